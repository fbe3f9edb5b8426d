//! Shared helpers: a DNS reply builder and a loopback nameserver.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;

enum Data {
    Address(IpAddr),
    Alias(String),
}

/// Builds a response echoing the question of a query.
pub struct Reply {
    query: Vec<u8>,
    rcode: u8,
    truncated: bool,
    /// Owner `None` points at the question name.
    answers: Vec<(Option<String>, u32, Data)>,
}

impl Reply {
    pub fn to(query: &[u8]) -> Self {
        Self {
            query: query.to_vec(),
            rcode: 0,
            truncated: false,
            answers: Vec::new(),
        }
    }

    pub fn rcode(mut self, rcode: u8) -> Self {
        self.rcode = rcode;
        self
    }

    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    pub fn address(mut self, ttl: u32, ip: &str) -> Self {
        self.answers
            .push((None, ttl, Data::Address(ip.parse().unwrap())));
        self
    }

    pub fn address_for(mut self, owner: &str, ttl: u32, ip: &str) -> Self {
        self.answers.push((
            Some(owner.to_string()),
            ttl,
            Data::Address(ip.parse().unwrap()),
        ));
        self
    }

    pub fn alias(mut self, ttl: u32, target: &str) -> Self {
        self.answers
            .push((None, ttl, Data::Alias(target.to_string())));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let question_end = question_end(&self.query);
        let mut flags: u16 = 0x8180 | self.rcode as u16;
        if self.truncated {
            flags |= 0x0200;
        }

        let mut out = Vec::new();
        out.extend_from_slice(&self.query[..2]);
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&self.query[12..question_end]);

        for (owner, ttl, data) in &self.answers {
            match owner {
                Some(name) => out.extend_from_slice(&encode_name(name)),
                None => out.extend_from_slice(&[0xC0, 0x0C]),
            }
            let (rtype, rdata) = match data {
                Data::Address(IpAddr::V4(ip)) => (TYPE_A, ip.octets().to_vec()),
                Data::Address(IpAddr::V6(ip)) => (TYPE_AAAA, ip.octets().to_vec()),
                Data::Alias(target) => (TYPE_CNAME, encode_name(target)),
            };
            out.extend_from_slice(&rtype.to_be_bytes());
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(&rdata);
        }
        out
    }
}

pub fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in name.trim_end_matches('.').split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

fn question_end(query: &[u8]) -> usize {
    let mut pos = 12;
    while query[pos] != 0 {
        pos += query[pos] as usize + 1;
    }
    pos + 1 + 4
}

/// Question name of a query, without trailing dot.
pub fn question_name(query: &[u8]) -> String {
    let mut labels = Vec::new();
    let mut pos = 12;
    while query[pos] != 0 {
        let len = query[pos] as usize;
        labels.push(String::from_utf8_lossy(&query[pos + 1..pos + 1 + len]).into_owned());
        pos += len + 1;
    }
    labels.join(".")
}

pub fn question_type(query: &[u8]) -> u16 {
    let end = question_end(query);
    u16::from_be_bytes([query[end - 4], query[end - 3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Answers a query, or drops it when returning `None`.
pub type Handler = Arc<dyn Fn(Protocol, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Nameserver on a loopback port, answering UDP and TCP with `handler`.
pub struct TestNameserver {
    pub addr: SocketAddr,
    udp_queries: Arc<AtomicUsize>,
    tcp_queries: Arc<AtomicUsize>,
}

impl TestNameserver {
    pub fn spawn(handler: Handler) -> Self {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).unwrap();
        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_queries = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&udp_queries);
        let udp_handler = Arc::clone(&handler);
        std::thread::spawn(move || {
            let mut buf = [0u8; 1500];
            while let Ok((n, peer)) = udp.recv_from(&mut buf) {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = udp_handler(Protocol::Udp, &buf[..n]) {
                    let _ = udp.send_to(&reply, peer);
                }
            }
        });

        let counter = Arc::clone(&tcp_queries);
        std::thread::spawn(move || {
            for stream in tcp.incoming() {
                let Ok(stream) = stream else { break };
                let handler = Arc::clone(&handler);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || serve_tcp(stream, handler, counter));
            }
        });

        Self {
            addr,
            udp_queries,
            tcp_queries,
        }
    }

    pub fn udp_queries(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_queries(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }
}

fn serve_tcp(mut stream: TcpStream, handler: Handler, counter: Arc<AtomicUsize>) {
    loop {
        let mut len = [0u8; 2];
        if stream.read_exact(&mut len).is_err() {
            return;
        }
        let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
        if stream.read_exact(&mut query).is_err() {
            return;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = handler(Protocol::Tcp, &query) {
            let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
            framed.extend_from_slice(&reply);
            if stream.write_all(&framed).is_err() {
                return;
            }
        }
    }
}

/// Handler answering A and AAAA queries with fixed addresses.
pub fn dual_stack(v4: &'static str, v6: &'static str) -> Handler {
    Arc::new(move |_, query| {
        let reply = Reply::to(query);
        Some(match question_type(query) {
            TYPE_A => reply.address(300, v4).build(),
            TYPE_AAAA => reply.address(300, v6).build(),
            _ => reply.build(),
        })
    })
}

/// Polls `step` until it yields a value or five seconds pass.
pub fn poll_until<T>(mut step: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = step() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for resolver");
        std::thread::sleep(Duration::from_millis(2));
    }
}
