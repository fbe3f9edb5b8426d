//! Non-blocking nameserver sockets.
//!
//! [`DnsTransport`] is the seam between the resolver state machine and the
//! network. The real implementations use a connected UDP socket (so the
//! kernel drops datagrams from any other source) or a TCP stream carrying
//! length-prefixed messages.

use crate::dns::options::SocketKind;
use crate::dns::wire::{frame_tcp, TcpFrameBuffer};
use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

const RECV_BUFFER_SIZE: usize = 65_535;

/// A message-oriented, non-blocking connection to one nameserver.
pub trait DnsTransport: Send {
    fn kind(&self) -> SocketKind;

    /// Queues `message` and writes as much as the socket accepts.
    fn send(&mut self, message: &[u8]) -> io::Result<()>;

    /// Drains complete messages currently readable.
    ///
    /// Returns `Err(UnexpectedEof)` once the peer closed the connection
    /// and nothing is left to deliver.
    fn receive(&mut self) -> io::Result<Vec<Bytes>>;

    /// Whether queued output is waiting for write readiness.
    fn wants_write(&self) -> bool;

    fn flush(&mut self) -> io::Result<()>;

    fn file_descriptor(&self) -> Option<RawFd>;
}

/// Opens transports on demand; replaceable for tests.
pub type Connector =
    Box<dyn FnMut(SocketAddr, SocketKind) -> io::Result<Box<dyn DnsTransport>> + Send>;

/// Connects a real socket of `kind` to `nameserver`.
pub fn connect(nameserver: SocketAddr, kind: SocketKind) -> io::Result<Box<dyn DnsTransport>> {
    match kind {
        SocketKind::Udp => Ok(Box::new(UdpTransport::connect(nameserver)?)),
        SocketKind::Tcp => Ok(Box::new(TcpTransport::connect(nameserver)?)),
    }
}

/// Connected, non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    pending: Vec<Bytes>,
}

impl UdpTransport {
    pub fn connect(nameserver: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(nameserver),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind(&unspecified(nameserver.ip()).into())?;
        socket.connect(&nameserver.into())?;
        tracing::trace!(nameserver = %nameserver, "udp transport open");

        Ok(Self {
            socket: socket.into(),
            pending: Vec::new(),
        })
    }
}

impl DnsTransport for UdpTransport {
    fn kind(&self) -> SocketKind {
        SocketKind::Udp
    }

    fn send(&mut self, message: &[u8]) -> io::Result<()> {
        self.pending.push(Bytes::copy_from_slice(message));
        self.flush()
    }

    fn receive(&mut self) -> io::Result<Vec<Bytes>> {
        let mut messages = Vec::new();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => messages.push(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(messages),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if messages.is_empty() => return Err(e),
                // Deliver what was read; the error resurfaces on the next call.
                Err(_) => return Ok(messages),
            }
        }
    }

    fn wants_write(&self) -> bool {
        !self.pending.is_empty()
    }

    fn flush(&mut self) -> io::Result<()> {
        while let Some(message) = self.pending.first() {
            match self.socket.send(message) {
                Ok(_) => {
                    self.pending.remove(0);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }
}

/// Non-blocking TCP stream with 2-byte length framing.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    connecting: bool,
    output: BytesMut,
    input: TcpFrameBuffer,
    eof: bool,
}

impl TcpTransport {
    pub fn connect(nameserver: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(nameserver),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let connecting = match socket.connect(&nameserver.into()) {
            Ok(()) => false,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => return Err(e),
        };
        tracing::trace!(nameserver = %nameserver, connecting, "tcp transport open");

        Ok(Self {
            stream: socket.into(),
            connecting,
            output: BytesMut::new(),
            input: TcpFrameBuffer::new(),
            eof: false,
        })
    }

    /// Completes a pending connect; `Ok(false)` while still in progress.
    fn finish_connect(&mut self) -> io::Result<bool> {
        if !self.connecting {
            return Ok(true);
        }
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connecting = false;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl DnsTransport for TcpTransport {
    fn kind(&self) -> SocketKind {
        SocketKind::Tcp
    }

    fn send(&mut self, message: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(&frame_tcp(message));
        self.flush()
    }

    fn receive(&mut self) -> io::Result<Vec<Bytes>> {
        if !self.finish_connect()? {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while !self.eof {
            match self.stream.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => self.input.push(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut messages = Vec::new();
        while let Some(frame) = self.input.next_frame() {
            messages.push(frame);
        }
        if messages.is_empty() && self.eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "nameserver closed the connection",
            ));
        }
        Ok(messages)
    }

    fn wants_write(&self) -> bool {
        self.connecting || !self.output.is_empty()
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.finish_connect()? {
            return Ok(());
        }
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "nameserver stopped accepting data",
                    ))
                }
                Ok(n) => self.output.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

fn unspecified(peer: IpAddr) -> SocketAddr {
    match peer {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}
