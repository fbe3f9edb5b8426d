//! DNS-over-HTTPS resolver (RFC 8484).
//!
//! Queries are encoded with the wire codec and carried in an HTTP request,
//! either as a `POST` body or as the `dns` query parameter of a `GET`.
//! Responses are decoded according to their content type: DNS wire format
//! or the JSON format served by public resolvers.
//!
//! The HTTP exchange itself sits behind [`DohClient`]; [`HyperDohClient`]
//! runs it on tokio with hyper over BoringSSL and reports completions
//! through a pollable descriptor.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::cache::ResolverCache;
use crate::dns::entry::{dedup_entries, Entry, Family};
use crate::dns::native::{alias_target, candidates, MAX_CNAME_HOPS};
use crate::dns::options::{DohMethod, ResolverOptions};
use crate::dns::wakeup::{handoff, Handoff, Notifier};
use crate::dns::wire::{self, Outcome, Record, RecordData, RecordType};
use crate::dns::{Interest, RequestId, Resolution};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use boring::ssl::{SslConnector, SslMethod};
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use url::Url;

pub const DNS_MESSAGE: &str = "application/dns-message";
pub const DNS_UDPWIREFORMAT: &str = "application/dns-udpwireformat";
pub const DNS_JSON: &str = "application/dns-json";

/// Exchanges in flight per client before new ones are refused.
pub const MAX_IN_FLIGHT: usize = 256;

/// Completion of one HTTP exchange.
pub type Completion = (u64, Result<Response<Bytes>, NetError>);

/// Non-blocking HTTP transport for DoH queries.
pub trait DohClient: Send {
    /// Starts an exchange and returns a token identifying it.
    fn start(&mut self, request: Request<Bytes>) -> Result<u64, NetError>;

    /// Exchanges finished since the last call.
    fn poll_complete(&mut self) -> Vec<Completion>;

    /// Abandons an exchange; its completion is never reported.
    fn cancel(&mut self, token: u64);

    /// Descriptor that becomes readable when a completion is available.
    fn file_descriptor(&self) -> Option<RawFd>;
}

struct DohRequest {
    origin: String,
    candidates: VecDeque<String>,
    /// Name currently queried.
    name: String,
    token: u64,
    deadline: Instant,
    chain: Vec<Record>,
    hops: usize,
}

/// Resolver for one family speaking DNS-over-HTTPS.
pub struct HttpsResolver {
    family: Family,
    uri: Url,
    method: DohMethod,
    ndots: usize,
    search: Vec<String>,
    timeout: Duration,
    use_cache: bool,
    cache: ResolverCache,
    client: Box<dyn DohClient>,
    requests: HashMap<RequestId, DohRequest>,
    tokens: HashMap<u64, RequestId>,
    ready: Vec<Resolution>,
}

impl std::fmt::Debug for HttpsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsResolver")
            .field("family", &self.family)
            .field("uri", &self.uri.as_str())
            .field("method", &self.method)
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl HttpsResolver {
    pub fn new(
        family: Family,
        options: &ResolverOptions,
        cache: ResolverCache,
        client: Box<dyn DohClient>,
    ) -> Self {
        Self {
            family,
            uri: options.doh_uri.clone(),
            method: options.doh_method,
            ndots: options.ndots,
            search: options.search.clone(),
            timeout: options.total_timeout(),
            use_cache: options.cache,
            cache,
            client,
            requests: HashMap::new(),
            tokens: HashMap::new(),
            ready: Vec::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn submit(&mut self, id: RequestId, hostname: &str) -> Result<(), NetError> {
        let mut names: VecDeque<String> = candidates(hostname, self.ndots, &self.search).into();
        let Some(first) = names.pop_front() else {
            return Err(NetError::not_resolved(hostname, "no candidate names"));
        };
        tracing::debug!(host = %hostname, uri = %self.uri, family = %self.family, "resolving via DoH");

        let token = self.start(&first).map_err(|e| e.for_host(hostname))?;
        self.tokens.insert(token, id);
        self.requests.insert(
            id,
            DohRequest {
                origin: hostname.to_string(),
                candidates: names,
                name: first,
                token,
                deadline: Instant::now() + self.timeout,
                chain: Vec::new(),
                hops: 0,
            },
        );
        Ok(())
    }

    pub fn poll(&mut self) -> Vec<Resolution> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Vec<Resolution> {
        for (token, result) in self.client.poll_complete() {
            let Some(id) = self.tokens.remove(&token) else {
                continue;
            };
            match result {
                Ok(response) if !response.status().is_success() => {
                    let err = io::Error::other(format!("DoH server returned status {}", response.status()));
                    self.fail(id, |host| NetError::transport(host, &err));
                }
                Ok(response) => {
                    let outcome = decode_http_response(&response);
                    self.handle_outcome(id, outcome);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "DoH exchange failed");
                    self.fail(id, |host| e.clone().for_host(host));
                }
            }
        }

        let expired: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(request) = self.requests.get(&id) {
                let token = request.token;
                self.client.cancel(token);
                self.tokens.remove(&token);
            }
            self.fail(id, |host| NetError::DnsTimedOut {
                host: host.to_string(),
                attempts: 1,
            });
        }

        std::mem::take(&mut self.ready)
    }

    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        self.requests
            .values()
            .map(|r| r.deadline.saturating_duration_since(now))
            .min()
    }

    pub fn interests(&self) -> Option<Interest> {
        if self.requests.is_empty() {
            None
        } else {
            Some(Interest::Read)
        }
    }

    pub fn file_descriptor(&self) -> Option<RawFd> {
        self.client.file_descriptor()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.ready.is_empty()
    }

    pub fn cancel(&mut self, id: RequestId) {
        if let Some(request) = self.requests.remove(&id) {
            self.client.cancel(request.token);
            self.tokens.remove(&request.token);
        }
        self.ready.retain(|r| r.id != id);
    }

    pub fn close(&mut self) {
        for (token, _) in self.tokens.drain() {
            self.client.cancel(token);
        }
        self.requests.clear();
        self.ready.clear();
    }

    fn start(&mut self, name: &str) -> Result<u64, NetError> {
        let request = build_request(&self.uri, self.method, name, self.family.record_type())?;
        self.client.start(request)
    }

    fn handle_outcome(&mut self, id: RequestId, outcome: Outcome) {
        match outcome {
            Outcome::Ok(records) => self.handle_answer(id, records),
            Outcome::NoDomain => {
                let next = self
                    .requests
                    .get_mut(&id)
                    .and_then(|request| request.candidates.pop_front());
                match next {
                    Some(name) => self.requery(id, name),
                    None => self.fail(id, |host| NetError::not_resolved(host, "name or service not known")),
                }
            }
            Outcome::ServerError(rcode) => self.fail(id, |host| NetError::DnsServerFailed {
                host: host.to_string(),
                rcode,
            }),
            Outcome::Truncated => self.fail(id, |host| NetError::malformed(host, "truncated DoH response")),
            Outcome::DecodeError(reason) => self.fail(id, |host| NetError::malformed(host, reason.clone())),
        }
    }

    fn handle_answer(&mut self, id: RequestId, records: Vec<Record>) {
        let family = self.family;
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };

        let mut entries: Vec<Entry> = records
            .iter()
            .filter_map(|r| {
                r.address()
                    .filter(|ip| Family::of(ip) == family)
                    .map(|ip| Entry::with_ttl(ip, r.ttl))
            })
            .collect();

        if entries.is_empty() {
            let Some((target, aliases)) = alias_target(&request.name, &records) else {
                self.fail(id, |host| NetError::not_resolved(host, "no address records"));
                return;
            };

            request.hops += aliases.len();
            request.chain.extend(aliases);
            if request.hops > MAX_CNAME_HOPS {
                self.fail(id, |host| NetError::not_resolved(host, "CNAME chain too long"));
                return;
            }

            if self.use_cache {
                let cached: Vec<Entry> = self
                    .cache
                    .get(&target)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|e| e.family() == family)
                    .collect();
                if !cached.is_empty() {
                    self.succeed(id, cached, Vec::new());
                    return;
                }
            }
            tracing::debug!(alias = %target, "following alias");
            self.requery(id, format!("{target}."));
            return;
        }

        dedup_entries(&mut entries);
        self.succeed(id, entries, records);
    }

    fn succeed(&mut self, id: RequestId, entries: Vec<Entry>, records: Vec<Record>) {
        let Some(request) = self.requests.remove(&id) else {
            return;
        };
        tracing::debug!(host = %request.origin, count = entries.len(), "resolved via DoH");
        if self.use_cache {
            let mut all = request.chain;
            all.extend(records);
            self.cache.set(&request.origin, self.family, &all);
        }
        self.ready.push(Resolution {
            id,
            family: self.family,
            hostname: request.origin,
            result: Ok(entries),
        });
    }

    fn requery(&mut self, id: RequestId, name: String) {
        match self.start(&name) {
            Ok(token) => {
                self.tokens.insert(token, id);
                if let Some(request) = self.requests.get_mut(&id) {
                    request.token = token;
                    request.name = name;
                }
            }
            Err(e) => self.fail(id, |host| e.clone().for_host(host)),
        }
    }

    fn fail(&mut self, id: RequestId, error: impl Fn(&str) -> NetError) {
        if let Some(request) = self.requests.remove(&id) {
            tracing::debug!(host = %request.origin, name = %request.name, "DoH resolution failed");
            self.ready.push(Resolution {
                id,
                family: self.family,
                result: Err(error(&request.origin)),
                hostname: request.origin,
            });
        }
    }
}

/// Builds the HTTP request carrying a query for `name`.
pub fn build_request(
    uri: &Url,
    method: DohMethod,
    name: &str,
    record_type: RecordType,
) -> Result<Request<Bytes>, NetError> {
    let message = wire::encode_query(name, record_type, 0)?;
    let host = uri.host_str().unwrap_or_default();
    let authority = match uri.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let builder = Request::builder()
        .header(HOST, authority)
        .header(ACCEPT, DNS_MESSAGE);
    let request = match method {
        DohMethod::Post => builder
            .method(Method::POST)
            .uri(uri.as_str())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .body(message),
        DohMethod::Get => {
            let mut url = uri.clone();
            url.query_pairs_mut()
                .append_pair("dns", &URL_SAFE_NO_PAD.encode(&message))
                .append_pair("type", record_type.as_str());
            builder.method(Method::GET).uri(url.as_str()).body(Bytes::new())
        }
    };
    request.map_err(|e| NetError::not_resolved(name, format!("invalid DoH request: {e}")))
}

/// Classifies an HTTP response body by its content type.
///
/// Non-success statuses are transport failures; bodies of an unexpected
/// content type are decode errors.
pub fn decode_http_response(response: &Response<Bytes>) -> Outcome {
    if !response.status().is_success() {
        return Outcome::DecodeError(format!("DoH server returned status {}", response.status()));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default();

    match content_type.as_str() {
        DNS_MESSAGE | DNS_UDPWIREFORMAT => wire::decode_answer(response.body()),
        DNS_JSON | "application/json" => decode_json(response.body()),
        other => Outcome::DecodeError(format!("unexpected content type {other:?}")),
    }
}

#[derive(Debug, Deserialize)]
struct JsonMessage {
    #[serde(rename = "Status")]
    status: u8,
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonRecord>,
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

/// Decodes an `application/dns-json` body.
pub fn decode_json(body: &[u8]) -> Outcome {
    let message: JsonMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => return Outcome::DecodeError(format!("invalid DNS JSON: {e}")),
    };
    match message.status {
        0 => {}
        3 => return Outcome::NoDomain,
        rcode => return Outcome::ServerError(rcode),
    }

    let mut records = Vec::with_capacity(message.answer.len());
    for answer in message.answer {
        let data = match RecordType::from_code(answer.rtype) {
            Some(RecordType::A) | Some(RecordType::Aaaa) => match answer.data.parse::<IpAddr>() {
                Ok(ip) => RecordData::Address(ip),
                Err(_) => return Outcome::DecodeError(format!("invalid address {:?}", answer.data)),
            },
            Some(RecordType::Cname) => RecordData::Alias(answer.data.trim_end_matches('.').to_string()),
            _ => continue,
        };
        records.push(Record {
            name: answer.name.trim_end_matches('.').to_string(),
            ttl: answer.ttl,
            data,
        });
    }
    Outcome::Ok(records)
}

/// [`DohClient`] running HTTP/1.1 exchanges over BoringSSL on tokio.
pub struct HyperDohClient {
    handle: Handle,
    runtime: Option<Runtime>,
    connector: SslConnector,
    notifier: Notifier<Completion>,
    completions: Handoff<Completion>,
    tasks: HashMap<u64, JoinHandle<()>>,
    next_token: u64,
}

impl std::fmt::Debug for HyperDohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperDohClient")
            .field("in_flight", &self.tasks.len())
            .field("owns_runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl HyperDohClient {
    /// Uses the current tokio runtime, or starts a private one when called
    /// outside of a runtime.
    pub fn new() -> io::Result<Self> {
        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("dns-doh")
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(io::Error::other)?;
        builder
            .set_alpn_protos(b"\x08http/1.1")
            .map_err(io::Error::other)?;
        let (notifier, completions) = handoff(MAX_IN_FLIGHT)?;

        Ok(Self {
            handle,
            runtime,
            connector: builder.build(),
            notifier,
            completions,
            tasks: HashMap::new(),
            next_token: 0,
        })
    }
}

impl DohClient for HyperDohClient {
    fn start(&mut self, request: Request<Bytes>) -> Result<u64, NetError> {
        if self.tasks.len() >= MAX_IN_FLIGHT {
            return Err(NetError::HostResolverQueueTooLarge);
        }
        self.next_token += 1;
        let token = self.next_token;
        let connector = self.connector.clone();
        let notifier = self.notifier.clone();

        let task = self.handle.spawn(async move {
            let result = exchange(connector, request).await;
            // Capacity matches MAX_IN_FLIGHT, so only a dropped client fails here.
            let _ = notifier.try_send((token, result));
        });
        self.tasks.insert(token, task);
        Ok(token)
    }

    fn poll_complete(&mut self) -> Vec<Completion> {
        let completions = self.completions.drain();
        for (token, _) in &completions {
            self.tasks.remove(token);
        }
        completions
    }

    fn cancel(&mut self, token: u64) {
        if let Some(task) = self.tasks.remove(&token) {
            task.abort();
        }
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.completions.file_descriptor())
    }
}

impl Drop for HyperDohClient {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn exchange(
    connector: SslConnector,
    mut request: Request<Bytes>,
) -> Result<Response<Bytes>, NetError> {
    let host = request
        .uri()
        .host()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = request.uri().port_u16().unwrap_or(443);

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .dns_context(&host)?;
    let config = connector
        .configure()
        .map_err(|e| NetError::transport(&host, &io::Error::other(e)))?;
    let tls = tokio_boring::connect(config, &host, stream)
        .await
        .map_err(|e| {
            tracing::debug!(host = %host, error = %e, "DoH TLS handshake failed");
            NetError::transport(&host, &io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))
        })?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(tls))
        .await
        .map_err(|e| hyper_error(&host, e))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "DoH connection closed");
        }
    });

    // HTTP/1.1 requests carry the origin form.
    if let Some(path) = request.uri().path_and_query().cloned() {
        *request.uri_mut() = path.into();
    }
    let response = sender
        .send_request(request.map(Full::new))
        .await
        .map_err(|e| hyper_error(&host, e))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| hyper_error(&host, e))?
        .to_bytes();
    if !parts.status.is_success() {
        let err = io::Error::other(format!("DoH server returned status {}", parts.status));
        return Err(NetError::transport(&host, &err));
    }
    Ok(Response::from_parts(parts, body))
}

fn hyper_error(host: &str, err: hyper::Error) -> NetError {
    let kind = if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else if err.is_incomplete_message() || err.is_closed() {
        io::ErrorKind::UnexpectedEof
    } else {
        io::ErrorKind::Other
    };
    NetError::transport(host, &io::Error::new(kind, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::wire::testing::ResponseBuilder;
    use http::StatusCode;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Exchanges {
        started: Vec<(u64, Request<Bytes>)>,
        completed: Vec<Completion>,
        cancelled: Vec<u64>,
        next: u64,
    }

    #[derive(Clone, Default)]
    struct MockClient(Arc<Mutex<Exchanges>>);

    impl MockClient {
        fn last_request(&self) -> (u64, Request<Bytes>) {
            let state = self.0.lock();
            let (token, request) = state.started.last().expect("no request started");
            let mut copy = Request::builder()
                .method(request.method().clone())
                .uri(request.uri().clone());
            for (name, value) in request.headers() {
                copy = copy.header(name, value);
            }
            (*token, copy.body(request.body().clone()).unwrap())
        }

        fn started(&self) -> usize {
            self.0.lock().started.len()
        }

        fn complete(&self, token: u64, content_type: &str, body: impl Into<Bytes>) {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type)
                .body(body.into())
                .unwrap();
            self.0.lock().completed.push((token, Ok(response)));
        }

        fn complete_with(&self, token: u64, result: Result<Response<Bytes>, NetError>) {
            self.0.lock().completed.push((token, result));
        }
    }

    impl DohClient for MockClient {
        fn start(&mut self, request: Request<Bytes>) -> Result<u64, NetError> {
            let mut state = self.0.lock();
            state.next += 1;
            let token = state.next;
            state.started.push((token, request));
            Ok(token)
        }

        fn poll_complete(&mut self) -> Vec<Completion> {
            std::mem::take(&mut self.0.lock().completed)
        }

        fn cancel(&mut self, token: u64) {
            self.0.lock().cancelled.push(token);
        }

        fn file_descriptor(&self) -> Option<RawFd> {
            None
        }
    }

    fn options() -> ResolverOptions {
        ResolverOptions::builtin()
            .with_hosts_path(None)
            .with_timeouts(vec![Duration::from_secs(1)])
    }

    fn resolver(family: Family, options: &ResolverOptions) -> (HttpsResolver, MockClient, ResolverCache) {
        let client = MockClient::default();
        let cache = ResolverCache::in_memory();
        let resolver = HttpsResolver::new(family, options, cache.clone(), Box::new(client.clone()));
        (resolver, client, cache)
    }

    fn url() -> Url {
        Url::parse("https://doh.example:8443/dns-query").unwrap()
    }

    #[test]
    fn test_post_request() {
        let request = build_request(&url(), DohMethod::Post, "example.com", RecordType::A).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "https://doh.example:8443/dns-query");
        assert_eq!(request.headers()[HOST], "doh.example:8443");
        assert_eq!(request.headers()[CONTENT_TYPE], DNS_MESSAGE);
        assert_eq!(request.headers()[ACCEPT], DNS_MESSAGE);
        assert_eq!(
            request.body(),
            &wire::encode_query("example.com", RecordType::A, 0).unwrap()
        );
    }

    #[test]
    fn test_get_request() {
        let request = build_request(&url(), DohMethod::Get, "example.com", RecordType::Aaaa).unwrap();
        let message = wire::encode_query("example.com", RecordType::Aaaa, 0).unwrap();

        assert_eq!(request.method(), Method::GET);
        assert!(request.body().is_empty());
        let query = request.uri().query().unwrap();
        assert!(query.contains(&format!("dns={}", URL_SAFE_NO_PAD.encode(&message))));
        assert!(query.contains("type=AAAA"));
        assert!(request.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_resolves_wire_answer() {
        let (mut resolver, client, cache) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        assert_eq!(resolver.interests(), Some(Interest::Read));
        let (token, request) = client.last_request();
        let body = ResponseBuilder::reply_to(request.body())
            .address("example.com", 300, "192.0.2.1")
            .build();
        client.complete(token, DNS_MESSAGE, body);

        let results = resolver.poll();
        assert_eq!(results.len(), 1);
        let entries = results[0].result.as_ref().unwrap();
        assert_eq!(entries[0].address(), "192.0.2.1".parse::<IpAddr>().unwrap());
        assert!(entries[0].expires_at().is_some());
        assert!(cache.get("example.com").is_some());
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_resolves_json_answer() {
        let (mut resolver, client, _) = resolver(Family::V6, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        let (token, _) = client.last_request();
        let body = r#"{"Status":0,"Answer":[
            {"name":"example.com.","type":28,"TTL":60,"data":"2001:db8::1"}
        ]}"#;
        client.complete(token, "application/dns-json; charset=utf-8", body);

        let results = resolver.poll();
        let entries = results[0].result.as_ref().unwrap();
        assert_eq!(entries[0].address(), "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_nxdomain_tries_next_candidate() {
        let options = options().with_search(vec!["corp.example".to_string()]);
        let (mut resolver, client, _) = resolver(Family::V4, &options);

        resolver.submit(RequestId(1), "intranet").unwrap();
        let (token, _) = client.last_request();
        client.complete(token, DNS_JSON, r#"{"Status":3}"#);
        assert!(resolver.poll().is_empty());
        assert_eq!(client.started(), 2);

        let (token, request) = client.last_request();
        assert_eq!(
            request.body(),
            &wire::encode_query("intranet.", RecordType::A, 0).unwrap()
        );
        client.complete(token, DNS_JSON, r#"{"Status":3}"#);
        let results = resolver.poll();
        assert_eq!(
            results[0].result,
            Err(NetError::not_resolved("intranet", "name or service not known"))
        );
    }

    #[test]
    fn test_follows_alias() {
        let (mut resolver, client, cache) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "www.example.com").unwrap();
        let (token, request) = client.last_request();
        let body = ResponseBuilder::reply_to(request.body())
            .alias("www.example.com", 300, "edge.example.net")
            .build();
        client.complete(token, DNS_MESSAGE, body);
        assert!(resolver.poll().is_empty());

        let (token, request) = client.last_request();
        assert_eq!(
            request.body(),
            &wire::encode_query("edge.example.net.", RecordType::A, 0).unwrap()
        );
        let body = ResponseBuilder::reply_to(request.body())
            .address("edge.example.net", 300, "198.51.100.7")
            .build();
        client.complete(token, DNS_MESSAGE, body);

        let results = resolver.poll();
        assert_eq!(results[0].hostname, "www.example.com");
        assert!(results[0].result.is_ok());
        let cached = cache.get("www.example.com").unwrap();
        assert_eq!(cached[0].address(), "198.51.100.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_unknown_content_type() {
        let (mut resolver, client, _) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        let (token, _) = client.last_request();
        client.complete(token, "text/html", "<html></html>");

        let results = resolver.poll();
        assert!(matches!(
            results[0].result,
            Err(NetError::DnsMalformedResponse { .. })
        ));
    }

    #[test]
    fn test_http_error_status() {
        let (mut resolver, client, _) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        let (token, _) = client.last_request();
        let response = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Bytes::new())
            .unwrap();
        client.complete_with(token, Ok(response));

        let results = resolver.poll();
        let err = results[0].result.clone().unwrap_err();
        assert!(matches!(err, NetError::DnsTransport { .. }));
        assert_eq!(err.as_i32(), -104);
    }

    #[test]
    fn test_exchange_error_is_reported_for_origin() {
        let (mut resolver, client, _) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        let (token, _) = client.last_request();
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        client.complete_with(token, Err(NetError::transport("doh.example", &refused)));

        let results = resolver.poll();
        let err = results[0].result.clone().unwrap_err();
        assert_eq!(err.as_i32(), -102);
        assert!(matches!(err, NetError::DnsTransport { ref host, .. } if host == "example.com"));
    }

    #[test]
    fn test_timeout_cancels_exchange() {
        let (mut resolver, client, _) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        let now = Instant::now();
        assert!(resolver.next_timeout(now).unwrap() <= Duration::from_secs(1));

        let results = resolver.poll_at(now + Duration::from_secs(2));
        assert_eq!(
            results[0].result,
            Err(NetError::DnsTimedOut {
                host: "example.com".to_string(),
                attempts: 1
            })
        );
        assert_eq!(client.0.lock().cancelled, vec![1]);
    }

    #[test]
    fn test_cancel_drops_completion() {
        let (mut resolver, client, _) = resolver(Family::V4, &options());

        resolver.submit(RequestId(1), "example.com").unwrap();
        let (token, request) = client.last_request();
        resolver.cancel(RequestId(1));
        let body = ResponseBuilder::reply_to(request.body())
            .address("example.com", 300, "192.0.2.1")
            .build();
        client.complete(token, DNS_MESSAGE, body);

        assert!(resolver.poll().is_empty());
        assert!(resolver.is_empty());
        assert_eq!(resolver.interests(), None);
    }

    #[test]
    fn test_decode_json_server_failure() {
        assert_eq!(decode_json(br#"{"Status":2}"#), Outcome::ServerError(2));
        assert!(matches!(decode_json(b"not json"), Outcome::DecodeError(_)));
    }
}
