//! # Source-Bound HTTP Executor
//!
//! Performs one outbound HTTP request with the TCP socket bound to a
//! caller-supplied local source IP, so the remote sees that address as the
//! client. Redirects are followed manually so every hop carries the same
//! bind: the target host is resolved up front, the resolved addresses are
//! filtered to the source family, and a hop with no address in that family
//! fails with `BindError` instead of silently switching source.

use indexmap::IndexMap;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, Method, StatusCode, Url};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{AgentResponse, ErrorKind, HeaderMap, JobError, MAX_TIMEOUT_SECS};

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 10;

/// Slack on top of the job timeout for the total wall clock
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// One dispatch, as received over the control plane
#[derive(Debug, Clone)]
pub struct ExecuteSpec {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub timeout_sec: f64,
}

/// Unwrap bracketed IPv6 literals (`[2001:db8::1]`) and parse
pub fn parse_source_ip(source_ip: &str) -> Result<IpAddr, JobError> {
    let trimmed = source_ip
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(source_ip);
    trimmed.parse().map_err(|_| {
        JobError::new(
            ErrorKind::BindError,
            format!("not a bindable address: {source_ip}"),
        )
    })
}

/// Execute one request from `source_ip`. Total wall time is bounded by the
/// job timeout plus a small grace.
pub async fn execute(source_ip: &str, spec: &ExecuteSpec) -> Result<AgentResponse, JobError> {
    let ip = parse_source_ip(source_ip)?;
    if !spec.timeout_sec.is_finite() || spec.timeout_sec <= 0.0 {
        return Err(JobError::invalid_request("timeout must be positive"));
    }
    // the coordinator validates this too, but the frame is the trust
    // boundary here and Duration::from_secs_f64 panics on overflow
    if spec.timeout_sec > MAX_TIMEOUT_SECS {
        return Err(JobError::invalid_request(format!(
            "timeout must be at most {MAX_TIMEOUT_SECS} seconds"
        )));
    }
    let timeout = Duration::from_secs_f64(spec.timeout_sec);

    let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| JobError::invalid_request(format!("unsupported method {}", spec.method)))?;
    let url = Url::parse(&spec.url)
        .map_err(|e| JobError::invalid_request(format!("invalid url: {e}")))?;

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        timeout + TIMEOUT_GRACE,
        follow_and_fetch(ip, method, url, spec, timeout),
    )
    .await
    .map_err(|_| JobError::new(ErrorKind::Timeout, "request exceeded deadline"))?;

    let (status, headers, body) = outcome?;
    let elapsed_sec = started.elapsed().as_secs_f64();
    debug!(status, bytes = body.len(), elapsed_sec, "request finished");
    Ok(AgentResponse {
        status,
        headers,
        body,
        elapsed_sec,
    })
}

/// The redirect loop: each hop re-resolves, re-pins and re-binds
async fn follow_and_fetch(
    ip: IpAddr,
    mut method: Method,
    mut url: Url,
    spec: &ExecuteSpec,
    timeout: Duration,
) -> Result<(u16, HeaderMap, Vec<u8>), JobError> {
    let mut body = spec.body.clone();

    for _hop in 0..=MAX_REDIRECTS {
        let client = bound_client(ip, &url, timeout).await?;

        let mut request = client.request(method.clone(), url.clone());
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        request = match &body {
            None => request,
            Some(serde_json::Value::String(text)) => request.body(text.clone()),
            Some(value) => request.json(value),
        };

        let response = request.send().await.map_err(classify)?;
        let status = response.status();

        if status.is_redirection() {
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                // a 3xx without Location is a final answer
                return read_response(response).await;
            };
            url = url
                .join(location)
                .map_err(|e| JobError::invalid_request(format!("bad redirect target: {e}")))?;
            // 303 (and the de-facto 301/302 behavior) demote to GET
            if status == StatusCode::SEE_OTHER
                || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                    && method != Method::GET
                    && method != Method::HEAD)
            {
                method = Method::GET;
                body = None;
            }
            continue;
        }

        return read_response(response).await;
    }

    Err(JobError::new(
        ErrorKind::TooManyRedirects,
        format!("stopped after {MAX_REDIRECTS} redirects"),
    ))
}

/// Build a client whose connection will be bound to `ip` and whose DNS view
/// of the target host is restricted to `ip`'s address family.
async fn bound_client(ip: IpAddr, url: &Url, timeout: Duration) -> Result<Client, JobError> {
    let mut builder = Client::builder()
        .local_address(ip)
        .connect_timeout(timeout)
        .timeout(timeout)
        .redirect(Policy::none());

    match url.host() {
        None => return Err(JobError::invalid_request("url has no host")),
        Some(url::Host::Ipv4(addr)) => {
            if !ip.is_ipv4() {
                return Err(family_mismatch(ip, addr.into()));
            }
        }
        Some(url::Host::Ipv6(addr)) => {
            if !ip.is_ipv6() {
                return Err(family_mismatch(ip, addr.into()));
            }
        }
        Some(url::Host::Domain(name)) => {
            let port = url.port_or_known_default().unwrap_or(80);
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((name, port))
                .await
                .map_err(|e| {
                    JobError::new(ErrorKind::DnsError, format!("lookup {name} failed: {e}"))
                })?
                .filter(|addr| addr.is_ipv4() == ip.is_ipv4())
                .collect();
            if resolved.is_empty() {
                return Err(JobError::new(
                    ErrorKind::BindError,
                    format!(
                        "{name} has no {} addresses reachable from {ip}",
                        family_name(ip)
                    ),
                ));
            }
            builder = builder.resolve_to_addrs(name, &resolved);
        }
    }

    builder
        .build()
        .map_err(|e| JobError::new(ErrorKind::Other, format!("client build failed: {e}")))
}

fn family_mismatch(source: IpAddr, target: IpAddr) -> JobError {
    JobError::new(
        ErrorKind::BindError,
        format!(
            "cannot reach {} target {target} from {} source {source}",
            family_name(target),
            family_name(source)
        ),
    )
}

fn family_name(ip: IpAddr) -> &'static str {
    if ip.is_ipv4() {
        "IPv4"
    } else {
        "IPv6"
    }
}

async fn read_response(response: reqwest::Response) -> Result<(u16, HeaderMap, Vec<u8>), JobError> {
    let status = response.status().as_u16();
    let headers: HeaderMap = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| JobError::new(ErrorKind::ReadError, e.to_string()))?;
    Ok((status, headers, body.to_vec()))
}

/// Map a transport error onto the wire taxonomy. Works from reqwest's own
/// predicates first, then walks the source chain for the io-level cause.
fn classify(err: reqwest::Error) -> JobError {
    let message = err.to_string();

    if err.is_timeout() {
        return JobError::new(ErrorKind::Timeout, message);
    }
    if err.is_builder() {
        return JobError::invalid_request(message);
    }

    let chain = chain_text(&err);
    if let Some(kind) = io_error_kind(&err) {
        use std::io::ErrorKind as Io;
        if matches!(kind, Io::AddrNotAvailable | Io::AddrInUse | Io::InvalidInput) {
            return JobError::new(ErrorKind::BindError, message);
        }
    }
    if chain.contains("dns") || chain.contains("lookup address") {
        return JobError::new(ErrorKind::DnsError, message);
    }
    if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake") {
        return JobError::new(ErrorKind::TlsError, message);
    }
    if err.is_connect() {
        return JobError::new(ErrorKind::ConnectError, message);
    }
    if err.is_decode() || err.is_body() {
        return JobError::new(ErrorKind::ReadError, message);
    }
    JobError::new(ErrorKind::Other, message)
}

/// Lowercased rendering of the whole error chain
fn chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string().to_lowercase();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(" / ");
        text.push_str(&cause.to_string().to_lowercase());
        source = cause.source();
    }
    text
}

/// The deepest `std::io::Error` kind in the chain, if any
fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut found = None;
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            found = Some(io.kind());
        }
        source = cause.source();
    }
    found
}
