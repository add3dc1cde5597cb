//! HTTP/1.1 and HTTP/2 handler built on a shared reqwest client, with
//! optional HTTP/3 behind the `http3` cargo feature. Range support is
//! believed only after a 1-byte test range comes back 206.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode, Version};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::probe::{ProbeResult, Validators};
use crate::target::Target;
use crate::tls;

use super::{ByteStream, HandlerConfig, ProtocolHandler, Session};

const USER_AGENT: &str = concat!("snag/", env!("CARGO_PKG_VERSION"));
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

pub struct HttpHandler {
    client: Client,
    #[cfg(feature = "http3")]
    h3_client: Option<Client>,
    config: HandlerConfig,
    /// Set by the probe when HTTP/3 was advertised and is enabled.
    use_h3: AtomicBool,
}

fn default_headers(config: &HandlerConfig) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name: HeaderName = name
            .parse()
            .map_err(|_| FetchError::TransientNetwork(format!("bad header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| FetchError::TransientNetwork(format!("bad header value for {name}")))?;
        headers.insert(name, value);
    }
    if let Some(cookie) = &config.cookie {
        headers.insert(
            COOKIE,
            HeaderValue::from_str(cookie)
                .map_err(|_| FetchError::TransientNetwork("bad cookie string".into()))?,
        );
    }
    Ok(headers)
}

fn base_builder(config: &HandlerConfig) -> Result<reqwest::ClientBuilder, FetchError> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(default_headers(config)?)
        .connect_timeout(config.timeout)
        .read_timeout(config.timeout)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .tcp_nodelay(true)
        .danger_accept_invalid_certs(!config.verify_tls);
    if let Some(proxy) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| FetchError::TransientNetwork(format!("bad proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder)
}

impl HttpHandler {
    pub fn new(config: &HandlerConfig) -> Result<Self, FetchError> {
        let client = base_builder(config)?
            .build()
            .map_err(|e| FetchError::TransientNetwork(format!("client build failed: {e}")))?;
        #[cfg(feature = "http3")]
        let h3_client = if config.http3 {
            Some(
                base_builder(config)?
                    .http3_prior_knowledge()
                    .build()
                    .map_err(|e| {
                        FetchError::TransientNetwork(format!("h3 client build failed: {e}"))
                    })?,
            )
        } else {
            None
        };
        Ok(Self {
            client,
            #[cfg(feature = "http3")]
            h3_client,
            config: config.clone(),
            use_h3: AtomicBool::new(false),
        })
    }

    fn transfer_client(&self) -> Client {
        #[cfg(feature = "http3")]
        if self.use_h3.load(Ordering::Relaxed) {
            if let Some(h3) = &self.h3_client {
                return h3.clone();
            }
        }
        self.client.clone()
    }

    /// True when HTTP/3 would actually be used for the transfer.
    fn h3_ready(&self, advertised: bool) -> bool {
        #[cfg(feature = "http3")]
        {
            advertised && self.h3_client.is_some()
        }
        #[cfg(not(feature = "http3"))]
        {
            let _ = advertised;
            false
        }
    }
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_3 => "http/3",
        Version::HTTP_2 => "http/2",
        Version::HTTP_11 => "http/1.1",
        Version::HTTP_10 => "http/1.0",
        _ => "http",
    }
}

fn header_str<'a>(resp: &'a Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

fn content_length_of(resp: &Response) -> Option<u64> {
    header_str(resp, "content-length").and_then(|v| v.parse().ok())
}

/// Total size out of `Content-Range: bytes 0-0/12345`.
fn total_from_content_range(resp: &Response) -> Option<u64> {
    let raw = header_str(resp, "content-range")?;
    raw.rsplit('/').next()?.trim().parse().ok()
}

/// Retry-After as either delta-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(raw.trim()).ok()?;
    when.duration_since(std::time::SystemTime::now()).ok()
}

/// Map a non-success transfer status onto the engine's error categories.
/// Only range-specific refusals become ProtocolDegraded (and thereby a
/// candidate for the single-stream replan); any other 4xx is a hard
/// rejection that fails the fetch on the spot.
fn status_error(status: StatusCode, headers: &HeaderMap) -> FetchError {
    match status.as_u16() {
        429 | 503 => FetchError::ServerBackoff {
            status: status.as_u16(),
            retry_after: parse_retry_after(headers),
        },
        408 => FetchError::TransientNetwork("HTTP 408 request timeout".into()),
        416 => FetchError::ProtocolDegraded("HTTP 416 range not satisfiable".into()),
        s if s >= 500 => FetchError::TransientNetwork(format!("HTTP {s}")),
        s => FetchError::RequestRejected { status: s },
    }
}

fn body_stream(resp: Response, limit: Option<u64>) -> ByteStream {
    let stream = resp
        .bytes_stream()
        .map(|item| item.map_err(FetchError::from_http))
        .scan(limit, |remaining, item| {
            let out = match item {
                Ok(mut bytes) => match remaining {
                    Some(0) => None,
                    Some(rem) => {
                        if (bytes.len() as u64) > *rem {
                            bytes.truncate(*rem as usize);
                        }
                        *rem -= bytes.len() as u64;
                        Some(Ok(bytes))
                    }
                    None => Some(Ok(bytes)),
                },
                Err(e) => Some(Err(e)),
            };
            futures_util::future::ready(out)
        });
    Box::pin(stream)
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn schemes(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    async fn probe(&self, target: &Target) -> Result<ProbeResult, FetchError> {
        let url = target.as_url().clone();
        let started = Instant::now();

        // HEAD first; some servers only answer GET, so fall back to a
        // 1-byte range request as the metadata source.
        let head = self.client.head(url.clone()).send().await;
        let (meta, latency, from_head) = match head {
            Ok(resp) if resp.status().is_success() => (resp, started.elapsed(), true),
            _ => {
                let started = Instant::now();
                let resp = self
                    .client
                    .get(url.clone())
                    .header(RANGE, "bytes=0-0")
                    .send()
                    .await
                    .map_err(FetchError::from_http)?;
                let latency = started.elapsed();
                if !resp.status().is_success() {
                    return Err(status_error(resp.status(), resp.headers()));
                }
                (resp, latency, false)
            }
        };

        let mut probe = ProbeResult::new(version_label(meta.version()), latency);
        probe.peer_addr = meta.remote_addr();
        probe.server = header_str(&meta, "server").map(str::to_string);
        probe.content_type = header_str(&meta, "content-type").map(str::to_string);
        probe.validators = Validators {
            etag: header_str(&meta, "etag").map(str::to_string),
            last_modified: header_str(&meta, "last-modified").map(str::to_string),
        };
        probe.alt_svc_h3 = header_str(&meta, "alt-svc")
            .map(|v| v.contains("h3"))
            .unwrap_or(false);

        let advertised = header_str(&meta, "accept-ranges")
            .map(|v| v.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false);
        probe.content_length = if meta.status() == StatusCode::PARTIAL_CONTENT {
            total_from_content_range(&meta).or_else(|| content_length_of(&meta))
        } else {
            match content_length_of(&meta) {
                // HEAD bodies get stripped by some servers and proxies; a
                // zero there means "unknown", not "empty". The test range
                // below recovers the real total.
                Some(0) if from_head => None,
                other => other,
            }
        };
        drop(meta);

        // Advertising is not enough: require a real 206 for 1 byte.
        if advertised {
            match self
                .client
                .get(url.clone())
                .header(RANGE, "bytes=0-0")
                .send()
                .await
            {
                Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {
                    probe.supports_range = true;
                    if probe.content_length.is_none() {
                        probe.content_length = total_from_content_range(&resp);
                    }
                }
                Ok(resp) => {
                    debug!(status = %resp.status(), "test range refused, staying single-stream");
                }
                Err(e) => {
                    warn!(error = %e, "test range request failed");
                }
            }
        }

        if target.scheme() == "https" {
            let summary = tls::inspect(
                target.host(),
                target.port(),
                self.config.verify_tls,
                self.config.timeout,
            )
            .await?;
            tls::check_pin(&self.config.pins, target.host(), &summary.sha256_fingerprint)?;
            probe.tls = Some(summary);
        }

        if self.config.http3 && self.h3_ready(probe.alt_svc_h3) {
            self.use_h3.store(true, Ordering::Relaxed);
            probe.protocol = "http/3".into();
        }

        Ok(probe)
    }

    async fn open(&self, target: &Target) -> Result<Box<dyn Session>, FetchError> {
        Ok(Box::new(HttpSession {
            client: self.transfer_client(),
            url: target.as_url().clone(),
        }))
    }
}

struct HttpSession {
    client: Client,
    url: url::Url,
}

#[async_trait]
impl Session for HttpSession {
    async fn read_range(&mut self, offset: u64, length: u64) -> Result<ByteStream, FetchError> {
        let end = offset + length - 1;
        let resp = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(FetchError::from_http)?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(body_stream(resp, Some(length))),
            StatusCode::OK => Err(FetchError::ProtocolDegraded(
                "server returned the full body for a range request".into(),
            )),
            status => Err(status_error(status, resp.headers())),
        }
    }

    async fn read_all(&mut self) -> Result<ByteStream, FetchError> {
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(FetchError::from_http)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), resp.headers()));
        }
        Ok(body_stream(resp, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let when = std::time::SystemTime::now() + Duration::from_secs(60);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&httpdate::fmt_http_date(when)).unwrap(),
        );
        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed <= Duration::from_secs(60));
        assert!(parsed > Duration::from_secs(50));
    }

    #[test]
    fn test_parse_retry_after_absent() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_status_mapping() {
        let headers = HeaderMap::new();
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers),
            FetchError::ServerBackoff { status: 429, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, &headers),
            FetchError::ServerBackoff { status: 503, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::REQUEST_TIMEOUT, &headers),
            FetchError::TransientNetwork(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &headers),
            FetchError::TransientNetwork(_)
        ));
        assert!(matches!(
            status_error(StatusCode::RANGE_NOT_SATISFIABLE, &headers),
            FetchError::ProtocolDegraded(_)
        ));
        // Generic 4xx is a hard rejection, never a replan trigger.
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, &headers),
            FetchError::RequestRejected { status: 404 }
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, &headers),
            FetchError::RequestRejected { status: 403 }
        ));
        assert!(status_error(StatusCode::FORBIDDEN, &headers).is_fatal());
    }

    #[test]
    fn test_version_labels() {
        assert_eq!(version_label(Version::HTTP_11), "http/1.1");
        assert_eq!(version_label(Version::HTTP_2), "http/2");
        assert_eq!(version_label(Version::HTTP_3), "http/3");
    }
}
