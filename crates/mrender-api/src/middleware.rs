//! API middleware.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderName, HeaderValue, Method, Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::JOB_ID_HEADER;
use crate::metrics;

/// Direct (unkeyed) governor limiter, one per client IP.
pub type IpRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Upper bound on tracked client IPs.
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Limiters idle for longer than this are dropped on the next sweep.
const CLIENT_IDLE_TTL: Duration = Duration::from_secs(3600);

const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Paths polled by probes and scrapers; not worth a log line each.
const QUIET_PATHS: [&str; 3] = ["/health", "/ready", "/metrics"];

struct ClientLimiter {
    limiter: Arc<IpRateLimiter>,
    last_seen: Instant,
}

/// Per-IP rate limiters, swept when the table fills up.
#[derive(Clone)]
pub struct RateLimiterCache {
    clients: Arc<RwLock<HashMap<IpAddr, ClientLimiter>>>,
    quota: Quota,
}

impl RateLimiterCache {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            quota: Quota::per_second(rps),
        }
    }

    /// Whether `ip` may make another request now.
    pub async fn check(&self, ip: IpAddr) -> bool {
        let limiter = self.limiter_for(ip).await;
        limiter.check().is_ok()
    }

    async fn limiter_for(&self, ip: IpAddr) -> Arc<IpRateLimiter> {
        let now = Instant::now();
        let mut clients = self.clients.write().await;

        if !clients.contains_key(&ip) && clients.len() >= MAX_TRACKED_CLIENTS {
            sweep(&mut clients, now);
        }

        let entry = clients.entry(ip).or_insert_with(|| ClientLimiter {
            limiter: Arc::new(RateLimiter::direct(self.quota)),
            last_seen: now,
        });
        entry.last_seen = now;
        Arc::clone(&entry.limiter)
    }

    /// Number of client IPs currently tracked.
    pub async fn tracked_clients(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Drop idle clients, then the least recently seen ones until there is room.
fn sweep(clients: &mut HashMap<IpAddr, ClientLimiter>, now: Instant) {
    clients.retain(|_, c| now.duration_since(c.last_seen) < CLIENT_IDLE_TTL);

    if clients.len() >= MAX_TRACKED_CLIENTS {
        let mut by_age: Vec<(IpAddr, Instant)> =
            clients.iter().map(|(ip, c)| (*ip, c.last_seen)).collect();
        by_age.sort_unstable_by_key(|(_, seen)| *seen);

        let excess = clients.len() + 1 - MAX_TRACKED_CLIENTS;
        for (ip, _) in by_age.into_iter().take(excess) {
            clients.remove(&ip);
        }
        warn!(evicted = excess, "Rate limiter table full, evicted least recent clients");
    }
}

/// Create CORS layer.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let job_id_header = HeaderName::from_static("x-job-id");

    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any)
            .allow_origin(Any)
            .max_age(Duration::from_secs(600))
    } else {
        // tower-http rejects credentials combined with wildcard headers, so list them.
        let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
            .expose_headers([
                header::CONTENT_LENGTH,
                header::CONTENT_TYPE,
                header::CONTENT_DISPOSITION,
                header::RETRY_AFTER,
                job_id_header,
            ])
            .allow_credentials(true)
            .allow_origin(origins)
            .max_age(Duration::from_secs(600))
    }
}

/// Security headers middleware.
///
/// Headers already set by a handler are left alone.
pub async fn security_headers(request: Request<Body>, next: Next) -> Response<Body> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    let defaults = [
        ("x-content-type-options", "nosniff"),
        ("x-frame-options", "DENY"),
        ("referrer-policy", "strict-origin-when-cross-origin"),
        ("cross-origin-resource-policy", "same-origin"),
        ("x-permitted-cross-domain-policies", "none"),
    ];
    for (name, value) in defaults {
        headers
            .entry(HeaderName::from_static(name))
            .or_insert(HeaderValue::from_static(value));
    }

    response
}

/// Request ID middleware.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response<Body> {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Log one line per request, tagged with the job id when the response carries one.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    if !QUIET_PATHS.contains(&path.as_str()) {
        let job_id = response
            .headers()
            .get(JOB_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            job_id = %job_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request handled"
        );
    }

    response
}

/// Rate limiting middleware using IP-based rate limiter.
pub async fn rate_limit_middleware(
    State(rate_limiter): State<Arc<RateLimiterCache>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if let Some(ip) = extract_client_ip(&request) {
        if !rate_limiter.check(ip).await {
            warn!(ip = %ip, "Rate limit exceeded");
            metrics::record_rate_limit_hit(request.uri().path());
            let mut response = ApiError::RateLimited.into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            return response;
        }
    }

    next.run(request).await
}

/// Client IP: first `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
fn extract_client_ip(request: &Request<Body>) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("X-Forwarded-For")
        .or_else(|| header_ip("X-Real-IP"))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_is_per_ip() {
        let cache = RateLimiterCache::new(1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(cache.check(a).await);
        assert!(!cache.check(a).await);
        assert!(cache.check(b).await);
        assert_eq!(cache.tracked_clients().await, 2);
    }

    #[test]
    fn test_sweep_evicts_least_recent_when_full() {
        let now = Instant::now();
        let mut clients = HashMap::new();
        for i in 0..MAX_TRACKED_CLIENTS {
            let ip = IpAddr::from([10, 0, (i / 256) as u8, (i % 256) as u8]);
            clients.insert(
                ip,
                ClientLimiter {
                    limiter: Arc::new(RateLimiter::direct(Quota::per_second(NonZeroU32::MIN))),
                    last_seen: now - Duration::from_secs(10) + Duration::from_millis(i as u64),
                },
            );
        }

        sweep(&mut clients, now);

        assert_eq!(clients.len(), MAX_TRACKED_CLIENTS - 1);
        assert!(!clients.contains_key(&IpAddr::from([10, 0, 0, 0])));
    }

    #[test]
    fn test_extract_client_ip_prefers_forwarded_for() {
        let request = Request::builder()
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .header("X-Real-IP", "10.0.0.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            extract_client_ip(&request),
            Some("203.0.113.7".parse().unwrap())
        );

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(extract_client_ip(&request), None);
    }
}
