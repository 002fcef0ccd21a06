//! Request gatekeeping applied ahead of the catalog and media handlers:
//! per-client rate limiting, CORS, and referer/origin/user-agent checks.

use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::error::ApiError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use url::Url;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after: Duration },
}

/// Sliding-window request counter keyed by client address
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    clock: Arc<dyn Clock>,
    trusted_proxy_hops: usize,
    /// Request times per client, oldest first
    clients: Mutex<HashMap<String, VecDeque<SystemTime>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            max_requests,
            clock,
            trusted_proxy_hops: 0,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Key clients by `X-Forwarded-For` as written by this many proxies
    pub fn with_trusted_proxy_hops(mut self, hops: usize) -> Self {
        self.trusted_proxy_hops = hops;
        self
    }

    fn in_window(&self, now: SystemTime, at: SystemTime) -> bool {
        match now.duration_since(at) {
            Ok(age) => age < self.window,
            // Recorded in the future (clock stepped back); still counts
            Err(_) => true,
        }
    }

    /// Record a request from `client` if it fits in the current window
    pub fn check(&self, client: &str) -> RateDecision {
        let now = self.clock.now();
        let mut clients = self.clients.lock();
        let history = clients.entry(client.to_string()).or_default();

        while let Some(&oldest) = history.front() {
            if self.in_window(now, oldest) {
                break;
            }
            history.pop_front();
        }

        if history.len() >= self.max_requests {
            return RateDecision::Limited {
                retry_after: self.window,
            };
        }

        history.push_back(now);
        RateDecision::Allowed {
            remaining: self.max_requests - history.len(),
        }
    }

    /// Forget clients with no requests inside the window
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut clients = self.clients.lock();
        let before = clients.len();

        clients.retain(|_, history| {
            history.retain(|&at| self.in_window(now, at));
            !history.is_empty()
        });

        before - clients.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Client identity for rate limiting.
///
/// Each trusted proxy appends the address it saw to `X-Forwarded-For`, so
/// the client is the entry `trusted_hops` positions from the right. With no
/// trusted proxies the header is ignored and the peer address is used.
pub fn client_key(request: &Request, trusted_hops: usize) -> String {
    if trusted_hops > 0 {
        let forwarded = request
            .headers()
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>();

        // Fewer entries than hops: the leftmost one is as far as we can see
        if let Some(hop) = forwarded.get(forwarded.len().saturating_sub(trusted_hops)) {
            return hop.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limit middleware
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_key(&request, limiter.trusted_proxy_hops);

    match limiter.check(&client) {
        RateDecision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert("ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        RateDecision::Limited { retry_after } => {
            warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
            metrics::counter!("rate_limited_total").increment(1);
            ApiError::RateLimited {
                retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
            }
            .into_response()
        }
    }
}

/// Referer, origin and user-agent policy for media requests
#[derive(Debug, Clone)]
pub struct RequestValidator {
    allowed_referer_domains: Vec<String>,
    allowed_origins: Vec<String>,
    /// Lowercased fragments
    blocked_user_agents: Vec<String>,
}

impl RequestValidator {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            allowed_referer_domains: config.allowed_referer_domains.clone(),
            allowed_origins: config.allowed_origins.clone(),
            blocked_user_agents: config
                .blocked_user_agents
                .iter()
                .map(|ua| ua.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Missing referer is allowed (direct access)
    pub fn validate_referer(&self, referer: Option<&str>) -> bool {
        let Some(referer) = referer else {
            return true;
        };

        let Ok(url) = Url::parse(referer) else {
            debug!(referer = %referer, "Unparseable referer");
            return false;
        };

        let Some(host) = url.host_str() else {
            return false;
        };
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        self.allowed_referer_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
    }

    pub fn validate_user_agent(&self, user_agent: Option<&str>) -> bool {
        let user_agent = user_agent.unwrap_or_default().to_ascii_lowercase();
        !self
            .blocked_user_agents
            .iter()
            .any(|fragment| user_agent.contains(fragment.as_str()))
    }

    /// Missing origin is allowed (direct access)
    pub fn validate_origin(&self, origin: Option<&str>) -> bool {
        origin.map_or(true, |origin| {
            self.allowed_origins.iter().any(|allowed| allowed == origin)
        })
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let get = move |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        if !self.validate_referer(get(header::REFERER)) {
            return Err(ApiError::Forbidden("Invalid referer".to_string()));
        }
        if !self.validate_user_agent(get(header::USER_AGENT)) {
            return Err(ApiError::Forbidden("Invalid user agent".to_string()));
        }
        if !self.validate_origin(get(header::ORIGIN)) {
            return Err(ApiError::Forbidden("Invalid request origin".to_string()));
        }
        Ok(())
    }
}

/// Request validation middleware for media routes
pub async fn validate_request(
    State(validator): State<Arc<RequestValidator>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = validator.check(request.headers()) {
        warn!(
            path = %request.uri().path(),
            user_agent = ?request.headers().get(header::USER_AGENT),
            reason = %e,
            "Rejected media request"
        );
        return e.into_response();
    }
    next.run(request).await
}

/// CORS for the single frontend origin, with credentials
pub fn cors_layer(frontend_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    match frontend_origin.parse::<HeaderValue>() {
        Ok(origin) => base.allow_origin(origin).allow_credentials(true),
        Err(_) => {
            warn!(origin = %frontend_origin, "Invalid frontend origin, CORS disabled");
            base
        }
    }
}
