//! Basic 认证与登录失败限流。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, Request, header};
use axum::{middleware, response::Response};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::AUTH_REALM;
use crate::error::DavError;
use crate::http::request_client_ip;

#[derive(Debug)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

impl AuthConfig {
    pub fn new(
        username: String,
        password: String,
        login_max_attempts: u32,
        login_window: Duration,
        login_lockout: Duration,
    ) -> Self {
        Self {
            username,
            password,
            login_attempts: Mutex::new(HashMap::new()),
            login_window,
            login_max_attempts,
            login_lockout,
        }
    }

    fn credentials_match(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

fn unauthorized() -> DavError {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!(r#"Basic realm="{AUTH_REALM}""#)) {
        headers.insert(header::WWW_AUTHENTICATE, value);
    }
    DavError::Unauthorized(headers)
}

/// 认证中间件：校验 Basic 认证；OPTIONS 免认证以便客户端探测能力。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, DavError> {
    if req.method() == Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let client_ip = request_client_ip(&req);
    if let Some(ip) = client_ip
        && let Some(retry_after) = check_login_rate_limit(&auth, ip).await
    {
        return Err(DavError::TooManyRequests(retry_after));
    }

    match auth_header {
        Some(TypedHeader(credentials))
            if auth.credentials_match(credentials.username(), credentials.password()) =>
        {
            if let Some(ip) = client_ip {
                clear_login_failures(&auth, ip).await;
            }
            Ok(next.run(req).await)
        }
        Some(TypedHeader(credentials)) => {
            debug!(user = credentials.username(), "basic auth rejected");
            if let Some(ip) = client_ip {
                register_login_failure(&auth, ip).await;
            }
            Err(unauthorized())
        }
        None => Err(unauthorized()),
    }
}

async fn check_login_rate_limit(auth: &AuthConfig, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.get_mut(&ip)?;

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
        }
        entry.locked_until = None;
        entry.failures = 0;
        entry.window_start = now;
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
    }

    None
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
        entry.locked_until = None;
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthConfig, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
