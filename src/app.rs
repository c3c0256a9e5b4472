//! 服务端状态与路由组装：认证 → 请求日志 → 锁检查 → 方法分发。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use axum::{Router, middleware, response::Response};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info_span};

use crate::adapter::ResourceAdapter;
use crate::auth::{self, AuthConfig};
use crate::error::DavError;
use crate::headers::{parse_destination, submitted_tokens};
use crate::http::request_client_ip;
use crate::path::{DavPath, strip_mount};
use crate::webdav::{self, Method};
use crate::webdav_lock::LockManager;

/// 请求处理所需的共享状态，每个服务实例一份。
pub struct DavContext {
    pub adapter: Arc<ResourceAdapter>,
    pub locks: Arc<LockManager>,
    /// 规范化后的挂载前缀，挂载在 `/` 时为 `""`。
    pub prefix: String,
    pub assume_overwrite: bool,
    pub lock_default_timeout: Duration,
    pub lock_max_timeout: Duration,
}

impl DavContext {
    /// 请求 URL 路径 → 资源路径；挂载点之外返回 NotFound。
    pub fn request_path(&self, uri_path: &str) -> Result<DavPath, DavError> {
        let inner = strip_mount(&self.prefix, uri_path)
            .ok_or_else(|| DavError::NotFound(format!("{uri_path} is outside the mount")))?;
        DavPath::parse(inner)
    }
}

/// 写操作的锁检查：请求未携带匹配令牌时返回 Locked。
///
/// 只读取请求头部分，请求体留给后续处理。
pub async fn check_request_locks(ctx: &DavContext, parts: &Parts) -> Result<(), DavError> {
    let method = Method::from_http(&parts.method);
    let deep = match method {
        Method::Put | Method::Mkcol | Method::Proppatch => false,
        Method::Delete | Method::Move => true,
        Method::Copy => {
            return check_destination(ctx, &parts.headers).await;
        }
        _ => return Ok(()),
    };
    let Ok(path) = ctx.request_path(parts.uri.path()) else {
        return Ok(());
    };
    let tokens = submitted_tokens(&parts.headers);
    if let Err(lock) = ctx.locks.check_write(&path, deep, &tokens).await {
        debug!(path = %path, lock_root = %lock.path, "write blocked by lock");
        return Err(DavError::Locked(format!("{path} is locked")));
    }
    let changes_membership = match method {
        Method::Mkcol | Method::Delete | Method::Move => true,
        // 覆盖已有文件不改变父集合的成员
        Method::Put => !ctx.adapter.exists(&path).await.unwrap_or(true),
        _ => false,
    };
    if changes_membership {
        check_parent(ctx, &path, &tokens).await?;
    }
    if method == Method::Move {
        check_destination(ctx, &parts.headers).await?;
    }
    Ok(())
}

/// 集合上的锁同样保护其成员的增删，深度为 0 时也是如此。
async fn check_parent(ctx: &DavContext, path: &DavPath, tokens: &[String]) -> Result<(), DavError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if let Err(lock) = ctx.locks.check_write(&parent, false, tokens).await {
        debug!(path = %path, lock_root = %lock.path, "membership change blocked by lock");
        return Err(DavError::Locked(format!("{parent} is locked")));
    }
    Ok(())
}

async fn check_destination(ctx: &DavContext, headers: &HeaderMap) -> Result<(), DavError> {
    let Ok(dest) = parse_destination(headers, &ctx.prefix) else {
        return Ok(());
    };
    let tokens = submitted_tokens(headers);
    if let Err(lock) = ctx.locks.check_write(&dest, true, &tokens).await {
        debug!(dest = %dest, lock_root = %lock.path, "destination blocked by lock");
        return Err(DavError::Locked(format!("{dest} is locked")));
    }
    check_parent(ctx, &dest, &tokens).await
}

/// 锁检查中间件。
pub async fn lock_enforcement(
    Extension(ctx): Extension<Arc<DavContext>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, DavError> {
    let (parts, body) = req.into_parts();
    check_request_locks(&ctx, &parts).await?;
    Ok(next.run(Request::from_parts(parts, body)).await)
}

/// 构建完整路由；后添加的层包裹先添加的层。
pub fn build_router(
    ctx: Arc<DavContext>,
    auth: Option<Arc<AuthConfig>>,
    cors: Option<CorsLayer>,
) -> Router {
    let mut app = Router::new()
        .fallback(webdav::handle_request)
        .layer(middleware::from_fn(lock_enforcement))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = request_client_ip(request)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    if let Some(auth) = auth {
        app = app
            .layer(middleware::from_fn(auth::auth_middleware))
            .layer(Extension(auth));
    }
    app = app.layer(Extension(ctx));
    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}
