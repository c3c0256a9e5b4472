//! WebDAV 方法分发与各方法处理。

use axum::body::{Body as AxumBody, to_bytes};
use axum::extract::Extension;
use axum::http::{self, HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use httpdate::fmt_http_date;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::app::DavContext;
use crate::copy_move::{check_transfer, execute_copy, execute_move};
use crate::dav_xml::{
    XML_CONTENT_TYPE, lock_response_body, parse_lockinfo, parse_propfind, parse_proppatch,
    proppatch_body,
};
use crate::error::DavError;
use crate::etag::{check_preconditions, etag_for_node, if_range_matches};
use crate::headers::{
    Depth, parse_depth, parse_lock_token, parse_range, parse_timeout, submitted_tokens,
};
use crate::path::DavPath;
use crate::propfind::propfind;
use crate::store::ByteStream;
use crate::webdav_lock::{LockDepth, LockManager, LockRequest};

/// XML 请求体（PROPFIND、PROPPATCH、LOCK）的大小上限。
const MAX_XML_BODY: usize = 1024 * 1024;
const ALLOWED_METHODS: &str =
    "OPTIONS, GET, HEAD, PUT, DELETE, MKCOL, PROPFIND, PROPPATCH, COPY, MOVE, LOCK, UNLOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Get,
    Head,
    Put,
    Delete,
    Mkcol,
    Propfind,
    Proppatch,
    Copy,
    Move,
    Lock,
    Unlock,
    Other,
}

impl Method {
    pub fn from_http(method: &http::Method) -> Self {
        match method.as_str() {
            "OPTIONS" => Method::Options,
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "MKCOL" => Method::Mkcol,
            "PROPFIND" => Method::Propfind,
            "PROPPATCH" => Method::Proppatch,
            "COPY" => Method::Copy,
            "MOVE" => Method::Move,
            "LOCK" => Method::Lock,
            "UNLOCK" => Method::Unlock,
            _ => Method::Other,
        }
    }
}

/// WebDAV 入口：解析路径并按方法分发。
pub async fn handle_request(
    Extension(ctx): Extension<Arc<DavContext>>,
    req: Request<AxumBody>,
) -> Response {
    let method = req.method().clone();
    let uri_path = req.uri().path().to_string();
    match dispatch(&ctx, req).await {
        Ok(response) => response,
        Err(err) => {
            debug!(method = %method, path = %uri_path, error = %err, "webdav request failed");
            err.into_response()
        }
    }
}

async fn dispatch(ctx: &DavContext, req: Request<AxumBody>) -> Result<Response, DavError> {
    let method = Method::from_http(req.method());
    if method == Method::Options {
        return Ok(options());
    }
    let path = ctx.request_path(req.uri().path())?;
    match method {
        Method::Get => get(ctx, &path, req.headers(), false).await,
        Method::Head => get(ctx, &path, req.headers(), true).await,
        Method::Put => put(ctx, &path, req).await,
        Method::Delete => delete(ctx, &path).await,
        Method::Mkcol => mkcol(ctx, &path, req).await,
        Method::Propfind => handle_propfind(ctx, &path, req).await,
        Method::Proppatch => proppatch(ctx, &path, req).await,
        Method::Copy => copy(ctx, &path, req.headers()).await,
        Method::Move => move_resource(ctx, &path, req.headers()).await,
        Method::Lock => lock(ctx, &path, req).await,
        Method::Unlock => unlock(ctx, &path, req.headers()).await,
        Method::Options | Method::Other => Err(DavError::MethodNotAllowed(format!(
            "{} is not supported",
            req.method()
        ))),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, DavError> {
    HeaderValue::from_str(value).map_err(|_| DavError::Internal("响应头构建失败".into()))
}

async fn read_body(body: AxumBody) -> Result<Bytes, DavError> {
    to_bytes(body, MAX_XML_BODY)
        .await
        .map_err(|err| DavError::InvalidRequest(format!("unreadable request body: {err}")))
}

fn xml_response(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE))],
        body,
    )
        .into_response()
}

fn options() -> Response {
    (
        StatusCode::OK,
        [
            (header::HeaderName::from_static("dav"), "1, 2"),
            (header::ALLOW, ALLOWED_METHODS),
            (header::HeaderName::from_static("ms-author-via"), "DAV"),
            (header::ACCEPT_RANGES, "bytes"),
        ],
    )
        .into_response()
}

/// GET / HEAD：支持单区间 Range 与 If-Range。
async fn get(
    ctx: &DavContext,
    path: &DavPath,
    request_headers: &HeaderMap,
    head_only: bool,
) -> Result<Response, DavError> {
    let node = ctx.adapter.stat(path).await?;
    if node.is_folder() {
        return Err(DavError::NotFound(format!("{path} is a collection")));
    }
    let etag = etag_for_node(&node);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(&node.mime_type)?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(header::ETAG, header_value(&etag)?);
    response_headers.insert(
        header::LAST_MODIFIED,
        header_value(&fmt_http_date(SystemTime::from(node.modified_at)))?,
    );

    if request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|tag| tag.trim() == etag || tag.trim() == "*"))
    {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let range = if if_range_matches(request_headers, &node) {
        parse_range(request_headers.get(header::RANGE), node.size)?
    } else {
        None
    };
    let (status, length) = match range {
        Some(range) => {
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {}-{}/{}", range.start, range.end, node.size))?,
            );
            (StatusCode::PARTIAL_CONTENT, range.len())
        }
        None => (StatusCode::OK, node.size),
    };

    if head_only {
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        return Ok((status, response_headers).into_response());
    }
    // 读取流被限定为恰好 handle.length 字节
    let handle = ctx.adapter.open_read(path, range).await?;
    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&handle.length.to_string())?,
    );
    debug!(path = %path, range = ?handle.range, length = handle.length, "serving content");
    Ok((status, response_headers, AxumBody::from_stream(handle.stream)).into_response())
}

/// 析构时丢弃临时锁，除非创建对应资源的 PUT 已完成。
struct ProvisionalGuard {
    locks: Arc<LockManager>,
    tokens: Vec<String>,
}

impl ProvisionalGuard {
    fn disarm(mut self) {
        self.tokens.clear();
    }
}

impl Drop for ProvisionalGuard {
    fn drop(&mut self) {
        if self.tokens.is_empty() {
            return;
        }
        let tokens = std::mem::take(&mut self.tokens);
        let locks = self.locks.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for token in tokens {
                        locks.discard_provisional(&token).await;
                    }
                });
            }
            Err(_) => warn!(count = tokens.len(), "no runtime to release provisional locks"),
        }
    }
}

async fn put(
    ctx: &DavContext,
    path: &DavPath,
    req: Request<AxumBody>,
) -> Result<Response, DavError> {
    let headers = req.headers().clone();
    let existing = ctx.adapter.resolver().try_resolve(path).await?;
    if existing.as_ref().is_some_and(|node| node.is_folder()) {
        return Err(DavError::MethodNotAllowed(format!("{path} is a collection")));
    }
    let current_etag = existing.as_ref().map(etag_for_node);
    check_preconditions(&headers, current_etag.as_deref(), existing.is_some())?;

    let expected_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let guard = ProvisionalGuard {
        locks: ctx.locks.clone(),
        tokens: ctx
            .locks
            .get_locks_for_path(path)
            .await
            .into_iter()
            .filter(|lock| lock.provisional && lock.path == *path)
            .map(|lock| lock.token)
            .collect(),
    };

    let content: ByteStream = http_body_util::BodyExt::into_data_stream(req.into_body())
        .map_err(io::Error::other)
        .boxed();
    let outcome = ctx.adapter.open_write(path, content, expected_size).await?;
    ctx.locks.confirm_provisional(path).await;
    guard.disarm();

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    };
    Ok((
        status,
        [(header::ETAG, header_value(&etag_for_node(&outcome.node))?)],
    )
        .into_response())
}

async fn delete(ctx: &DavContext, path: &DavPath) -> Result<Response, DavError> {
    ctx.adapter.remove(path).await?;
    let dropped = ctx.locks.remove_tree(path).await;
    if dropped > 0 {
        info!(path = %path, dropped, "locks released with deleted resource");
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn mkcol(
    ctx: &DavContext,
    path: &DavPath,
    req: Request<AxumBody>,
) -> Result<Response, DavError> {
    let body = read_body(req.into_body()).await?;
    if !body.is_empty() {
        return Err(DavError::UnsupportedMediaType);
    }
    ctx.adapter.create(path, true).await?;
    ctx.locks.confirm_provisional(path).await;
    Ok(StatusCode::CREATED.into_response())
}

async fn handle_propfind(
    ctx: &DavContext,
    path: &DavPath,
    req: Request<AxumBody>,
) -> Result<Response, DavError> {
    let depth = parse_depth(req.headers(), Depth::Infinity)?;
    let body = read_body(req.into_body()).await?;
    let request = parse_propfind(&body)?;
    let output = propfind(&ctx.adapter, &ctx.locks, path, depth, &request, &ctx.prefix).await?;
    Ok(xml_response(StatusCode::MULTI_STATUS, output))
}

/// 所有属性均为只读：返回 207，每个属性 403。
async fn proppatch(
    ctx: &DavContext,
    path: &DavPath,
    req: Request<AxumBody>,
) -> Result<Response, DavError> {
    let node = ctx.adapter.stat(path).await?;
    let body = read_body(req.into_body()).await?;
    let names = parse_proppatch(&body)?;
    let output = proppatch_body(&path.href(&ctx.prefix, node.is_folder()), &names)?;
    Ok(xml_response(StatusCode::MULTI_STATUS, output))
}

async fn copy(ctx: &DavContext, path: &DavPath, headers: &HeaderMap) -> Result<Response, DavError> {
    let transfer =
        check_transfer(&ctx.adapter, path, headers, &ctx.prefix, ctx.assume_overwrite).await?;
    let status = execute_copy(&ctx.adapter, &transfer).await?;
    Ok(status.into_response())
}

async fn move_resource(
    ctx: &DavContext,
    path: &DavPath,
    headers: &HeaderMap,
) -> Result<Response, DavError> {
    let transfer =
        check_transfer(&ctx.adapter, path, headers, &ctx.prefix, ctx.assume_overwrite).await?;
    let status = execute_move(&ctx.adapter, &ctx.locks, &transfer).await?;
    Ok(status.into_response())
}

/// LOCK：带请求体时创建锁，空请求体时按 If 头中的令牌刷新。
async fn lock(
    ctx: &DavContext,
    path: &DavPath,
    req: Request<AxumBody>,
) -> Result<Response, DavError> {
    let headers = req.headers().clone();
    let body = read_body(req.into_body()).await?;
    let timeout = parse_timeout(&headers, ctx.lock_default_timeout, ctx.lock_max_timeout);

    let Some(info) = parse_lockinfo(&body)? else {
        let tokens = submitted_tokens(&headers);
        if tokens.is_empty() {
            return Err(DavError::InvalidRequest(
                "lock refresh needs a token in the If header".into(),
            ));
        }
        for token in &tokens {
            if let Some(lock) = ctx.locks.refresh_lock(path, token, timeout).await {
                let output = lock_response_body(&lock, &ctx.prefix)?;
                return Ok(xml_response(StatusCode::OK, output));
            }
        }
        return Err(DavError::PreconditionFailed(format!(
            "no submitted token covers {path}"
        )));
    };

    let depth = match parse_depth(&headers, Depth::Infinity)? {
        Depth::Zero => LockDepth::Zero,
        Depth::Infinity => LockDepth::Infinity,
        Depth::One => return Err(DavError::InvalidRequest("Depth: 1 is not valid for LOCK".into())),
    };

    let provisional = match ctx.adapter.resolver().try_resolve(path).await? {
        Some(_) => false,
        None => {
            if path.is_root() {
                return Err(DavError::Consistency("the served root is missing".into()));
            }
            match ctx.adapter.resolver().resolve_parent(path).await {
                Ok(parent) if parent.is_folder() => true,
                Ok(_) | Err(DavError::NotFound(_)) => {
                    return Err(DavError::Conflict(format!("parent of {path} does not exist")));
                }
                Err(err) => return Err(err),
            }
        }
    };

    let lock = ctx
        .locks
        .create_lock(LockRequest {
            path: path.clone(),
            owner: info.owner,
            timeout,
            scope: info.scope,
            depth,
            provisional,
        })
        .await
        .map_err(|conflict| {
            DavError::Locked(format!("{path} conflicts with lock on {}", conflict.path))
        })?;

    let output = lock_response_body(&lock, &ctx.prefix)?;
    let mut response = xml_response(StatusCode::OK, output);
    response.headers_mut().insert(
        header::HeaderName::from_static("lock-token"),
        header_value(&format!("<{}>", lock.token))?,
    );
    Ok(response)
}

async fn unlock(ctx: &DavContext, path: &DavPath, headers: &HeaderMap) -> Result<Response, DavError> {
    let token = parse_lock_token(headers)?;
    if ctx.locks.get_lock(&token).await.is_none() {
        return Err(DavError::NotFound(format!("no active lock {token}")));
    }
    if !ctx.locks.validate_token(path, &token).await {
        return Err(DavError::Conflict(format!("{token} does not cover {path}")));
    }
    ctx.locks.delete_lock(&token).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}
