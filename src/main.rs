//! AxoDav 服务入口。
//!
//! 以 WebDAV class 1/2 对外提供远端节点存储。启动时依次装配节点存储、元数据缓存、
//! 路径解析器、锁管理器与 Axum 中间件栈，然后运行单个 HTTP 监听直到关闭。

mod adapter;
mod app;
mod atomic;
mod auth;
mod background;
mod cache;
mod config;
mod copy_move;
mod dav_xml;
mod error;
mod etag;
mod headers;
mod http;
mod lock_store;
mod logging;
mod path;
mod propfind;
mod resolver;
mod store;
mod webdav;
mod webdav_lock;

use axum::Router;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::adapter::ResourceAdapter;
use crate::app::{DavContext, build_router};
use crate::auth::AuthConfig;
use crate::background::spawn_background_tasks;
use crate::cache::MetadataCache;
use crate::config::{Args, Backend, SHUTDOWN_GRACE_SECS};
use crate::http::build_cors_layer;
use crate::lock_store::LockStore;
use crate::path::{DavPath, normalize_prefix};
use crate::resolver::PathResolver;
use crate::store::{LocalNodeStore, MemoryNodeStore, RemoteNodeStore};
use crate::webdav_lock::LockManager;

shadow!(build);

/// 启动 AxoDav 服务并阻塞直到关闭。
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    logging::init_logging(args.debug);

    let store: Arc<dyn RemoteNodeStore> = match args.backend {
        Backend::Memory => {
            warn!("memory backend selected; content is lost on exit");
            Arc::new(MemoryNodeStore::new())
        }
        Backend::Local => {
            let local = LocalNodeStore::new(PathBuf::from(&args.storage_dir));
            local.ensure_root().await?;
            info!(root = %local.root_path().display(), "local backend ready");
            Arc::new(local)
        }
    };

    let cache = Arc::new(MetadataCache::new(
        Duration::from_secs(args.cache_ttl_secs),
        args.cache_max_entries,
    ));
    let remote_path = DavPath::parse(&args.remote_path)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let resolver = Arc::new(PathResolver::new(store, cache.clone(), remote_path));
    let adapter = Arc::new(ResourceAdapter::new(resolver));

    let lock_store = LockStore::new(PathBuf::from(&args.lock_file));
    if args.reset_locks {
        lock_store.reset().await?;
        info!(path = %lock_store.path().display(), "persisted locks cleared");
    }
    let locks = Arc::new(LockManager::load(lock_store).await?);
    let restored = locks.get_all_locks().await.len();
    if restored > 0 {
        info!(restored, "active locks restored");
    }

    let auth = match (args.auth_user.clone(), args.auth_pass.clone()) {
        (Some(username), Some(password)) => Some(Arc::new(AuthConfig::new(
            username,
            password,
            args.login_max_attempts,
            Duration::from_secs(args.login_window_secs),
            Duration::from_secs(args.login_lockout_secs),
        ))),
        (None, None) => None,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "--auth-user and --auth-pass must be set together",
            ));
        }
    };
    if auth.is_none() {
        warn!("basic auth disabled; every client has full access");
    }

    let ctx = Arc::new(DavContext {
        adapter,
        locks: locks.clone(),
        prefix: normalize_prefix(&args.prefix),
        assume_overwrite: args.assume_overwrite,
        lock_default_timeout: Duration::from_secs(args.lock_default_timeout_secs),
        lock_max_timeout: Duration::from_secs(args.lock_max_timeout_secs),
    });
    let prefix = ctx.prefix.clone();
    let app = build_router(
        ctx,
        auth.clone(),
        build_cors_layer(args.cors_origins.as_deref()),
    );

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting WebDAV server at http://{}{}/", addr, prefix);

    spawn_background_tasks(locks, cache, auth);
    tokio::spawn(shutdown_signal(handle.clone()));
    serve(addr, app, handle).await?;
    info!("server stopped");

    Ok(())
}

/// 运行监听，直到 `handle` 触发关闭且在途请求处理完毕。
async fn serve(addr: SocketAddr, app: Router, handle: Handle) -> io::Result<()> {
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
