//! 命令行参数与服务配置默认值。

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 5005;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_LOCK_FILE: &str = ".axo/dav-locks.json";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_LOCK_MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const AUTH_REALM: &str = "axo-dav";
pub const MAINTENANCE_INTERVAL_SECS: u64 = 60;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// 服务使用的 `RemoteNodeStore` 实现。
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// 进程内存中的目录树，退出即丢失。
    Memory,
    /// 本地目录，按路径生成稳定的节点 ID。
    Local,
}

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug, Clone)]
#[command(name = "axo-dav", version = VERSION_INFO, about = "WebDAV server over a remote node store")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "AXO_DAV_BIND",
        default_value = "127.0.0.1",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_DAV_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "AXO_DAV_PREFIX",
        default_value = "",
        help = "URL prefix the WebDAV tree is mounted under, e.g. /dav"
    )]
    pub prefix: String,
    #[arg(
        long,
        env = "AXO_DAV_BACKEND",
        value_enum,
        default_value_t = Backend::Local,
        help = "Node store backend"
    )]
    pub backend: Backend,
    #[arg(
        short = 's',
        long,
        env = "AXO_DAV_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Root directory for the local backend"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "AXO_DAV_REMOTE_PATH",
        default_value = "/",
        help = "Folder inside the store served as the WebDAV root"
    )]
    pub remote_path: String,
    #[arg(
        long,
        env = "AXO_DAV_CACHE_TTL_SECS",
        default_value_t = DEFAULT_CACHE_TTL_SECS,
        help = "Metadata cache TTL in seconds (0 to disable)"
    )]
    pub cache_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_DAV_CACHE_MAX_ENTRIES",
        default_value_t = DEFAULT_CACHE_MAX_ENTRIES,
        help = "Max metadata cache entries (0 for no limit)"
    )]
    pub cache_max_entries: usize,
    #[arg(
        long,
        env = "AXO_DAV_LOCK_FILE",
        default_value = DEFAULT_LOCK_FILE,
        help = "File the lock table is persisted to"
    )]
    pub lock_file: String,
    #[arg(
        long,
        env = "AXO_DAV_LOCK_DEFAULT_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_TIMEOUT_SECS,
        help = "Lock timeout when the client sends none"
    )]
    pub lock_default_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_DAV_LOCK_MAX_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_MAX_TIMEOUT_SECS,
        help = "Upper bound for lock timeouts, including Infinite"
    )]
    pub lock_max_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_DAV_ASSUME_OVERWRITE",
        help = "Treat a missing Overwrite header as T"
    )]
    pub assume_overwrite: bool,
    #[arg(
        long,
        env = "AXO_DAV_AUTH_USER",
        help = "Basic auth username (auth is on when user and password are both set)"
    )]
    pub auth_user: Option<String>,
    #[arg(long, env = "AXO_DAV_AUTH_PASS", help = "Basic auth password")]
    pub auth_pass: Option<String>,
    #[arg(
        long,
        env = "AXO_DAV_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Failed logins before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "AXO_DAV_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login failure window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "AXO_DAV_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Lockout time after too many failed logins"
    )]
    pub login_lockout_secs: u64,
    #[arg(long, env = "AXO_DAV_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(short = 'd', long, env = "AXO_DAV_DEBUG", help = "Verbose logging")]
    pub debug: bool,
    #[arg(long, help = "Delete the persisted lock table before starting")]
    pub reset_locks: bool,
}
