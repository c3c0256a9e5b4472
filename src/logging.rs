//! 日志初始化：支持环境变量覆盖与默认值。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化 tracing 日志订阅；`RUST_LOG` 优先，其次按 `debug` 选择默认级别。
pub fn init_logging(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
