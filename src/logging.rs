//! 日志初始化：支持环境变量覆盖与默认值。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 默认过滤规则，调试模式下提升本 crate 的日志级别。
pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        concat!("info,", env!("CARGO_CRATE_NAME"), "=debug,tower_http=debug")
    } else {
        "info"
    }
}

/// 初始化 tracing 日志订阅，`RUST_LOG` 优先于默认规则。
pub fn init_logging(debug: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
