//! 日志初始化
//!
//! 诊断信息经 `tracing` 输出到 stderr, 不与 stdout 上的表格混在一起.
//! 设置了 `RUST_LOG` 时以其为准.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// `-v` 个数对应的默认日志级别
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// 初始化 tracing subscriber, 重复调用无效果
pub fn init(verbosity: u8) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("nodecheck={}", level_for(verbosity))));

        // 测试中可能已经装好了 subscriber, 用 try_init
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}
