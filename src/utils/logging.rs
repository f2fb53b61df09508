use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{EngineConfig, EnvConfig};

/// 控制台输出镜像到 tracing 时使用的 target
pub const CONSOLE_TARGET: &str = "cpsflow::console";

/// tracing 订阅者的安装入口
///
/// - RUST_LOG 优先于内置过滤器
/// - CPSFLOW_DEBUG 打开 target、文件、行号与线程 id，并输出步骤控制台
///
/// ```no_run
/// use cpsflow::utils::LoggingConfig;
///
/// LoggingConfig::init();
/// tracing::info!("ready");
/// ```
pub struct LoggingConfig;

impl LoggingConfig {
    pub fn init() {
        let debug = Self::is_debug();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Self::default_directives(debug)));
        Self::install(filter, debug);
    }

    pub fn init_with_filter(filter: &str) {
        Self::install(EnvFilter::new(filter), Self::is_debug());
    }

    /// 按引擎配置初始化：配置了过滤器就用它，否则走默认规则
    pub fn init_for(config: &EngineConfig) {
        match &config.log {
            Some(filter) => Self::init_with_filter(filter),
            None => Self::init(),
        }
    }

    pub fn is_debug() -> bool {
        EnvConfig::is_debug_mode()
    }

    /// 非调试模式下控制台行由命令行自己打印，不再经过 tracing
    fn default_directives(debug: bool) -> String {
        if debug {
            "cpsflow=debug,info".to_string()
        } else {
            format!("cpsflow=info,{CONSOLE_TARGET}=warn,warn")
        }
    }

    fn install(filter: EnvFilter, debug: bool) {
        let layer = fmt::layer()
            .with_target(debug)
            .with_file(debug)
            .with_line_number(debug)
            .with_thread_ids(debug);

        // 测试与嵌入场景下可能已经装过订阅者
        if tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .is_err()
        {
            return;
        }
        if debug {
            tracing::debug!("Debug logging enabled");
        }
    }
}

/// 记录一个错误，可附带结构化字段
#[macro_export]
macro_rules! log_error {
    ($err:expr) => {
        tracing::error!(error = %$err, "Operation failed")
    };
    ($err:expr, $($key:ident = $value:expr),+) => {
        tracing::error!(error = %$err, $($key = $value),+, "Operation failed")
    };
}

/// 记录一条警告，可附带结构化字段
#[macro_export]
macro_rules! log_warn {
    ($msg:expr) => {
        tracing::warn!("{}", $msg)
    };
    ($msg:expr, $($key:ident = $value:expr),+) => {
        tracing::warn!($($key = $value),+, "{}", $msg)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_is_quiet_unless_debugging() {
        assert!(LoggingConfig::default_directives(false).contains("cpsflow::console=warn"));
        assert!(!LoggingConfig::default_directives(true).contains("cpsflow::console"));
    }

    #[test]
    fn repeated_init_keeps_first_subscriber() {
        LoggingConfig::init_with_filter("cpsflow=debug");
        LoggingConfig::init_with_filter("cpsflow=trace");
        crate::log_warn!("still logging", attempt = 2);
        crate::log_error!(crate::FlowError::ProgramFinished, step = "echo");
    }
}
