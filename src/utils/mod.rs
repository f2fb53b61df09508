// 日志等通用工具
pub mod logging;

pub use logging::LoggingConfig;
