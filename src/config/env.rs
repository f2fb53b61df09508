use crate::error::{FlowError, Result};
use anyhow::anyhow;
use std::env;

/// 单个环境变量的读取
pub struct EnvConfig;

impl EnvConfig {
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key).map_err(|_| {
            FlowError::Other(anyhow!("environment variable `{}` is not set", key))
        })
    }

    /// 未设置或为空都视为没有
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.is_empty())
    }

    pub fn get_bool(key: &str) -> Option<bool> {
        Self::get_env_optional(key).map(|value| Self::parse_bool(&value))
    }

    /// 1/true/yes/on 为真，其余为假
    pub fn parse_bool(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }

    pub fn is_debug_mode() -> bool {
        env::var("CPSFLOW_DEBUG").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_bool() {
        env::set_var("CPSFLOW_TEST_FLAG", "Yes");
        assert_eq!(EnvConfig::get_bool("CPSFLOW_TEST_FLAG"), Some(true));
        env::set_var("CPSFLOW_TEST_FLAG", "0");
        assert_eq!(EnvConfig::get_bool("CPSFLOW_TEST_FLAG"), Some(false));
        env::set_var("CPSFLOW_TEST_FLAG", "");
        assert_eq!(EnvConfig::get_bool("CPSFLOW_TEST_FLAG"), None);
        env::remove_var("CPSFLOW_TEST_FLAG");
        assert_eq!(EnvConfig::get_bool("CPSFLOW_TEST_FLAG"), None);
    }

    #[test]
    fn test_get_env_missing() {
        env::remove_var("CPSFLOW_TEST_MISSING");
        let err = EnvConfig::get_env("CPSFLOW_TEST_MISSING").unwrap_err();
        assert!(err.to_string().contains("CPSFLOW_TEST_MISSING"));
    }
}
