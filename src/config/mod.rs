// 引擎配置
pub mod env;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::runtime::Executable;

pub use env::EnvConfig;

/// 流程节点的存储方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// 每个节点一个 JSON 文件
    #[default]
    File,
    /// 只保存在内存中，重新加载后丢失
    Memory,
}

impl FromStr for StorageKind {
    type Err = FlowError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(FlowError::Storage(format!("unknown storage kind `{other}`"))),
        }
    }
}

/// 引擎级默认配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 执行目录的根
    pub home: PathBuf,
    pub sandbox: bool,
    pub storage: StorageKind,
    /// tracing 过滤表达式
    pub log: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".cpsflow"),
            sandbox: false,
            storage: StorageKind::File,
            log: None,
        }
    }
}

impl EngineConfig {
    /// 读取 JSON 配置文件，再应用环境变量覆盖
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config: EngineConfig = serde_json::from_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// 默认值加环境变量覆盖
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// 未指定目录时的执行根：`home/<job>/<number>` 或 `home/<脚本名>`
    pub fn execution_dir(&self, script: &Path, build: Option<&Executable>) -> PathBuf {
        match build {
            Some(build) => self.home.join(&build.job).join(build.number.to_string()),
            None => {
                let stem = script
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "flow".to_string());
                self.home.join(stem)
            }
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(EnvConfig::get_env_optional)
    }

    /// CPSFLOW_HOME / CPSFLOW_SANDBOX / CPSFLOW_STORAGE / CPSFLOW_LOG
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(home) = lookup("CPSFLOW_HOME") {
            self.home = PathBuf::from(home);
        }
        if let Some(sandbox) = lookup("CPSFLOW_SANDBOX") {
            self.sandbox = EnvConfig::parse_bool(&sandbox);
        }
        if let Some(storage) = lookup("CPSFLOW_STORAGE") {
            self.storage = storage.parse()?;
        }
        if let Some(log) = lookup("CPSFLOW_LOG") {
            self.log = Some(log);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"home": "/var/flows", "storage": "memory"}}"#).unwrap();
        let mut config = EngineConfig::from_file(file.path()).unwrap();
        if std::env::var_os("CPSFLOW_HOME").is_none() {
            assert_eq!(config.home, PathBuf::from("/var/flows"));
        }
        if std::env::var_os("CPSFLOW_STORAGE").is_none() {
            assert_eq!(config.storage, StorageKind::Memory);
        }
        if std::env::var_os("CPSFLOW_SANDBOX").is_none() {
            assert!(!config.sandbox);
        }

        let env: HashMap<&str, &str> = [("CPSFLOW_SANDBOX", "true"), ("CPSFLOW_STORAGE", "file")].into();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert!(config.sandbox);
        assert_eq!(config.storage, StorageKind::File);
    }

    #[test]
    fn test_from_file_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(EngineConfig::from_file(file.path()).is_err());
        assert!(EngineConfig::from_file("/nonexistent/cpsflow.json").is_err());
    }

    #[test]
    fn test_rejects_unknown_storage() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "CPSFLOW_STORAGE").then(|| "redis".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn test_execution_dir_defaults() {
        let config = EngineConfig {
            home: PathBuf::from("/srv/flows"),
            ..EngineConfig::default()
        };
        let build = Executable::new("deploy", 7);
        assert_eq!(
            config.execution_dir(Path::new("ci/deploy.flow"), Some(&build)),
            PathBuf::from("/srv/flows/deploy/7")
        );
        assert_eq!(
            config.execution_dir(Path::new("ci/nightly.flow"), None),
            PathBuf::from("/srv/flows/nightly")
        );
    }
}
