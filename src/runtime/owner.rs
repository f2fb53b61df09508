use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

use super::execution::FlowExecution;

/// 拥有流程执行的外部构建记录
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Executable {
    pub job: String,
    pub number: u64,
}

impl Executable {
    pub fn new(job: impl Into<String>, number: u64) -> Self {
        Self {
            job: job.into(),
            number,
        }
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

/// 流程执行的所有者句柄
///
/// 执行只通过弱引用挂在所有者上，所有者决定持久化目录。
pub trait FlowExecutionOwner: Send + Sync {
    fn get(&self) -> Result<Arc<FlowExecution>>;
    fn root_dir(&self) -> &Path;
    fn executable(&self) -> Option<Executable>;
    fn attach(&self, execution: Weak<FlowExecution>);

    fn url(&self) -> String {
        match self.executable() {
            Some(executable) => executable.to_string(),
            None => self.root_dir().display().to_string(),
        }
    }
}

/// 以目录为根的所有者
pub struct DirectoryOwner {
    root: PathBuf,
    executable: Option<Executable>,
    execution: RwLock<Weak<FlowExecution>>,
}

impl DirectoryOwner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            executable: None,
            execution: RwLock::new(Weak::new()),
        }
    }

    pub fn for_build(root: impl Into<PathBuf>, job: impl Into<String>, number: u64) -> Self {
        Self {
            executable: Some(Executable::new(job, number)),
            ..Self::new(root)
        }
    }
}

impl FlowExecutionOwner for DirectoryOwner {
    fn get(&self) -> Result<Arc<FlowExecution>> {
        self.execution.read().upgrade().ok_or_else(|| {
            FlowError::ProgramNotLoaded(format!("no execution attached to {}", self.url()))
        })
    }

    fn root_dir(&self) -> &Path {
        &self.root
    }

    fn executable(&self) -> Option<Executable> {
        self.executable.clone()
    }

    fn attach(&self, execution: Weak<FlowExecution>) {
        *self.execution.write() = execution;
    }
}
