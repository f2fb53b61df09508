// 可续行脚本模块：词法、语法、编译与可序列化解释器
pub mod ast;
pub mod compiler;
pub mod interpreter;
pub mod lexer;
pub mod parser;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::runtime::{FlowFailure, Outcome, ThreadTask};

pub use compiler::CompiledScript;
pub use interpreter::{display, truthy, Interpreter, PAUSE};
pub use lexer::Span;

/// 主脚本的名字
pub const MAIN_SCRIPT: &str = "Script1";

/// 可恢复的计算
pub trait Continuable {
    /// 用 resume 值继续运行，直到结束或需要在安全点执行任务
    fn run(&mut self, resume: Outcome) -> Yielded;
    fn is_resumable(&self) -> bool;
}

/// 一次运行的结果
#[derive(Debug)]
pub enum Yielded {
    Task(ThreadTask),
    Done(Outcome),
}

/// 按值捕获变量的代码块引用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub script: String,
    pub block: usize,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
}

impl Closure {
    /// 整个脚本的主体
    pub fn script_root(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            block: 0,
            env: BTreeMap::new(),
        }
    }
}

/// 脚本发起的步骤调用
#[derive(Clone, Debug, PartialEq)]
pub struct StepCall {
    pub function: String,
    pub args: Vec<(Option<String>, Value)>,
    pub bodies: Vec<(Option<String>, Closure)>,
    pub line: usize,
}

/// 线程中运行的程序
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Program {
    Script { interpreter: Interpreter },
    /// 第一次运行即抛出给定失败
    Throw { failure: FlowFailure, done: bool },
}

impl Program {
    pub fn script(interpreter: Interpreter) -> Self {
        Program::Script { interpreter }
    }

    pub fn throwing(failure: FlowFailure) -> Self {
        Program::Throw {
            failure,
            done: false,
        }
    }

    /// 需要重新挂载编译结果的脚本名
    pub fn script_name(&self) -> Option<&str> {
        match self {
            Program::Script { interpreter } => Some(interpreter.script_name()),
            Program::Throw { .. } => None,
        }
    }

    pub fn attach(&mut self, scripts: &ScriptSet) -> Result<()> {
        if let Program::Script { interpreter } = self {
            let code = scripts.get(interpreter.script_name()).ok_or_else(|| {
                FlowError::ProgramNotLoaded(format!(
                    "no compiled script `{}`",
                    interpreter.script_name()
                ))
            })?;
            interpreter.attach(code);
        }
        Ok(())
    }
}

impl Continuable for Program {
    fn run(&mut self, resume: Outcome) -> Yielded {
        match self {
            Program::Script { interpreter } => interpreter.run(resume),
            Program::Throw { failure, done } => {
                *done = true;
                Yielded::Done(Outcome::Abnormal(failure.clone()))
            }
        }
    }

    fn is_resumable(&self) -> bool {
        match self {
            Program::Script { interpreter } => interpreter.is_resumable(),
            Program::Throw { done, .. } => !*done,
        }
    }
}

/// 已编译脚本的缓存
#[derive(Default)]
pub struct ScriptSet {
    compiled: HashMap<String, Arc<CompiledScript>>,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledScript>> {
        self.compiled.get(name).cloned()
    }

    pub fn compile(&mut self, name: &str, source: &str) -> Result<Arc<CompiledScript>> {
        if let Some(code) = self.compiled.get(name) {
            return Ok(code.clone());
        }
        let code = Arc::new(CompiledScript::compile(name, source)?);
        self.compiled.insert(name.to_string(), code.clone());
        Ok(code)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn clear(&mut self) {
        self.compiled.clear();
    }
}
