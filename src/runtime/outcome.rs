use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::FlowError;
use crate::flow::FlowResult;

/// 中断原因
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterruptCause {
    User {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Superseded {
        by: String,
    },
    FailFast {
        branch: String,
    },
    Persistence,
    Custom {
        message: String,
    },
}

impl InterruptCause {
    pub fn short_description(&self) -> String {
        match self {
            InterruptCause::User { name: Some(name) } => format!("Aborted by {name}"),
            InterruptCause::User { name: None } => "Aborted by user".to_string(),
            InterruptCause::Superseded { by } => format!("Superseded by {by}"),
            InterruptCause::FailFast { branch } => format!("Failed in branch {branch}"),
            InterruptCause::Persistence => "Program state could not be saved".to_string(),
            InterruptCause::Custom { message } => message.clone(),
        }
    }
}

/// 在脚本与步骤之间传递的失败
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowFailure {
    #[error("{message}")]
    Error { message: String },
    #[error("{}", describe_interrupt(.result, .causes))]
    Interrupted {
        result: FlowResult,
        #[serde(default)]
        causes: Vec<InterruptCause>,
    },
    #[error("Failed in branch {branch}: {cause}")]
    Branch {
        branch: String,
        cause: Box<FlowFailure>,
    },
    #[error("Failed to load persisted workflow state: {cause}")]
    LoadFailed { cause: String },
}

fn describe_interrupt(result: &FlowResult, causes: &[InterruptCause]) -> String {
    if causes.is_empty() {
        return format!("Interrupted ({result})");
    }
    let reasons: Vec<String> = causes.iter().map(|c| c.short_description()).collect();
    format!("Interrupted ({result}): {}", reasons.join("; "))
}

impl FlowFailure {
    pub fn error(message: impl Into<String>) -> Self {
        FlowFailure::Error {
            message: message.into(),
        }
    }

    pub fn interrupted(result: FlowResult, causes: Vec<InterruptCause>) -> Self {
        FlowFailure::Interrupted { result, causes }
    }

    /// 该失败对应的构建结果
    pub fn result(&self) -> FlowResult {
        match self {
            FlowFailure::Interrupted { result, .. } => *result,
            FlowFailure::Branch { cause, .. } => cause.result(),
            _ => FlowResult::Failure,
        }
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, FlowFailure::Interrupted { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FlowFailure::Error { .. } => "error",
            FlowFailure::Interrupted { .. } => "interrupted",
            FlowFailure::Branch { .. } => "branch",
            FlowFailure::LoadFailed { .. } => "load_failed",
        }
    }

    /// 脚本 catch 块看到的值
    pub fn to_value(&self) -> Value {
        json!({
            "type": self.kind(),
            "message": self.to_string(),
            "result": self.result().as_str(),
        })
    }
}

impl From<FlowError> for FlowFailure {
    fn from(err: FlowError) -> Self {
        FlowFailure::error(err.to_string())
    }
}

/// 正常值或异常的二选一包装
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Normal(Value),
    Abnormal(FlowFailure),
}

impl Outcome {
    pub fn success(value: Value) -> Self {
        Outcome::Normal(value)
    }

    pub fn null() -> Self {
        Outcome::Normal(Value::Null)
    }

    pub fn failure(failure: FlowFailure) -> Self {
        Outcome::Abnormal(failure)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Normal(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Abnormal(_))
    }

    pub fn normal(&self) -> Option<&Value> {
        match self {
            Outcome::Normal(value) => Some(value),
            Outcome::Abnormal(_) => None,
        }
    }

    pub fn abnormal(&self) -> Option<&FlowFailure> {
        match self {
            Outcome::Normal(_) => None,
            Outcome::Abnormal(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> std::result::Result<Value, FlowFailure> {
        match self {
            Outcome::Normal(value) => Ok(value),
            Outcome::Abnormal(failure) => Err(failure),
        }
    }
}

impl From<std::result::Result<Value, FlowFailure>> for Outcome {
    fn from(result: std::result::Result<Value, FlowFailure>) -> Self {
        match result {
            Ok(value) => Outcome::Normal(value),
            Err(failure) => Outcome::Abnormal(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_failure_inherits_cause_result() {
        let failure = FlowFailure::Branch {
            branch: "b".into(),
            cause: Box::new(FlowFailure::interrupted(
                FlowResult::Aborted,
                vec![InterruptCause::User { name: None }],
            )),
        };
        assert_eq!(failure.result(), FlowResult::Aborted);
        assert!(failure.to_string().starts_with("Failed in branch b: Interrupted (ABORTED)"));
        assert_eq!(FlowFailure::error("boom").result(), FlowResult::Failure);
    }

    #[test]
    fn outcome_holds_one_side() {
        let ok = Outcome::success(json!(3));
        assert_eq!(ok.normal(), Some(&json!(3)));
        assert!(ok.abnormal().is_none());
        let err = Outcome::failure(FlowFailure::error("x"));
        assert!(err.is_failure());
        assert_eq!(err.into_result().unwrap_err().to_string(), "x");
    }
}
