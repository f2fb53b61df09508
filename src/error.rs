use thiserror::Error;

use crate::script::Span;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("parse error at {span:?}: {message}")]
    Parse { message: String, span: Span },
    #[error("thread {0} is already runnable; it cannot be resumed twice")]
    ThreadAlreadyResumed(u32),
    #[error("unknown thread {0}")]
    UnknownThread(u32),
    #[error("outcome of step `{0}` is already set")]
    OutcomeAlreadySet(String),
    #[error("body invoker is already started")]
    BodyAlreadyStarted,
    #[error("step `{0}` already completed; it cannot start another body")]
    BodyAfterCompletion(String),
    #[error("no such step `{0}`")]
    UnknownStep(String),
    #[error("unknown flow node `{0}`")]
    UnknownNode(String),
    #[error("unknown flow head {0}")]
    UnknownHead(u32),
    #[error("invalid arguments for `{step}`: {message}")]
    InvalidArguments { step: String, message: String },
    #[error("failed to restore {kind} `{key}`: {message}")]
    PickleRestore {
        kind: String,
        key: String,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("program has already finished")]
    ProgramFinished,
    #[error("program state is not loaded: {0}")]
    ProgramNotLoaded(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    pub fn invalid_args(step: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::InvalidArguments {
            step: step.into(),
            message: message.into(),
        }
    }
}
