pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod runtime;
pub mod script;
pub mod state;
pub mod steps;
pub mod utils;

pub use config::{EngineConfig, EnvConfig, StorageKind};
pub use error::{FlowError, Result};
pub use flow::{FlowGraphWalker, FlowNode, FlowNodeKind, FlowResult, NodeAction, NodeId};
pub use runtime::{
    DirectoryOwner, Executable, ExecutionRecord, FlowDefinition, FlowEnvironment, FlowExecution,
    FlowExecutionOwner, FlowFailure, GraphListener, InterruptCause, Outcome, ThreadId, ThreadInfo,
};
pub use state::{
    ContextValue, ContextVariable, ContextVariableSet, EnvVars, FileNodeStorage, FlowNodeStorage,
    MemoryNodeStorage, Pickle, PickleFactory, PickleRegistry, ResourceHandle,
};
pub use steps::{
    BodyExecution, BodyInvoker, StepArgs, StepContext, StepDescriptor, StepExecution,
    StepRegistry,
};
pub use utils::logging;
