// 运行时执行引擎模块
mod gate;
mod group;
mod outcome;
mod owner;
mod persistence;
mod task;
mod thread;
mod vm;

pub mod execution;

pub use execution::{
    ExecutionRecord, FlowDefinition, FlowEnvironment, FlowExecution, GraphListener,
};
pub use gate::AtMostOneTaskExecutor;
pub use group::ThreadGroup;
pub use outcome::{FlowFailure, InterruptCause, Outcome};
pub use owner::{DirectoryOwner, Executable, FlowExecutionOwner};
pub use persistence::{ProgramState, PROGRAM_FILE, RECORD_FILE};
pub use task::ThreadTask;
pub use thread::{CompletionHandler, HeadId, ThreadId, ThreadInfo};
pub use vm::ProgramHandle;
