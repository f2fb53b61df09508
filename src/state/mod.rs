pub mod pickle;
pub mod scope;
pub mod store;

pub use pickle::{LiveResource, Pickle, PickleFactory, PickleRegistry, ResourceHandle};
pub use scope::{ContextValue, ContextVariable, ContextVariableSet, EnvVars, Workspace};
pub use store::{write_atomically, FileNodeStorage, FlowNodeStorage, MemoryNodeStorage};
