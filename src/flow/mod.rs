// 执行历史图模块
pub mod nodes;
pub mod result;
pub mod walker;

pub use nodes::{FlowNode, FlowNodeKind, NodeAction, NodeId};
pub use result::FlowResult;
pub use walker::FlowGraphWalker;
