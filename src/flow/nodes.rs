use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::FlowFailure;

use super::FlowResult;

pub type NodeId = String;

/// 流程节点类型
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowNodeKind {
    FlowStart,
    FlowEnd { start_id: NodeId, result: FlowResult },
    StepAtom { function: String },
    StepStart { function: String },
    StepEnd { function: String, start_id: NodeId },
}

/// 执行历史图中的一个不可变节点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    #[serde(default)]
    pub parents: Vec<NodeId>,
    #[serde(flatten)]
    pub kind: FlowNodeKind,
}

impl FlowNode {
    pub fn new(id: impl Into<NodeId>, parents: Vec<NodeId>, kind: FlowNodeKind) -> Self {
        Self {
            id: id.into(),
            parents,
            kind,
        }
    }

    pub fn is_block_start(&self) -> bool {
        matches!(
            self.kind,
            FlowNodeKind::FlowStart | FlowNodeKind::StepStart { .. }
        )
    }

    pub fn is_block_end(&self) -> bool {
        matches!(
            self.kind,
            FlowNodeKind::FlowEnd { .. } | FlowNodeKind::StepEnd { .. }
        )
    }

    pub fn is_atom(&self) -> bool {
        matches!(self.kind, FlowNodeKind::StepAtom { .. })
    }

    /// 块结束节点对应的起始节点
    pub fn start_id(&self) -> Option<&str> {
        match &self.kind {
            FlowNodeKind::FlowEnd { start_id, .. } | FlowNodeKind::StepEnd { start_id, .. } => {
                Some(start_id)
            }
            _ => None,
        }
    }

    pub fn function_name(&self) -> Option<&str> {
        match &self.kind {
            FlowNodeKind::StepAtom { function }
            | FlowNodeKind::StepStart { function }
            | FlowNodeKind::StepEnd { function, .. } => Some(function),
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.kind {
            FlowNodeKind::FlowStart => "Start of Flow".to_string(),
            FlowNodeKind::FlowEnd { result, .. } => format!("End of Flow ({result})"),
            FlowNodeKind::StepAtom { function } => function.clone(),
            FlowNodeKind::StepStart { function } => format!("{function} : Start"),
            FlowNodeKind::StepEnd { function, .. } => format!("{function} : End"),
        }
    }
}

/// 附加在节点上的元数据
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeAction {
    Error { failure: FlowFailure },
    BodyInvocation,
    Label { name: String },
    Arguments { values: Value },
    Log { text: String },
}

impl NodeAction {
    pub fn label(name: impl Into<String>) -> Self {
        NodeAction::Label { name: name.into() }
    }

    pub fn as_error(&self) -> Option<&FlowFailure> {
        match self {
            NodeAction::Error { failure } => Some(failure),
            _ => None,
        }
    }
}
