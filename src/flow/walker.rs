use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::state::FlowNodeStorage;

use super::FlowNode;

/// 从当前 head 出发沿父节点深度优先遍历流程图，每个节点只访问一次
pub struct FlowGraphWalker {
    storage: Arc<dyn FlowNodeStorage>,
    stack: Vec<FlowNode>,
    visited: HashSet<String>,
}

impl FlowGraphWalker {
    pub fn new(storage: Arc<dyn FlowNodeStorage>, heads: Vec<FlowNode>) -> Self {
        let mut walker = Self {
            storage,
            stack: Vec::new(),
            visited: HashSet::new(),
        };
        for head in heads.into_iter().rev() {
            walker.push(head);
        }
        walker
    }

    fn push(&mut self, node: FlowNode) {
        if self.visited.insert(node.id.clone()) {
            self.stack.push(node);
        }
    }
}

impl Iterator for FlowGraphWalker {
    type Item = FlowNode;

    fn next(&mut self) -> Option<FlowNode> {
        let node = self.stack.pop()?;
        for parent in node.parents.iter().rev() {
            if self.visited.contains(parent) {
                continue;
            }
            match self.storage.get_node(parent) {
                Ok(Some(parent)) => self.push(parent),
                Ok(None) => warn!(node = %node.id, parent = %parent, "Missing parent flow node"),
                Err(err) => warn!(node = %node.id, parent = %parent, error = %err, "Failed to load parent flow node"),
            }
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowNodeKind;
    use crate::state::MemoryNodeStorage;

    fn atom(id: &str, parents: &[&str]) -> FlowNode {
        FlowNode::new(
            id,
            parents.iter().map(|p| p.to_string()).collect(),
            FlowNodeKind::StepAtom {
                function: "echo".into(),
            },
        )
    }

    #[test]
    fn visits_joined_parents_once() {
        let storage = Arc::new(MemoryNodeStorage::new());
        let start = FlowNode::new("2", vec![], FlowNodeKind::FlowStart);
        storage.store_node(&start).unwrap();
        for node in [atom("3", &["2"]), atom("4", &["2"]), atom("5", &["3", "4"])] {
            storage.store_node(&node).unwrap();
        }
        let head = storage.get_node("5").unwrap().unwrap();
        let ids: Vec<String> = FlowGraphWalker::new(storage, vec![head])
            .map(|node| node.id)
            .collect();
        assert_eq!(ids, vec!["5", "3", "2", "4"]);
    }
}
