use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::{FlowNode, NodeAction};

/// 流程节点存储 trait
pub trait FlowNodeStorage: Send + Sync {
    fn store_node(&self, node: &FlowNode) -> Result<()>;
    fn get_node(&self, id: &str) -> Result<Option<FlowNode>>;
    fn load_actions(&self, id: &str) -> Result<Vec<NodeAction>>;
    fn save_actions(&self, id: &str, actions: &[NodeAction]) -> Result<()>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeRecord {
    node: FlowNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    actions: Vec<NodeAction>,
}

/// 内存存储实现
#[derive(Default)]
pub struct MemoryNodeStorage {
    inner: RwLock<HashMap<String, NodeRecord>>,
}

impl MemoryNodeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl FlowNodeStorage for MemoryNodeStorage {
    fn store_node(&self, node: &FlowNode) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.get_mut(&node.id) {
            Some(record) => record.node = node.clone(),
            None => {
                inner.insert(
                    node.id.clone(),
                    NodeRecord {
                        node: node.clone(),
                        actions: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn get_node(&self, id: &str) -> Result<Option<FlowNode>> {
        Ok(self.inner.read().get(id).map(|record| record.node.clone()))
    }

    fn load_actions(&self, id: &str) -> Result<Vec<NodeAction>> {
        self.inner
            .read()
            .get(id)
            .map(|record| record.actions.clone())
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))
    }

    fn save_actions(&self, id: &str, actions: &[NodeAction]) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .get_mut(id)
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
        record.actions = actions.to_vec();
        Ok(())
    }
}

/// 每个节点一个 JSON 文件的存储实现，带读缓存
pub struct FileNodeStorage {
    dir: PathBuf,
    cache: RwLock<HashMap<String, NodeRecord>>,
}

impl FileNodeStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn load(&self, id: &str) -> Result<Option<NodeRecord>> {
        if let Some(record) = self.cache.read().get(id) {
            return Ok(Some(record.clone()));
        }
        let path = self.file_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let record: NodeRecord = serde_json::from_slice(&bytes).map_err(|err| {
            FlowError::Storage(format!("failed to read {}: {err}", path.display()))
        })?;
        self.cache.write().insert(id.to_string(), record.clone());
        Ok(Some(record))
    }

    fn save(&self, record: NodeRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomically(&self.file_for(&record.node.id), &serde_json::to_vec_pretty(&record)?)?;
        self.cache.write().insert(record.node.id.clone(), record);
        Ok(())
    }
}

impl FlowNodeStorage for FileNodeStorage {
    fn store_node(&self, node: &FlowNode) -> Result<()> {
        let actions = self.load(&node.id)?.map(|r| r.actions).unwrap_or_default();
        self.save(NodeRecord {
            node: node.clone(),
            actions,
        })
    }

    fn get_node(&self, id: &str) -> Result<Option<FlowNode>> {
        Ok(self.load(id)?.map(|record| record.node))
    }

    fn load_actions(&self, id: &str) -> Result<Vec<NodeAction>> {
        self.load(id)?
            .map(|record| record.actions)
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))
    }

    fn save_actions(&self, id: &str, actions: &[NodeAction]) -> Result<()> {
        let mut record = self
            .load(id)?
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
        record.actions = actions.to_vec();
        self.save(record)
    }
}

/// 先写临时文件再原子替换
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| FlowError::Storage(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| FlowError::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowNodeKind;

    fn start_node() -> FlowNode {
        FlowNode::new("2", vec![], FlowNodeKind::FlowStart)
    }

    #[test]
    fn memory_storage_keeps_actions_separate() -> anyhow::Result<()> {
        let storage = MemoryNodeStorage::new();
        storage.store_node(&start_node())?;
        storage.save_actions("2", &[NodeAction::label("build")])?;
        storage.store_node(&start_node())?;
        assert_eq!(storage.load_actions("2")?, vec![NodeAction::label("build")]);
        assert!(storage.load_actions("9").is_err());
        Ok(())
    }

    #[test]
    fn file_storage_survives_new_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FileNodeStorage::new(dir.path().join("workflow"));
        storage.store_node(&start_node())?;
        storage.save_actions("2", &[NodeAction::label("checkout")])?;

        let reopened = FileNodeStorage::new(dir.path().join("workflow"));
        assert_eq!(reopened.get_node("2")?, Some(start_node()));
        assert_eq!(
            reopened.load_actions("2")?,
            vec![NodeAction::label("checkout")]
        );
        assert_eq!(reopened.get_node("3")?, None);
        Ok(())
    }
}
