use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};

pub type LiveResource = Arc<dyn Any + Send + Sync>;

/// 外部有状态资源的可序列化替身
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pickle {
    pub kind: String,
    pub key: String,
}

impl Pickle {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Pickle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// 上下文中携带的资源句柄，live 部分不参与序列化
#[derive(Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub pickle: Pickle,
    #[serde(skip)]
    live: Option<LiveResource>,
}

impl ResourceHandle {
    pub fn new(pickle: Pickle, live: LiveResource) -> Self {
        Self {
            pickle,
            live: Some(live),
        }
    }

    pub fn detached(pickle: Pickle) -> Self {
        Self { pickle, live: None }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn live(&self) -> Option<&LiveResource> {
        self.live.as_ref()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.live.clone()?.downcast::<T>().ok()
    }

    pub(crate) fn attach(&mut self, live: LiveResource) {
        self.live = Some(live);
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.pickle == other.pickle
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("pickle", &self.pickle)
            .field("live", &self.live.is_some())
            .finish()
    }
}

/// 按 key 重新建立外部资源
#[async_trait]
pub trait PickleFactory: Send + Sync {
    fn kind(&self) -> &str;
    async fn rehydrate(&self, key: &str) -> anyhow::Result<LiveResource>;
}

/// Pickle 工厂注册表
#[derive(Clone, Default)]
pub struct PickleRegistry {
    factories: HashMap<String, Arc<dyn PickleFactory>>,
}

impl PickleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn PickleFactory>) -> &mut Self {
        self.factories.insert(factory.kind().to_string(), factory);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn PickleFactory>) -> Self {
        self.register(factory);
        self
    }

    pub async fn rehydrate(&self, pickle: &Pickle) -> Result<LiveResource> {
        let factory = self
            .factories
            .get(&pickle.kind)
            .ok_or_else(|| FlowError::PickleRestore {
                kind: pickle.kind.clone(),
                key: pickle.key.clone(),
                message: "no factory registered for this kind".to_string(),
            })?;
        factory
            .rehydrate(&pickle.key)
            .await
            .map_err(|err| FlowError::PickleRestore {
                kind: pickle.kind.clone(),
                key: pickle.key.clone(),
                message: format!("{err:#}"),
            })
    }

    /// 并发恢复全部 pickle，任一失败则整体失败并指出是哪个资源
    pub async fn rehydrate_all(
        &self,
        pickles: &BTreeSet<Pickle>,
    ) -> Result<HashMap<Pickle, LiveResource>> {
        let results = join_all(pickles.iter().map(|pickle| async move {
            let live = self.rehydrate(pickle).await?;
            debug!(pickle = %pickle, "Rehydrated pickle");
            Ok::<_, FlowError>((pickle.clone(), live))
        }))
        .await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Agents;

    #[async_trait]
    impl PickleFactory for Agents {
        fn kind(&self) -> &str {
            "agent"
        }

        async fn rehydrate(&self, key: &str) -> anyhow::Result<LiveResource> {
            if key == "gone" {
                anyhow::bail!("agent {key} is offline");
            }
            Ok(Arc::new(format!("channel-{key}")))
        }
    }

    #[tokio::test]
    async fn reports_failing_resource() {
        let registry = PickleRegistry::new().with_factory(Arc::new(Agents));
        let pickles: BTreeSet<Pickle> =
            [Pickle::new("agent", "linux"), Pickle::new("agent", "gone")].into();
        let err = registry.rehydrate_all(&pickles).await.unwrap_err();
        match err {
            FlowError::PickleRestore { kind, key, message } => {
                assert_eq!((kind.as_str(), key.as_str()), ("agent", "gone"));
                assert!(message.contains("offline"));
            }
            other => panic!("unexpected error {other}"),
        }

        let ok: BTreeSet<Pickle> = [Pickle::new("agent", "linux")].into();
        let live = registry.rehydrate_all(&ok).await.unwrap();
        let handle = ResourceHandle::new(Pickle::new("agent", "linux"), live[&Pickle::new("agent", "linux")].clone());
        assert_eq!(handle.downcast::<String>().as_deref().map(String::as_str), Some("channel-linux"));
    }
}
