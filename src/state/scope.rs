use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::pickle::{LiveResource, Pickle, ResourceHandle};

/// 环境变量覆盖层
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVars(pub BTreeMap<String, String>);

impl EnvVars {
    /// 解析 `KEY=VALUE` 形式的条目
    pub fn parse<'a>(entries: impl IntoIterator<Item = &'a str>) -> Option<EnvVars> {
        let mut vars = BTreeMap::new();
        for entry in entries {
            let (key, value) = entry.split_once('=')?;
            vars.insert(key.to_string(), value.to_string());
        }
        Some(EnvVars(vars))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workspace(pub PathBuf);

/// 上下文变量值（封闭集合，便于持久化）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextValue {
    Env { vars: EnvVars },
    Workspace { path: PathBuf },
    Resource { handle: ResourceHandle },
    Custom { key: String, value: Value },
}

impl ContextValue {
    pub fn env(vars: EnvVars) -> Self {
        ContextValue::Env { vars }
    }

    pub fn resource(handle: ResourceHandle) -> Self {
        ContextValue::Resource { handle }
    }
}

/// 能从上下文中按类型取出的值
pub trait ContextVariable: Sized {
    fn extract(value: &ContextValue) -> Option<Self>;
}

impl ContextVariable for EnvVars {
    fn extract(value: &ContextValue) -> Option<Self> {
        match value {
            ContextValue::Env { vars } => Some(vars.clone()),
            _ => None,
        }
    }
}

impl ContextVariable for Workspace {
    fn extract(value: &ContextValue) -> Option<Self> {
        match value {
            ContextValue::Workspace { path } => Some(Workspace(path.clone())),
            _ => None,
        }
    }
}

impl ContextVariable for ResourceHandle {
    fn extract(value: &ContextValue) -> Option<Self> {
        match value {
            ContextValue::Resource { handle } => Some(handle.clone()),
            _ => None,
        }
    }
}

struct Layer {
    values: Vec<ContextValue>,
    parent: Option<Arc<Layer>>,
}

/// 不可变的上下文变量链，查找从最内层向外
#[derive(Clone, Default)]
pub struct ContextVariableSet {
    head: Option<Arc<Layer>>,
}

impl ContextVariableSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 在 parent 之上叠加一层；没有覆盖值时直接返回 parent
    pub fn from(parent: &ContextVariableSet, overrides: Vec<ContextValue>) -> Self {
        if overrides.is_empty() {
            return parent.clone();
        }
        Self {
            head: Some(Arc::new(Layer {
                values: overrides,
                parent: parent.head.clone(),
            })),
        }
    }

    pub fn get<T: ContextVariable>(&self) -> Option<T> {
        self.iter().find_map(T::extract)
    }

    pub fn custom(&self, key: &str) -> Option<Value> {
        self.iter().find_map(|value| match value {
            ContextValue::Custom { key: k, value } if k == key => Some(value.clone()),
            _ => None,
        })
    }

    /// 合并所有环境变量覆盖层，内层优先
    pub fn environment(&self) -> EnvVars {
        let mut merged = BTreeMap::new();
        for layer in self.layers().into_iter().rev() {
            for value in layer {
                if let ContextValue::Env { vars } = value {
                    merged.extend(vars.0.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        EnvVars(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// 由内向外遍历所有值
    pub fn iter(&self) -> impl Iterator<Item = &ContextValue> {
        let mut layers = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(layer) = cursor {
            layers.push(layer);
            cursor = layer.parent.as_deref();
        }
        layers.into_iter().flat_map(|layer| layer.values.iter().rev())
    }

    /// 由内向外的各层
    fn layers(&self) -> Vec<&[ContextValue]> {
        let mut layers = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(layer) = cursor {
            layers.push(layer.values.as_slice());
            cursor = layer.parent.as_deref();
        }
        layers
    }

    pub fn pickles(&self) -> BTreeSet<Pickle> {
        self.iter()
            .filter_map(|value| match value {
                ContextValue::Resource { handle } => Some(handle.pickle.clone()),
                _ => None,
            })
            .collect()
    }

    /// 持久化形式：由外到内的层列表
    pub fn to_layers(&self) -> Vec<Vec<ContextValue>> {
        self.layers()
            .into_iter()
            .rev()
            .map(|layer| layer.to_vec())
            .collect()
    }

    /// 从持久化形式重建，并重新挂上已恢复的资源
    pub fn from_layers(
        layers: Vec<Vec<ContextValue>>,
        resources: &HashMap<Pickle, LiveResource>,
    ) -> Self {
        let mut set = ContextVariableSet::empty();
        for mut values in layers {
            for value in values.iter_mut() {
                if let ContextValue::Resource { handle } = value {
                    if let Some(live) = resources.get(&handle.pickle) {
                        handle.attach(live.clone());
                    }
                }
            }
            set = ContextVariableSet::from(&set, values);
        }
        set
    }
}

impl fmt::Debug for ContextVariableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.layers()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entry: &str) -> ContextValue {
        ContextValue::env(EnvVars::parse([entry]).unwrap())
    }

    #[test]
    fn innermost_override_wins() {
        let root = ContextVariableSet::from(&ContextVariableSet::empty(), vec![env("A=1")]);
        let inner = ContextVariableSet::from(&root, vec![env("A=2"), env("B=3")]);

        assert_eq!(root.get::<EnvVars>().unwrap().get("A"), Some("1"));
        assert_eq!(inner.get::<EnvVars>().unwrap().get("B"), Some("3"));
        let merged = inner.environment();
        assert_eq!(merged.get("A"), Some("2"));
        assert_eq!(merged.get("B"), Some("3"));
        assert!(inner.get::<Workspace>().is_none());
    }

    #[test]
    fn empty_overrides_reuse_parent() {
        let root = ContextVariableSet::from(&ContextVariableSet::empty(), vec![env("A=1")]);
        let same = ContextVariableSet::from(&root, Vec::new());
        assert!(Arc::ptr_eq(
            root.head.as_ref().unwrap(),
            same.head.as_ref().unwrap()
        ));
    }

    #[test]
    fn layers_reattach_resources() {
        let pickle = Pickle::new("agent", "linux");
        let set = ContextVariableSet::from(
            &ContextVariableSet::empty(),
            vec![ContextValue::resource(ResourceHandle::detached(pickle.clone()))],
        );
        let mut resources: HashMap<Pickle, LiveResource> = HashMap::new();
        resources.insert(pickle.clone(), Arc::new(7u32));

        let restored = ContextVariableSet::from_layers(set.to_layers(), &resources);
        let handle = restored.get::<ResourceHandle>().unwrap();
        assert_eq!(handle.downcast::<u32>().map(|v| *v), Some(7));
        assert_eq!(restored.pickles().into_iter().collect::<Vec<_>>(), vec![pickle]);
    }
}
