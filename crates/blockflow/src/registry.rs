//! Function registry.
//!
//! Functions are registered under a namespaced key (`ns:id`, or the bare id
//! without a namespace). Each key owns a [`Dispatcher`] whose listeners are
//! the blocks whose `#is` names that key, so registering a function late
//! attaches it to blocks that were loaded before it existed, and
//! unregistering detaches it again.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::arena::BlockId;
use crate::block::RunMode;
use crate::dispatcher::Dispatcher;
use crate::error::{FlowError, Result};
use crate::function::Function;
use crate::functions::worker::FlowFunction;
use crate::runtime::Runtime;

pub type FunctionFactory = Arc<dyn Fn() -> Box<dyn Function>>;

/// Category for tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCategory {
    Math,
    Timing,
    /// Backed by a nested flow.
    Flow,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropRole {
    Input,
    Output,
    Config,
}

/// Declared property of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropDesc {
    pub name: String,
    pub role: PropRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PropDesc {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: PropRole::Input,
            default: None,
            description: String::new(),
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self { role: PropRole::Output, ..Self::input(name) }
    }

    pub fn config(name: impl Into<String>, default: Json) -> Self {
        Self {
            role: PropRole::Config,
            default: Some(default),
            ..Self::input(name)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Serializable descriptor of a registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDesc {
    pub id: String,
    #[serde(default)]
    pub category: FunctionCategory,
    /// Scheduler bucket, 0 (first) to 3.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub properties: Vec<PropDesc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_priority() -> u8 {
    1
}

impl FunctionDesc {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: FunctionCategory::Other,
            priority: default_priority(),
            mode: RunMode::default(),
            properties: Vec::new(),
            description: String::new(),
        }
    }

    pub fn category(mut self, category: FunctionCategory) -> Self {
        self.category = category;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(3);
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn property(mut self, property: PropDesc) -> Self {
        self.properties.push(property);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

pub struct FunctionEntry {
    key: Arc<str>,
    desc: FunctionDesc,
    factory: FunctionFactory,
}

impl FunctionEntry {
    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    pub fn desc(&self) -> &FunctionDesc {
        &self.desc
    }

    pub fn create(&self) -> Box<dyn Function> {
        (self.factory)()
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("key", &self.key)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

type Slot = Dispatcher<Option<Arc<FunctionEntry>>, BlockId>;

#[derive(Default)]
pub struct FunctionRegistry {
    slots: FxHashMap<Arc<str>, Slot>,
}

impl FunctionRegistry {
    pub fn key(id: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(namespace) if !namespace.is_empty() => format!("{namespace}:{id}"),
            _ => id.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<FunctionEntry>> {
        self.slots.get(key).and_then(|slot| slot.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store `entry`, returning the blocks that must (re)attach.
    fn insert(&mut self, entry: Arc<FunctionEntry>) -> Vec<BlockId> {
        let slot = self.slots.entry(entry.key.clone()).or_default();
        if slot.update(Some(entry)) {
            slot.snapshot().1
        } else {
            Vec::new()
        }
    }

    /// Clear `key`, returning the blocks that must detach. Listeners stay
    /// subscribed for a later re-registration.
    fn remove(&mut self, key: &str) -> Option<Vec<BlockId>> {
        let slot = self.slots.get_mut(key)?;
        if slot.update(None) {
            Some(slot.snapshot().1)
        } else {
            None
        }
    }

    pub(crate) fn listen(&mut self, key: &str, block: BlockId) -> Option<Arc<FunctionEntry>> {
        let slot = self.slots.entry(Arc::from(key)).or_default();
        slot.listen(block);
        slot.value().clone()
    }

    pub(crate) fn unlisten(&mut self, key: &str, block: BlockId) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.unlisten(&block);
            if slot.value().is_none() && !slot.has_listeners() {
                self.slots.remove(key);
            }
        }
    }

    pub fn descs(&self) -> Vec<(String, FunctionDesc)> {
        let mut descs: Vec<(String, FunctionDesc)> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| slot.value().as_ref().map(|entry| (key.to_string(), entry.desc.clone())))
            .collect();
        descs.sort_by(|a, b| a.0.cmp(&b.0));
        descs
    }
}

impl Runtime {
    /// Register a native function. Returns its key.
    pub fn register_function<F>(&mut self, factory: F, desc: FunctionDesc, namespace: Option<&str>) -> String
    where
        F: Fn() -> Box<dyn Function> + 'static,
    {
        let key = FunctionRegistry::key(&desc.id, namespace);
        self.install(Arc::from(key.as_str()), desc, Arc::new(factory));
        key
    }

    /// Register a function whose body is a nested flow built from `data`.
    pub fn register_flow_function(&mut self, id: &str, data: Json, namespace: Option<&str>) -> Result<String> {
        if !data.is_object() {
            return Err(FlowError::InvalidData(format!("flow function '{id}' must be an object")));
        }
        let key: Arc<str> = Arc::from(FunctionRegistry::key(id, namespace));
        let desc = FlowFunction::describe(id, &data);
        let data = Arc::new(data);
        let function_type = key.clone();
        let factory: FunctionFactory =
            Arc::new(move || Box::new(FlowFunction::new(function_type.clone(), data.clone())));
        self.install(key.clone(), desc, factory);
        Ok(key.to_string())
    }

    fn install(&mut self, key: Arc<str>, mut desc: FunctionDesc, factory: FunctionFactory) {
        desc.priority = desc.priority.min(3);
        log::debug!("registering function '{key}'");
        let entry = Arc::new(FunctionEntry { key, desc, factory });
        for block in self.registry.insert(entry.clone()) {
            self.attach_function(block, entry.clone());
        }
    }

    /// Unregister a function. Blocks using it become function-less but keep
    /// listening for a re-registration; persisted shared blocks owned by the
    /// function type are released.
    pub fn unregister_function(&mut self, key: &str) -> bool {
        let Some(blocks) = self.registry.remove(key) else {
            return false;
        };
        log::debug!("unregistering function '{key}'");
        for block in blocks {
            self.detach_function(block, crate::function::CancelReason::Reconfigure);
        }
        self.release_persisted_shared(Some(key));
        true
    }

    pub fn function_descs(&self) -> Vec<(String, FunctionDesc)> {
        self.registry.descs()
    }

    pub fn function_entry(&self, key: &str) -> Option<Arc<FunctionEntry>> {
        self.registry.get(key)
    }
}
