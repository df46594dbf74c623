//! The runtime context object.
//!
//! A [`Runtime`] owns every block, binding, function and timer of one graph.
//! It plays the role of the process root: the root block is the namespace
//! table of named flows and `#global` is the outermost context scope.

use std::fmt;
use std::fs;
use std::path::Path as FsPath;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::arena::{Arena, BindingId, BlockId};
use crate::binding::Binding;
use crate::block::{Block, BlockKind};
use crate::clock::Clock;
use crate::error::Result;
use crate::functions;
use crate::property::{PropRef, SubscriptionId, GLOBAL};
use crate::registry::FunctionRegistry;
use crate::scheduler::Loop;
use crate::shared::SharedCache;
use crate::storage::Storage;
use crate::value::Value;

/// Runtime settings, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Panic on access through a destroyed block handle.
    pub strict: bool,
    pub history_debounce_ms: u64,
    pub history_limit: usize,
    /// Drain passes per `advance_time` step.
    pub run_all_limit: usize,
    /// Maximum nesting of inline `#sync` runs before falling back to the queue.
    pub sync_depth_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strict: false,
            history_debounce_ms: 250,
            history_limit: 100,
            run_all_limit: 10,
            sync_depth_limit: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: impl AsRef<FsPath>) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

pub(crate) struct Subscription {
    pub(crate) prop: PropRef,
    pub(crate) callback: Box<dyn FnMut(&Value)>,
}

pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) blocks: Arena<BlockId, Block>,
    pub(crate) bindings: Arena<BindingId, Binding>,
    pub(crate) subscriptions: FxHashMap<SubscriptionId, Subscription>,
    next_subscription: u64,
    pub(crate) scheduler: Loop,
    pub(crate) registry: FunctionRegistry,
    pub(crate) clock: Clock,
    pub(crate) shared: SharedCache,
    pub(crate) storage: Option<Box<dyn Storage>>,
    pub(crate) root: BlockId,
    pub(crate) global: BlockId,
    pub(crate) sync_depth: usize,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let mut blocks = Arena::new();
        let root = blocks.alloc_with(|id| Block::new(id, BlockKind::Root, None, None));
        let mut runtime = Self {
            config,
            blocks,
            bindings: Arena::new(),
            subscriptions: FxHashMap::default(),
            next_subscription: 0,
            scheduler: Loop::default(),
            registry: FunctionRegistry::default(),
            clock: Clock::new(),
            shared: SharedCache::default(),
            storage: None,
            root,
            global: BlockId::INVALID,
            sync_depth: 0,
        };
        let global = runtime.alloc_block(BlockKind::Flow(Box::default()), Some(PropRef::new(root, GLOBAL)));
        let name = runtime.ensure_prop(root, GLOBAL);
        if let Some(property) = runtime.prop_mut(&PropRef::new(root, name)) {
            property.saved = Some(Value::Block(global));
            property.dispatcher.replace(Value::Block(global));
        }
        runtime.global = global;
        functions::register_builtins(&mut runtime);
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether `id` still names a live block. Panics in strict mode when
    /// it does not.
    pub(crate) fn check_live(&self, id: BlockId) -> bool {
        let live = self.blocks.is_valid(id);
        if !live && self.config.strict {
            panic!("block {id:?} has been destroyed");
        }
        live
    }

    pub fn is_valid(&self, id: BlockId) -> bool {
        self.blocks.is_valid(id)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn tick(&self) -> i64 {
        self.scheduler.tick()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn time_to_next_timer(&self) -> Option<u64> {
        self.clock.time_to_next_timer()
    }

    /// Root block holding the flow namespace.
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Outermost context scope.
    pub fn global_flow(&self) -> BlockId {
        self.global
    }

    pub(crate) fn next_subscription_id(&mut self) -> SubscriptionId {
        self.next_subscription += 1;
        SubscriptionId(self.next_subscription)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("blocks", &self.blocks.len())
            .field("bindings", &self.bindings.len())
            .field("tick", &self.tick())
            .field("now_ms", &self.now_ms())
            .finish_non_exhaustive()
    }
}
