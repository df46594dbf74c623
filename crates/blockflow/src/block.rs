//! Blocks: graph nodes holding properties and an optional function.
//!
//! The property write path lives here. Every mutation ends in
//! [`Runtime::after_change`], which notifies watchers, dispatches to
//! listeners, reacts to config changes and records history, in that order.

use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use ulid::Ulid;

use crate::arena::BlockId;
use crate::clock::TimerId;
use crate::error::{FlowError, Result};
use crate::event::{Event, EventType};
use crate::function::{CancelMode, CancelReason, Function};
use crate::history::FlowHistory;
use crate::path::{Path, Segment};
use crate::property::{
    Listener, PropRef, Property, PropertyKind, SubscriptionId, CALL, CANCEL, DISABLED, HELPER_PREFIX,
    IS, MODE, OUTPUT, SHARED, SYNC,
};
use crate::runner::RunCause;
use crate::runtime::{Runtime, Subscription};
use crate::value::{SameValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Queued,
    Running,
    Waiting,
}

/// When a block's function runs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    /// Same as `OnChange`.
    Auto,
    #[default]
    OnChange,
    /// Once when the function attaches.
    OnLoad,
    /// Only on a fresh `#call`.
    OnCall,
}

impl RunMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(RunMode::Auto),
            "onChange" => Some(RunMode::OnChange),
            "onLoad" => Some(RunMode::OnLoad),
            "onCall" => Some(RunMode::OnCall),
            _ => None,
        }
    }

    pub fn runs_on_attach(self) -> bool {
        !matches!(self, RunMode::OnCall)
    }

    pub fn runs_on_change(self) -> bool {
        matches!(self, RunMode::Auto | RunMode::OnChange)
    }
}

#[derive(Debug, Default)]
pub struct FlowState {
    pub(crate) history: Option<FlowHistory>,
    /// Key of the flow function this flow implements, if any.
    pub(crate) function_type: Option<Arc<str>>,
}

#[derive(Debug)]
pub enum BlockKind {
    Plain,
    Flow(Box<FlowState>),
    /// Namespace node holding flows.
    Folder,
    Root,
}

/// A direct property mutation, as seen by watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChange {
    pub block: BlockId,
    pub property: Arc<str>,
    pub value: Value,
    /// Persisted write (`set_value`, binding, delete) rather than a
    /// transient one (`update_value`, `output`, binding delivery).
    pub saved: bool,
}

pub trait BlockWatcher {
    fn on_child_change(&self, change: &ChildChange);

    fn on_destroy(&self, _block: BlockId) {}
}

pub struct Block {
    id: BlockId,
    uid: Ulid,
    pub(crate) kind: BlockKind,
    /// Owning property. `None` for the root and for shared blocks.
    pub(crate) parent: Option<PropRef>,
    /// Enclosing flow scope; the block itself for flows.
    pub(crate) flow: Option<BlockId>,
    pub(crate) properties: IndexMap<Arc<str>, Property>,
    pub(crate) function: Option<Box<dyn Function>>,
    pub(crate) function_id: Option<Arc<str>>,
    /// Bumped whenever the function is replaced or removed, so a function
    /// that was out running a hook knows whether it may return.
    pub(crate) function_epoch: u32,
    /// The current function is taken out of the block (running a hook).
    pub(crate) busy: bool,
    /// Scheduler bucket. Negative when there is nothing to run.
    pub(crate) priority: i8,
    pub(crate) state: RunState,
    pub(crate) queued: bool,
    pub(crate) mode: RunMode,
    pub(crate) default_mode: RunMode,
    pub(crate) disabled: bool,
    pub(crate) sync: bool,
    /// A run was requested while the block could not run.
    pub(crate) pending: bool,
    pub(crate) destroying: bool,
    pub(crate) watchers: Vec<Rc<dyn BlockWatcher>>,
    pub(crate) timers: SmallVec<[TimerId; 2]>,
}

impl Block {
    pub(crate) fn new(id: BlockId, kind: BlockKind, parent: Option<PropRef>, flow: Option<BlockId>) -> Self {
        Self {
            id,
            uid: Ulid::new(),
            kind,
            parent,
            flow,
            properties: IndexMap::new(),
            function: None,
            function_id: None,
            function_epoch: 0,
            busy: false,
            priority: -1,
            state: RunState::Idle,
            queued: false,
            mode: RunMode::default(),
            default_mode: RunMode::default(),
            disabled: false,
            sync: false,
            pending: false,
            destroying: false,
            watchers: Vec::new(),
            timers: SmallVec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Process-unique identifier, stable for the block's lifetime.
    pub fn uid(&self) -> Ulid {
        self.uid
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    pub fn is_flow(&self) -> bool {
        matches!(self.kind, BlockKind::Flow(_))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, BlockKind::Folder)
    }

    pub(crate) fn flow_state(&self) -> Option<&FlowState> {
        match &self.kind {
            BlockKind::Flow(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn flow_state_mut(&mut self) -> Option<&mut FlowState> {
        match &mut self.kind {
            BlockKind::Flow(state) => Some(state),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<&PropRef> {
        self.parent.as_ref()
    }

    pub fn flow_scope(&self) -> Option<BlockId> {
        self.flow
    }

    pub fn function_id(&self) -> Option<&str> {
        self.function_id.as_deref()
    }

    pub fn has_function(&self) -> bool {
        self.function.is_some() || self.busy
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// Block handles held by this block's properties, in property order.
    /// Bound or referenced blocks are included; callers filter by ownership.
    pub(crate) fn block_values(&self) -> Vec<BlockId> {
        self.properties
            .values()
            .filter_map(|property| property.value().as_block())
            .collect()
    }
}

/// Helper slots hold blocks only; a saved literal there would read back as
/// a binding path.
pub(crate) fn check_persisted(name: &str, value: &Value) -> Result<()> {
    if PropertyKind::of(name) == PropertyKind::Helper && !matches!(value, Value::Block(_) | Value::Undefined) {
        return Err(FlowError::InvalidTarget(format!("'{name}' only holds helper blocks")));
    }
    Ok(())
}

/// Persist (`set_value`) or transient (`update_value`, `output`) write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Write {
    Persist,
    Transient,
}

impl Runtime {
    // ----- structure -----

    pub(crate) fn alloc_block(&mut self, kind: BlockKind, parent: Option<PropRef>) -> BlockId {
        let scope = parent
            .as_ref()
            .and_then(|parent| self.blocks.get(parent.block))
            .and_then(|block| block.flow);
        let is_flow = matches!(kind, BlockKind::Flow(_));
        self.blocks
            .alloc_with(|id| Block::new(id, kind, parent, if is_flow { Some(id) } else { scope }))
    }

    /// Whether `child` is owned by the property `name` of `block`.
    pub(crate) fn owns(&self, block: BlockId, name: &str, child: BlockId) -> bool {
        self.blocks
            .get(child)
            .and_then(|child| child.parent.as_ref())
            .is_some_and(|parent| parent.block == block && &*parent.name == name)
    }

    /// Create a child block under `parent.name`, optionally with a function.
    pub fn create_block(&mut self, parent: BlockId, name: &str, function_id: Option<&str>) -> Result<BlockId> {
        self.create_child(parent, name, BlockKind::Plain, function_id)
    }

    /// Create the helper block `~name` and bind `name` to its `#output`.
    pub fn create_helper_block(&mut self, block: BlockId, name: &str, function_id: Option<&str>) -> Result<BlockId> {
        let helper_name = format!("{HELPER_PREFIX}{name}");
        let helper = self.create_child(block, &helper_name, BlockKind::Plain, function_id)?;
        self.set_binding(block, name, Some(&format!("{helper_name}.{OUTPUT}")))?;
        Ok(helper)
    }

    pub(crate) fn create_child(
        &mut self,
        parent: BlockId,
        name: &str,
        kind: BlockKind,
        function_id: Option<&str>,
    ) -> Result<BlockId> {
        if !self.check_live(parent) {
            return Err(FlowError::Destroyed(parent));
        }
        let property_kind = PropertyKind::of(name);
        if name.is_empty() || matches!(property_kind, PropertyKind::Output | PropertyKind::Virtual) {
            return Err(FlowError::InvalidTarget(format!("cannot create a block at '{name}'")));
        }
        if self.peek(parent, name).as_block().is_some() {
            return Err(FlowError::DuplicateName(name.to_string()));
        }
        let name = self.ensure_prop(parent, name);
        let prop = PropRef::new(parent, name);
        let child = self.alloc_block(kind, Some(prop.clone()));
        self.unbind_property(&prop);
        if let Some(property) = self.prop_mut(&prop) {
            property.saved = Some(Value::Block(child));
        }
        self.apply(&prop, Value::Block(child), true);
        if let Some(function_id) = function_id {
            self.write(child, IS, Value::string(function_id), Write::Persist);
        }
        Ok(child)
    }

    /// Destroy a block and everything it owns. Stale handles are ignored.
    pub fn destroy_block(&mut self, block: BlockId) {
        let Some(parent) = self.blocks.get(block).and_then(|b| b.parent.clone()) else {
            self.teardown(block);
            return;
        };
        if self.owns(parent.block, &parent.name, block) && self.peek(parent.block, &parent.name).as_block() == Some(block) {
            // Releasing the owning property tears the block down
            self.clear_property(&parent);
        } else {
            self.teardown(block);
        }
    }

    /// Destroy `root` and the blocks it owns, children before parents.
    /// Binding edges are released, never walked.
    pub(crate) fn teardown(&mut self, root: BlockId) {
        let mut stack = vec![(root, false)];
        while let Some((id, released)) = stack.pop() {
            if released {
                self.free_block(id);
                continue;
            }
            if !self.begin_teardown(id) {
                continue;
            }
            stack.push((id, true));
            let children = self.release_properties(id);
            stack.extend(children.into_iter().rev().map(|child| (child, false)));
        }
    }

    /// Mark `id` as destroying and retire its function. `false` when the
    /// block is gone or already on its way out.
    fn begin_teardown(&mut self, id: BlockId) -> bool {
        let Some(block) = self.blocks.get_mut(id) else {
            return false;
        };
        if block.destroying {
            return false;
        }
        block.destroying = true;
        log::trace!("destroying {id:?}");

        for watcher in block.watchers.clone() {
            watcher.on_destroy(id);
        }

        self.detach_function(id, CancelReason::Destroy);
        if let Some(function_id) = self.blocks.get_mut(id).and_then(|b| b.function_id.take()) {
            self.registry.unlisten(&function_id, id);
        }
        self.cancel_history_timer(id);
        true
    }

    /// Unbind every property of `id` and drop shared references. Returns
    /// the owned children still to destroy, in property order.
    fn release_properties(&mut self, id: BlockId) -> Vec<BlockId> {
        let names: Vec<Arc<str>> = self
            .blocks
            .get(id)
            .map(|b| b.properties.keys().cloned().collect())
            .unwrap_or_default();
        let mut children = Vec::new();
        for name in names {
            let prop = PropRef::new(id, name);
            self.unbind_property(&prop);
            let Some(child) = self.prop_ref(&prop).and_then(|p| p.value().as_block()) else {
                continue;
            };
            if self.owns(id, &prop.name, child) {
                children.push(child);
            } else if &*prop.name == SHARED {
                self.release_shared(child);
            }
        }
        children
    }

    fn free_block(&mut self, id: BlockId) {
        // Whoever still listens to this block's properties sees it vanish
        let mut listeners = Vec::new();
        if let Some(block) = self.blocks.get_mut(id) {
            for property in block.properties.values_mut() {
                listeners.extend(property.dispatcher.snapshot().1);
                property.dispatcher.clear();
            }
        }
        self.blocks.free(id);

        for listener in listeners {
            match listener {
                Listener::Binding { binding, hop } => self.on_hop_changed(binding, hop as usize),
                Listener::Subscription(subscription) => {
                    if let Some(mut subscription) = self.subscriptions.remove(&subscription) {
                        (subscription.callback)(&Value::Undefined);
                    }
                }
                Listener::Forward(_) => {}
            }
        }
    }

    /// Release what `value` held for property `prop`: an owned child block
    /// is destroyed, a shared block loses a reference.
    pub(crate) fn release_value(&mut self, prop: &PropRef, value: &Value) {
        let Value::Block(child) = value else {
            return;
        };
        if self.owns(prop.block, &prop.name, *child) {
            self.teardown(*child);
        } else if &*prop.name == SHARED {
            self.release_shared(*child);
        }
    }

    // ----- lookup -----

    pub(crate) fn prop_ref(&self, prop: &PropRef) -> Option<&Property> {
        self.blocks.get(prop.block)?.properties.get(&*prop.name)
    }

    pub(crate) fn prop_mut(&mut self, prop: &PropRef) -> Option<&mut Property> {
        self.blocks.get_mut(prop.block)?.properties.get_mut(&*prop.name)
    }

    /// Create the property if missing. Returns its shared name.
    pub(crate) fn ensure_prop(&mut self, block: BlockId, name: &str) -> Arc<str> {
        match self.blocks.get_mut(block) {
            Some(b) => match b.properties.get(name) {
                Some(property) => property.name_arc().clone(),
                None => {
                    let property = Property::named(name);
                    let name = property.name_arc().clone();
                    b.properties.insert(name.clone(), property);
                    name
                }
            },
            None => Arc::from(name),
        }
    }

    /// Property by name; the void sentinel when absent or destroyed.
    pub fn get_property(&self, block: BlockId, name: &str) -> &Property {
        if !self.check_live(block) {
            return Property::void();
        }
        self.blocks
            .get(block)
            .and_then(|b| b.properties.get(name))
            .unwrap_or(Property::void())
    }

    /// Create the property if missing.
    pub fn ensure_property(&mut self, block: BlockId, name: &str) -> &Property {
        if !self.check_live(block) || PropertyKind::of(name) == PropertyKind::Virtual {
            return Property::void();
        }
        self.ensure_prop(block, name);
        self.blocks
            .get(block)
            .and_then(|b| b.properties.get(name))
            .unwrap_or(Property::void())
    }

    pub fn property_names(&self, block: BlockId) -> Vec<String> {
        if !self.check_live(block) {
            return Vec::new();
        }
        self.blocks
            .get(block)
            .map(|b| b.properties.keys().map(|name| name.to_string()).collect())
            .unwrap_or_default()
    }

    /// Non-panicking single-name read, virtual names included.
    pub(crate) fn peek(&self, block: BlockId, name: &str) -> Value {
        match PropertyKind::of(name) {
            PropertyKind::Virtual => self.virtual_value(block, name),
            _ => self
                .blocks
                .get(block)
                .and_then(|b| b.properties.get(name))
                .map(|p| p.value().clone())
                .unwrap_or_default(),
        }
    }

    /// Read a value through a path relative to `block`.
    pub fn get_value(&self, block: BlockId, path: &str) -> Value {
        if !self.check_live(block) {
            return Value::Undefined;
        }
        if !path.contains('.') {
            return self.peek(block, path);
        }
        match Path::parse(path) {
            Ok(path) => self.evaluate(block, &path),
            Err(_) => Value::Undefined,
        }
    }

    /// Split a write path into the owning block and the property name.
    pub(crate) fn resolve_target(&self, block: BlockId, path: &str) -> Result<(BlockId, Arc<str>)> {
        if !path.contains('.') {
            return Ok((block, Arc::from(path)));
        }
        let parsed = Path::parse(path)?;
        let segments = parsed.segments();
        let Some((last, init)) = segments.split_last() else {
            return Err(FlowError::invalid_path(path, "empty path", 0..0));
        };
        let mut current = Value::Block(block);
        for (index, segment) in init.iter().enumerate() {
            current = self.step(block, &current, segment, index);
        }
        let Some(target) = current.as_block().filter(|id| self.blocks.is_valid(*id)) else {
            return Err(FlowError::NotFound(path.to_string()));
        };
        match last {
            Segment::Name(name) | Segment::Helper(name) | Segment::Context(name) => Ok((target, name.clone())),
            _ => Err(FlowError::InvalidTarget(format!("'{path}' is read-only"))),
        }
    }

    // ----- writes -----

    /// Persisted write: clears a binding and records the saved literal.
    pub fn set_value(&mut self, block: BlockId, path: &str, value: impl Into<Value>) -> Result<()> {
        if !self.check_live(block) {
            return Ok(());
        }
        let (target, name) = self.resolve_target(block, path)?;
        let value = value.into();
        check_persisted(&name, &value)?;
        self.write(target, &name, value, Write::Persist);
        Ok(())
    }

    /// Transient write of the live value only.
    pub fn update_value(&mut self, block: BlockId, path: &str, value: impl Into<Value>) -> Result<()> {
        if !self.check_live(block) {
            return Ok(());
        }
        let (target, name) = self.resolve_target(block, path)?;
        self.write(target, &name, value.into(), Write::Transient);
        Ok(())
    }

    /// Publish a result on a block. Never touches bindings.
    pub fn output(&mut self, block: BlockId, value: impl Into<Value>, name: &str) {
        if !self.check_live(block) {
            return;
        }
        self.write(block, name, value.into(), Write::Transient);
    }

    /// Clear value, saved literal and binding, destroying an owned child.
    pub fn delete_value(&mut self, block: BlockId, path: &str) -> Result<()> {
        if !self.check_live(block) {
            return Ok(());
        }
        let (target, name) = self.resolve_target(block, path)?;
        let prop = PropRef::new(target, name);
        if self.prop_ref(&prop).is_none() {
            return Ok(());
        }
        self.clear_property(&prop);
        Ok(())
    }

    pub(crate) fn clear_property(&mut self, prop: &PropRef) {
        self.unbind_property(prop);
        let Some(property) = self.prop_mut(prop) else {
            return;
        };
        property.saved = None;
        if property.kind() == PropertyKind::Context && property.context_refs > 0 {
            // Still referenced: fall back to the outer scope
            self.attach_auto_context(prop);
            return;
        }
        self.apply(prop, Value::Undefined, true);
        if let Some(block) = self.blocks.get_mut(prop.block) {
            if block.properties.get(&*prop.name).is_some_and(|p| p.is_idle()) {
                block.properties.shift_remove(&*prop.name);
            }
        }
    }

    pub(crate) fn write(&mut self, block: BlockId, name: &str, value: Value, mode: Write) {
        if !self.blocks.is_valid(block) {
            return;
        }
        let kind = PropertyKind::of(name);
        if kind == PropertyKind::Virtual {
            return;
        }
        let persist = mode == Write::Persist && kind != PropertyKind::Output;
        if persist && name == SHARED {
            self.set_shared(block, value);
            return;
        }
        let name = self.ensure_prop(block, name);
        let prop = PropRef::new(block, name);
        if persist {
            self.unbind_property(&prop);
            if let Some(property) = self.prop_mut(&prop) {
                property.saved = (!value.is_undefined()).then(|| value.clone());
                property.auto_context = false;
            }
        }
        self.apply(&prop, value, persist);
    }

    /// Store the live value and run the change pipeline. Returns whether
    /// the value changed.
    pub(crate) fn apply(&mut self, prop: &PropRef, value: Value, saved: bool) -> bool {
        let Some(property) = self.prop_mut(prop) else {
            return false;
        };
        if property.value().same(&value) {
            if saved {
                self.after_change(prop, &value, true, false);
            }
            return false;
        }
        let old = property.dispatcher.replace(value.clone());
        self.release_value(prop, &old);
        self.after_change(prop, &value, saved, true);
        true
    }

    pub(crate) fn after_change(&mut self, prop: &PropRef, value: &Value, saved: bool, changed: bool) {
        self.notify_watchers(prop, value, saved);
        if changed {
            self.dispatch(prop);
            self.react(prop, value);
        }
        if saved {
            self.track_change(prop.block);
        }
    }

    fn notify_watchers(&mut self, prop: &PropRef, value: &Value, saved: bool) {
        let Some(block) = self.blocks.get(prop.block) else {
            return;
        };
        if block.watchers.is_empty() {
            return;
        }
        let watchers = block.watchers.clone();
        let change = ChildChange {
            block: prop.block,
            property: prop.name.clone(),
            value: value.clone(),
            saved,
        };
        for watcher in watchers {
            watcher.on_child_change(&change);
        }
    }

    /// Deliver the property's value to its listeners, coalescing nested
    /// updates into one more pass.
    pub(crate) fn dispatch(&mut self, prop: &PropRef) {
        loop {
            let Some(property) = self.prop_mut(prop) else {
                return;
            };
            if !property.dispatcher.begin_dispatch() {
                return;
            }
            let (value, listeners) = property.dispatcher.snapshot();
            for listener in listeners {
                let Some(property) = self.prop_ref(prop) else {
                    return;
                };
                if !property.value().same(&value) {
                    // superseded, the next pass delivers the latest value
                    break;
                }
                if !property.dispatcher.is_listening(&listener) {
                    continue;
                }
                self.deliver(&listener, &value);
            }
            let again = self
                .prop_mut(prop)
                .map(|property| property.dispatcher.end_dispatch())
                .unwrap_or(false);
            if !again {
                return;
            }
        }
    }

    fn deliver(&mut self, listener: &Listener, value: &Value) {
        match listener {
            Listener::Binding { binding, hop } => self.on_hop_changed(*binding, *hop as usize),
            Listener::Subscription(id) => {
                if let Some(subscription) = self.subscriptions.get_mut(id) {
                    (subscription.callback)(value);
                }
            }
            Listener::Forward(target) => self.output(target.block, value.clone(), &target.name),
        }
    }

    /// Block-side reaction to a changed property.
    fn react(&mut self, prop: &PropRef, value: &Value) {
        let block = prop.block;
        let name: &str = &prop.name;
        match PropertyKind::of(name) {
            PropertyKind::Config => match name {
                IS => self.set_function_id(block, value),
                MODE => {
                    if let Some(b) = self.blocks.get_mut(block) {
                        b.mode = value.as_str().and_then(RunMode::parse).unwrap_or(b.default_mode);
                    }
                }
                DISABLED => self.set_disabled(block, value.is_truthy()),
                SYNC => {
                    if let Some(b) = self.blocks.get_mut(block) {
                        b.sync = value.is_truthy();
                    }
                }
                CALL => {
                    if Event::check(value, self.tick()) == EventType::Trigger {
                        self.request_run(block, RunCause::Call);
                    }
                }
                CANCEL => {
                    if Event::check(value, self.tick()) != EventType::Void {
                        self.cancel_waiting(block, CancelReason::Manual, CancelMode::Soft);
                    }
                }
                _ => self.config_changed(block, name, value),
            },
            PropertyKind::Structural => self.config_changed(block, name, value),
            PropertyKind::Input | PropertyKind::Context => {
                let wants = self
                    .call_hook(block, |function, ctx| function.input_changed(ctx, name, value))
                    .unwrap_or(true);
                if wants {
                    self.request_run(block, RunCause::Change);
                }
            }
            PropertyKind::Output | PropertyKind::Attribute | PropertyKind::Helper | PropertyKind::Virtual => {}
        }
    }

    fn config_changed(&mut self, block: BlockId, name: &str, value: &Value) {
        let wants = self
            .call_hook(block, |function, ctx| function.config_changed(ctx, name, value))
            .unwrap_or(true);
        if wants {
            self.request_run(block, RunCause::Change);
        }
    }

    // ----- disabling -----

    /// Own flag or any disabled ancestor flow.
    pub fn is_disabled(&self, block: BlockId) -> bool {
        let Some(b) = self.blocks.get(block) else {
            return false;
        };
        if b.disabled {
            return true;
        }
        let mut parent = b.parent.as_ref().map(|p| p.block);
        while let Some(id) = parent {
            let Some(ancestor) = self.blocks.get(id) else {
                break;
            };
            if ancestor.disabled && ancestor.is_flow() {
                return true;
            }
            parent = ancestor.parent.as_ref().map(|p| p.block);
        }
        false
    }

    fn set_disabled(&mut self, block: BlockId, disabled: bool) {
        let was = self.is_disabled(block);
        let Some(b) = self.blocks.get_mut(block) else {
            return;
        };
        b.disabled = disabled;
        if was && !self.is_disabled(block) {
            self.catch_up(block);
        }
    }

    /// One run for every block under `block` that missed changes while
    /// disabled.
    fn catch_up(&mut self, block: BlockId) {
        let mut stack = vec![block];
        while let Some(id) = stack.pop() {
            let Some(b) = self.blocks.get(id) else {
                continue;
            };
            stack.extend(b.block_values().into_iter().filter(|child| self.owns_any(id, *child)));
            if b.pending && b.state == RunState::Idle && !self.is_disabled(id) {
                if let Some(b) = self.blocks.get_mut(id) {
                    b.pending = false;
                }
                self.request_run(id, RunCause::Pending);
            }
        }
    }

    fn owns_any(&self, block: BlockId, child: BlockId) -> bool {
        self.blocks
            .get(child)
            .and_then(|c| c.parent.as_ref())
            .is_some_and(|parent| parent.block == block)
    }

    // ----- observers -----

    pub fn watch(&mut self, block: BlockId, watcher: Rc<dyn BlockWatcher>) {
        if !self.check_live(block) {
            return;
        }
        if let Some(b) = self.blocks.get_mut(block) {
            b.watchers.push(watcher);
        }
    }

    pub fn unwatch(&mut self, block: BlockId, watcher: &Rc<dyn BlockWatcher>) {
        if let Some(b) = self.blocks.get_mut(block) {
            b.watchers.retain(|w| !Rc::ptr_eq(w, watcher));
        }
    }

    /// Listen to a property. The callback receives the current value
    /// immediately and every change after that.
    pub fn subscribe(
        &mut self,
        block: BlockId,
        name: &str,
        callback: impl FnMut(&Value) + 'static,
    ) -> SubscriptionId {
        let id = self.next_subscription_id();
        if !self.check_live(block) || PropertyKind::of(name) == PropertyKind::Virtual {
            return id;
        }
        let name = self.ensure_prop(block, name);
        let prop = PropRef::new(block, name);
        let mut subscription = Subscription {
            prop: prop.clone(),
            callback: Box::new(callback),
        };
        let Some(property) = self.prop_mut(&prop) else {
            return id;
        };
        property.dispatcher.listen(Listener::Subscription(id));
        let value = property.value().clone();
        (subscription.callback)(&value);
        self.subscriptions.insert(id, subscription);
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(subscription) = self.subscriptions.remove(&id) {
            if let Some(property) = self.prop_mut(&subscription.prop) {
                property.dispatcher.unlisten(&Listener::Subscription(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::test_harness::{record_values, RecordingWatcher};
    use serde_json::json;

    fn setup() -> (Runtime, BlockId) {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({})).unwrap();
        (rt, flow)
    }

    #[test]
    fn identical_set_value_notifies_once() {
        let (mut rt, flow) = setup();
        let (values, callback) = record_values();
        rt.subscribe(flow, "x", callback);
        rt.set_value(flow, "x", 1).unwrap();
        rt.set_value(flow, "x", 1).unwrap();
        // initial delivery plus one change
        assert_eq!(*values.borrow(), vec![Value::Undefined, Value::from(1)]);
    }

    #[test]
    fn persisted_and_transient_writes() {
        let (mut rt, flow) = setup();
        rt.set_value(flow, "x", 1).unwrap();
        rt.update_value(flow, "x", 2).unwrap();
        let property = rt.get_property(flow, "x");
        assert_eq!(property.value(), &Value::from(2));
        assert_eq!(property.saved_value(), Some(&Value::from(1)));
    }

    #[test]
    fn watchers_see_saved_flag() {
        let (mut rt, flow) = setup();
        let watcher = RecordingWatcher::new();
        rt.watch(flow, watcher.clone());
        rt.set_value(flow, "a", 1).unwrap();
        rt.update_value(flow, "a", 2).unwrap();
        let changes = watcher.changes();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].saved);
        assert!(!changes[1].saved);
        assert_eq!(&*changes[1].property, "a");

        let handle: Rc<dyn BlockWatcher> = watcher.clone();
        rt.unwatch(flow, &handle);
        rt.set_value(flow, "a", 3).unwrap();
        assert_eq!(watcher.changes().len(), 2);
    }

    #[test]
    fn absent_properties_read_as_void() {
        let (rt, flow) = setup();
        assert!(rt.get_property(flow, "missing").is_void());
        assert!(rt.get_value(flow, "missing").is_undefined());
        assert!(rt.property_names(flow).is_empty());
    }

    #[test]
    fn outputs_are_transient() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(block, "#output", 5).unwrap();
        assert_eq!(rt.get_value(block, "#output"), Value::from(5));
        assert_eq!(rt.get_property(block, "#output").saved_value(), None);
    }

    #[test]
    fn path_qualified_access() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(flow, "b.x", 3).unwrap();
        assert_eq!(rt.get_value(block, "x"), Value::from(3));
        assert_eq!(rt.get_value(flow, "b.x"), Value::from(3));
        assert_eq!(rt.get_value(block, "##"), Value::Block(flow));
        assert_eq!(rt.get_value(block, "#parent"), Value::Block(flow));
        assert!(matches!(rt.set_value(flow, "nope.x", 1), Err(FlowError::NotFound(_))));
        assert!(matches!(rt.set_value(flow, "b.##", 1), Err(FlowError::InvalidTarget(_))));
    }

    #[test]
    fn duplicate_child_names_are_rejected() {
        let (mut rt, flow) = setup();
        rt.create_block(flow, "b", None).unwrap();
        assert!(matches!(rt.create_block(flow, "b", None), Err(FlowError::DuplicateName(_))));
        assert!(matches!(rt.create_block(flow, "#output", None), Err(FlowError::InvalidTarget(_))));
    }

    #[test]
    fn destruction_cascades_to_owned_children() {
        let (mut rt, flow) = setup();
        let parent = rt.create_block(flow, "p", None).unwrap();
        let child = rt.create_block(parent, "c", None).unwrap();
        rt.set_value(child, "x", 1).unwrap();

        rt.destroy_block(parent);
        assert!(!rt.is_valid(parent));
        assert!(!rt.is_valid(child));
        assert!(rt.get_property(child, "x").is_void());
        assert!(rt.get_value(child, "x").is_undefined());
        assert!(rt.get_value(flow, "p").is_undefined());
        // writes through stale handles are no-ops
        rt.set_value(child, "x", 2).unwrap();
        assert!(rt.get_value(child, "x").is_undefined());
    }

    #[test]
    fn destroying_deep_chains_does_not_recurse() {
        let (mut rt, flow) = setup();
        let before = rt.block_count();
        let top = rt.create_block(flow, "c", None).unwrap();
        let mut block = top;
        for _ in 0..20_000 {
            block = rt.create_block(block, "c", None).unwrap();
        }
        rt.destroy_block(top);
        assert!(!rt.is_valid(block));
        assert_eq!(rt.block_count(), before);
    }

    #[test]
    fn deleting_owning_property_destroys_child() {
        let (mut rt, flow) = setup();
        let child = rt.create_block(flow, "c", None).unwrap();
        rt.delete_value(flow, "c").unwrap();
        assert!(!rt.is_valid(child));
        assert!(!rt.property_names(flow).contains(&"c".to_string()));
    }

    #[test]
    fn overwriting_owning_property_destroys_child() {
        let (mut rt, flow) = setup();
        let child = rt.create_block(flow, "c", None).unwrap();
        rt.set_value(flow, "c", 1).unwrap();
        assert!(!rt.is_valid(child));
        assert_eq!(rt.get_value(flow, "c"), Value::from(1));
    }

    #[test]
    fn subscriptions_end_on_destroy() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(block, "x", 1).unwrap();
        let (values, callback) = record_values();
        rt.subscribe(block, "x", callback);
        rt.destroy_block(block);
        assert_eq!(*values.borrow(), vec![Value::from(1), Value::Undefined]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (mut rt, flow) = setup();
        let (values, callback) = record_values();
        let id = rt.subscribe(flow, "x", callback);
        rt.unsubscribe(id);
        rt.set_value(flow, "x", 1).unwrap();
        assert_eq!(values.borrow().len(), 1);
    }

    #[test]
    #[should_panic(expected = "destroyed")]
    fn strict_mode_panics_on_stale_handles() {
        let mut rt = Runtime::new(RuntimeConfig { strict: true, ..RuntimeConfig::default() });
        let flow = rt.add_flow("main", &json!({})).unwrap();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.destroy_block(block);
        let _ = rt.get_value(block, "x");
    }

    #[test]
    fn helper_block_feeds_named_input() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        let helper = rt.create_helper_block(block, "x", None).unwrap();
        rt.output(helper, 9, "#output");
        assert_eq!(rt.get_value(block, "x"), Value::from(9));
        assert_eq!(rt.get_property(block, "x").binding_path(), Some("~x.#output"));
    }

    #[test]
    fn uids_are_unique() {
        let (mut rt, flow) = setup();
        let a = rt.create_block(flow, "a", None).unwrap();
        let b = rt.create_block(flow, "b", None).unwrap();
        assert_ne!(rt.block(a).unwrap().uid(), rt.block(b).unwrap().uid());
    }
}
