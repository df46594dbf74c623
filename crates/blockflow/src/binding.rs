//! Dynamic multi-hop bindings and `^name` context resolution.
//!
//! A binding evaluates its path hop by hop from the block that owns the
//! target property. Every property read along the way is a hop the binding
//! listens to. When hop `i` changes, hops after `i` are dropped and the rest
//! of the path is resolved again from hop `i`'s new value, so bindings
//! follow structural changes (a helper swapped, a child replaced) without
//! ever being re-created. Bindings never own what they point at.

use smallvec::SmallVec;

use crate::arena::{BindingId, BlockId};
use crate::error::Result;
use crate::path::{Path, Segment};
use crate::property::{Listener, PropRef, PropertyKind, FLOW, PARENT, ROOT_FLOW};
use crate::runtime::Runtime;
use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) struct Hop {
    pub(crate) prop: PropRef,
    /// Index of the path segment that read this property.
    pub(crate) segment: usize,
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub(crate) target: PropRef,
    /// Block the path is evaluated from (the target's owner).
    pub(crate) origin: BlockId,
    pub(crate) path: Path,
    /// Context lookup starts one scope out. Used by automatically attached
    /// context properties, which bind to their own name.
    pub(crate) outer: bool,
    pub(crate) hops: SmallVec<[Hop; 4]>,
    /// Context property this binding holds a reference on.
    pub(crate) held: Option<PropRef>,
}

impl Runtime {
    /// Bind the property at `path` to `binding`, or unbind it with `None`.
    ///
    /// Rebinding drops the old chain silently, then resolves the new one,
    /// delivering its value once. Unbinding reverts to the saved literal.
    /// Output and virtual properties ignore bindings.
    pub fn set_binding(&mut self, block: BlockId, path: &str, binding: Option<&str>) -> Result<()> {
        if !self.check_live(block) {
            return Ok(());
        }
        let parsed = binding.map(Path::parse).transpose()?;
        let (target, name) = self.resolve_target(block, path)?;
        if !PropertyKind::of(&name).accepts_binding() {
            return Ok(());
        }
        let name = self.ensure_prop(target, &name);
        let prop = PropRef::new(target, name);
        self.unbind_property(&prop);

        let Some(path) = parsed else {
            let value = self.prop_ref(&prop).and_then(|p| p.saved.clone()).unwrap_or_default();
            self.apply(&prop, value, true);
            return Ok(());
        };
        let source = path.source().clone();
        let id = self.bindings.alloc(Binding {
            target: prop.clone(),
            origin: target,
            path,
            outer: false,
            hops: SmallVec::new(),
            held: None,
        });
        if let Some(property) = self.prop_mut(&prop) {
            property.saved = None;
            property.auto_context = false;
            property.binding = Some(id);
            property.binding_path = Some(source);
        }
        self.resolve(id, 0, true);
        Ok(())
    }

    /// Drop the property's binding without notifying anyone.
    pub(crate) fn unbind_property(&mut self, prop: &PropRef) {
        let Some(property) = self.prop_mut(prop) else {
            return;
        };
        property.binding_path = None;
        let Some(id) = property.binding.take() else {
            return;
        };
        self.unlisten_hops(id, 0);
        if let Some(binding) = self.bindings.free(id) {
            if let Some(held) = binding.held {
                self.release_context(&held);
            }
        }
    }

    fn unlisten_hops(&mut self, id: BindingId, keep: usize) {
        let Some(binding) = self.bindings.get_mut(id) else {
            return;
        };
        if keep >= binding.hops.len() {
            return;
        }
        let dropped: SmallVec<[Hop; 4]> = binding.hops.drain(keep..).collect();
        for (offset, hop) in dropped.into_iter().enumerate() {
            let listener = Listener::Binding {
                binding: id,
                hop: (keep + offset) as u16,
            };
            if let Some(property) = self.prop_mut(&hop.prop) {
                property.dispatcher.unlisten(&listener);
            }
        }
    }

    pub(crate) fn on_hop_changed(&mut self, id: BindingId, hop: usize) {
        let Some(binding) = self.bindings.get(id) else {
            return;
        };
        if hop < binding.hops.len() {
            self.resolve(id, hop + 1, false);
        }
    }

    /// Keep the first `keep` hops and resolve the rest of the path.
    fn resolve(&mut self, id: BindingId, keep: usize, saved: bool) {
        self.unlisten_hops(id, keep);
        let Some(binding) = self.bindings.get(id) else {
            return;
        };
        let origin = binding.origin;
        let outer = binding.outer;
        let target = binding.target.clone();
        let segments: SmallVec<[Segment; 4]> = binding.path.segments().iter().cloned().collect();
        let (mut current, start) = if keep == 0 {
            (Value::Block(origin), 0)
        } else {
            let Some(hop) = binding.hops.get(keep - 1) else {
                return;
            };
            let value = self.prop_ref(&hop.prop).map(|p| p.value().clone()).unwrap_or_default();
            (value, hop.segment + 1)
        };

        for (index, segment) in segments.iter().enumerate().skip(start) {
            let next = match (current.as_block(), segment) {
                (Some(block), Segment::Name(name) | Segment::Helper(name)) if self.blocks.is_valid(block) => {
                    let name = self.ensure_prop(block, name);
                    self.listen_hop(id, PropRef::new(block, name), index)
                }
                (Some(_), Segment::Context(name)) if index == 0 => {
                    match self.context_prop(origin, name, outer) {
                        Some(prop) => {
                            if let Some(property) = self.prop_mut(&prop) {
                                property.context_refs += 1;
                            }
                            let previous = self
                                .bindings
                                .get_mut(id)
                                .and_then(|binding| binding.held.replace(prop.clone()));
                            if let Some(previous) = previous {
                                self.release_context(&previous);
                            }
                            self.listen_hop(id, prop, index)
                        }
                        None => Value::Undefined,
                    }
                }
                _ => self.step(origin, &current, segment, index),
            };
            current = next;
            if current.is_undefined() {
                break;
            }
        }

        let bound = self
            .prop_ref(&target)
            .is_some_and(|property| property.binding == Some(id));
        if bound {
            self.apply(&target, current, saved);
        }
    }

    fn listen_hop(&mut self, id: BindingId, prop: PropRef, segment: usize) -> Value {
        let Some(binding) = self.bindings.get_mut(id) else {
            return Value::Undefined;
        };
        let hop = binding.hops.len() as u16;
        binding.hops.push(Hop { prop: prop.clone(), segment });
        let Some(property) = self.prop_mut(&prop) else {
            return Value::Undefined;
        };
        property.dispatcher.listen(Listener::Binding { binding: id, hop });
        property.value().clone()
    }

    /// Read-only evaluation of one path segment.
    pub(crate) fn step(&self, origin: BlockId, current: &Value, segment: &Segment, index: usize) -> Value {
        match (current, segment) {
            (Value::Block(block), Segment::Flow) => self.virtual_value(*block, FLOW),
            (Value::Block(block), Segment::RootFlow) => self.virtual_value(*block, ROOT_FLOW),
            (Value::Block(block), Segment::Parent) => self.virtual_value(*block, PARENT),
            (Value::Block(_), Segment::Context(name)) if index == 0 => self.lookup_context(origin, name),
            (Value::Block(block), Segment::Name(name) | Segment::Helper(name)) => self.peek(*block, name),
            (Value::Object(fields), Segment::Name(name)) => fields.get(&**name).cloned().unwrap_or_default(),
            (Value::List(items), Segment::Name(name)) => name
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index))
                .cloned()
                .unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    pub(crate) fn evaluate(&self, origin: BlockId, path: &Path) -> Value {
        let mut current = Value::Block(origin);
        for (index, segment) in path.segments().iter().enumerate() {
            current = self.step(origin, &current, segment, index);
        }
        current
    }

    pub(crate) fn virtual_value(&self, block: BlockId, name: &str) -> Value {
        let Some(b) = self.blocks.get(block) else {
            return Value::Undefined;
        };
        let target = match name {
            FLOW => b.flow,
            ROOT_FLOW => self.outermost_flow(block),
            PARENT => b.parent.as_ref().map(|parent| parent.block),
            _ => None,
        };
        target.map(Value::Block).unwrap_or_default()
    }

    /// Nearest flow strictly above `flow`, not counting the global fallback.
    fn enclosing_flow(&self, flow: BlockId) -> Option<BlockId> {
        let mut parent = self.blocks.get(flow)?.parent.as_ref().map(|p| p.block);
        while let Some(id) = parent {
            let block = self.blocks.get(id)?;
            if block.is_flow() {
                return Some(id);
            }
            parent = block.parent.as_ref().map(|p| p.block);
        }
        None
    }

    fn outermost_flow(&self, block: BlockId) -> Option<BlockId> {
        let mut flow = self.blocks.get(block)?.flow?;
        while let Some(outer) = self.enclosing_flow(flow) {
            flow = outer;
        }
        Some(flow)
    }

    /// Context scope of a block: its flow, or the global flow.
    fn scope_of(&self, block: BlockId) -> Option<BlockId> {
        let b = self.blocks.get(block)?;
        Some(b.flow.unwrap_or(self.global))
    }

    /// Next scope out. Top-level flows fall back to the global flow, which
    /// has no outer scope.
    fn parent_scope(&self, scope: BlockId) -> Option<BlockId> {
        if scope == self.global {
            return None;
        }
        self.enclosing_flow(scope).or(Some(self.global))
    }

    fn lookup_context(&self, block: BlockId, name: &str) -> Value {
        let mut scope = self.scope_of(block);
        while let Some(id) = scope {
            if let Some(property) = self.blocks.get(id).and_then(|b| b.properties.get(name)) {
                if !property.auto_context && (property.saved.is_some() || property.binding.is_some()) {
                    return property.value().clone();
                }
            }
            scope = self.parent_scope(id);
        }
        Value::Undefined
    }

    /// The `^name` property a binding from `origin` resolves through,
    /// attaching it to the outer scope when nothing is set explicitly.
    fn context_prop(&mut self, origin: BlockId, name: &str, outer: bool) -> Option<PropRef> {
        let scope = if outer {
            self.parent_scope(origin)?
        } else {
            self.scope_of(origin)?
        };
        let name = self.ensure_prop(scope, name);
        let prop = PropRef::new(scope, name);
        let property = self.prop_ref(&prop)?;
        let explicit = property.saved.is_some() || (property.binding.is_some() && !property.auto_context);
        if !explicit && !property.auto_context {
            self.attach_auto_context(&prop);
        }
        Some(prop)
    }

    /// Bind a context property to the same name one scope out.
    pub(crate) fn attach_auto_context(&mut self, prop: &PropRef) {
        let Some(property) = self.prop_mut(prop) else {
            return;
        };
        property.auto_context = true;
        if self.parent_scope(prop.block).is_none() {
            return;
        }
        let Ok(path) = Path::parse(&prop.name) else {
            return;
        };
        log::debug!("attaching context {} on {:?}", prop.name, prop.block);
        let source = path.source().clone();
        let id = self.bindings.alloc(Binding {
            target: prop.clone(),
            origin: prop.block,
            path,
            outer: true,
            hops: SmallVec::new(),
            held: None,
        });
        if let Some(property) = self.prop_mut(prop) {
            property.binding = Some(id);
            property.binding_path = Some(source);
        }
        self.resolve(id, 0, false);
    }

    fn release_context(&mut self, prop: &PropRef) {
        let Some(property) = self.prop_mut(prop) else {
            return;
        };
        property.context_refs = property.context_refs.saturating_sub(1);
        if property.context_refs > 0 || !property.auto_context {
            return;
        }
        log::debug!("detaching context {} from {:?}", prop.name, prop.block);
        self.unbind_property(prop);
        let Some(block) = self.blocks.get_mut(prop.block) else {
            return;
        };
        let removable = block.properties.get(&*prop.name).is_some_and(|property| {
            !property.dispatcher.has_listeners() && property.saved.is_none() && property.binding.is_none()
        });
        if removable {
            block.properties.shift_remove(&*prop.name);
        } else if let Some(property) = block.properties.get_mut(&*prop.name) {
            property.auto_context = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::test_harness::{counter, probe_desc, record_values, Probe};
    use serde_json::json;

    fn setup() -> (Runtime, BlockId) {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({})).unwrap();
        (rt, flow)
    }

    #[test]
    fn binding_follows_source() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(flow, "v1", 1).unwrap();
        rt.set_binding(block, "x", Some("##.v1")).unwrap();
        assert_eq!(rt.get_value(block, "x"), Value::from(1));
        rt.set_value(flow, "v1", 2).unwrap();
        assert_eq!(rt.get_value(block, "x"), Value::from(2));
        assert_eq!(rt.get_property(block, "x").binding_path(), Some("##.v1"));
        assert_eq!(rt.get_property(block, "x").saved_value(), None);
    }

    #[test]
    fn unrelated_key_does_not_rerun_bound_block() {
        let (mut rt, flow) = setup();
        let runs = counter();
        let probe_runs = runs.clone();
        rt.register_function(move || Box::new(Probe::new(probe_runs.clone())), probe_desc("probe"), None);
        rt.set_value(flow, "v1", 1).unwrap();
        rt.set_value(flow, "v1package", "a").unwrap();
        let block = rt.create_block(flow, "b", Some("probe")).unwrap();
        rt.set_binding(block, "x", Some("##.v1")).unwrap();
        rt.run();
        let baseline = runs.get();

        rt.set_value(flow, "v1", 5).unwrap();
        rt.run();
        assert_eq!(runs.get(), baseline + 1);
        assert_eq!(rt.get_value(block, "x"), Value::from(5));

        rt.set_value(flow, "v1package", "b").unwrap();
        rt.run();
        assert_eq!(runs.get(), baseline + 1);
    }

    #[test]
    fn set_value_clears_binding() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(flow, "src", 1).unwrap();
        rt.set_binding(block, "x", Some("##.src")).unwrap();
        rt.set_value(block, "x", 7).unwrap();
        assert_eq!(rt.get_value(block, "x"), Value::from(7));
        assert_eq!(rt.get_property(block, "x").binding_path(), None);
        rt.set_value(flow, "src", 2).unwrap();
        assert_eq!(rt.get_value(block, "x"), Value::from(7));
        // the old hop no longer listens
        assert_eq!(rt.get_property(flow, "src").listener_count(), 0);
    }

    #[test]
    fn unbinding_reverts_to_saved_literal() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(flow, "src", 1).unwrap();
        rt.set_binding(block, "x", Some("##.src")).unwrap();
        rt.set_binding(block, "x", None).unwrap();
        assert!(rt.get_value(block, "x").is_undefined());
        assert!(!rt.get_property(block, "x").is_bound());
    }

    #[test]
    fn rebinding_delivers_once() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(flow, "a", 1).unwrap();
        rt.set_value(flow, "c", 2).unwrap();
        rt.set_binding(block, "x", Some("##.a")).unwrap();
        let (values, callback) = record_values();
        rt.subscribe(block, "x", callback);
        rt.set_binding(block, "x", Some("##.c")).unwrap();
        assert_eq!(*values.borrow(), vec![Value::from(1), Value::from(2)]);
        rt.set_value(flow, "a", 10).unwrap();
        assert_eq!(values.borrow().len(), 2);
    }

    #[test]
    fn intermediate_hop_change_re_resolves() {
        let (mut rt, flow) = setup();
        let first = rt.create_block(flow, "first", None).unwrap();
        let second = rt.create_block(flow, "second", None).unwrap();
        rt.set_value(first, "v", "one").unwrap();
        rt.set_value(second, "v", "two").unwrap();
        rt.update_value(flow, "current", first).unwrap();

        let reader = rt.create_block(flow, "reader", None).unwrap();
        rt.set_binding(reader, "x", Some("##.current.v")).unwrap();
        assert_eq!(rt.get_value(reader, "x"), Value::from("one"));

        rt.update_value(flow, "current", second).unwrap();
        assert_eq!(rt.get_value(reader, "x"), Value::from("two"));
        // the first block's hop was dropped
        rt.set_value(first, "v", "uno").unwrap();
        assert_eq!(rt.get_value(reader, "x"), Value::from("two"));
        assert_eq!(rt.get_property(first, "v").listener_count(), 0);
    }

    #[test]
    fn binding_into_object_fields() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(flow, "obj", Value::from_json(&json!({"a": {"b": [10, 20]}}))).unwrap();
        rt.set_binding(block, "x", Some("##.obj.a.b.1")).unwrap();
        assert_eq!(rt.get_value(block, "x"), Value::from(20));
    }

    #[test]
    fn destroyed_hop_yields_undefined() {
        let (mut rt, flow) = setup();
        let source = rt.create_block(flow, "src", None).unwrap();
        rt.set_value(source, "v", 3).unwrap();
        let reader = rt.create_block(flow, "reader", None).unwrap();
        rt.set_binding(reader, "x", Some("##.src.v")).unwrap();
        assert_eq!(rt.get_value(reader, "x"), Value::from(3));
        rt.destroy_block(source);
        assert!(rt.get_value(reader, "x").is_undefined());

        // a new block under the same name is picked up
        let source = rt.create_block(flow, "src", None).unwrap();
        rt.set_value(source, "v", 4).unwrap();
        assert_eq!(rt.get_value(reader, "x"), Value::from(4));
    }

    #[test]
    fn invalid_paths_are_rejected_before_mutation() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(block, "x", 1).unwrap();
        let error = rt.set_binding(block, "x", Some("a..b")).unwrap_err();
        assert!(matches!(error, FlowError::InvalidPath { .. }));
        assert_eq!(rt.get_value(block, "x"), Value::from(1));
    }

    #[test]
    fn outputs_ignore_bindings() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_binding(block, "#output", Some("##.x")).unwrap();
        assert!(!rt.get_property(block, "#output").is_bound());
    }

    #[test]
    fn context_shadowing_and_detach() {
        let (mut rt, flow) = setup();
        let global = rt.global_flow();
        rt.set_value(global, "^theme", "dark").unwrap();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_binding(block, "t", Some("^theme")).unwrap();
        assert_eq!(rt.get_value(block, "t"), Value::from("dark"));
        assert!(rt.property_names(flow).contains(&"^theme".to_string()));

        // explicit value on the flow shadows the global one
        rt.set_value(flow, "^theme", "light").unwrap();
        assert_eq!(rt.get_value(block, "t"), Value::from("light"));
        rt.set_value(global, "^theme", "blue").unwrap();
        assert_eq!(rt.get_value(block, "t"), Value::from("light"));

        // deleting it falls back to the outer scope while still referenced
        rt.delete_value(flow, "^theme").unwrap();
        assert_eq!(rt.get_value(block, "t"), Value::from("blue"));

        // last reference gone: the automatic attachment detaches
        rt.set_binding(block, "t", None).unwrap();
        assert!(!rt.property_names(flow).contains(&"^theme".to_string()));
        assert_eq!(rt.get_property(global, "^theme").listener_count(), 0);
    }

    #[test]
    fn nested_flow_context_chain() {
        let (mut rt, outer) = setup();
        rt.set_value(outer, "^lang", "en").unwrap();
        let inner = rt.add_flow("main2", &json!({})).unwrap();
        let block = rt.create_block(inner, "b", None).unwrap();
        rt.set_binding(block, "l", Some("^lang")).unwrap();
        // sibling flow does not see main's context
        assert!(rt.get_value(block, "l").is_undefined());
        rt.set_value(rt.global_flow(), "^lang", "fr").unwrap();
        assert_eq!(rt.get_value(block, "l"), Value::from("fr"));
    }

    #[test]
    fn context_segment_resolves_read_only() {
        let (mut rt, flow) = setup();
        rt.set_value(rt.global_flow(), "^user", Value::from_json(&json!({"name": "ada"}))).unwrap();
        assert_eq!(rt.get_value(flow, "^user.name"), Value::from("ada"));
    }
}
