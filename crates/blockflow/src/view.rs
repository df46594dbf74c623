//! Map-like views over a block's properties.
//!
//! Views go through the arena directly and never panic on a destroyed
//! block, strict mode included: reads come back empty, writes are dropped.

use crate::arena::BlockId;
use crate::block::{check_persisted, Write};
use crate::property::PropertyKind;
use crate::runtime::Runtime;
use crate::value::Value;

/// Nesting limit for deep materialization; deeper blocks stay handles.
const MAX_DEPTH: usize = 16;

pub trait PropertyAccessor {
    fn get(&self, name: &str) -> Value;

    /// Persisted write. Returns `false` when the write was dropped.
    fn set(&mut self, name: &str, value: Value) -> bool;

    fn has(&self, name: &str) -> bool;

    fn keys(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// Nested blocks are returned as `Value::Block` handles.
    Shallow,
    /// Nested owned blocks are materialized as objects.
    Deep,
}

pub struct BlockView<'a> {
    rt: &'a mut Runtime,
    block: BlockId,
    mode: ViewMode,
}

impl Runtime {
    pub fn view(&mut self, block: BlockId) -> BlockView<'_> {
        BlockView { rt: self, block, mode: ViewMode::Shallow }
    }

    pub fn deep_view(&mut self, block: BlockId) -> BlockView<'_> {
        BlockView { rt: self, block, mode: ViewMode::Deep }
    }

    fn materialize(&self, block: BlockId, depth: usize) -> Value {
        let Some(b) = self.blocks.get(block) else {
            return Value::Undefined;
        };
        let fields = b
            .properties()
            .filter(|property| !property.value().is_undefined())
            .map(|property| {
                let value = self.expand(block, property.name(), property.value().clone(), depth);
                (property.name().to_string(), value)
            });
        Value::object(fields.collect::<Vec<_>>())
    }

    fn expand(&self, block: BlockId, name: &str, value: Value, depth: usize) -> Value {
        match value {
            Value::Block(child) if depth < MAX_DEPTH && self.owns(block, name, child) => {
                self.materialize(child, depth + 1)
            }
            other => other,
        }
    }
}

impl BlockView<'_> {
    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.rt.blocks.is_valid(self.block)
    }

    /// The whole block as one object value.
    pub fn snapshot(&self) -> Value {
        match self.mode {
            ViewMode::Deep => self.rt.materialize(self.block, 0),
            ViewMode::Shallow if self.is_live() => {
                let fields: Vec<(String, Value)> = self
                    .keys()
                    .into_iter()
                    .map(|name| {
                        let value = self.get(&name);
                        (name, value)
                    })
                    .collect();
                Value::object(fields)
            }
            ViewMode::Shallow => Value::Undefined,
        }
    }
}

impl PropertyAccessor for BlockView<'_> {
    fn get(&self, name: &str) -> Value {
        if !self.is_live() {
            return Value::Undefined;
        }
        let value = self.rt.peek(self.block, name);
        match self.mode {
            ViewMode::Shallow => value,
            ViewMode::Deep => self.rt.expand(self.block, name, value, 0),
        }
    }

    fn set(&mut self, name: &str, value: Value) -> bool {
        if !self.is_live() || PropertyKind::of(name) == PropertyKind::Virtual {
            return false;
        }
        if check_persisted(name, &value).is_err() {
            return false;
        }
        self.rt.write(self.block, name, value, Write::Persist);
        true
    }

    fn has(&self, name: &str) -> bool {
        self.rt
            .blocks
            .get(self.block)
            .is_some_and(|b| b.property(name).is_some())
    }

    fn keys(&self) -> Vec<String> {
        self.rt
            .blocks
            .get(self.block)
            .map(|b| b.properties().map(|property| property.name().to_string()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use serde_json::json;

    #[test]
    fn shallow_and_deep_reads() {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({"a": 1, "b": {"#is": null, "x": 2}})).unwrap();
        let b = rt.get_value(flow, "b").as_block().unwrap();

        let view = rt.view(flow);
        assert_eq!(view.get("a"), Value::from(1));
        assert_eq!(view.get("b"), Value::Block(b));
        assert!(view.has("a"));
        assert!(!view.has("zzz"));
        assert_eq!(view.keys(), vec!["a".to_string(), "b".to_string()]);

        let view = rt.deep_view(flow);
        let nested = view.get("b");
        assert_eq!(nested.as_object().and_then(|fields| fields.get("x")), Some(&Value::from(2)));
        let whole = view.snapshot();
        assert_eq!(whole.as_object().map(|fields| fields.len()), Some(2));
    }

    #[test]
    fn writes_are_persisted() {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({})).unwrap();
        let mut view = rt.view(flow);
        assert!(view.set("x", Value::from(3)));
        assert!(!view.set("##", Value::from(3)));
        assert_eq!(rt.save(flow), json!({"x": 3}));
    }

    #[test]
    fn destroyed_block_views_are_empty_even_in_strict_mode() {
        let mut rt = Runtime::new(RuntimeConfig { strict: true, ..RuntimeConfig::default() });
        let flow = rt.add_flow("main", &json!({})).unwrap();
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(block, "x", 1).unwrap();
        rt.destroy_block(block);

        let mut view = rt.deep_view(block);
        assert!(!view.is_live());
        assert!(view.get("x").is_undefined());
        assert!(!view.has("x"));
        assert!(view.keys().is_empty());
        assert!(!view.set("x", Value::from(2)));
        assert!(view.snapshot().is_undefined());
    }

    #[test]
    fn deep_views_stop_at_the_depth_limit() {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({})).unwrap();
        let mut block = flow;
        for _ in 0..MAX_DEPTH + 2 {
            block = rt.create_block(block, "c", None).unwrap();
        }
        let mut value = rt.deep_view(flow).get("c");
        let mut levels = 0;
        while let Some(fields) = value.as_object() {
            value = fields.get("c").cloned().unwrap_or_default();
            levels += 1;
        }
        assert_eq!(levels, MAX_DEPTH);
        assert!(value.as_block().is_some());
    }
}
