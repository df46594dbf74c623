//! Structural sharing of `#shared` sub-blocks.
//!
//! Flows that load identical `#shared` data under the same function type get
//! one block, reference counted by the `#shared` properties holding it.
//! Entries marked `#cacheMode: "persist"` outlive their last reference until
//! the function type is unregistered or the cache is cleared.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value as Json};

use crate::arena::BlockId;
use crate::block::BlockKind;
use crate::property::{PropRef, CACHE_MODE, SHARED};
use crate::runtime::Runtime;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SharedKey {
    function_type: Option<Arc<str>>,
    /// Canonical JSON (sorted keys) of the shared data.
    data: String,
}

#[derive(Debug)]
struct SharedEntry {
    block: BlockId,
    refs: usize,
    persist: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SharedCache {
    entries: FxHashMap<SharedKey, SharedEntry>,
    by_block: FxHashMap<BlockId, SharedKey>,
}

fn canonical(json: &Json) -> Json {
    match json {
        Json::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(value) = fields.get(key) {
                    sorted.insert(key.clone(), canonical(value));
                }
            }
            Json::Object(sorted)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

impl Runtime {
    fn function_type_of(&self, block: BlockId) -> Option<Arc<str>> {
        let flow = self.blocks.get(block)?.flow?;
        self.blocks.get(flow)?.flow_state()?.function_type.clone()
    }

    /// Persisted write of `#shared`: find or create the shared block for
    /// `value` and hold a reference on it.
    pub(crate) fn set_shared(&mut self, block: BlockId, value: Value) {
        let name = self.ensure_prop(block, SHARED);
        let prop = PropRef::new(block, name);
        self.unbind_property(&prop);
        let shared = match &value {
            Value::Undefined | Value::Null => None,
            Value::Block(existing) if self.shared.by_block.contains_key(existing) => {
                if self.peek(block, SHARED).as_block() != Some(*existing) {
                    self.retain_shared(*existing);
                }
                Some(*existing)
            }
            Value::Object(_) => {
                let Some(data) = value.to_json() else {
                    return;
                };
                let key = self.shared_key(block, &data);
                let current = self.peek(block, SHARED).as_block();
                if current.is_some_and(|current| self.shared.by_block.get(&current) == Some(&key)) {
                    return;
                }
                Some(self.acquire_shared(key, &data))
            }
            other => {
                log::warn!("ignoring #shared value {other:?} on {block:?}");
                return;
            }
        };
        if let Some(property) = self.prop_mut(&prop) {
            property.saved = shared.map(Value::Block);
        }
        self.apply(&prop, shared.map(Value::Block).unwrap_or_default(), true);
    }

    fn shared_key(&self, owner: BlockId, data: &Json) -> SharedKey {
        SharedKey {
            function_type: self.function_type_of(owner),
            data: canonical(data).to_string(),
        }
    }

    fn acquire_shared(&mut self, key: SharedKey, data: &Json) -> BlockId {
        if let Some(entry) = self.shared.entries.get_mut(&key) {
            entry.refs += 1;
            return entry.block;
        }
        let block = self.alloc_block(BlockKind::Plain, None);
        let persist = data.get(CACHE_MODE).and_then(Json::as_str) == Some("persist");
        log::debug!("new shared block {block:?} (persist: {persist})");
        self.shared.by_block.insert(block, key.clone());
        self.shared.entries.insert(key, SharedEntry { block, refs: 1, persist });
        if let Err(error) = self.load(block, data) {
            log::warn!("loading shared block {block:?} failed: {error}");
        }
        block
    }

    fn retain_shared(&mut self, block: BlockId) {
        let Some(key) = self.shared.by_block.get(&block) else {
            return;
        };
        if let Some(entry) = self.shared.entries.get_mut(key) {
            entry.refs += 1;
        }
    }

    /// Drop one reference, destroying the block at zero unless persisted.
    pub(crate) fn release_shared(&mut self, block: BlockId) {
        let Some(key) = self.shared.by_block.get(&block).cloned() else {
            return;
        };
        let Some(entry) = self.shared.entries.get_mut(&key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 || entry.persist {
            return;
        }
        self.shared.entries.remove(&key);
        self.shared.by_block.remove(&block);
        log::debug!("releasing shared block {block:?}");
        self.teardown(block);
    }

    /// Release persisted entries of one function type, or all of them.
    /// Entries still referenced stop being persistent.
    pub(crate) fn release_persisted_shared(&mut self, function_type: Option<&str>) {
        let matching: Vec<SharedKey> = self
            .shared
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.persist && function_type.is_none_or(|ty| key.function_type.as_deref() == Some(ty))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in matching {
            let Some(entry) = self.shared.entries.get_mut(&key) else {
                continue;
            };
            entry.persist = false;
            if entry.refs > 0 {
                continue;
            }
            let block = entry.block;
            self.shared.entries.remove(&key);
            self.shared.by_block.remove(&block);
            self.teardown(block);
        }
    }

    /// Drop every unreferenced persisted shared block.
    pub fn clear_shared_cache(&mut self) {
        self.release_persisted_shared(None);
    }

    pub fn shared_block_count(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_shared_block(&self, block: BlockId) -> bool {
        self.shared.by_block.contains_key(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = canonical(&json!({"b": 1, "a": {"d": 2, "c": 3}}));
        let b = canonical(&json!({"a": {"c": 3, "d": 2}, "b": 1}));
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn identical_data_shares_one_block() {
        let mut rt = Runtime::default();
        let a = rt.add_flow("a", &json!({"#shared": {"x": 1, "y": 2}})).unwrap();
        let b = rt.add_flow("b", &json!({"#shared": {"y": 2, "x": 1}})).unwrap();
        let c = rt.add_flow("c", &json!({"#shared": {"x": 9}})).unwrap();

        let shared = rt.get_value(a, "#shared").as_block().unwrap();
        assert_eq!(rt.get_value(b, "#shared"), Value::Block(shared));
        assert_ne!(rt.get_value(c, "#shared"), Value::Block(shared));
        assert_eq!(rt.get_value(a, "#shared.x"), Value::from(1));
        assert!(rt.is_shared_block(shared));
        assert!(rt.block(shared).unwrap().parent().is_none());
        assert_eq!(rt.shared_block_count(), 2);

        rt.delete_flow("a").unwrap();
        assert!(rt.is_valid(shared));
        rt.delete_flow("b").unwrap();
        assert!(!rt.is_valid(shared));
        assert_eq!(rt.shared_block_count(), 1);
    }

    #[test]
    fn persisted_entries_survive_until_cleared() {
        let mut rt = Runtime::default();
        let data = json!({"#shared": {"#cacheMode": "persist", "v": 1}});
        let flow = rt.add_flow("a", &data).unwrap();
        let shared = rt.get_value(flow, "#shared").as_block().unwrap();
        rt.delete_flow("a").unwrap();
        assert!(rt.is_valid(shared));

        // a new flow with the same data picks the cached block up again
        let flow = rt.add_flow("b", &data).unwrap();
        assert_eq!(rt.get_value(flow, "#shared"), Value::Block(shared));
        rt.delete_flow("b").unwrap();

        rt.clear_shared_cache();
        assert!(!rt.is_valid(shared));
        assert_eq!(rt.shared_block_count(), 0);
    }

    #[test]
    fn clearing_referenced_entry_drops_persistence() {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("a", &json!({"#shared": {"#cacheMode": "persist"}})).unwrap();
        let shared = rt.get_value(flow, "#shared").as_block().unwrap();
        rt.clear_shared_cache();
        assert!(rt.is_valid(shared));
        rt.delete_flow("a").unwrap();
        assert!(!rt.is_valid(shared));
    }

    #[test]
    fn shared_data_round_trips_through_save() {
        let mut rt = Runtime::default();
        let data = json!({"#shared": {"x": 1}});
        let flow = rt.add_flow("a", &data).unwrap();
        assert_eq!(rt.save(flow), data);
    }

    #[test]
    fn rewriting_same_data_keeps_reference_count() {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("a", &json!({"#shared": {"x": 1}})).unwrap();
        let shared = rt.get_value(flow, "#shared").as_block().unwrap();
        rt.set_value(flow, "#shared", Value::from_json(&json!({"x": 1}))).unwrap();
        assert_eq!(rt.get_value(flow, "#shared"), Value::Block(shared));
        rt.delete_value(flow, "#shared").unwrap();
        assert!(!rt.is_valid(shared));
    }
}
