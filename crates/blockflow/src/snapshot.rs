//! Plain-object snapshots of blocks.
//!
//! The format is one JSON object per block:
//!
//! - literal properties are written as their JSON value;
//! - a bound property `x` is written as `"~x": "path"`;
//! - a helper block is written as `"~x": {...}`, and a non-default binding
//!   of `x` next to it moves into the helper object as `"#bind"`;
//! - an owned child block is written as an object that always carries `#is`
//!   (`null` when the child has no function);
//! - `#shared` is written as the shared block's own snapshot.
//!
//! Outputs, auto-attached context properties and worker flows are never
//! written.

use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::arena::BlockId;
use crate::block::{check_persisted, BlockKind, Write};
use crate::error::{FlowError, Result};
use crate::path::Path;
use crate::property::{PropRef, PropertyKind, HELPER_PREFIX, IS, OUTPUT, SHARED};
use crate::runtime::Runtime;
use crate::value::Value;

/// Key under which a helper object carries its owner's explicit binding.
const BIND: &str = "#bind";

/// How one key of a snapshot object is applied.
enum Entry<'a> {
    Value(&'a str, &'a Json),
    Binding(&'a str, &'a str),
    Helper(&'a str, &'a Map<String, Json>),
    Child(&'a str, &'a Map<String, Json>),
}

fn classify<'a>(key: &'a str, value: &'a Json) -> Entry<'a> {
    if let Some(name) = key.strip_prefix(HELPER_PREFIX) {
        match value {
            Json::String(path) => return Entry::Binding(name, path),
            Json::Object(fields) => return Entry::Helper(name, fields),
            _ => {}
        }
    }
    match value {
        Json::Object(fields) if key != SHARED && fields.contains_key(IS) => Entry::Child(key, fields),
        _ => Entry::Value(key, value),
    }
}

fn literal_helper(key: &str) -> FlowError {
    FlowError::InvalidData(format!("'{key}' must be a path or a helper object"))
}

fn data_object<'a>(block: BlockId, data: &'a Json) -> Result<&'a Map<String, Json>> {
    data.as_object()
        .ok_or_else(|| FlowError::InvalidData(format!("snapshot for {block:?} must be an object")))
}

/// Split `#bind` off a helper object.
fn helper_parts(fields: &Map<String, Json>) -> (Json, Option<&str>) {
    let bind = fields.get(BIND).and_then(Json::as_str);
    let mut rest = fields.clone();
    rest.remove(BIND);
    (Json::Object(rest), bind)
}

fn helper_key(name: &str) -> String {
    format!("{HELPER_PREFIX}{name}")
}

impl Runtime {
    /// Child block owned by the property `name`, if any.
    pub(crate) fn owned_child(&self, block: BlockId, name: &str) -> Option<BlockId> {
        self.peek(block, name).as_block().filter(|child| self.owns(block, name, *child))
    }

    fn is_worker_flow(&self, block: BlockId) -> bool {
        self.blocks
            .get(block)
            .and_then(|b| b.flow_state())
            .is_some_and(|state| state.function_type.is_some())
    }

    /// Serialize the persisted state of a block.
    pub fn save(&self, block: BlockId) -> Json {
        let mut out = Map::new();
        let Some(b) = self.blocks.get(block) else {
            return Json::Object(out);
        };
        let mut moved_bindings = Vec::new();
        for property in b.properties() {
            let name = property.name();
            let kind = property.kind();
            if !kind.is_persistent() || (kind == PropertyKind::Context && property.auto_context) {
                continue;
            }
            if let Some(path) = property.binding_path() {
                let default = Path::parse(path).is_ok_and(|parsed| parsed.is_helper_output_of(name));
                if default {
                    continue;
                }
                let key = helper_key(name);
                if self.owned_child(block, &key).is_some() {
                    moved_bindings.push((key, path.to_string()));
                } else {
                    out.insert(key, Json::String(path.to_string()));
                }
                continue;
            }
            let Some(saved) = property.saved_value() else {
                continue;
            };
            let json = match saved {
                Value::Block(child) if self.owns(block, name, *child) => {
                    if self.is_worker_flow(*child) {
                        continue;
                    }
                    let mut child_json = self.save(*child);
                    if let Json::Object(fields) = &mut child_json {
                        if !fields.contains_key(IS) {
                            fields.insert(IS.to_string(), Json::Null);
                        }
                    }
                    child_json
                }
                Value::Block(shared) if name == SHARED && self.is_shared_block(*shared) => self.save(*shared),
                other => match other.to_json() {
                    Some(json) => json,
                    None => continue,
                },
            };
            out.insert(name.to_string(), json);
        }
        for (key, path) in moved_bindings {
            if let Some(Json::Object(helper)) = out.get_mut(&key) {
                helper.insert(BIND.to_string(), Json::String(path));
            }
        }
        Json::Object(out)
    }

    /// Reset a block and rebuild it from a snapshot.
    ///
    /// Plain values go first, then helpers, bindings and children; `#is` is
    /// applied last so the function starts on a complete block.
    pub fn load(&mut self, block: BlockId, data: &Json) -> Result<()> {
        if !self.check_live(block) {
            return Err(FlowError::Destroyed(block));
        }
        let fields = data_object(block, data)?;
        self.reset_block(block);

        let entries: Vec<Entry<'_>> = fields
            .iter()
            .filter(|(key, _)| key.as_str() != IS)
            .map(|(key, value)| classify(key, value))
            .collect();
        for entry in &entries {
            if let Entry::Value(key, value) = entry {
                let value = Value::from_json(value);
                check_persisted(key, &value).map_err(|_| literal_helper(key))?;
                self.write(block, key, value, Write::Persist);
            }
        }
        for entry in &entries {
            if let Entry::Helper(name, fields) = entry {
                let (helper_data, bind) = helper_parts(fields);
                let helper = self.create_helper_block(block, name, None)?;
                self.load(helper, &helper_data)?;
                if let Some(bind) = bind {
                    self.set_binding(block, name, Some(bind))?;
                }
            }
        }
        for entry in &entries {
            if let Entry::Binding(name, path) = entry {
                self.set_binding(block, name, Some(path))?;
            }
        }
        for entry in &entries {
            if let Entry::Child(key, fields) = entry {
                let child = self.create_child(block, key, BlockKind::Plain, None)?;
                self.load(child, &Json::Object((*fields).clone()))?;
            }
        }
        self.apply_is(block, fields.get(IS));
        Ok(())
    }

    /// Clear every persisted property of a block.
    fn reset_block(&mut self, block: BlockId) {
        let names: Vec<Arc<str>> = self
            .blocks
            .get(block)
            .map(|b| {
                b.properties
                    .iter()
                    .filter(|(_, property)| property.kind().is_persistent())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        for name in names {
            self.clear_property(&PropRef::new(block, name));
        }
    }

    fn apply_is(&mut self, block: BlockId, is: Option<&Json>) {
        match is.and_then(Json::as_str).filter(|id| !id.is_empty()) {
            Some(id) => self.write(block, IS, Value::string(id), Write::Persist),
            None => {
                if self.prop_ref(&PropRef::new(block, IS)).is_some() {
                    self.clear_property(&PropRef::new(block, IS));
                }
            }
        }
    }

    /// Move a block to `data`, touching only what differs.
    ///
    /// Children with an unchanged `#is` are updated in place and keep their
    /// function instance; helpers are always updated in place; unchanged
    /// bindings stay subscribed.
    pub fn live_update(&mut self, block: BlockId, data: &Json) -> Result<()> {
        if !self.check_live(block) {
            return Err(FlowError::Destroyed(block));
        }
        let fields = data_object(block, data)?;
        let current = match self.save(block) {
            Json::Object(current) => current,
            _ => Map::new(),
        };

        for (key, old) in &current {
            if key == IS || fields.contains_key(key) {
                continue;
            }
            match classify(key, old) {
                Entry::Binding(name, _) => self.delete_value(block, name)?,
                Entry::Helper(name, _) => {
                    self.delete_value(block, key)?;
                    if !fields.contains_key(name) {
                        self.delete_value(block, name)?;
                    }
                }
                Entry::Value(name, _) | Entry::Child(name, _) => self.delete_value(block, name)?,
            }
        }

        let entries: Vec<Entry<'_>> = fields
            .iter()
            .filter(|(key, _)| key.as_str() != IS)
            .map(|(key, value)| classify(key, value))
            .collect();
        for entry in &entries {
            if let Entry::Value(key, value) = entry {
                if current.get(*key) != Some(*value) {
                    let value = Value::from_json(value);
                    check_persisted(key, &value).map_err(|_| literal_helper(key))?;
                    self.write(block, key, value, Write::Persist);
                }
            }
        }
        for entry in &entries {
            if let Entry::Helper(name, fields) = entry {
                let key = helper_key(name);
                let (helper_data, bind) = helper_parts(fields);
                match self.owned_child(block, &key) {
                    Some(helper) => self.live_update(helper, &helper_data)?,
                    None => {
                        let helper = self.create_helper_block(block, name, None)?;
                        self.load(helper, &helper_data)?;
                    }
                }
                let wanted = match bind {
                    Some(bind) => bind.to_string(),
                    None => format!("{key}.{OUTPUT}"),
                };
                if self.get_property(block, name).binding_path() != Some(wanted.as_str()) {
                    self.set_binding(block, name, Some(&wanted))?;
                }
            }
        }
        for entry in &entries {
            if let Entry::Binding(name, path) = entry {
                if self.get_property(block, name).binding_path() != Some(*path) {
                    self.set_binding(block, name, Some(path))?;
                }
            }
        }
        for entry in &entries {
            if let Entry::Child(key, child_fields) = entry {
                let child_data = Json::Object((*child_fields).clone());
                let same_function = current
                    .get(*key)
                    .and_then(Json::as_object)
                    .is_some_and(|old| old.get(IS) == child_fields.get(IS));
                match self.owned_child(block, key) {
                    Some(child) if same_function => self.live_update(child, &child_data)?,
                    existing => {
                        if existing.is_some() {
                            self.delete_value(block, key)?;
                        }
                        let child = self.create_child(block, key, BlockKind::Plain, None)?;
                        self.load(child, &child_data)?;
                    }
                }
            }
        }
        if current.get(IS) != fields.get(IS) {
            self.apply_is(block, fields.get(IS));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{counter, probe_desc, Probe};
    use crate::view::PropertyAccessor;
    use serde_json::json;

    fn setup() -> (Runtime, BlockId) {
        let mut rt = Runtime::default();
        let flow = rt.add_flow("main", &json!({})).unwrap();
        (rt, flow)
    }

    #[test]
    fn save_writes_literals_bindings_and_children() {
        let (mut rt, flow) = setup();
        rt.set_value(flow, "v1", 3).unwrap();
        rt.set_value(flow, "@x", 10).unwrap();
        let block = rt.create_block(flow, "b", Some("add")).unwrap();
        rt.set_binding(block, "0", Some("##.v1")).unwrap();
        rt.set_value(block, "1", 2).unwrap();
        rt.run();

        assert_eq!(
            rt.save(flow),
            json!({
                "v1": 3,
                "@x": 10,
                "b": {"#is": "add", "~0": "##.v1", "1": 2},
            })
        );
    }

    #[test]
    fn outputs_and_transient_values_are_skipped() {
        let (mut rt, flow) = setup();
        rt.update_value(flow, "t", 1).unwrap();
        rt.output(flow, 2, "#output");
        let block = rt.create_block(flow, "b", None).unwrap();
        rt.set_value(block, "x", Value::Block(flow)).unwrap();
        assert_eq!(rt.save(flow), json!({"b": {"#is": null}}));
    }

    #[test]
    fn load_round_trips() {
        let (mut rt, flow) = setup();
        let data = json!({
            "v1": 2,
            "list": [1, "two", null],
            "obj": {"a": {"b": true}},
            "^theme": "dark",
            "b": {
                "#is": "add",
                "~0": "##.v1",
                "~1": {"#is": "multiply", "0": 3, "1": 4},
                "c": {"#is": null, "deep": 1},
            },
        });
        rt.load(flow, &data).unwrap();
        rt.run();
        assert_eq!(rt.save(flow), data);
        assert_eq!(rt.get_value(flow, "b.#output"), Value::from(14));

        let saved = rt.save(flow);
        let copy = rt.add_flow("copy", &saved).unwrap();
        rt.run();
        assert_eq!(rt.save(copy), rt.save(flow));
    }

    #[test]
    fn load_resets_the_block() {
        let (mut rt, flow) = setup();
        let child = rt.create_block(flow, "old", None).unwrap();
        rt.set_value(flow, "stale", 1).unwrap();
        rt.load(flow, &json!({"fresh": 2})).unwrap();
        assert!(!rt.is_valid(child));
        assert!(rt.get_value(flow, "stale").is_undefined());
        assert_eq!(rt.save(flow), json!({"fresh": 2}));
    }

    #[test]
    fn load_rejects_non_objects() {
        let (mut rt, flow) = setup();
        assert!(matches!(rt.load(flow, &json!([1])), Err(FlowError::InvalidData(_))));
        assert!(matches!(
            rt.load(flow, &json!({"~x": "a..b"})),
            Err(FlowError::InvalidPath { .. })
        ));
    }

    #[test]
    fn helper_slots_reject_literals() {
        let (mut rt, flow) = setup();
        let block = rt.create_block(flow, "b", None).unwrap();
        assert!(matches!(
            rt.set_value(block, "~x", "just text"),
            Err(FlowError::InvalidTarget(_))
        ));
        assert!(rt.get_value(block, "~x").is_undefined());
        assert_eq!(rt.save(block), json!({"#is": null}));
        assert!(!rt.view(block).set("~x", Value::from(1)));
        assert!(matches!(rt.load(flow, &json!({"~x": 5})), Err(FlowError::InvalidData(_))));
    }

    #[test]
    fn helper_with_explicit_binding() {
        let (mut rt, flow) = setup();
        let data = json!({
            "v": 1,
            "b": {"#is": null, "~x": {"#is": null, "#bind": "##.v", "k": 1}},
        });
        rt.load(flow, &data).unwrap();
        assert_eq!(rt.get_value(flow, "b.x"), Value::from(1));
        assert_eq!(rt.get_value(flow, "b.~x.k"), Value::from(1));
        assert_eq!(rt.save(flow), data);
    }

    #[test]
    fn objects_without_is_are_values() {
        let (mut rt, flow) = setup();
        rt.load(flow, &json!({"o": {"a": 1}})).unwrap();
        assert!(rt.get_value(flow, "o").as_object().is_some());
        assert_eq!(rt.get_value(flow, "o.a"), Value::from(1));
    }

    #[test]
    fn live_update_keeps_unchanged_children() {
        let mut rt = Runtime::default();
        let runs = counter();
        let probe = runs.clone();
        rt.register_function(move || Box::new(Probe::new(probe.clone())), probe_desc("probe"), None);
        let flow = rt
            .add_flow("main", &json!({"a": 1, "b": {"#is": "probe", "x": 1}, "c": {"#is": "probe"}}))
            .unwrap();
        rt.run();
        let b = rt.get_value(flow, "b").as_block().unwrap();
        let c = rt.get_value(flow, "c").as_block().unwrap();
        let before = runs.get();

        rt.live_update(flow, &json!({"a": 2, "b": {"#is": "probe", "x": 1}, "c": {"#is": "add"}}))
            .unwrap();
        rt.run();
        assert_eq!(rt.get_value(flow, "b"), Value::Block(b));
        assert_eq!(runs.get(), before);
        assert!(!rt.is_valid(c));
        assert_eq!(rt.get_value(flow, "a"), Value::from(2));
        assert_eq!(rt.block(rt.get_value(flow, "c").as_block().unwrap()).unwrap().function_id(), Some("add"));
    }

    #[test]
    fn live_update_removes_missing_keys() {
        let (mut rt, flow) = setup();
        rt.load(flow, &json!({"a": 1, "~b": "##.a", "~h": {"#is": null}, "c": {"#is": null}}))
            .unwrap();
        let helper = rt.get_value(flow, "~h").as_block().unwrap();
        rt.live_update(flow, &json!({"a": 1})).unwrap();
        assert!(rt.get_value(flow, "b").is_undefined());
        assert!(rt.get_value(flow, "c").is_undefined());
        assert!(!rt.is_valid(helper));
        assert!(rt.get_property(flow, "h").binding_path().is_none());
        assert_eq!(rt.save(flow), json!({"a": 1}));
    }

    #[test]
    fn live_update_rebinds_changed_paths_only() {
        let (mut rt, flow) = setup();
        rt.load(flow, &json!({"a": 1, "z": 9, "b": {"#is": null, "~x": "##.a"}})).unwrap();
        let b = rt.get_value(flow, "b").as_block().unwrap();
        rt.live_update(flow, &json!({"a": 1, "z": 9, "b": {"#is": null, "~x": "##.z"}}))
            .unwrap();
        assert_eq!(rt.get_value(flow, "b"), Value::Block(b));
        assert_eq!(rt.get_value(b, "x"), Value::from(9));
    }
}
