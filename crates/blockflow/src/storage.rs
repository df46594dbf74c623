//! Flow persistence.
//!
//! Stores keep one JSON document per flow name. [`FileStorage`] writes
//! `<base>/<key>.json`; [`MemoryStorage`] is used by tests and embedders that
//! persist elsewhere.

use std::fs;
use std::io;
use std::path::PathBuf;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use crate::arena::BlockId;
use crate::error::{FlowError, Result};
use crate::runtime::Runtime;

pub trait Storage {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Dotted flow names map to flat file names
        self.base_path.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&mut self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.base_path)?;
        fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: FxHashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

impl Runtime {
    pub fn set_storage(&mut self, storage: impl Storage + 'static) {
        self.storage = Some(Box::new(storage));
    }

    /// Write a flow's snapshot to storage under its dotted name. The saved
    /// state becomes the flow's `@has-change` baseline.
    pub fn save_flow(&mut self, name: &str) -> Result<()> {
        let flow = self.flow(name).ok_or_else(|| FlowError::NotFound(name.to_string()))?;
        let text = serde_json::to_string_pretty(&self.save(flow))?;
        let storage = self.storage.as_mut().ok_or(FlowError::NoStorage)?;
        storage.save(name, &text)?;
        log::debug!("saved flow '{name}'");
        self.mark_history_saved(flow);
        Ok(())
    }

    /// Load a flow from storage, updating it in place when it exists.
    pub fn load_flow_from_storage(&mut self, name: &str) -> Result<BlockId> {
        let storage = self.storage.as_ref().ok_or(FlowError::NoStorage)?;
        let text = storage
            .load(name)?
            .ok_or_else(|| FlowError::NotFound(name.to_string()))?;
        let data: Json = serde_json::from_str(&text)?;
        log::debug!("loading flow '{name}' from storage");
        match self.flow(name) {
            Some(flow) => {
                self.live_update(flow, &data)?;
                self.mark_history_saved(flow);
                Ok(flow)
            }
            None => self.add_flow(name, &data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("flows"));

        assert_eq!(storage.load("main").unwrap(), None);
        storage.save("main", "{\"a\":1}").unwrap();
        assert_eq!(storage.load("main").unwrap().as_deref(), Some("{\"a\":1}"));

        storage.remove("main").unwrap();
        assert_eq!(storage.load("main").unwrap(), None);
        // removing twice is fine
        storage.remove("main").unwrap();
    }

    #[test]
    fn memory_storage_round_trip() {
        let mut storage = MemoryStorage::new();
        storage.save("a.b", "1").unwrap();
        assert_eq!(storage.load("a.b").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.len(), 1);
        storage.remove("a.b").unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn flows_round_trip_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = Runtime::default();
        rt.set_storage(FileStorage::new(dir.path()));
        let flow = rt
            .add_flow("main", &json!({"v": 2, "b": {"#is": "add", "~0": "##.v", "1": 3}}))
            .unwrap();
        rt.save_flow("main").unwrap();
        let saved = rt.save(flow);

        let mut fresh = Runtime::default();
        fresh.set_storage(FileStorage::new(dir.path()));
        let loaded = fresh.load_flow_from_storage("main").unwrap();
        fresh.run();
        assert_eq!(fresh.save(loaded), saved);
        assert_eq!(fresh.get_value(loaded, "b.#output"), Value::from(5));
    }

    #[test]
    fn loading_an_existing_flow_updates_it_in_place() {
        let mut rt = Runtime::default();
        let mut storage = MemoryStorage::new();
        storage.save("main", r#"{"v": 9}"#).unwrap();
        rt.set_storage(storage);
        let flow = rt.add_flow("main", &json!({"v": 1})).unwrap();
        assert_eq!(rt.load_flow_from_storage("main").unwrap(), flow);
        assert_eq!(rt.get_value(flow, "v"), Value::from(9));
    }

    #[test]
    fn storage_errors() {
        let mut rt = Runtime::default();
        rt.add_flow("main", &json!({})).unwrap();
        assert!(matches!(rt.save_flow("main"), Err(FlowError::NoStorage)));
        assert!(matches!(rt.load_flow_from_storage("main"), Err(FlowError::NoStorage)));

        let mut storage = MemoryStorage::new();
        storage.save("broken", "{").unwrap();
        rt.set_storage(storage);
        assert!(matches!(rt.save_flow("nope"), Err(FlowError::NotFound(_))));
        assert!(matches!(rt.load_flow_from_storage("nope"), Err(FlowError::NotFound(_))));
        assert!(matches!(rt.load_flow_from_storage("broken"), Err(FlowError::Json(_))));
    }

    #[test]
    fn saving_resets_the_change_flag() {
        let mut rt = Runtime::default();
        rt.set_storage(MemoryStorage::new());
        let flow = rt.add_flow("main", &json!({"v": 1})).unwrap();
        rt.enable_history(flow).unwrap();
        rt.set_value(flow, "v", 2).unwrap();
        rt.advance_time(1_000);
        assert_eq!(rt.get_value(flow, "@has-change"), Value::Bool(true));
        rt.save_flow("main").unwrap();
        assert_eq!(rt.get_value(flow, "@has-change"), Value::Bool(false));
        assert_eq!(rt.get_value(flow, "@has-undo"), Value::Bool(true));
    }
}
