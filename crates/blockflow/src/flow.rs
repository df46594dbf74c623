//! Flow namespace on the root block.
//!
//! Flows live as owned children of the root block, optionally grouped into
//! folders addressed with dotted names (`folder.sub.flow`).

use serde_json::Value as Json;

use crate::arena::BlockId;
use crate::block::BlockKind;
use crate::error::{FlowError, Result};
use crate::property::{PropertyKind, GLOBAL};
use crate::runtime::Runtime;

impl Runtime {
    /// Walk the folders of a dotted name. Returns the containing folder and
    /// the last segment.
    fn namespace_slot<'n>(&self, name: &'n str) -> Result<(BlockId, &'n str)> {
        let mut segments: Vec<&str> = name.split('.').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(FlowError::InvalidData(format!("invalid flow name '{name}'")));
        }
        let Some(leaf) = segments.pop() else {
            return Err(FlowError::InvalidData(format!("invalid flow name '{name}'")));
        };
        if PropertyKind::of(leaf) != PropertyKind::Input {
            return Err(FlowError::InvalidData(format!("invalid flow name '{name}'")));
        }
        let mut folder = self.root;
        let mut walked = String::new();
        for segment in segments {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);
            let Some(child) = self.owned_child(folder, segment) else {
                return Err(FlowError::NotFound(walked));
            };
            if !self.blocks.get(child).is_some_and(|b| b.is_folder()) {
                return Err(FlowError::NotAFolder(walked));
            }
            folder = child;
        }
        Ok((folder, leaf))
    }

    fn add_namespace_entry(&mut self, name: &str, kind: BlockKind) -> Result<BlockId> {
        let (folder, leaf) = self.namespace_slot(name)?;
        if !self.peek(folder, leaf).is_undefined() {
            return Err(FlowError::DuplicateName(name.to_string()));
        }
        self.create_child(folder, leaf, kind, None)
    }

    /// Create a flow and load `data` into it.
    pub fn add_flow(&mut self, name: &str, data: &Json) -> Result<BlockId> {
        if !data.is_object() {
            return Err(FlowError::InvalidData(format!("flow '{name}' must be an object")));
        }
        let flow = self.add_namespace_entry(name, BlockKind::Flow(Box::default()))?;
        if let Err(error) = self.load(flow, data) {
            self.destroy_block(flow);
            return Err(error);
        }
        log::debug!("added flow '{name}' as {flow:?}");
        Ok(flow)
    }

    pub fn add_flow_folder(&mut self, name: &str) -> Result<BlockId> {
        let folder = self.add_namespace_entry(name, BlockKind::Folder)?;
        log::debug!("added folder '{name}'");
        Ok(folder)
    }

    fn namespace_entry(&self, name: &str) -> Result<BlockId> {
        let (folder, leaf) = self.namespace_slot(name)?;
        self.owned_child(folder, leaf)
            .ok_or_else(|| FlowError::NotFound(name.to_string()))
    }

    /// Destroy a flow, or a folder with everything in it.
    pub fn delete_flow(&mut self, name: &str) -> Result<()> {
        let block = self.namespace_entry(name)?;
        log::debug!("deleting '{name}'");
        self.destroy_block(block);
        Ok(())
    }

    pub fn flow(&self, name: &str) -> Option<BlockId> {
        self.namespace_entry(name)
            .ok()
            .filter(|id| self.blocks.get(*id).is_some_and(|b| b.is_flow()))
    }

    /// Dotted names of every flow, folders expanded.
    pub fn flow_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_flow_names(self.root, "", &mut names);
        names
    }

    fn collect_flow_names(&self, folder: BlockId, prefix: &str, names: &mut Vec<String>) {
        let Some(block) = self.blocks.get(folder) else {
            return;
        };
        for property in block.properties() {
            let name = property.name();
            if name == GLOBAL {
                continue;
            }
            let Some(child) = self.owned_child(folder, name) else {
                continue;
            };
            let full = if prefix.is_empty() { name.to_string() } else { format!("{prefix}.{name}") };
            match self.blocks.get(child) {
                Some(b) if b.is_folder() => self.collect_flow_names(child, &full, names),
                Some(b) if b.is_flow() => names.push(full),
                _ => {}
            }
        }
    }

    /// Whether `block` is `ancestor` or sits somewhere below it.
    fn is_within(&self, block: BlockId, ancestor: BlockId) -> bool {
        let mut current = Some(block);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.blocks.get(id).and_then(|b| b.parent.as_ref()).map(|p| p.block);
        }
        false
    }

    /// Paste a copy of `source` under `target_parent.name`. The copy is a
    /// flow when pasted into the namespace (root or a folder) and a plain
    /// block anywhere else, matching what `load` rebuilds from a snapshot.
    pub fn copy_block(&mut self, source: BlockId, target_parent: BlockId, name: &str) -> Result<BlockId> {
        for id in [source, target_parent] {
            if !self.check_live(id) {
                return Err(FlowError::Destroyed(id));
            }
        }
        if !matches!(
            self.blocks.get(source).map(|b| b.kind()),
            Some(BlockKind::Flow(_) | BlockKind::Plain)
        ) {
            return Err(FlowError::InvalidTarget(format!("{source:?} cannot be copied")));
        }
        let into_namespace =
            target_parent == self.root || self.blocks.get(target_parent).is_some_and(|b| b.is_folder());
        let kind = if into_namespace { BlockKind::Flow(Box::default()) } else { BlockKind::Plain };
        if self.is_within(target_parent, source) {
            return Err(FlowError::InvalidTarget(format!("cannot paste {source:?} inside itself")));
        }
        if !self.peek(target_parent, name).is_undefined() {
            return Err(FlowError::DuplicateName(name.to_string()));
        }
        let data = self.save(source);
        let copy = self.create_child(target_parent, name, kind, None)?;
        if let Err(error) = self.load(copy, &data) {
            self.destroy_block(copy);
            return Err(error);
        }
        Ok(copy)
    }
}
