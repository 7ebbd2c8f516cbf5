//! Node table backing the in-memory provider
//!
//! Entries are keyed by id (`id:<n>`) and linked to their parent by id.
//! Paths here are logical; the provider adds its prefix when it builds
//! handles.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use overcast_core::ports::EntryKind;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub parent: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Store {
    nodes: HashMap<String, Node>,
    root: String,
    next_id: u64,
}

/// Splits a logical path into its parent path and last segment
pub(crate) fn split_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed
        .rsplit_once('/')
        .ok_or_else(|| anyhow!("not an absolute path: {path}"))?;
    if name.is_empty() {
        bail!("path has no name: {path}");
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Ok((parent.to_string(), name.to_string()))
}

impl Store {
    pub fn new() -> Self {
        let root = Node {
            id: "id:0".to_string(),
            name: String::new(),
            kind: EntryKind::Folder,
            size: 0,
            modified: Utc::now(),
            parent: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(root.id.clone(), root);
        Self {
            nodes,
            root: "id:0".to_string(),
            next_id: 1,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn allocate_id(&mut self) -> String {
        let id = format!("id:{}", self.next_id);
        self.next_id += 1;
        id
    }

    pub fn path_of(&self, id: &str) -> Option<String> {
        let node = self.nodes.get(id)?;
        match &node.parent {
            None => Some("/".to_string()),
            Some(parent) => {
                let parent_path = self.path_of(parent)?;
                Some(if parent_path == "/" {
                    format!("/{}", node.name)
                } else {
                    format!("{}/{}", parent_path, node.name)
                })
            }
        }
    }

    /// Children of `id`, ordered by name
    pub fn children_of(&self, id: &str) -> Vec<&Node> {
        let mut children: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.parent.as_deref() == Some(id))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        children
    }

    pub fn child_named(&self, parent: &str, name: &str, kind: EntryKind) -> Option<&Node> {
        self.children_of(parent)
            .into_iter()
            .find(|n| n.name == name && n.kind == kind)
    }

    /// Id of the node at logical `path`
    pub fn resolve(&self, path: &str) -> Option<String> {
        let mut current = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self
                .children_of(&current)
                .into_iter()
                .find(|n| n.name == segment)?
                .id
                .clone();
        }
        Some(current)
    }

    pub fn insert(&mut self, parent: &str, name: &str, kind: EntryKind, size: u64) -> Result<String> {
        match self.nodes.get(parent) {
            Some(node) if node.kind == EntryKind::Folder => {}
            Some(_) => bail!("{parent} is not a folder"),
            None => bail!("no such folder: {parent}"),
        }
        if self.child_named(parent, name, kind).is_some() {
            bail!("{name} already exists");
        }

        let id = self.allocate_id();
        self.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                name: name.to_string(),
                kind,
                size,
                modified: Utc::now(),
                parent: Some(parent.to_string()),
            },
        );
        Ok(id)
    }

    /// Removes `id` and everything below it; returns the number of nodes removed
    pub fn remove(&mut self, id: &str) -> usize {
        let children: Vec<String> = self.children_of(id).iter().map(|n| n.id.clone()).collect();
        let mut removed = 0;
        for child in children {
            removed += self.remove(&child);
        }
        if self.nodes.remove(id).is_some() {
            removed += 1;
        }
        removed
    }

    /// Deep-copies `id` under `parent` as `name`; returns the id of the copy
    pub fn copy(&mut self, id: &str, parent: &str, name: &str) -> Result<String> {
        let node = self
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no such entry: {id}"))?;
        if self.is_within(parent, id) {
            bail!("cannot copy {id} into itself");
        }
        let copy = self.insert(parent, name, node.kind, node.size)?;

        let children: Vec<Node> = self.children_of(id).into_iter().cloned().collect();
        for child in children {
            self.copy(&child.id, &copy, &child.name)?;
        }
        Ok(copy)
    }

    /// Re-parents and renames `id`
    pub fn relocate(&mut self, id: &str, parent: &str, name: &str) -> Result<()> {
        let kind = self
            .nodes
            .get(id)
            .map(|n| n.kind)
            .ok_or_else(|| anyhow!("no such entry: {id}"))?;
        if let Some(existing) = self.child_named(parent, name, kind) {
            if existing.id != id {
                bail!("{name} already exists");
            }
        }
        if self.is_within(parent, id) {
            bail!("cannot move {id} into itself");
        }

        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such entry: {id}"))?;
        node.parent = Some(parent.to_string());
        node.name = name.to_string();
        node.modified = Utc::now();
        Ok(())
    }

    /// True if `id` is `ancestor` or lies below it
    fn is_within(&self, id: &str, ancestor: &str) -> bool {
        let mut current = Some(id.to_string());
        while let Some(node_id) = current {
            if node_id == ancestor {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|n| n.parent.clone());
        }
        false
    }

    /// Bytes held by all files
    pub fn used(&self) -> u64 {
        self.nodes
            .values()
            .filter(|n| n.kind == EntryKind::File)
            .map(|n| n.size)
            .sum()
    }
}
