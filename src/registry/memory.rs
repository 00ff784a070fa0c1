//! In-process naming backend.
//!
//! A shared node tree guarded by a mutex; sessions are guard objects whose
//! drop removes the ephemeral nodes they own. Good for tests and
//! single-process deployments, and the reference for what a networked
//! backend must provide.

use super::{NamingError, NamingService, NamingSession};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Node {
    data: String,
    /// Some(session id) marks an ephemeral node.
    owner: Option<u64>,
    /// Sequence counter handed to ephemeral-sequential children.
    next_seq: u64,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, Node>,
    next_session_id: u64,
}

fn parent_of(path: &str) -> Result<&str, NamingError> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(NamingError::Backend(format!("malformed path {:?}", path)));
    }
    match path.rfind('/') {
        Some(0) => Ok("/"),
        Some(i) => Ok(&path[..i]),
        None => Err(NamingError::Backend(format!("malformed path {:?}", path))),
    }
}

#[derive(Clone, Default)]
pub struct MemoryNamingService {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryNamingService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NamingService for MemoryNamingService {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, NamingError> {
        let mut tree = self.tree.lock().expect("lock");
        tree.next_session_id += 1;
        let id = tree.next_session_id;
        drop(tree);
        Ok(MemorySession { id, tree: self.tree.clone() })
    }
}

pub struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut tree = self.tree.lock().expect("lock");
        tree.nodes.retain(|_, node| node.owner != Some(self.id));
    }
}

impl NamingSession for MemorySession {
    async fn exists(&self, path: &str) -> Result<bool, NamingError> {
        let tree = self.tree.lock().expect("lock");
        Ok(path == "/" || tree.nodes.contains_key(path))
    }

    async fn create_persistent(&self, path: &str) -> Result<(), NamingError> {
        let parent = parent_of(path)?;
        let mut tree = self.tree.lock().expect("lock");
        if tree.nodes.contains_key(path) {
            return Err(NamingError::NodeExists(path.to_string()));
        }
        if parent != "/" && !tree.nodes.contains_key(parent) {
            return Err(NamingError::NoNode(parent.to_string()));
        }
        tree.nodes
            .insert(path.to_string(), Node { data: String::new(), owner: None, next_seq: 0 });
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self, path_prefix: &str, data: &str,
    ) -> Result<String, NamingError> {
        let parent = parent_of(path_prefix)?.to_string();
        let mut tree = self.tree.lock().expect("lock");
        let Some(parent_node) = tree.nodes.get_mut(&parent) else {
            return Err(NamingError::NoNode(parent));
        };
        let seq = parent_node.next_seq;
        parent_node.next_seq += 1;
        let path = format!("{}{:010}", path_prefix, seq);
        tree.nodes.insert(
            path.clone(),
            Node { data: data.to_string(), owner: Some(self.id), next_seq: 0 },
        );
        Ok(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, NamingError> {
        let tree = self.tree.lock().expect("lock");
        if path != "/" && !tree.nodes.contains_key(path) {
            return Err(NamingError::NoNode(path.to_string()));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let mut out: Vec<String> = tree
            .nodes
            .keys()
            .filter_map(|k| match k.strip_prefix(&prefix) {
                Some(rest) if !rest.is_empty() && !rest.contains('/') => Some(rest.to_string()),
                _ => None,
            })
            .collect();
        out.sort();
        Ok(out)
    }

    async fn read_data(&self, path: &str) -> Result<String, NamingError> {
        let tree = self.tree.lock().expect("lock");
        match tree.nodes.get(path) {
            Some(node) => Ok(node.data.clone()),
            None => Err(NamingError::NoNode(path.to_string())),
        }
    }
}
