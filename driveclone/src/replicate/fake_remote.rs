//! In-memory remote store for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use drive_core::{
    DriveError, DriveFile, FOLDER_MIME_TYPE, ListPage, RemoteStore, SHORTCUT_MIME_TYPE,
    ShortcutDetails, StatusCode,
};
use tokio::sync::watch;

struct Node {
    file: DriveFile,
    children: Vec<String>,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, Node>,
    missing: HashSet<String>,
    list_failures: HashMap<String, u32>,
    copy_limit: Option<u64>,
    copies_done: u64,
}

pub struct FakeRemote {
    tree: Mutex<Tree>,
    next_id: AtomicU64,
    list_calls: AtomicU64,
    metadata_calls: AtomicU64,
    create_calls: AtomicU64,
    copy_calls: AtomicU64,
    copy_gate: watch::Sender<bool>,
}

impl FakeRemote {
    pub fn new(root: &str) -> Self {
        let remote = Self {
            tree: Mutex::new(Tree::default()),
            next_id: AtomicU64::new(1),
            list_calls: AtomicU64::new(0),
            metadata_calls: AtomicU64::new(0),
            create_calls: AtomicU64::new(0),
            copy_calls: AtomicU64::new(0),
            copy_gate: watch::Sender::new(true),
        };
        remote.insert_orphan_folder(root);
        remote
    }

    pub fn add_folder(&self, parent: &str, id: &str) {
        self.insert(parent, folder(id, id));
    }

    pub fn add_file(&self, parent: &str, id: &str, size: u64) {
        self.insert(
            parent,
            DriveFile {
                id: id.into(),
                name: id.into(),
                mime_type: "application/octet-stream".into(),
                size: Some(size),
                shortcut_details: None,
            },
        );
    }

    pub fn add_shortcut(&self, parent: &str, id: &str, target: &str, target_is_folder: bool) {
        self.insert(
            parent,
            DriveFile {
                id: id.into(),
                name: id.into(),
                mime_type: SHORTCUT_MIME_TYPE.into(),
                size: None,
                shortcut_details: Some(ShortcutDetails {
                    target_id: target.into(),
                    target_mime_type: target_is_folder.then(|| FOLDER_MIME_TYPE.to_string()),
                }),
            },
        );
    }

    /// Keeps the entry visible in its parent's listing but answers 404 for it.
    pub fn remove(&self, id: &str) {
        self.tree.lock().unwrap().missing.insert(id.to_string());
    }

    pub fn fail_list_transient(&self, folder_id: &str, times: u32) {
        self.tree
            .lock()
            .unwrap()
            .list_failures
            .insert(folder_id.to_string(), times);
    }

    /// Copies after the first `limit` successful ones fail with a quota error.
    pub fn limit_copies(&self, limit: Option<u64>) {
        let mut tree = self.tree.lock().unwrap();
        tree.copy_limit = limit;
        tree.copies_done = 0;
    }

    /// Blocks copy calls until [`FakeRemote::open_copies`] is called.
    pub fn hold_copies(&self) {
        self.copy_gate.send_replace(false);
    }

    pub fn open_copies(&self) {
        self.copy_gate.send_replace(true);
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> u64 {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn copy_calls(&self) -> u64 {
        self.copy_calls.load(Ordering::SeqCst)
    }

    pub fn children_named(&self, parent: &str) -> Vec<(String, String)> {
        let tree = self.tree.lock().unwrap();
        tree.nodes
            .get(parent)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|id| tree.nodes.get(id))
                    .map(|child| (child.file.name.clone(), child.file.id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sorted relative paths below `root`; folders end with `/`.
    pub fn tree_paths(&self, root: &str) -> Vec<String> {
        let tree = self.tree.lock().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![(root.to_string(), String::new())];
        while let Some((id, prefix)) = stack.pop() {
            let Some(node) = tree.nodes.get(&id) else {
                continue;
            };
            for child_id in &node.children {
                let Some(child) = tree.nodes.get(child_id) else {
                    continue;
                };
                if child.file.is_folder() {
                    let path = format!("{prefix}{}/", child.file.name);
                    out.push(path.clone());
                    stack.push((child_id.clone(), path));
                } else {
                    out.push(format!("{prefix}{}", child.file.name));
                }
            }
        }
        out.sort();
        out
    }

    fn insert_orphan_folder(&self, id: &str) {
        let mut tree = self.tree.lock().unwrap();
        tree.nodes.entry(id.to_string()).or_insert_with(|| Node {
            file: folder(id, id),
            children: Vec::new(),
        });
    }

    fn insert(&self, parent: &str, file: DriveFile) {
        self.insert_orphan_folder(parent);
        let mut tree = self.tree.lock().unwrap();
        let id = file.id.clone();
        if let Some(parent) = tree.nodes.get_mut(parent) {
            parent.children.push(id.clone());
        }
        tree.nodes.insert(
            id,
            Node {
                file,
                children: Vec::new(),
            },
        );
    }

    fn fresh_id(&self) -> String {
        format!("t-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

fn folder(id: &str, name: &str) -> DriveFile {
    DriveFile {
        id: id.into(),
        name: name.into(),
        mime_type: FOLDER_MIME_TYPE.into(),
        size: None,
        shortcut_details: None,
    }
}

fn not_found(id: &str) -> DriveError {
    DriveError::api(StatusCode::NOT_FOUND, format!("File not found: {id}"))
}

impl RemoteStore for FakeRemote {
    async fn list(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, DriveError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let mut tree = self.tree.lock().unwrap();
        if let Some(remaining) = tree.list_failures.get_mut(folder_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriveError::api(StatusCode::SERVICE_UNAVAILABLE, "backend error"));
            }
        }
        if tree.missing.contains(folder_id) {
            return Err(not_found(folder_id));
        }
        let node = tree.nodes.get(folder_id).ok_or_else(|| not_found(folder_id))?;

        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + page_size.max(1) as usize).min(node.children.len());
        let files = node.children[start.min(end)..end]
            .iter()
            .filter_map(|id| tree.nodes.get(id))
            .map(|child| child.file.clone())
            .collect();
        Ok(ListPage {
            files,
            next_page_token: (end < node.children.len()).then(|| end.to_string()),
        })
    }

    async fn get_metadata(&self, id: &str) -> Result<DriveFile, DriveError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let tree = self.tree.lock().unwrap();
        if tree.missing.contains(id) {
            return Err(not_found(id));
        }
        tree.nodes
            .get(id)
            .map(|node| node.file.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile, DriveError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if !self.tree.lock().unwrap().nodes.contains_key(parent_id) {
            return Err(not_found(parent_id));
        }
        let created = folder(&self.fresh_id(), name);
        self.insert(parent_id, created.clone());
        Ok(created)
    }

    async fn copy_file(&self, file_id: &str, dest_parent_id: &str) -> Result<DriveFile, DriveError> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.copy_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        tokio::task::yield_now().await;

        let mut copy = {
            let mut tree = self.tree.lock().unwrap();
            if let Some(limit) = tree.copy_limit {
                if tree.copies_done >= limit {
                    return Err(DriveError::api(
                        StatusCode::FORBIDDEN,
                        r#"{"error":{"errors":[{"reason":"storageQuotaExceeded"}]}}"#,
                    ));
                }
            }
            if tree.missing.contains(file_id) {
                return Err(not_found(file_id));
            }
            if !tree.nodes.contains_key(dest_parent_id) {
                return Err(not_found(dest_parent_id));
            }
            let source = tree.nodes.get(file_id).ok_or_else(|| not_found(file_id))?;
            let copy = source.file.clone();
            tree.copies_done += 1;
            copy
        };
        copy.id = self.fresh_id();
        self.insert(dest_parent_id, copy.clone());
        Ok(copy)
    }
}
