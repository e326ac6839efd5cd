//! Folder hierarchy discovery and folder selection.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{FolderRecord, MailStore};

pub const DEFAULT_FOLDER_ROOT: &str = "inbox";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderNode {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub path: String,
    pub child_folder_count: u32,
    pub total_item_count: u64,
    pub unread_item_count: u64,
    pub is_hidden: bool,
}

impl FolderNode {
    fn from_record(record: FolderRecord, parent_id: Option<String>, path: String) -> Self {
        FolderNode {
            id: record.id,
            name: record.display_name,
            parent_id,
            child_ids: Vec::new(),
            path,
            child_folder_count: record.child_folder_count,
            total_item_count: record.total_item_count,
            unread_item_count: record.unread_item_count,
            is_hidden: record.is_hidden,
        }
    }
}

/// A fully materialised folder hierarchy. Nodes are stored in breadth-first
/// order, which is also the order of the flat index.
#[derive(Debug, Clone)]
pub struct FolderTree {
    nodes: Vec<FolderNode>,
    by_id: HashMap<String, usize>,
}

impl FolderTree {
    pub fn root(&self) -> &FolderNode {
        &self.nodes[0]
    }

    pub fn get(&self, id: &str) -> Option<&FolderNode> {
        self.by_id.get(id).map(|&i| &self.nodes[i])
    }

    pub fn children<'a>(&'a self, node: &'a FolderNode) -> impl Iterator<Item = &'a FolderNode> {
        node.child_ids.iter().filter_map(move |id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Flat listing, one entry per node. Sibling folders sharing a display
    /// name produce repeated paths; all of them are kept.
    pub fn index(&self) -> &[FolderNode] {
        &self.nodes
    }

    pub fn nested(&self) -> Value {
        self.nested_from(self.root())
    }

    fn nested_from(&self, node: &FolderNode) -> Value {
        let children: Vec<Value> = self
            .children(node)
            .map(|child| self.nested_from(child))
            .collect();
        json!({
            "id": node.id,
            "display_name": node.name,
            "parent_id": node.parent_id,
            "path": node.path,
            "child_folder_count": node.child_folder_count,
            "total_item_count": node.total_item_count,
            "unread_item_count": node.unread_item_count,
            "is_hidden": node.is_hidden,
            "children": children,
        })
    }

    /// Resolve a slash separated path against this tree, rooted at its root.
    pub fn resolve(&self, raw_path: &str) -> Result<&FolderNode> {
        let root = self.root();
        let mut current = root;
        let mut consumed = root.path.clone();
        for segment in path_segments(raw_path, &root.name) {
            let children: Vec<&FolderNode> = self.children(current).collect();
            let picked = pick_child(&children, &segment, &consumed, |n| n.name.as_str(), |n| n.id.as_str())?;
            current = picked;
            consumed = current.path.clone();
        }
        Ok(current)
    }
}

/// Walk the hierarchy below `root_token` breadth first.
///
/// Fails with `TraversalLimitExceeded` as soon as more than `max_nodes`
/// folders (root included) have been discovered.
pub fn build_tree<S: MailStore + ?Sized>(
    store: &S,
    root_token: &str,
    include_hidden: bool,
    max_nodes: usize,
) -> Result<FolderTree> {
    if max_nodes == 0 {
        return Err(Error::InvalidArgument(
            "--max-nodes must be greater than 0".to_string(),
        ));
    }

    let root = store.get_folder(root_token)?;
    let root_path = format!("/{}", root.display_name);
    let mut nodes = vec![FolderNode::from_record(root, None, root_path)];
    let mut by_id = HashMap::new();
    by_id.insert(nodes[0].id.clone(), 0);

    let mut queue = VecDeque::from(vec![0usize]);
    while let Some(parent) = queue.pop_front() {
        if nodes[parent].child_folder_count == 0 {
            continue;
        }

        let mut children = store.list_child_folders(&nodes[parent].id, include_hidden)?;
        children.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });

        for child in children {
            if nodes.len() >= max_nodes {
                return Err(Error::TraversalLimitExceeded { limit: max_nodes });
            }
            if by_id.contains_key(&child.id) {
                return Err(Error::malformed(
                    "folder",
                    format!("folder {} appears more than once in the hierarchy", child.id),
                ));
            }

            let path = format!("{}/{}", nodes[parent].path, child.display_name);
            let parent_id = nodes[parent].id.clone();
            let index = nodes.len();
            by_id.insert(child.id.clone(), index);
            nodes[parent].child_ids.push(child.id.clone());
            nodes.push(FolderNode::from_record(child, Some(parent_id), path));
            queue.push_back(index);
        }
    }

    debug!(root = root_token, count = nodes.len(), "folder tree built");
    Ok(FolderTree { nodes, by_id })
}

/// How the caller picked a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderSelector {
    /// A well-known name or id the store can look up directly.
    Token(String),
    /// An explicit handle, used verbatim.
    Id(String),
    /// A path below the inbox, e.g. `Projects/2024`.
    Path(String),
}

impl FolderSelector {
    /// `--folder-id` beats `--folder-path`, which beats `--folder`.
    pub fn from_args(
        folder: Option<&str>,
        folder_id: Option<&str>,
        folder_path: Option<&str>,
    ) -> Result<Self> {
        if let Some(id) = folder_id {
            let id = id.trim();
            if id.is_empty() {
                return Err(Error::InvalidArgument("--folder-id cannot be empty".to_string()));
            }
            return Ok(FolderSelector::Id(id.to_string()));
        }
        if let Some(path) = folder_path {
            return Ok(FolderSelector::Path(path.to_string()));
        }
        let token = folder
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_FOLDER_ROOT);
        Ok(FolderSelector::Token(token.to_string()))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            FolderSelector::Token(_) => "token",
            FolderSelector::Id(_) => "id",
            FolderSelector::Path(_) => "path",
        }
    }

    pub fn input(&self) -> &str {
        match self {
            FolderSelector::Token(s) | FolderSelector::Id(s) | FolderSelector::Path(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedFolder {
    pub folder_mode: &'static str,
    pub folder_input: String,
    pub resolved_folder_id: String,
    pub resolved_folder_path: Option<String>,
}

/// Turn a selector into a canonical folder id.
pub fn resolve<S: MailStore + ?Sized>(
    store: &S,
    selector: &FolderSelector,
    include_hidden: bool,
) -> Result<ResolvedFolder> {
    let (id, path) = match selector {
        FolderSelector::Id(id) => (id.clone(), None),
        FolderSelector::Token(token) => {
            let folder = store.get_folder(token)?;
            let path = format!("/{}", folder.display_name);
            (folder.id, Some(path))
        }
        FolderSelector::Path(raw) => {
            let (id, path) = resolve_path(store, raw, include_hidden)?;
            (id, Some(path))
        }
    };

    debug!(mode = selector.mode(), input = selector.input(), folder_id = %id, "folder resolved");
    Ok(ResolvedFolder {
        folder_mode: selector.mode(),
        folder_input: selector.input().to_string(),
        resolved_folder_id: id,
        resolved_folder_path: path,
    })
}

/// Resolve a path one level at a time against the live store, starting at
/// the inbox. Returns the folder id and its display path.
pub fn resolve_path<S: MailStore + ?Sized>(
    store: &S,
    raw_path: &str,
    include_hidden: bool,
) -> Result<(String, String)> {
    let root = store.get_folder(DEFAULT_FOLDER_ROOT)?;
    let mut current_id = root.id.clone();
    let mut consumed = format!("/{}", root.display_name);

    for segment in path_segments(raw_path, &root.display_name) {
        let children = store.list_child_folders(&current_id, include_hidden)?;
        let refs: Vec<&FolderRecord> = children.iter().collect();
        let picked = pick_child(&refs, &segment, &consumed, |f| f.display_name.as_str(), |f| f.id.as_str())?;
        current_id = picked.id.clone();
        consumed = format!("{}/{}", consumed, picked.display_name);
    }

    Ok((current_id, consumed))
}

/// Split a user supplied path. Empty segments are ignored and a leading
/// segment naming the root (or `inbox`) is dropped.
pub fn path_segments(raw_path: &str, root_name: &str) -> Vec<String> {
    let mut segments: Vec<String> = raw_path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if let Some(first) = segments.first() {
        let first = first.to_lowercase();
        if first == root_name.trim().to_lowercase() || first == DEFAULT_FOLDER_ROOT {
            segments.remove(0);
        }
    }
    segments
}

fn pick_child<'a, T>(
    children: &[&'a T],
    segment: &str,
    consumed: &str,
    name: impl Fn(&T) -> &str,
    id: impl Fn(&T) -> &str,
) -> Result<&'a T> {
    let wanted = segment.to_lowercase();
    let matches: Vec<&'a T> = children
        .iter()
        .copied()
        .filter(|c| name(c).trim().to_lowercase() == wanted)
        .collect();

    match matches.len() {
        1 => Ok(matches[0]),
        0 => {
            let mut available: Vec<String> = children
                .iter()
                .map(|c| name(c).trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
            available.sort();
            available.dedup();
            Err(Error::FolderNotFound {
                segment: segment.to_string(),
                consumed: consumed.to_string(),
                available,
            })
        }
        _ => Err(Error::AmbiguousFolderPath {
            segment: segment.to_string(),
            consumed: consumed.to_string(),
            candidates: matches.iter().map(|c| id(c).to_string()).collect(),
        }),
    }
}
