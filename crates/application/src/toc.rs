//! Normalized table of contents: a tree built from the adapter's flat
//! outline, plus the expansion and active-entry state the reader view shows.

use std::collections::{HashMap, HashSet};

use folio_core::{HrefMatch, OutlineEntry};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocNode {
    /// `{parent id}-{native id or label}`; unique within one document.
    pub id: String,
    pub label: String,
    /// Unique within one document. Leaves always carry one; a branch has
    /// none when its entry had no target or a leaf already claimed it.
    pub href: Option<String>,
    /// Depth in the tree, 0 for top-level entries.
    pub level: usize,
    pub children: Vec<TocNode>,
}

impl TocNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Result of activating a row: branches toggle, leaves navigate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TocAction {
    Toggled { id: String, expanded: bool },
    Navigate { href: String },
}

/// Flattened row for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocRow {
    pub id: String,
    pub label: String,
    pub level: usize,
    pub is_leaf: bool,
    pub expanded: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TocModel {
    nodes: Vec<TocNode>,
    expanded: HashSet<String>,
    active: Option<String>,
    policy: HrefMatch,
}

struct RawNode<'a> {
    entry: &'a OutlineEntry,
    children: Vec<RawNode<'a>>,
}

fn attach<'a>(stack: &mut Vec<(usize, RawNode<'a>)>, roots: &mut Vec<RawNode<'a>>) {
    if let Some((_, node)) = stack.pop() {
        match stack.last_mut() {
            Some((_, parent)) => parent.children.push(node),
            None => roots.push(node),
        }
    }
}

fn finish(
    raw: RawNode<'_>,
    parent_id: Option<&str>,
    depth: usize,
    sibling_keys: &mut HashMap<String, usize>,
) -> Option<TocNode> {
    let label = raw.entry.label.split_whitespace().collect::<Vec<_>>().join(" ");
    let label = if label.is_empty() {
        "Untitled".to_string()
    } else {
        label
    };

    let key = raw
        .entry
        .native_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(&label)
        .to_string();
    let seen = sibling_keys.entry(key.clone()).or_insert(0);
    *seen += 1;
    let key = if *seen == 1 {
        key
    } else {
        format!("{key}~{seen}")
    };
    let id = match parent_id {
        Some(parent) => format!("{parent}-{key}"),
        None => key,
    };

    let mut child_keys = HashMap::new();
    let children = raw
        .children
        .into_iter()
        .filter_map(|child| finish(child, Some(&id), depth + 1, &mut child_keys))
        .collect::<Vec<_>>();

    let href = raw
        .entry
        .href
        .as_deref()
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(str::to_string);
    if href.is_none() && children.is_empty() {
        return None;
    }

    Some(TocNode {
        id,
        label,
        href,
        level: depth,
        children,
    })
}

/// Leaves claim their hrefs first, in document order; a later leaf repeating
/// a claimed href is dropped.
fn claim_leaf_hrefs(nodes: Vec<TocNode>, claimed: &mut HashSet<String>) -> Vec<TocNode> {
    nodes
        .into_iter()
        .filter_map(|mut node| {
            if !node.is_leaf() {
                node.children = claim_leaf_hrefs(std::mem::take(&mut node.children), claimed);
                if !node.is_leaf() {
                    return Some(node);
                }
            }
            let href = node.href.as_ref()?;
            if claimed.insert(href.clone()) {
                Some(node)
            } else {
                debug!(id = %node.id, href = %href, "dropping toc entry with a repeated href");
                None
            }
        })
        .collect()
}

/// Branches keep their href only when no leaf or earlier branch claimed it.
fn claim_branch_hrefs(nodes: &mut [TocNode], claimed: &mut HashSet<String>) {
    for node in nodes {
        if node.is_leaf() {
            continue;
        }
        if let Some(href) = &node.href
            && !claimed.insert(href.clone())
        {
            node.href = None;
        }
        claim_branch_hrefs(&mut node.children, claimed);
    }
}

/// Resource part of an href, before any `#fragment`.
fn resource(href: &str) -> &str {
    href.split_once('#').map_or(href, |(path, _)| path)
}

impl TocModel {
    /// Nests entries by their `level`: an entry becomes a child of the
    /// nearest preceding entry with a smaller level. Leaves without an href
    /// are dropped, and every href is kept by at most one node.
    pub fn build(entries: &[OutlineEntry], policy: HrefMatch) -> Self {
        let mut roots = Vec::new();
        let mut stack: Vec<(usize, RawNode<'_>)> = Vec::new();
        for entry in entries {
            while stack.last().is_some_and(|(level, _)| *level >= entry.level) {
                attach(&mut stack, &mut roots);
            }
            stack.push((
                entry.level,
                RawNode {
                    entry,
                    children: Vec::new(),
                },
            ));
        }
        while !stack.is_empty() {
            attach(&mut stack, &mut roots);
        }

        let mut keys = HashMap::new();
        let nodes = roots
            .into_iter()
            .filter_map(|raw| finish(raw, None, 0, &mut keys))
            .collect();
        let mut claimed = HashSet::new();
        let mut nodes = claim_leaf_hrefs(nodes, &mut claimed);
        claim_branch_hrefs(&mut nodes, &mut claimed);

        Self {
            nodes,
            expanded: HashSet::new(),
            active: None,
            policy,
        }
    }

    pub fn nodes(&self) -> &[TocNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn policy(&self) -> HrefMatch {
        self.policy
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_expanded(&self, id: &str) -> bool {
        self.expanded.contains(id)
    }

    pub fn find(&self, id: &str) -> Option<&TocNode> {
        fn walk<'a>(nodes: &'a [TocNode], id: &str) -> Option<&'a TocNode> {
            nodes.iter().find_map(|node| {
                if node.id == id {
                    Some(node)
                } else {
                    walk(&node.children, id)
                }
            })
        }
        walk(&self.nodes, id)
    }

    pub fn find_by_href(&self, href: &str) -> Option<&TocNode> {
        let path = self.exact_path(href)?;
        path.last().and_then(|id| self.find(id))
    }

    /// Ids from the root to the node whose href equals `href`.
    fn exact_path(&self, href: &str) -> Option<Vec<String>> {
        fn walk(nodes: &[TocNode], href: &str, path: &mut Vec<String>) -> bool {
            for node in nodes {
                path.push(node.id.clone());
                if node.href.as_deref() == Some(href) || walk(&node.children, href, path) {
                    return true;
                }
                path.pop();
            }
            false
        }
        let mut path = Vec::new();
        walk(&self.nodes, href, &mut path).then_some(path)
    }

    /// Ids from the root to the first node (preorder) addressing the same
    /// resource as `href`.
    fn containing_path(&self, href: &str) -> Option<Vec<String>> {
        fn walk(nodes: &[TocNode], target: &str, path: &mut Vec<String>) -> bool {
            for node in nodes {
                path.push(node.id.clone());
                let here = node.href.as_deref().map(resource) == Some(target);
                if here || walk(&node.children, target, path) {
                    return true;
                }
                path.pop();
            }
            false
        }
        let mut path = Vec::new();
        walk(&self.nodes, resource(href), &mut path).then_some(path)
    }

    /// Recomputes the active entry for the reader's current position. On a
    /// match the expanded set becomes exactly the match's ancestor chain; on
    /// no match the active entry is cleared and expansion is left alone.
    pub fn sync_to(&mut self, href: Option<&str>) -> Option<&TocNode> {
        let path = href.and_then(|href| {
            self.exact_path(href).or_else(|| match self.policy {
                HrefMatch::Containment => self.containing_path(href),
                HrefMatch::Exact => None,
            })
        });

        let Some(mut path) = path else {
            self.active = None;
            return None;
        };
        let active = path.pop();
        self.expanded = path.into_iter().collect();
        self.active = active;
        self.active.as_deref().and_then(|id| self.find(id))
    }

    /// Flips a branch's expansion. Returns the new state, or `None` for
    /// leaves and unknown ids.
    pub fn toggle(&mut self, id: &str) -> Option<bool> {
        let node = self.find(id)?;
        if node.is_leaf() {
            return None;
        }
        if self.expanded.remove(id) {
            Some(false)
        } else {
            self.expanded.insert(id.to_string());
            Some(true)
        }
    }

    pub fn activate(&mut self, id: &str) -> Option<TocAction> {
        let node = self.find(id)?;
        if node.is_leaf() {
            return node.href.clone().map(|href| TocAction::Navigate { href });
        }
        let expanded = self.toggle(id)?;
        Some(TocAction::Toggled {
            id: id.to_string(),
            expanded,
        })
    }

    /// Rows whose ancestors are all expanded, in document order.
    pub fn visible_rows(&self) -> Vec<TocRow> {
        fn walk(model: &TocModel, nodes: &[TocNode], out: &mut Vec<TocRow>) {
            for node in nodes {
                let expanded = model.expanded.contains(&node.id);
                out.push(TocRow {
                    id: node.id.clone(),
                    label: node.label.clone(),
                    level: node.level,
                    is_leaf: node.is_leaf(),
                    expanded,
                    active: model.active.as_deref() == Some(node.id.as_str()),
                });
                if expanded {
                    walk(model, &node.children, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &self.nodes, &mut out);
        out
    }
}
