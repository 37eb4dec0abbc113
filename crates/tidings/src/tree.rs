//! Priority-ordered tree.
//!
//! Siblings are kept sorted by descending priority; among equal priorities
//! the most recently linked node comes first. Every node also carries
//! `previous`/`next` sibling links so a walk can advance without looking up
//! indices. Disabling a node hides its whole subtree from walks while keeping
//! it in place.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::ops::ControlFlow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Node<T> {
    content: Option<T>,
    label: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    previous: Option<NodeId>,
    next: Option<NodeId>,
    priority: i32,
    enabled: bool,
}

/// Read-only view of one node during a walk.
#[derive(Debug)]
pub struct NodeRef<'a, T> {
    id: NodeId,
    node: &'a Node<T>,
}

impl<T> Clone for NodeRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<'_, T> {}

impl<'a, T> NodeRef<'a, T> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn content(&self) -> Option<&'a T> {
        self.node.content.as_ref()
    }

    pub fn label(&self) -> Option<&'a str> {
        self.node.label.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.node.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.node.enabled
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.node.parent
    }

    pub fn children(&self) -> &'a [NodeId] {
        &self.node.children
    }
}

#[derive(Debug)]
pub struct Tree<T> {
    nodes: HashMap<NodeId, Node<T>>,
    root: NodeId,
    next_id: u64,
}

impl<T> Tree<T> {
    pub fn new(root: Option<T>, label: Option<String>) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            root: NodeId(0),
            next_id: 0,
        };
        tree.root = tree.create(root, label);
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Create a detached node with priority 0.
    pub fn create(&mut self, content: Option<T>, label: Option<String>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                content,
                label,
                parent: None,
                children: Vec::new(),
                previous: None,
                next: None,
                priority: 0,
                enabled: true,
            },
        );
        id
    }

    /// Create a node under `parent`. Returns `None` if `parent` is gone.
    pub fn insert(
        &mut self,
        parent: NodeId,
        content: T,
        label: Option<String>,
        priority: i32,
    ) -> Option<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return None;
        }
        let id = self.create(Some(content), label);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.priority = priority;
        }
        self.link(id, parent);
        Some(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<NodeRef<'_, T>> {
        self.nodes.get(&id).map(|node| NodeRef { id, node })
    }

    pub fn content(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(&id).and_then(|n| n.content.as_ref())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.next)
    }

    pub fn previous(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.previous)
    }

    pub fn priority(&self, id: NodeId) -> Option<i32> {
        self.nodes.get(&id).map(|n| n.priority)
    }

    pub fn is_enabled(&self, id: NodeId) -> Option<bool> {
        self.nodes.get(&id).map(|n| n.enabled)
    }

    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Whether a walk from the root would reach `id`: the node exists, is
    /// attached, and neither it nor any ancestor is disabled.
    pub fn is_active(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(&current) else {
                return false;
            };
            if !node.enabled {
                return false;
            }
            if current == self.root {
                return true;
            }
            cursor = node.parent;
        }
        false
    }

    /// Change the priority and re-sort the node among its siblings.
    pub fn set_priority(&mut self, id: NodeId, priority: i32) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        node.priority = priority;
        if let Some(parent) = node.parent {
            self.unlink(id);
            self.link(id, parent);
        }
        true
    }

    /// Move the node under `parent`, or detach it with `None`.
    ///
    /// Fails if either node is missing or `parent` lies inside the subtree
    /// of `id`.
    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) -> bool {
        if !self.nodes.contains_key(&id) {
            return false;
        }
        if let Some(parent) = parent {
            if !self.nodes.contains_key(&parent) || self.is_within(parent, id) {
                return false;
            }
        }
        self.unlink(id);
        if let Some(parent) = parent {
            self.link(id, parent);
        }
        true
    }

    /// Remove `id` and its descendants, children first. Destroying the root
    /// only clears its children. Returns the removed contents in removal
    /// order.
    pub fn destroy(&mut self, id: NodeId) -> Vec<(NodeId, T)> {
        let mut removed = Vec::new();
        if !self.nodes.contains_key(&id) {
            return removed;
        }
        while let Some(&child) = self.children(id).first() {
            removed.extend(self.destroy(child));
        }
        if id == self.root {
            return removed;
        }
        self.unlink(id);
        if let Some(node) = self.nodes.remove(&id) {
            if let Some(content) = node.content {
                removed.push((id, content));
            }
        }
        removed
    }

    /// Pre-order walk from `start`, skipping disabled subtrees below it.
    ///
    /// The callback folds an accumulator and may stop the walk early by
    /// returning `ControlFlow::Break`.
    pub fn reduce<U, F>(&self, start: NodeId, init: U, mut f: F) -> U
    where
        F: FnMut(NodeRef<'_, T>, U) -> ControlFlow<U, U>,
    {
        let Some(first) = self.node(start) else {
            return init;
        };
        let mut acc = match f(first, init) {
            ControlFlow::Continue(acc) => acc,
            ControlFlow::Break(acc) => return acc,
        };

        // Ancestors of the cursor strictly below `start`.
        let mut stack: Vec<NodeId> = Vec::new();
        let mut cursor = self.first_enabled(self.children(start).first().copied());
        while let Some(id) = cursor {
            let Some(node) = self.node(id) else {
                break;
            };
            acc = match f(node, acc) {
                ControlFlow::Continue(acc) => acc,
                ControlFlow::Break(acc) => return acc,
            };

            if let Some(child) = self.first_enabled(node.children().first().copied()) {
                stack.push(id);
                cursor = Some(child);
                continue;
            }

            cursor = self.first_enabled(self.next(id));
            while cursor.is_none() {
                match stack.pop() {
                    Some(parent) => cursor = self.first_enabled(self.next(parent)),
                    None => break,
                }
            }
        }
        acc
    }

    pub fn some<F>(&self, start: NodeId, mut predicate: F) -> bool
    where
        F: FnMut(NodeRef<'_, T>) -> bool,
    {
        self.reduce(start, false, |node, _| {
            if predicate(node) {
                ControlFlow::Break(true)
            } else {
                ControlFlow::Continue(false)
            }
        })
    }

    pub fn every<F>(&self, start: NodeId, mut predicate: F) -> bool
    where
        F: FnMut(NodeRef<'_, T>) -> bool,
    {
        self.reduce(start, true, |node, _| {
            if predicate(node) {
                ControlFlow::Continue(true)
            } else {
                ControlFlow::Break(false)
            }
        })
    }

    pub fn find<F>(&self, start: NodeId, mut predicate: F) -> Option<NodeId>
    where
        F: FnMut(NodeRef<'_, T>) -> bool,
    {
        self.reduce(start, None, |node, _| {
            if predicate(node) {
                ControlFlow::Break(Some(node.id()))
            } else {
                ControlFlow::Continue(None)
            }
        })
    }

    pub fn find_all<F>(&self, start: NodeId, mut predicate: F) -> Vec<NodeId>
    where
        F: FnMut(NodeRef<'_, T>) -> bool,
    {
        self.reduce(start, Vec::new(), |node, mut found| {
            if predicate(node) {
                found.push(node.id());
            }
            ControlFlow::Continue(found)
        })
    }

    pub fn for_each<F>(&self, start: NodeId, mut f: F)
    where
        F: FnMut(NodeRef<'_, T>) -> ControlFlow<()>,
    {
        self.reduce(start, (), |node, ()| match f(node) {
            ControlFlow::Continue(()) => ControlFlow::Continue(()),
            ControlFlow::Break(()) => ControlFlow::Break(()),
        });
    }

    /// Indented outline of the subtree under `start`.
    pub fn render(&self, start: NodeId) -> String {
        let mut out = String::new();
        self.render_into(start, 0, &mut out);
        out
    }

    fn render_into(&self, id: NodeId, indent: usize, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let marker = if node.children.is_empty() { "  " } else { "- " };
        let _ = writeln!(
            out,
            "{:indent$}{marker}{} enabled: {}, priority: {}, children: {}",
            "",
            node.label.as_deref().unwrap_or("<anonymous>"),
            node.enabled,
            node.priority,
            node.children.len(),
        );
        for &child in &node.children {
            self.render_into(child, indent + 2, out);
        }
    }

    fn first_enabled(&self, mut cursor: Option<NodeId>) -> Option<NodeId> {
        while let Some(id) = cursor {
            let node = self.nodes.get(&id)?;
            if node.enabled {
                return Some(id);
            }
            cursor = node.next;
        }
        None
    }

    /// Whether `id` is `ancestor` or one of its descendants.
    fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    fn unlink(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let parent = node.parent.take();
        let previous = node.previous.take();
        let next = node.next.take();

        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|&child| child != id);
        }
        if let Some(prev) = previous.and_then(|p| self.nodes.get_mut(&p)) {
            prev.next = next;
        }
        if let Some(after) = next.and_then(|n| self.nodes.get_mut(&n)) {
            after.previous = previous;
        }
    }

    fn link(&mut self, id: NodeId, parent: NodeId) {
        let Some(priority) = self.priority(id) else {
            return;
        };
        let Some(siblings) = self.nodes.get(&parent).map(|p| &p.children) else {
            return;
        };
        let index = siblings
            .iter()
            .position(|s| self.nodes.get(s).is_some_and(|s| priority >= s.priority))
            .unwrap_or(siblings.len());
        let previous = index.checked_sub(1).map(|i| siblings[i]);
        let next = siblings.get(index).copied();

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(index, id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
            node.previous = previous;
            node.next = next;
        }
        if let Some(prev) = previous.and_then(|p| self.nodes.get_mut(&p)) {
            prev.next = Some(id);
        }
        if let Some(after) = next.and_then(|n| self.nodes.get_mut(&n)) {
            after.previous = Some(id);
        }
    }
}
