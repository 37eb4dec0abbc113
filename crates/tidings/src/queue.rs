//! The dispatch engine.
//!
//! A [`MessageQueue`] owns the listener tree. `send` walks the tree in
//! pre-order, delivering a message to every enabled listener whose filter
//! matches, and threads the message through their transforms:
//!
//! ```text
//! root
//!  ├─ A (p=10) ──► B (p=3, child of A)
//!  ├─ C (p=5, newest)
//!  └─ D (p=5)
//!
//! message ─► A ─► B ─► C ─► D ─► result
//! ```
//!
//! The set of listeners is captured when `send` is called. Listeners
//! registered while delivery is under way do not take part; listeners that
//! are destroyed or disabled before their turn are skipped.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::listener::{Listener, Reply};
use crate::message::{Message, ShareMode};
use crate::share::{ShareLink, ShareTransport};
use crate::tree::{NodeId, Tree};

const ROOT_LABEL: &str = "MESSAGE_ROOT";

struct State {
    tree: Tree<Listener>,
    /// Listener id to tree position.
    nodes: HashMap<String, NodeId>,
}

struct Inner {
    state: Mutex<State>,
    debug: AtomicBool,
    share: Mutex<Option<Arc<ShareLink>>>,
}

/// Result of [`MessageQueue::send`].
pub enum Sent {
    Immediate(Message),
    Deferred(BoxFuture<'static, Message>),
}

impl Sent {
    /// Wait for the final message regardless of the delivery kind.
    pub async fn resolve(self) -> Message {
        match self {
            Sent::Immediate(message) => message,
            Sent::Deferred(future) => future.await,
        }
    }

    pub fn into_immediate(self) -> Option<Message> {
        match self {
            Sent::Immediate(message) => Some(message),
            Sent::Deferred(_) => None,
        }
    }
}

impl std::fmt::Debug for Sent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sent::Immediate(message) => f.debug_tuple("Immediate").field(message).finish(),
            Sent::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// In-process publish/subscribe engine. Clones share the same tree.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tree: Tree::new(None, Some(ROOT_LABEL.to_string())),
                    nodes: HashMap::new(),
                }),
                debug: AtomicBool::new(false),
                share: Mutex::new(None),
            }),
        }
    }

    pub fn with_config(config: &QueueConfig) -> Self {
        let queue = Self::new();
        queue.set_debug(config.debug);
        queue
    }

    /// Log every sent message at debug level.
    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    /// Register a listener at the root with its own priority.
    pub fn register(&self, listener: Listener) -> Result<ListenerHandle> {
        self.receive(listener, None, None)
    }

    /// Register a listener as a child of an already registered one.
    pub fn register_under(
        &self,
        listener: Listener,
        parent: &ListenerHandle,
    ) -> Result<ListenerHandle> {
        let mut state = self.inner.state.lock();
        if let Some(existing) = self.existing(&state, &listener) {
            return existing;
        }
        if !self.owns(parent) || !state.tree.contains(parent.node) {
            return Err(Error::ParentNotFound {
                listener: listener.id().to_string(),
                parent: parent.listener_id.clone(),
            });
        }
        self.attach(&mut state, listener, parent.node, None)
    }

    /// Register `listener` under `parent` (the root when `None`).
    ///
    /// Registering an already registered listener returns its existing
    /// node unchanged. A different listener reusing a registered id is
    /// rejected. `priority` overrides the listener's own.
    pub fn receive(
        &self,
        listener: Listener,
        parent: Option<&Listener>,
        priority: Option<i32>,
    ) -> Result<ListenerHandle> {
        let mut state = self.inner.state.lock();
        if let Some(existing) = self.existing(&state, &listener) {
            return existing;
        }
        let parent_node = match parent {
            None => state.tree.root(),
            Some(parent) => {
                state
                    .nodes
                    .get(parent.id())
                    .copied()
                    .ok_or_else(|| Error::ParentNotFound {
                        listener: listener.id().to_string(),
                        parent: parent.id().to_string(),
                    })?
            }
        };
        self.attach(&mut state, listener, parent_node, priority)
    }

    fn attach(
        &self,
        state: &mut State,
        listener: Listener,
        parent: NodeId,
        priority: Option<i32>,
    ) -> Result<ListenerHandle> {
        let id = listener.id().to_string();
        let priority = priority.unwrap_or(listener.priority());
        let enabled = listener.is_enabled();
        let node = state
            .tree
            .insert(parent, listener, Some(id.clone()), priority)
            .ok_or_else(|| Error::ParentNotFound {
                listener: id.clone(),
                parent: parent.to_string(),
            })?;
        state.tree.set_enabled(node, enabled);
        state.nodes.insert(id.clone(), node);
        tracing::debug!(listener = %id, node = %node, parent = %parent, priority, "listener registered");
        Ok(self.handle(node, &id))
    }

    /// Node already holding `listener`'s id, if any.
    fn existing(&self, state: &State, listener: &Listener) -> Option<Result<ListenerHandle>> {
        let &node = state.nodes.get(listener.id())?;
        let same = state
            .tree
            .content(node)
            .is_some_and(|registered| registered.is_same(listener));
        if same {
            Some(Ok(self.handle(node, listener.id())))
        } else {
            Some(Err(Error::DuplicateListener {
                listener: listener.id().to_string(),
            }))
        }
    }

    /// Whether `handle` was issued by this queue.
    fn owns(&self, handle: &ListenerHandle) -> bool {
        std::ptr::eq(handle.queue.as_ptr(), Arc::as_ptr(&self.inner))
    }

    fn handle(&self, node: NodeId, listener_id: &str) -> ListenerHandle {
        ListenerHandle {
            queue: Arc::downgrade(&self.inner),
            node,
            listener_id: listener_id.to_string(),
        }
    }

    /// Deliver `message` according to its kind.
    pub fn send(&self, message: Message) -> Result<Sent> {
        if message.is_synchronous() {
            self.send_sync(message).map(Sent::Immediate)
        } else {
            Ok(Sent::Deferred(self.send_async(message).boxed()))
        }
    }

    /// Deliver a synchronous message and return the transformed result.
    ///
    /// Fails if the message is asynchronous, if a listener answers with a
    /// deferred reply, or if a listener transform fails. Fire-once
    /// listeners that ran are destroyed after the walk, also on failure.
    pub fn send_sync(&self, message: Message) -> Result<Message> {
        if !message.is_synchronous() {
            return Err(Error::NotSynchronous {
                message: message.id().to_string(),
            });
        }
        self.inner.announce(&message);
        let plan = self.inner.plan(&message);
        let share = message.share();
        let from_peer = message.is_from_peer();

        let mut spent = Vec::new();
        let mut current = message;
        let mut outcome = Ok(());
        for (node, listener) in plan {
            if !self.inner.is_active(node) {
                continue;
            }
            match listener.parse(current.clone()) {
                Reply::Immediate(Ok(next)) => {
                    if listener.is_once() {
                        spent.push(node);
                    }
                    if let Some(next) = next {
                        current = next;
                    }
                }
                Reply::Immediate(Err(source)) => {
                    outcome = Err(Error::ListenerFailed {
                        listener: listener.id().to_string(),
                        source,
                    });
                    break;
                }
                Reply::Deferred(_) => {
                    outcome = Err(Error::DeferredInSync {
                        origin: format!("listener {}", listener.id()),
                    });
                    break;
                }
            }
        }

        for node in spent {
            self.inner.destroy(node);
        }
        outcome?;
        if share == ShareMode::Deferred && !from_peer {
            self.inner.share(&current);
        }
        Ok(current)
    }

    /// Deliver a message through a sequential chain of listeners.
    ///
    /// Each listener waits for the previous one to settle. A listener that
    /// fails or panics is logged and skipped, and the message it received
    /// moves on unchanged. The listener set is captured before this
    /// returns.
    pub fn send_async(&self, message: Message) -> impl Future<Output = Message> + Send + 'static {
        self.inner.announce(&message);
        let plan = self.inner.plan(&message);
        let inner = self.inner.clone();

        async move {
            let share = message.share();
            let from_peer = message.is_from_peer();
            let mut current = message;
            for (node, listener) in plan {
                if !inner.is_active(node) {
                    continue;
                }
                match deliver(&listener, current.clone()).await {
                    Ok(Some(next)) => current = next,
                    Ok(None) => {}
                    Err(error) => {
                        tracing::error!(
                            listener = %listener.id(),
                            node = %node,
                            error = %format!("{error:#}"),
                            "cannot run listener"
                        );
                    }
                }
                if listener.is_once() {
                    inner.destroy(node);
                }
            }
            if share == ShareMode::Deferred && !from_peer {
                inner.share(&current);
            }
            current
        }
    }

    /// Destroy every registered listener.
    pub fn destroy_all(&self) {
        let mut state = self.inner.state.lock();
        let root = state.tree.root();
        let removed = state.tree.destroy(root);
        for (_, listener) in &removed {
            state.nodes.remove(listener.id());
        }
        tracing::debug!(count = removed.len(), "all listeners destroyed");
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().nodes.len()
    }

    /// Node of an already registered listener.
    pub fn lookup(&self, listener: &Listener) -> Option<ListenerHandle> {
        let state = self.inner.state.lock();
        state
            .nodes
            .get(listener.id())
            .map(|&node| self.handle(node, listener.id()))
    }

    /// Whether any registered listener satisfies `predicate`.
    ///
    /// Queries walk the tree in delivery order, skip disabled subtrees and
    /// stop at the first decisive answer. The tree stays locked while the
    /// callback runs, so it must not call back into the queue.
    pub fn some<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Listener) -> bool,
    {
        let state = self.inner.state.lock();
        state
            .tree
            .some(state.tree.root(), |node| node.content().is_some_and(&mut predicate))
    }

    pub fn every<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Listener) -> bool,
    {
        let state = self.inner.state.lock();
        state
            .tree
            .every(state.tree.root(), |node| node.content().map_or(true, &mut predicate))
    }

    pub fn find<F>(&self, mut predicate: F) -> Option<ListenerHandle>
    where
        F: FnMut(&Listener) -> bool,
    {
        let state = self.inner.state.lock();
        let node = state
            .tree
            .find(state.tree.root(), |node| node.content().is_some_and(&mut predicate))?;
        let listener = state.tree.content(node)?;
        Some(self.handle(node, listener.id()))
    }

    pub fn find_all<F>(&self, mut predicate: F) -> Vec<ListenerHandle>
    where
        F: FnMut(&Listener) -> bool,
    {
        let state = self.inner.state.lock();
        state
            .tree
            .find_all(state.tree.root(), |node| node.content().is_some_and(&mut predicate))
            .into_iter()
            .filter_map(|node| {
                let listener = state.tree.content(node)?;
                Some(self.handle(node, listener.id()))
            })
            .collect()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Listener) -> ControlFlow<()>,
    {
        let state = self.inner.state.lock();
        state
            .tree
            .for_each(state.tree.root(), |node| match node.content() {
                Some(listener) => f(listener),
                None => ControlFlow::Continue(()),
            });
    }

    /// Render the listener tree and log it.
    pub fn print_structure(&self) -> String {
        let outline = {
            let state = self.inner.state.lock();
            state.tree.render(state.tree.root())
        };
        tracing::info!("listener structure:\n{outline}");
        outline
    }

    /// Echo messages to, and receive messages from, sibling instances.
    ///
    /// Replaces any previous attachment. Needs a running tokio runtime for
    /// the receiving task.
    pub fn attach_share(&self, transport: Arc<dyn ShareTransport>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let link = Arc::new(ShareLink::new(transport));
        let mut incoming = link.transport().subscribe();
        let queue = Arc::downgrade(&self.inner);

        let pump = runtime.spawn(async move {
            while let Some(metadata) = incoming.next().await {
                let Some(inner) = queue.upgrade() else {
                    break;
                };
                let local = MessageQueue { inner };
                if local.inner.is_echo(&metadata.id) {
                    continue;
                }
                let message = Message::from_metadata(metadata);
                match local.send(message) {
                    Ok(sent) => {
                        sent.resolve().await;
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "shared message rejected");
                    }
                }
            }
        });
        link.set_pump(pump);

        if let Some(previous) = self.inner.share.lock().replace(link) {
            previous.stop();
        }
        Ok(())
    }

    pub fn detach_share(&self) {
        if let Some(link) = self.inner.share.lock().take() {
            link.stop();
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.inner.share.lock().is_some()
    }
}

impl Inner {
    /// Enabled listeners matching `message`, in delivery order.
    fn plan(&self, message: &Message) -> Vec<(NodeId, Listener)> {
        let state = self.state.lock();
        state
            .tree
            .reduce(state.tree.root(), Vec::new(), |node, mut plan| {
                if let Some(listener) = node.content() {
                    if listener.can_parse(message.mask(), message.tag()) {
                        plan.push((node.id(), listener.clone()));
                    }
                }
                ControlFlow::Continue(plan)
            })
    }

    fn is_active(&self, node: NodeId) -> bool {
        self.state.lock().tree.is_active(node)
    }

    fn destroy(&self, node: NodeId) {
        let mut state = self.state.lock();
        for (removed, listener) in state.tree.destroy(node) {
            state.nodes.remove(listener.id());
            tracing::trace!(listener = %listener.id(), node = %removed, "listener destroyed");
        }
    }

    /// Debug logging and immediate sharing, done before any delivery.
    fn announce(&self, message: &Message) {
        if self.debug.load(Ordering::Relaxed) {
            tracing::debug!(
                message = %message.id(),
                mask = message.mask(),
                tag = message.tag().unwrap_or_default(),
                kind = if message.is_synchronous() { "SYNC" } else { "ASYNC" },
                origin = if message.is_from_peer() { "PEER" } else { "LOCAL" },
                value = %message.value(),
                "send"
            );
        }
        if message.share() == ShareMode::Immediate && !message.is_from_peer() {
            self.share(message);
        }
    }

    fn share(&self, message: &Message) {
        let link = self.share.lock().clone();
        if let Some(link) = link {
            link.post(&message.metadata());
        }
    }

    fn is_echo(&self, id: &str) -> bool {
        let link = self.share.lock().clone();
        link.is_some_and(|link| link.take_echo(id))
    }
}

/// Run one listener to completion, turning panics into errors.
async fn deliver(listener: &Listener, message: Message) -> anyhow::Result<Option<Message>> {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.parse(message))) {
        Ok(Reply::Immediate(result)) => result,
        Ok(Reply::Deferred(future)) => AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload))),
        Err(payload) => Err(panic_error(payload)),
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("listener panicked: {reason}")
}

/// A listener's position in a [`MessageQueue`].
///
/// Handles do not keep the queue alive. Once the node is destroyed, or the
/// queue dropped, every operation is a no-op.
#[derive(Clone)]
pub struct ListenerHandle {
    queue: Weak<Inner>,
    node: NodeId,
    listener_id: String,
}

impl ListenerHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        let inner = self.queue.upgrade()?;
        let mut state = inner.state.lock();
        if !state.tree.contains(self.node) {
            return None;
        }
        Some(f(&mut state))
    }

    pub fn is_alive(&self) -> bool {
        self.with_state(|_| ()).is_some()
    }

    pub fn listener(&self) -> Option<Listener> {
        self.with_state(|state| state.tree.content(self.node).cloned())
            .flatten()
    }

    pub fn enable(&self) {
        self.set_enabled(true);
    }

    pub fn disable(&self) {
        self.set_enabled(false);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.with_state(|state| state.tree.set_enabled(self.node, enabled));
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|state| state.tree.is_enabled(self.node))
            .flatten()
            .unwrap_or(false)
    }

    pub fn priority(&self) -> Option<i32> {
        self.with_state(|state| state.tree.priority(self.node)).flatten()
    }

    /// Change the priority and re-sort among siblings.
    pub fn set_priority(&self, priority: i32) {
        self.with_state(|state| state.tree.set_priority(self.node, priority));
    }

    /// Move under another listener, or back to the root with `None`.
    pub fn set_parent(&self, parent: Option<&ListenerHandle>) -> Result<()> {
        let missing = |parent: &str| Error::ParentNotFound {
            listener: self.listener_id.clone(),
            parent: parent.to_string(),
        };
        if parent.is_some_and(|p| !p.queue.ptr_eq(&self.queue)) {
            return Err(missing(parent.map_or(ROOT_LABEL, |p| p.listener_id.as_str())));
        }
        let moved = self.with_state(|state| {
            let target = parent.map_or(state.tree.root(), |p| p.node);
            state.tree.set_parent(self.node, Some(target))
        });
        match moved {
            Some(true) => Ok(()),
            _ => Err(missing(
                parent.map_or(ROOT_LABEL, |p| p.listener_id.as_str()),
            )),
        }
    }

    pub fn children(&self) -> Vec<ListenerHandle> {
        self.with_state(|state| {
            state
                .tree
                .children(self.node)
                .iter()
                .filter_map(|&child| {
                    state.tree.content(child).map(|listener| ListenerHandle {
                        queue: self.queue.clone(),
                        node: child,
                        listener_id: listener.id().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Destroy this listener and everything registered under it.
    pub fn destroy(&self) {
        if let Some(inner) = self.queue.upgrade() {
            inner.destroy(self.node);
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("node", &self.node)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::BroadcastShare;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn increment() -> impl Fn(Message) -> Message + Send + Sync + 'static {
        |m: Message| {
            let next = m.value().as_i64().unwrap_or_default() + 1;
            m.with_value(next)
        }
    }

    /// A listener that appends `name` to a shared log and passes through.
    fn tracer(mask: u64, name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Listener {
        let log = log.clone();
        Listener::on(mask).inspect(move |_| log.lock().push(name))
    }

    #[test]
    fn sync_send_runs_pipeline_in_priority_order() {
        let queue = MessageQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let record = |name: &'static str| {
            let seen = seen.clone();
            move |m: Message| {
                seen.lock().push((name, m.value().clone()));
                let next = m.value().as_i64().unwrap_or_default() + 1;
                m.with_value(next)
            }
        };
        queue
            .register(Listener::on(1).listen("X").with_priority(10).map(record("high")))
            .unwrap();
        queue
            .register(Listener::on(1).listen("X").with_priority(5).map(record("older")))
            .unwrap();
        queue
            .register(Listener::on(1).listen("X").with_priority(5).map(record("newer")))
            .unwrap();

        let result = queue
            .send_sync(Message::sync().mark(1, "X").with_value(0))
            .unwrap();

        assert_eq!(result.value(), &json!(3));
        assert_eq!(
            *seen.lock(),
            vec![("high", json!(0)), ("newer", json!(1)), ("older", json!(2))]
        );
    }

    #[test]
    fn children_run_before_next_sibling() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = queue.register(tracer(1, "parent", &log).with_priority(10)).unwrap();
        queue.register(tracer(1, "sibling", &log).with_priority(5)).unwrap();
        queue
            .register_under(tracer(1, "child", &log).with_priority(-100), &parent)
            .unwrap();

        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["parent", "child", "sibling"]);
    }

    #[test]
    fn filter_excludes_non_matching_listeners() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.register(tracer(1, "mask1", &log)).unwrap();
        queue.register(tracer(2, "mask2", &log)).unwrap();
        queue.register(tracer(3, "tagged", &log).listen("A")).unwrap();

        queue.send_sync(Message::sync().mark(1, "B")).unwrap();
        assert_eq!(*log.lock(), vec!["mask1"]);

        log.lock().clear();
        queue.send_sync(Message::sync().mark(2, "A")).unwrap();
        assert_eq!(*log.lock(), vec!["tagged", "mask2"]);
    }

    #[test]
    fn registering_twice_is_idempotent() {
        let queue = MessageQueue::new();
        let listener = Listener::on(1);
        let first = queue.register(listener.clone()).unwrap();
        let second = queue.receive(listener, None, Some(99)).unwrap();
        assert_eq!(first.node(), second.node());
        assert_eq!(second.priority(), Some(0));
        assert_eq!(queue.listener_count(), 1);
    }

    #[test]
    fn unknown_parent_is_a_configuration_error() {
        let queue = MessageQueue::new();
        let orphan_parent = Listener::on(1);
        let error = queue
            .receive(Listener::on(1), Some(&orphan_parent), None)
            .unwrap_err();
        assert!(matches!(error, Error::ParentNotFound { .. }));
        assert!(error.is_configuration());
    }

    #[test]
    fn disabling_hides_subtree_until_reenabled() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = queue.register(tracer(1, "group", &log)).unwrap();
        queue.register_under(tracer(1, "member", &log), &group).unwrap();
        queue.register(tracer(1, "other", &log)).unwrap();

        group.disable();
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["other"]);
        assert!(!queue.some(|l| l.id() == group.listener_id()));

        group.enable();
        log.lock().clear();
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["other", "group", "member"]);
    }

    #[test]
    fn destroying_removes_descendants() {
        let queue = MessageQueue::new();
        let group = queue.register(Listener::on(1)).unwrap();
        let member = queue.register_under(Listener::on(1), &group).unwrap();
        queue.register(Listener::on(1)).unwrap();

        group.destroy();
        assert!(!group.is_alive());
        assert!(!member.is_alive());
        assert_eq!(queue.listener_count(), 1);
    }

    #[test]
    fn fire_once_listener_is_gone_after_first_send() {
        let queue = MessageQueue::new();
        queue.register(Listener::once(1).map(increment())).unwrap();
        queue.register(Listener::on(1).map(increment())).unwrap();

        let mut visited = 0;
        queue.for_each(|_| {
            visited += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(visited, 2);

        let first = queue.send_sync(Message::sync().with_mask(1).with_value(0)).unwrap();
        assert_eq!(first.value(), &json!(2));

        let mut visited = 0;
        queue.for_each(|_| {
            visited += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(visited, 1);

        let second = queue.send_sync(Message::sync().with_mask(1).with_value(0)).unwrap();
        assert_eq!(second.value(), &json!(1));
    }

    #[test]
    fn deferred_reply_in_sync_send_fails_loudly() {
        let queue = MessageQueue::new();
        queue
            .register(Listener::on(1).map_async(|m| async move { Ok(m) }))
            .unwrap();
        let error = queue.send_sync(Message::sync().with_mask(1)).unwrap_err();
        assert!(matches!(error, Error::DeferredInSync { .. }));
        assert!(error.is_contract_violation());
    }

    #[test]
    fn sync_send_rejects_async_message() {
        let queue = MessageQueue::new();
        let error = queue.send_sync(Message::deferred()).unwrap_err();
        assert!(matches!(error, Error::NotSynchronous { .. }));
    }

    #[test]
    fn failing_listener_surfaces_in_sync_send() {
        let queue = MessageQueue::new();
        queue
            .register(Listener::on(1).try_map(|_| anyhow::bail!("broken")))
            .unwrap();
        let error = queue.send_sync(Message::sync().with_mask(1)).unwrap_err();
        assert!(matches!(error, Error::ListenerFailed { .. }));
    }

    #[test]
    fn listener_registered_during_walk_waits_for_next_send() {
        let queue = MessageQueue::new();
        let late_calls = Arc::new(AtomicUsize::new(0));
        let registrar = {
            let queue = queue.clone();
            let late_calls = late_calls.clone();
            Listener::once(1).with_priority(10).inspect(move |_| {
                let late_calls = late_calls.clone();
                queue
                    .register(Listener::on(1).inspect(move |_| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
            })
        };
        queue.register(registrar).unwrap();

        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_disabled_before_its_turn_is_skipped() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim = queue.register(tracer(1, "victim", &log)).unwrap();
        let killer = {
            let log = log.clone();
            Listener::on(1).with_priority(10).inspect(move |_| {
                log.lock().push("killer");
                victim.disable();
            })
        };
        queue.register(killer).unwrap();

        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["killer"]);
    }

    #[test]
    fn listener_destroyed_before_its_turn_is_skipped() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim = queue.register(tracer(1, "victim", &log)).unwrap();
        let killer = {
            let log = log.clone();
            Listener::on(1).with_priority(10).inspect(move |_| {
                log.lock().push("killer");
                victim.destroy();
            })
        };
        queue.register(killer).unwrap();
        assert_eq!(queue.listener_count(), 2);

        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["killer"]);
        assert_eq!(queue.listener_count(), 1);
    }

    #[test]
    fn handles_from_another_queue_are_not_parents() {
        let left = MessageQueue::new();
        let right = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let local = left.register(tracer(1, "left", &log).with_id("left")).unwrap();
        let foreign = right.register(Listener::on(1).with_id("right")).unwrap();
        assert_eq!(local.node(), foreign.node());

        let error = left
            .register_under(tracer(1, "orphan", &log), &foreign)
            .unwrap_err();
        assert!(matches!(error, Error::ParentNotFound { .. }));
        assert_eq!(left.listener_count(), 1);

        let child = left.register(tracer(1, "child", &log)).unwrap();
        let error = child.set_parent(Some(&foreign)).unwrap_err();
        assert!(matches!(error, Error::ParentNotFound { .. }));

        local.disable();
        left.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["child"]);
    }

    #[test]
    fn reusing_an_id_for_another_listener_fails() {
        let queue = MessageQueue::new();
        let first = Listener::on(1).with_id("shared").map(increment());
        queue.register(first.clone()).unwrap();

        let error = queue
            .register(Listener::on(1).with_id("shared").map(increment()))
            .unwrap_err();
        assert!(matches!(error, Error::DuplicateListener { .. }));
        assert!(error.is_configuration());
        assert!(queue.register(first.with_priority(4)).is_ok());
        assert_eq!(queue.listener_count(), 1);
    }

    #[test]
    fn queries_stop_at_first_decisive_listener() {
        let queue = MessageQueue::new();
        for priority in 0..5 {
            queue.register(Listener::on(1).with_priority(priority)).unwrap();
        }
        let visited = AtomicUsize::new(0);
        let count = |_: &Listener| {
            visited.fetch_add(1, Ordering::SeqCst);
        };

        assert!(queue.some(|l| {
            count(l);
            l.priority() == 4
        }));
        assert_eq!(visited.swap(0, Ordering::SeqCst), 1);

        assert!(!queue.every(|l| {
            count(l);
            l.priority() > 3
        }));
        assert_eq!(visited.swap(0, Ordering::SeqCst), 2);

        assert!(queue
            .find(|l| {
                count(l);
                l.priority() == 2
            })
            .is_some());
        assert_eq!(visited.swap(0, Ordering::SeqCst), 3);

        queue.for_each(|l| {
            count(l);
            ControlFlow::Break(())
        });
        assert_eq!(visited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queries_walk_registered_listeners() {
        let queue = MessageQueue::new();
        let a = queue.register(Listener::on(1).with_id("a").with_priority(3)).unwrap();
        queue.register(Listener::on(2).with_id("b").with_priority(2)).unwrap();
        queue.register_under(Listener::on(4).with_id("c"), &a).unwrap();

        assert!(queue.every(|l| l.mask() > 0));
        assert!(queue.some(|l| l.mask() == 4));
        assert_eq!(queue.find(|l| l.mask() == 2).unwrap().listener_id(), "b");
        let ids: Vec<String> = queue
            .find_all(|_| true)
            .iter()
            .map(|h| h.listener_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(a.children().len(), 1);
    }

    #[test]
    fn reprioritising_reorders_delivery() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.register(tracer(1, "first", &log).with_priority(2)).unwrap();
        let second = queue.register(tracer(1, "second", &log).with_priority(1)).unwrap();

        second.set_priority(3);
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[test]
    fn reparenting_moves_listener_and_rejects_cycles() {
        let queue = MessageQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = queue.register(tracer(1, "a", &log).with_priority(1)).unwrap();
        let b = queue.register(tracer(1, "b", &log).with_priority(2)).unwrap();

        a.set_parent(Some(&b)).unwrap();
        assert!(b.set_parent(Some(&a)).is_err());
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["b", "a"]);

        b.disable();
        log.lock().clear();
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert!(log.lock().is_empty());

        a.set_parent(None).unwrap();
        queue.send_sync(Message::sync().with_mask(1)).unwrap();
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn destroy_all_empties_tree() {
        let queue = MessageQueue::new();
        let group = queue.register(Listener::on(1)).unwrap();
        queue.register_under(Listener::on(1), &group).unwrap();
        queue.destroy_all();
        assert_eq!(queue.listener_count(), 0);
        assert!(!group.is_alive());
        assert!(queue.print_structure().starts_with("  MESSAGE_ROOT"));
    }

    #[test]
    fn disabled_listener_registers_disabled() {
        let queue = MessageQueue::new();
        let handle = queue.register(Listener::on(1).map(increment()).disabled()).unwrap();
        assert!(!handle.is_enabled());
        let result = queue.send_sync(Message::sync().with_mask(1).with_value(0)).unwrap();
        assert_eq!(result.value(), &json!(0));
    }

    #[tokio::test]
    async fn async_send_chains_sequentially() {
        let queue = MessageQueue::new();
        queue
            .register(Listener::on(1).with_priority(2).map_async(|m| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(m.with_value("slow"))
            }))
            .unwrap();
        queue
            .register(Listener::on(1).with_priority(1).map(|m| {
                let seen = m.value().as_str().unwrap_or_default().to_string();
                m.with_value(format!("{seen}+fast"))
            }))
            .unwrap();

        let result = queue.send_async(Message::deferred().with_mask(1)).await;
        assert_eq!(result.value(), &json!("slow+fast"));
    }

    #[tokio::test]
    async fn async_failure_forwards_previous_value() {
        let queue = MessageQueue::new();
        let after = Arc::new(AtomicUsize::new(0));
        queue.register(Listener::on(1).with_priority(3).map(increment())).unwrap();
        queue
            .register(
                Listener::on(1)
                    .with_priority(2)
                    .try_map(|_| anyhow::bail!("listener exploded")),
            )
            .unwrap();
        queue
            .register(Listener::on(1).with_priority(1).map_async(|_| async move {
                Err::<Message, _>(anyhow::anyhow!("deferred rejection"))
            }))
            .unwrap();
        let counter = after.clone();
        queue
            .register(Listener::on(1).with_priority(0).inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let result = queue
            .send_async(Message::deferred().with_mask(1).with_value(0))
            .await;
        assert_eq!(result.value(), &json!(1));
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_panic_is_contained() {
        let queue = MessageQueue::new();
        queue
            .register(Listener::on(1).with_priority(1).map(|_| panic!("boom")))
            .unwrap();
        queue.register(Listener::on(1).map(increment())).unwrap();

        let result = queue
            .send_async(Message::deferred().with_mask(1).with_value(5))
            .await;
        assert_eq!(result.value(), &json!(6));
    }

    #[tokio::test]
    async fn async_fire_once_destroyed_even_on_failure() {
        let queue = MessageQueue::new();
        let handle = queue
            .register(Listener::once(1).try_map(|_| anyhow::bail!("nope")))
            .unwrap();
        queue.send_async(Message::deferred().with_mask(1)).await;
        assert!(!handle.is_alive());
        assert_eq!(queue.listener_count(), 0);
    }

    #[tokio::test]
    async fn send_dispatches_on_message_kind() {
        let queue = MessageQueue::new();
        queue.register(Listener::on(1).map(increment())).unwrap();

        let sync = queue.send(Message::sync().with_mask(1).with_value(1)).unwrap();
        assert!(matches!(sync, Sent::Immediate(_)));
        assert_eq!(sync.resolve().await.value(), &json!(2));

        let deferred = queue.send(Message::deferred().with_mask(1).with_value(1)).unwrap();
        assert!(deferred.into_immediate().is_none());
    }

    #[tokio::test]
    async fn shared_messages_reach_peers_once() {
        let transport: Arc<dyn ShareTransport> = Arc::new(BroadcastShare::new(16));
        let left = MessageQueue::new();
        let right = MessageQueue::new();
        left.attach_share(transport.clone()).unwrap();
        right.attach_share(transport.clone()).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let left_seen = Arc::new(AtomicUsize::new(0));
        let counter = left_seen.clone();
        left.register(Listener::on(1).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        right
            .register(Listener::on(1).inspect(move |m| {
                let _ = tx.send((m.id().to_string(), m.is_from_peer()));
            }))
            .unwrap();

        let message = Message::deferred().mark(1, "HELLO");
        let id = message.id().to_string();
        left.send_async(message).await;

        let (seen_id, from_peer) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen_id, id);
        assert!(from_peer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(left_seen.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deferred_share_posts_final_value() {
        let transport = Arc::new(BroadcastShare::new(16));
        let mut tap = transport.subscribe();
        let queue = MessageQueue::new();
        queue.attach_share(transport.clone()).unwrap();
        queue.register(Listener::on(1).map(increment())).unwrap();

        queue
            .send_async(
                Message::deferred()
                    .with_mask(1)
                    .with_value(1)
                    .with_share(ShareMode::Deferred),
            )
            .await;
        let posted = tap.next().await.unwrap();
        assert_eq!(posted.value, json!(2));

        queue
            .send_sync(Message::sync().with_mask(1).with_share(ShareMode::Disabled))
            .unwrap();
        queue.detach_share();
        assert!(!queue.is_sharing());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), tap.next())
                .await
                .is_err()
        );
    }

    #[test]
    fn attach_share_needs_runtime() {
        let queue = MessageQueue::new();
        let error = queue
            .attach_share(Arc::new(BroadcastShare::new(4)))
            .unwrap_err();
        assert!(matches!(error, Error::NoRuntime));
    }
}
