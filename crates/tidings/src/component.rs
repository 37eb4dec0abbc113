//! Listener groups owned by one component.
//!
//! A component registers a pass-through root listener and hangs every
//! listener it declares beneath it, so the whole group can be enabled,
//! disabled or destroyed at once.

use crate::config::{ComponentConfig, MessageIdentity};
use crate::error::Result;
use crate::listener::Listener;
use crate::message::Message;
use crate::queue::{ListenerHandle, MessageQueue};
use crate::resource::ResponseMetadata;

pub struct ComponentBuilder {
    queue: MessageQueue,
    name: String,
    priority: i32,
    listeners: Vec<Listener>,
}

impl ComponentBuilder {
    pub fn with_config(mut self, config: &ComponentConfig) -> Self {
        self.priority = config.listener_priority;
        self
    }

    /// Priority of the component's root listener among its siblings.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn on(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Observe resource responses published with `identity`.
    ///
    /// Payloads that do not decode as response metadata are ignored.
    pub fn on_response<F>(self, identity: &MessageIdentity, f: F) -> Self
    where
        F: Fn(ResponseMetadata) + Send + Sync + 'static,
    {
        let listener = Listener::on(identity.mask)
            .listen(identity.tag.clone())
            .inspect(move |message: &Message| {
                match ResponseMetadata::from_message(message) {
                    Ok(metadata) => f(metadata),
                    Err(error) => {
                        tracing::debug!(message = %message.id(), error = %error, "not a response payload")
                    }
                }
            });
        self.on(listener)
    }

    pub fn build(self) -> Result<Component> {
        let root = self.queue.register(
            Listener::on(u64::MAX)
                .with_id(format!("{}:{}", self.name, uuid::Uuid::new_v4()))
                .with_priority(self.priority),
        )?;
        let members = self
            .listeners
            .into_iter()
            .map(|listener| self.queue.register_under(listener, &root))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(component = %self.name, members = members.len(), "component registered");
        Ok(Component {
            name: self.name,
            root,
            members,
        })
    }
}

/// A registered listener group.
#[derive(Debug)]
pub struct Component {
    name: String,
    root: ListenerHandle,
    members: Vec<ListenerHandle>,
}

impl Component {
    pub fn builder(queue: &MessageQueue, name: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder {
            queue: queue.clone(),
            name: name.into(),
            priority: ComponentConfig::default().listener_priority,
            listeners: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &ListenerHandle {
        &self.root
    }

    pub fn members(&self) -> &[ListenerHandle] {
        &self.members
    }

    pub fn enable(&self) {
        self.root.enable();
    }

    pub fn disable(&self) {
        self.root.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_enabled()
    }

    pub fn is_alive(&self) -> bool {
        self.root.is_alive()
    }

    pub fn destroy(&self) {
        self.root.destroy();
    }
}
