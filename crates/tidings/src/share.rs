//! Cross-instance sharing.
//!
//! Several queues in one process can attach to the same transport. Each
//! queue posts the metadata of its locally sent messages and re-delivers
//! what its peers post. Delivery is best effort: a lagging or closed
//! transport drops records, it never fails a local send.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::message::MessageMetadata;

/// How many self-posted ids are remembered for echo suppression.
const RECENT_CAPACITY: usize = 256;

/// A channel shared by sibling queue instances.
pub trait ShareTransport: Send + Sync {
    /// Publish one record to every subscriber, this instance included.
    fn post(&self, metadata: &MessageMetadata) -> anyhow::Result<()>;

    /// Stream of records posted by any instance.
    fn subscribe(&self) -> BoxStream<'static, MessageMetadata>;
}

/// In-process transport on a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastShare {
    sender: broadcast::Sender<MessageMetadata>,
}

impl BroadcastShare {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of attached subscribers.
    pub fn peers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastShare {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ShareTransport for BroadcastShare {
    fn post(&self, metadata: &MessageMetadata) -> anyhow::Result<()> {
        self.sender
            .send(metadata.clone())
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("no peer is listening on the share channel"))
    }

    fn subscribe(&self) -> BoxStream<'static, MessageMetadata> {
        let receiver = self.sender.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(metadata) => return Some((metadata, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "share channel lagged, records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// A queue's attachment to a transport.
pub(crate) struct ShareLink {
    transport: Arc<dyn ShareTransport>,
    recent: Mutex<VecDeque<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ShareLink {
    pub(crate) fn new(transport: Arc<dyn ShareTransport>) -> Self {
        Self {
            transport,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            pump: Mutex::new(None),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ShareTransport> {
        &self.transport
    }

    pub(crate) fn set_pump(&self, pump: JoinHandle<()>) {
        *self.pump.lock() = Some(pump);
    }

    /// Post a record and remember its id so our own echo is dropped.
    pub(crate) fn post(&self, metadata: &MessageMetadata) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(metadata.id.clone());
        }
        if let Err(error) = self.transport.post(metadata) {
            self.recent.lock().retain(|id| id != &metadata.id);
            tracing::warn!(message = %metadata.id, error = %error, "skip message share");
        }
    }

    /// Returns true, and forgets the id, if the record is our own echo.
    pub(crate) fn take_echo(&self, id: &str) -> bool {
        let mut recent = self.recent.lock();
        match recent.iter().position(|known| known == id) {
            Some(index) => {
                recent.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for ShareLink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let share = BroadcastShare::new(8);
        let mut first = share.subscribe();
        let mut second = share.subscribe();
        assert_eq!(share.peers(), 2);

        let metadata = Message::from_value(1).mark(1, "T").metadata();
        share.post(&metadata).unwrap();

        assert_eq!(first.next().await.unwrap().id, metadata.id);
        assert_eq!(second.next().await.unwrap().id, metadata.id);
    }

    #[test]
    fn post_without_subscribers_fails() {
        let share = BroadcastShare::new(8);
        let metadata = Message::deferred().metadata();
        assert!(share.post(&metadata).is_err());
    }

    #[test]
    fn echo_is_recognised_once() {
        let share = BroadcastShare::new(8);
        let _subscriber = share.subscribe();
        let link = ShareLink::new(Arc::new(share));
        let metadata = Message::deferred().metadata();

        link.post(&metadata);
        assert!(link.take_echo(&metadata.id));
        assert!(!link.take_echo(&metadata.id));
    }

    #[test]
    fn failed_post_is_not_remembered() {
        let link = ShareLink::new(Arc::new(BroadcastShare::new(8)));
        let metadata = Message::deferred().metadata();
        link.post(&metadata);
        assert!(!link.take_echo(&metadata.id));
    }
}
