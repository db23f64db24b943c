//! Channel transport for query synchronization.

use crate::message::ChannelMessage;
use quarry_core::constants::{CHANNEL_NAME, DEFAULT_CHANNEL_CAPACITY};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A named, many-to-many message channel.
///
/// Posting never blocks. Every subscriber sees every message posted after
/// it subscribed, including its own; filter on [`ChannelMessage::origin`].
pub trait QueryChannel: Send + Sync {
    fn name(&self) -> &str;

    fn post_message(&self, message: ChannelMessage);

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage>;
}

/// In-process channel on a tokio broadcast queue.
///
/// Clones share the same queue, so several clients in one process can
/// stand in for several tabs.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    name: String,
    tx: broadcast::Sender<ChannelMessage>,
}

impl LocalChannel {
    /// Create a channel with the given per-subscriber buffer.
    ///
    /// Subscribers that fall more than `capacity` messages behind skip
    /// ahead and log the loss.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(CHANNEL_NAME, DEFAULT_CHANNEL_CAPACITY)
    }
}

impl QueryChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post_message(&self, message: ChannelMessage) {
        let message_type = message.message.message_type();
        match self.tx.send(message) {
            Ok(receivers) => {
                trace!(
                    channel = self.name.as_str(),
                    message_type,
                    receivers,
                    "Posted channel message"
                );
            }
            Err(_) => {
                trace!(
                    channel = self.name.as_str(),
                    message_type,
                    "No receivers for channel message"
                );
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.tx.subscribe()
    }
}

/// Subscription that stops listening when dropped.
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Invoke `listener` for every message arriving on `channel`.
///
/// Must be called from within a tokio runtime.
pub fn listen<F>(channel: &dyn QueryChannel, listener: F) -> ListenerHandle
where
    F: Fn(ChannelMessage) + Send + 'static,
{
    let mut rx = channel.subscribe();
    let name = channel.name().to_string();
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => listener(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = name.as_str(),
                        skipped, "Channel listener lagged, some messages were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(channel = name.as_str(), "Channel closed");
                    break;
                }
            }
        }
    });
    ListenerHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QueryBroadcastMessage;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_post_without_receivers_is_fine() {
        let channel = LocalChannel::default();
        assert_eq!(channel.name(), CHANNEL_NAME);
        channel.post_message(ChannelMessage::new(
            Uuid::now_v7(),
            QueryBroadcastMessage::invalidate("k"),
        ));
    }

    #[tokio::test]
    async fn test_subscriber_receives_posts() {
        let channel = LocalChannel::new("test", 8);
        let mut rx = channel.subscribe();
        let msg = ChannelMessage::new(Uuid::now_v7(), QueryBroadcastMessage::refetch("k"));
        channel.post_message(msg.clone());
        assert_eq!(rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_listen_and_unsubscribe() {
        let channel = LocalChannel::new("test", 8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let handle = listen(&channel, move |m| {
            sink.lock().unwrap().push(m.message.message_type());
        });

        channel.post_message(ChannelMessage::new(
            Uuid::now_v7(),
            QueryBroadcastMessage::invalidate("k"),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["invalidate"]);

        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.receiver_count(), 0);
    }
}
