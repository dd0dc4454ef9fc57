use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::debug;

use crate::commands::Command;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::Error;

/// Callback invoked for every message delivered on a subscribed channel or
/// pattern: `(channel, payload)`. Handlers run synchronously under the
/// registration lock and must not subscribe or unsubscribe from inside.
pub type MessageHandler = Arc<dyn Fn(&str, &Bytes) + Send + Sync>;

/// A subscription key: either an exact channel or a server-side glob
/// pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(String),
    Pattern(String),
}

impl Topic {
    fn subscribe_command(&self) -> Command {
        match self {
            Topic::Channel(channel) => Command::new("SUBSCRIBE").arg(channel),
            Topic::Pattern(pattern) => Command::new("PSUBSCRIBE").arg(pattern),
        }
    }

    fn unsubscribe_command(&self) -> Command {
        match self {
            Topic::Channel(channel) => Command::new("UNSUBSCRIBE").arg(channel),
            Topic::Pattern(pattern) => Command::new("PUNSUBSCRIBE").arg(pattern),
        }
    }
}

struct TopicEntry {
    handlers: Vec<MessageHandler>,
    /// Flipped once the server acknowledged the subscribe command; only live
    /// entries count toward the subscription total.
    live: bool,
}

/// Tracks active subscriptions as a derived view over the connection and
/// fans pushed messages out to their handlers. Registration changes and
/// delivery hold the same lock, so a handler is never delivered a message
/// across its own registration boundary.
pub(crate) struct Subscriptions {
    topics: Mutex<HashMap<Topic, TopicEntry>>,
}

impl Subscriptions {
    pub fn new() -> Subscriptions {
        Subscriptions {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, TopicEntry>> {
        self.topics.lock().expect("subscription lock poisoned")
    }

    /// Registers a handler; returns true when it is the first one for the
    /// topic and a subscribe command must be issued.
    fn add(&self, topic: Topic, handler: MessageHandler) -> bool {
        let mut topics = self.lock();
        match topics.get_mut(&topic) {
            Some(entry) => {
                entry.handlers.push(handler);
                false
            }
            None => {
                topics.insert(
                    topic,
                    TopicEntry {
                        handlers: vec![handler],
                        live: false,
                    },
                );
                true
            }
        }
    }

    /// Removes a handler by identity; returns true when it was the last one
    /// and the entry died with it.
    fn remove(&self, topic: &Topic, handler: &MessageHandler) -> bool {
        let mut topics = self.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };

        entry
            .handlers
            .retain(|registered| !Arc::ptr_eq(registered, handler));
        if entry.handlers.is_empty() {
            topics.remove(topic);
            true
        } else {
            false
        }
    }

    fn mark_live(&self, topic: &Topic) {
        if let Some(entry) = self.lock().get_mut(topic) {
            entry.live = true;
        }
    }

    /// Drops a topic wholesale, e.g. when its subscribe command failed.
    fn kill(&self, topic: &Topic) {
        self.lock().remove(topic);
    }

    /// Number of live, acknowledged subscriptions.
    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|entry| entry.live).count()
    }

    /// Routes an inbound frame. Pushed pub/sub messages are fanned out here
    /// and consumed; anything else is handed back to complete the oldest
    /// outstanding request. RESP2 delivers pushes as plain arrays, so those
    /// are only intercepted while subscriptions exist.
    pub fn route(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Push(items) => {
                self.deliver(items);
                None
            }
            Frame::Array(items) if self.is_message(&items) => {
                self.deliver(items);
                None
            }
            frame => Some(frame),
        }
    }

    fn is_message(&self, items: &[Frame]) -> bool {
        if self.lock().is_empty() {
            return false;
        }
        matches!(
            items.first().and_then(frame_text).as_deref(),
            Some("message") | Some("pmessage")
        )
    }

    fn deliver(&self, items: Vec<Frame>) {
        let kind = items.first().and_then(frame_text);
        let (topic, channel, payload) = match (kind.as_deref(), items.len()) {
            // ["message", channel, payload]
            (Some("message"), 3) => {
                let Some(channel) = frame_text(&items[1]) else {
                    return;
                };
                (
                    Topic::Channel(channel.clone()),
                    channel,
                    frame_bytes(&items[2]),
                )
            }
            // ["pmessage", pattern, channel, payload]
            (Some("pmessage"), 4) => {
                let (Some(pattern), Some(channel)) = (frame_text(&items[1]), frame_text(&items[2]))
                else {
                    return;
                };
                (Topic::Pattern(pattern), channel, frame_bytes(&items[3]))
            }
            (kind, _) => {
                debug!(?kind, "ignoring unrecognized push frame");
                return;
            }
        };

        let topics = self.lock();
        let Some(entry) = topics.get(&topic) else {
            debug!(?topic, "push for a channel with no handlers");
            return;
        };
        for handler in &entry.handlers {
            handler(&channel, &payload);
        }
    }
}

fn frame_text(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Simple(s) => Some(s.clone()),
        Frame::Bulk(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        _ => None,
    }
}

fn frame_bytes(frame: &Frame) -> Bytes {
    match frame {
        Frame::Bulk(bytes) => bytes.clone(),
        Frame::Simple(s) => Bytes::from(s.clone()),
        other => Bytes::from(other.to_string()),
    }
}

impl Connection {
    /// Subscribes `handler` to a channel. The first handler for a channel
    /// issues SUBSCRIBE through the normal request path and the entry turns
    /// live when the server acknowledges it.
    pub async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<(), Error> {
        self.subscribe_topic(Topic::Channel(channel.to_string()), handler)
            .await
    }

    /// Subscribes `handler` to a server-side glob pattern.
    pub async fn psubscribe(&self, pattern: &str, handler: MessageHandler) -> Result<(), Error> {
        self.subscribe_topic(Topic::Pattern(pattern.to_string()), handler)
            .await
    }

    /// Removes one previously registered handler (matched by identity).
    /// Removing the last handler for the channel issues UNSUBSCRIBE; the
    /// handlers stop receiving messages as soon as this call starts.
    pub async fn unsubscribe(&self, channel: &str, handler: &MessageHandler) -> Result<(), Error> {
        self.unsubscribe_topic(Topic::Channel(channel.to_string()), handler)
            .await
    }

    pub async fn punsubscribe(&self, pattern: &str, handler: &MessageHandler) -> Result<(), Error> {
        self.unsubscribe_topic(Topic::Pattern(pattern.to_string()), handler)
            .await
    }

    /// Number of live, acknowledged subscriptions on this connection.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.live_count()
    }

    async fn subscribe_topic(&self, topic: Topic, handler: MessageHandler) -> Result<(), Error> {
        // Register before the command goes out so a message racing the
        // acknowledgement still finds the handler.
        if !self.subscriptions.add(topic.clone(), handler) {
            return Ok(());
        }

        let ack = self.submit(None, topic.subscribe_command())?;
        match ack.wait().await {
            Ok(_) => {
                self.subscriptions.mark_live(&topic);
                Ok(())
            }
            Err(err) => {
                self.subscriptions.kill(&topic);
                Err(err)
            }
        }
    }

    async fn unsubscribe_topic(&self, topic: Topic, handler: &MessageHandler) -> Result<(), Error> {
        if !self.subscriptions.remove(&topic, handler) {
            return Ok(());
        }

        let ack = self.submit(None, topic.unsubscribe_command())?;
        ack.wait().await.map(|_| ())
    }
}
