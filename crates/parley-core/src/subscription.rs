//! Live subscription sessions.
//!
//! A session is a small state machine over its channel set. The caller reads
//! payloads from `messages` and changes the set by sending [`Command`]s. A
//! controller task owns the per-channel receivers and forwards payloads in
//! arrival order.
//!
//! The session tears itself down, closing `messages` and releasing every
//! channel, when:
//!
//! - its channel set becomes empty,
//! - a channel receiver lags behind or its channel closes,
//! - the command sender is dropped, or
//! - the consumer drops `messages`.

use crate::broker::{Broker, BrokerError};
use crate::channel::{validate_channel_name, ChannelId};
use crate::payload::Payload;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, warn};

/// A session identifier.
pub type SessionId = String;

/// A change to a session's channel set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Add channels. Channels already in the set are ignored.
    Subscribe(Vec<ChannelId>),
    /// Remove channels. Removing the last channel ends the session.
    Unsubscribe(Vec<ChannelId>),
}

/// A live session.
#[derive(Debug)]
pub struct Subscription {
    id: SessionId,
    messages: mpsc::Receiver<Arc<Payload>>,
    commands: mpsc::Sender<Command>,
}

impl Subscription {
    /// The session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next payload.
    ///
    /// Returns `None` once the session has torn down.
    pub async fn recv(&mut self) -> Option<Arc<Payload>> {
        self.messages.recv().await
    }

    /// Add channels to the session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionClosed`] if the session has ended.
    pub async fn subscribe(&self, channels: Vec<ChannelId>) -> Result<(), BrokerError> {
        self.send(Command::Subscribe(channels)).await
    }

    /// Remove channels from the session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionClosed`] if the session has ended.
    pub async fn unsubscribe(&self, channels: Vec<ChannelId>) -> Result<(), BrokerError> {
        self.send(Command::Unsubscribe(channels)).await
    }

    async fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BrokerError::SessionClosed)
    }

    /// A sender for commands, usable independently of this handle.
    #[must_use]
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// Split into the session ID, the payload stream and the command sender.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        SessionId,
        mpsc::Receiver<Arc<Payload>>,
        mpsc::Sender<Command>,
    ) {
        (self.id, self.messages, self.commands)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    NoChannels,
    Transport,
    CommandsClosed,
    ConsumerGone,
}

/// One item from a channel stream.
pub(crate) enum Delivery {
    Item(Result<Arc<Payload>, BroadcastStreamRecvError>),
    /// The channel's sender went away.
    Closed,
}

/// A channel receiver that reports its own end.
pub(crate) type ChannelStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

pub(crate) fn channel_stream(rx: broadcast::Receiver<Arc<Payload>>) -> ChannelStream {
    Box::pin(
        BroadcastStream::new(rx)
            .map(Delivery::Item)
            .chain(tokio_stream::once(Delivery::Closed)),
    )
}

enum Step {
    Command(Option<Command>),
    Delivery(ChannelId, Delivery),
}

struct Controller {
    broker: Arc<Broker>,
    id: SessionId,
    streams: StreamMap<ChannelId, ChannelStream>,
    commands: mpsc::Receiver<Command>,
    messages: mpsc::Sender<Arc<Payload>>,
}

/// Start the controller for a freshly attached session.
pub(crate) fn spawn(
    broker: Arc<Broker>,
    id: SessionId,
    streams: StreamMap<ChannelId, ChannelStream>,
    buffer: usize,
) -> Subscription {
    let (messages_tx, messages_rx) = mpsc::channel(buffer.max(1));
    let (commands_tx, commands_rx) = mpsc::channel(16);

    let controller = Controller {
        broker,
        id: id.clone(),
        streams,
        commands: commands_rx,
        messages: messages_tx,
    };
    tokio::spawn(controller.run());

    Subscription {
        id,
        messages: messages_rx,
        commands: commands_tx,
    }
}

impl Controller {
    async fn run(mut self) {
        let reason = loop {
            if self.streams.is_empty() {
                break Teardown::NoChannels;
            }

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                Some((channel, item)) = self.streams.next() => Step::Delivery(channel, item),
            };

            match step {
                Step::Command(Some(Command::Subscribe(channels))) => self.add(channels),
                Step::Command(Some(Command::Unsubscribe(channels))) => self.remove(channels),
                Step::Command(None) => break Teardown::CommandsClosed,
                Step::Delivery(_, Delivery::Item(Ok(payload))) => {
                    if self.messages.send(payload).await.is_err() {
                        break Teardown::ConsumerGone;
                    }
                }
                Step::Delivery(channel, Delivery::Item(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(session = %self.id, channel = %channel, skipped, "Session lagged behind channel");
                    break Teardown::Transport;
                }
                Step::Delivery(channel, Delivery::Closed) => {
                    warn!(session = %self.id, channel = %channel, "Channel closed under session");
                    break Teardown::Transport;
                }
            }
        };

        self.broker.detach_all(&self.id);
        debug!(session = %self.id, reason = ?reason, "Session closed");
    }

    fn add(&mut self, channels: Vec<ChannelId>) {
        for name in channels {
            if self.streams.contains_key(&name) {
                continue;
            }
            if let Err(reason) = validate_channel_name(&name) {
                warn!(session = %self.id, channel = %name, reason, "Ignoring invalid channel");
                continue;
            }
            match self.broker.attach(&self.id, &name) {
                Ok(rx) => {
                    debug!(session = %self.id, channel = %name, "Subscribed");
                    self.streams.insert(name, channel_stream(rx));
                }
                Err(e) => warn!(session = %self.id, channel = %name, error = %e, "Subscribe failed"),
            }
        }
    }

    fn remove(&mut self, channels: Vec<ChannelId>) {
        for name in channels {
            if self.streams.remove(&name).is_some() {
                self.broker.detach(&self.id, &name);
                debug!(session = %self.id, channel = %name, "Unsubscribed");
            }
        }
    }
}
