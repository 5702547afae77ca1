//! The activity-bus consumer port (spec.md §1 Non-goals: wire transport and
//! decoding are out of scope). `MessageBus` is the seam the real fedora
//! messaging transport plugs into; `ChannelMessageBus` is a simple
//! in-process adapter used by tests and by the consumer binary when fed
//! from a local queue.

use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("message bus closed")]
    Closed,
}

/// The message-bus port: an async stream of already-decoded messages.
pub trait MessageBus: Send + Sync {
    fn next_message<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Message, BusError>> + Send + 'a>>;
}

/// A `tokio::sync::mpsc`-backed adapter: whatever decodes wire frames into
/// `Message`s upstream just sends them down this channel.
pub struct ChannelMessageBus {
    receiver: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Message>>,
}

impl ChannelMessageBus {
    pub fn new(receiver: tokio::sync::mpsc::Receiver<Message>) -> Self {
        Self {
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }
}

impl MessageBus for ChannelMessageBus {
    fn next_message<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Message, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut rx = self.receiver.lock().await;
            rx.recv().await.ok_or(BusError::Closed)
        })
    }
}
