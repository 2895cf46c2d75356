//! Messaging capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Identifier, unique within the backend
    pub id: String,
    /// Subject or correspondent name
    pub title: String,
    /// Messages, when the backend filled them
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One message in a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier, unique within the thread
    pub id: String,
    /// Owning thread
    pub thread_id: String,
    /// Sender display name
    pub sender: String,
    /// Message body
    pub content: String,
    /// When the message was sent
    pub date: DateTime<Utc>,
}

/// Backends that expose message threads
#[async_trait]
pub trait CapMessages: Send {
    /// Lazily list threads, without their messages
    fn iter_threads(&mut self) -> BoxStream<'_, anyhow::Result<Thread>>;

    /// Fetch a thread with its messages
    ///
    /// # Errors
    ///
    /// Returns error if the site could not be queried
    async fn get_thread(&mut self, id: &str) -> anyhow::Result<Option<Thread>>;

    /// Lazily list messages not seen yet
    fn iter_unread_messages(&mut self) -> BoxStream<'_, anyhow::Result<Message>>;

    /// Post a reply into a thread
    ///
    /// # Errors
    ///
    /// Returns error if the site rejected the message
    async fn post_message(&mut self, thread_id: &str, content: &str) -> anyhow::Result<()>;
}
