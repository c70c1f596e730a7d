// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide notification bus.
//!
//! Topics map to priority-ordered handler chains. A publish does not fan out:
//! the handlers of a topic run one after another, each receiving the same
//! [`Notification`], and the value a handler returns becomes the
//! notification's response before the next handler runs. Any handler may
//! cancel the notification to stop the chain.
//!
//! Chain mutation is synchronous. A dispatch works on a snapshot of the chain
//! taken when it starts, so unsubscribing during a dispatch only affects later
//! publishes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::sync::lock;

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A subscriber callable. Identity (for [`NotificationBus::unsubscribe`]) is
/// the `Arc` pointer.
pub type Handler = Arc<dyn Fn(Notification) -> HandlerFuture + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |n| -> HandlerFuture { Box::pin(f(n)) })
}

/// Handle identifying exactly one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Dispatch status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Active,
    Cancelled,
}

#[derive(Debug)]
struct NotificationInner {
    topic: String,
    args: Vec<Value>,
    publisher: Option<String>,
    cancelled: AtomicBool,
    cursor: AtomicUsize,
    response: Mutex<Option<Value>>,
}

/// One in-flight publish. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Notification {
    inner: Arc<NotificationInner>,
}

impl Notification {
    fn new(topic: &str, args: Vec<Value>, publisher: Option<&str>) -> Self {
        Self {
            inner: Arc::new(NotificationInner {
                topic: topic.to_string(),
                args,
                publisher: publisher.map(str::to_string),
                cancelled: AtomicBool::new(false),
                cursor: AtomicUsize::new(0),
                response: Mutex::new(None),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn args(&self) -> &[Value] {
        &self.inner.args
    }

    /// Positional argument, `Value::Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.inner.args.get(index).unwrap_or(&Value::Null)
    }

    pub fn publisher(&self) -> Option<&str> {
        self.inner.publisher.as_deref()
    }

    /// Response left by the previous handler in the chain.
    pub fn response(&self) -> Option<Value> {
        lock(&self.inner.response).clone()
    }

    pub fn set_response(&self, value: Value) {
        *lock(&self.inner.response) = Some(value);
    }

    /// Stop the dispatch after the current handler returns.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> NotificationStatus {
        if self.is_cancelled() {
            NotificationStatus::Cancelled
        } else {
            NotificationStatus::Active
        }
    }

    /// Index of the next handler to run.
    pub fn cursor(&self) -> usize {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    fn advance(&self) -> usize {
        self.inner.cursor.fetch_add(1, Ordering::SeqCst)
    }
}

struct Entry {
    id: SubscriptionId,
    /// `None` means appended after every prioritised entry.
    priority: Option<u32>,
    handler: Handler,
}

/// Topic registry and sequential dispatcher.
pub struct NotificationBus {
    interests: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self {
            interests: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("topics", &self.topics())
            .finish()
    }
}

impl NotificationBus {
    /// Create the bus. One instance is shared by every node of a process.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a handler to the end of the topic's chain.
    pub fn subscribe(&self, topic: &str, handler: Handler) -> SubscriptionId {
        self.insert(topic, handler, None)
    }

    /// Insert a handler ordered by ascending `priority`; ties keep insertion
    /// order. A negative priority appends.
    pub fn subscribe_with_priority(
        &self,
        topic: &str,
        handler: Handler,
        priority: i32,
    ) -> SubscriptionId {
        self.insert(topic, handler, u32::try_from(priority).ok())
    }

    fn insert(&self, topic: &str, handler: Handler, priority: Option<u32>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut interests = lock(&self.interests);
        let chain = interests.entry(topic.to_string()).or_default();

        let position = match priority {
            None => chain.len(),
            Some(p) => chain
                .iter()
                .position(|e| e.priority.is_none_or(|other| other > p))
                .unwrap_or(chain.len()),
        };
        chain.insert(
            position,
            Entry {
                id,
                priority,
                handler,
            },
        );

        trace!(topic, position, "subscribed");
        id
    }

    /// Remove the first registration of `handler` on `topic`. No-op if absent.
    pub fn unsubscribe(&self, topic: &str, handler: &Handler) -> bool {
        let mut interests = lock(&self.interests);
        let Some(chain) = interests.get_mut(topic) else {
            return false;
        };
        match chain.iter().position(|e| Arc::ptr_eq(&e.handler, handler)) {
            Some(index) => {
                chain.remove(index);
                if chain.is_empty() {
                    interests.remove(topic);
                }
                true
            }
            None => false,
        }
    }

    /// Remove exactly the registration identified by `id`.
    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let mut interests = lock(&self.interests);
        let mut emptied = None;
        let mut removed = false;
        for (topic, chain) in interests.iter_mut() {
            if let Some(index) = chain.iter().position(|e| e.id == id) {
                chain.remove(index);
                removed = true;
                if chain.is_empty() {
                    emptied = Some(topic.clone());
                }
                break;
            }
        }
        if let Some(topic) = emptied {
            interests.remove(&topic);
        }
        removed
    }

    /// Dispatch `args` to the topic's handlers, one at a time.
    ///
    /// Returns the response of the last handler that ran, or `None` when the
    /// topic has no subscribers (which is logged, not an error). A failing
    /// handler aborts the chain.
    pub async fn publish(
        &self,
        topic: &str,
        args: Vec<Value>,
        publisher: Option<&str>,
    ) -> Result<Option<Value>> {
        let chain: Vec<Handler> = lock(&self.interests)
            .get(topic)
            .map(|chain| chain.iter().map(|e| e.handler.clone()).collect())
            .unwrap_or_default();

        if chain.is_empty() {
            match publisher {
                Some(name) => warn!(
                    service = %name,
                    topic,
                    "{name} published '{topic}' but there are no subscribers"
                ),
                None => warn!(topic, "published '{topic}' but there are no subscribers"),
            }
            return Ok(None);
        }

        let notification = Notification::new(topic, args, publisher);
        while !notification.is_cancelled() {
            let Some(next) = chain.get(notification.advance()) else {
                break;
            };
            let response = next(notification.clone())
                .await
                .map_err(|e| Error::Handler {
                    topic: topic.to_string(),
                    error: Arc::new(e),
                })?;
            notification.set_response(response);
        }

        Ok(notification.response())
    }

    /// Number of handlers currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.interests).get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one handler.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.interests).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drop every chain. Called at process shutdown.
    pub fn clear(&self) {
        lock(&self.interests).clear();
    }
}
