//! Subscription registry: each client session's tag list, last-known
//! values and delivery callback.

use chrono::{DateTime, Local};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use taghist_error::THResult;
use taghist_models::{TagSample, THValue};

/// Async delivery callback for one session. The transport behind it
/// (WebSocket, SSE, local handler) is the caller's business.
pub type DeliverFn = Arc<dyn Fn(Vec<TagSample>) -> BoxFuture<'static, THResult<()>> + Send + Sync>;

struct ClientSession {
    /// Ordered tag list with the session's last-known values.
    tags: Vec<TagSample>,
    deliver: DeliverFn,
}

/// Thread-safe session store: the subscribe/unsubscribe boundary mutates it
/// from request-handling code while the scheduler reads snapshots.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, ClientSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or wholesale-replace a session. The tag list is replaced, not
    /// merged, and every tag starts in the "not yet read" state.
    pub fn upsert(&self, id: &str, tag_names: Vec<String>, deliver: DeliverFn) {
        let tags = tag_names.into_iter().map(TagSample::unread).collect();
        self.sessions
            .insert(id.to_string(), ClientSession { tags, deliver });
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Session ids with their tag names, for one poll cycle's collect step.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.sessions
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().tags.iter().map(|t| t.name.clone()).collect(),
                )
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Null-safe diff against the session's stored value. On change the
    /// stored value and timestamp are updated and the new sample returned;
    /// equal values return `None` and cause no delivery.
    pub fn apply_change(
        &self,
        id: &str,
        name: &str,
        value: &THValue,
        time: DateTime<Local>,
    ) -> Option<TagSample> {
        let mut entry = self.sessions.get_mut(id)?;
        let slot = entry.tags.iter_mut().find(|t| t.name == name)?;
        if slot.value == *value {
            return None;
        }
        slot.value = value.clone();
        slot.time = time;
        Some(slot.clone())
    }

    /// Clone a session's delivery callback out of the map so the await
    /// happens without holding any shard lock.
    pub fn deliver_fn(&self, id: &str) -> Option<DeliverFn> {
        self.sessions.get(id).map(|s| Arc::clone(&s.deliver))
    }

    /// Last-known value of one tag in one session (diagnostics and tests).
    pub fn current_value(&self, id: &str, name: &str) -> Option<THValue> {
        self.sessions
            .get(id)?
            .tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.clone())
    }
}
