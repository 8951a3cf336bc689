//! Job id to subscription map.
//!
//! [`SubscriptionRegistry`] enforces one live subscription per job id and
//! knows nothing about what the messages mean: each entry is a topic plus
//! an opaque [`MessageHandler`]. Entries survive a dropped link and are
//! re-sent when the manager attaches the next one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitzomax_core::naming::conversion_topic;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::transport::LinkCommand;

/// What a handler wants done with its subscription after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    /// The subscription has reached a terminal state; remove it.
    Finished,
}

/// Callback invoked with the raw body of every message on a subscription.
pub type MessageHandler = Arc<dyn Fn(&str) -> Delivery + Send + Sync>;

/// Handle to one subscription.
///
/// Becomes inert once the subscription is replaced, unsubscribed, or
/// switched to another job id. Cloning shares the liveness flag.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    job_id: String,
    topic: String,
    live: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// STOMP subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.live.store(false, Ordering::Release);
    }
}

struct Entry {
    handle: SubscriptionHandle,
    handler: MessageHandler,
}

#[derive(Default)]
struct RegistryInner {
    link: Option<mpsc::UnboundedSender<LinkCommand>>,
    /// Keyed by job id.
    entries: HashMap<String, Entry>,
    /// Subscription id -> job id.
    by_subscription: HashMap<String, String>,
}

impl RegistryInner {
    fn send(&self, command: LinkCommand) -> Result<(), BusError> {
        match &self.link {
            Some(link) => link.send(command).map_err(|_| BusError::LinkClosed),
            None => Err(BusError::NotConnected),
        }
    }

    /// Remove and deactivate the entry for `job_id`, telling the broker if
    /// a link is attached.
    fn remove(&mut self, job_id: &str) -> Option<Entry> {
        let entry = self.entries.remove(job_id)?;
        entry.handle.deactivate();
        self.by_subscription.remove(entry.handle.id());
        if self.link.is_some() {
            let _ = self.send(LinkCommand::Unsubscribe {
                id: entry.handle.id().to_string(),
            });
        }
        Some(entry)
    }
}

/// Thread-safe map from job id to its single live subscription.
///
/// Interior `Mutex`, never held across an await or while a handler runs.
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_handle(&self, job_id: &str) -> SubscriptionHandle {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        SubscriptionHandle {
            id: format!("sub-{n}"),
            job_id: job_id.to_string(),
            topic: conversion_topic(job_id),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Insert a fresh entry for `job_id`, replacing any existing one.
    ///
    /// When `require_link` is false and no link is attached, the entry is
    /// only recorded and will be sent on the next [`attach`](Self::attach).
    fn install(
        &self,
        inner: &mut RegistryInner,
        job_id: &str,
        handler: MessageHandler,
        require_link: bool,
    ) -> Result<SubscriptionHandle, BusError> {
        if require_link && inner.link.is_none() {
            return Err(BusError::NotConnected);
        }

        if inner.remove(job_id).is_some() {
            tracing::debug!(job_id, "Replacing existing subscription");
        }

        let handle = self.new_handle(job_id);
        if inner.link.is_some() {
            let sent = inner.send(LinkCommand::Subscribe {
                id: handle.id().to_string(),
                destination: handle.topic().to_string(),
            });
            if let Err(e) = sent {
                if require_link {
                    return Err(e);
                }
                tracing::debug!(job_id, "Link closed, subscription deferred to next attach");
            }
        }

        inner
            .by_subscription
            .insert(handle.id().to_string(), job_id.to_string());
        inner.entries.insert(
            job_id.to_string(),
            Entry {
                handle: handle.clone(),
                handler,
            },
        );
        Ok(handle)
    }

    /// Subscribe to the progress topic of `job_id`.
    ///
    /// Any existing subscription for the same id is cancelled first and its
    /// handle becomes inert.
    pub fn subscribe(
        &self,
        job_id: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let mut inner = self.lock();
        let handle = self.install(&mut inner, job_id, handler, true)?;
        tracing::debug!(job_id, subscription = %handle.id(), "Subscribed");
        Ok(handle)
    }

    /// Cancel and remove the subscription for `job_id`. Returns whether one
    /// existed.
    pub fn unsubscribe(&self, job_id: &str) -> bool {
        self.lock().remove(job_id).is_some()
    }

    /// Remove the subscription only if `handle` still owns it.
    pub fn release(&self, handle: &SubscriptionHandle) -> bool {
        let mut inner = self.lock();
        let owned = inner
            .entries
            .get(handle.job_id())
            .is_some_and(|e| e.handle.id() == handle.id());
        if owned {
            inner.remove(handle.job_id());
        }
        owned
    }

    /// Move the subscription of `old_job_id`, handler included, to
    /// `new_job_id`.
    ///
    /// The old entry is removed and deactivated before the new one is
    /// installed, under one lock, so nothing addressed to the old
    /// subscription can be dispatched afterwards. Works while the link is
    /// down; the new topic is subscribed on the next attach.
    pub fn switch(
        &self,
        old_job_id: &str,
        new_job_id: &str,
    ) -> Result<SubscriptionHandle, BusError> {
        let mut inner = self.lock();
        let old = inner
            .remove(old_job_id)
            .ok_or_else(|| BusError::NotSubscribed(old_job_id.to_string()))?;
        let handle = self.install(&mut inner, new_job_id, old.handler, false)?;
        tracing::debug!(
            old_job_id,
            new_job_id,
            subscription = %handle.id(),
            "Switched subscription",
        );
        Ok(handle)
    }

    /// Cancel every subscription.
    pub fn unsubscribe_all(&self) {
        let mut inner = self.lock();
        let job_ids: Vec<String> = inner.entries.keys().cloned().collect();
        for job_id in job_ids {
            inner.remove(&job_id);
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().entries.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Job ids with a subscription.
    pub fn job_ids(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Attach a new link and re-send every recorded subscription on it.
    ///
    /// Returns the number of subscriptions restored.
    pub fn attach(&self, link: mpsc::UnboundedSender<LinkCommand>) -> usize {
        let mut inner = self.lock();
        inner.link = Some(link);
        let commands: Vec<LinkCommand> = inner
            .entries
            .values()
            .map(|e| LinkCommand::Subscribe {
                id: e.handle.id().to_string(),
                destination: e.handle.topic().to_string(),
            })
            .collect();
        let restored = commands.len();
        for command in commands {
            let _ = inner.send(command);
        }
        restored
    }

    /// Forget the current link. Entries are kept for the next attach.
    pub fn detach(&self) {
        self.lock().link = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Deliver a message body to the handler owning `subscription_id`.
    ///
    /// Returns `false` when no live subscription matches. The handler runs
    /// without the registry lock held; if it reports
    /// [`Delivery::Finished`] the subscription is released.
    pub fn dispatch(&self, subscription_id: &str, body: &str) -> bool {
        let (handle, handler) = {
            let inner = self.lock();
            let Some(entry) = inner
                .by_subscription
                .get(subscription_id)
                .and_then(|job_id| inner.entries.get(job_id))
            else {
                return false;
            };
            (entry.handle.clone(), Arc::clone(&entry.handler))
        };

        if !handle.is_live() {
            return false;
        }

        if handler(body) == Delivery::Finished {
            self.release(&handle);
        }
        true
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
