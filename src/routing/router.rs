//! Inbound envelope dispatch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::registry::{Callback, ChannelRegistry, SubscriptionHandle};
use crate::core::MessageEnvelope;

/// Outcome of one [`ChannelRouter::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers that returned normally.
    pub delivered: usize,
    /// Subscribers that panicked.
    pub panicked: usize,
}

impl DispatchReport {
    /// Whether nobody was subscribed.
    pub fn dropped(&self) -> bool {
        self.delivered == 0 && self.panicked == 0
    }
}

/// Routes inbound envelopes to channel subscribers.
///
/// Dispatch works on a snapshot of the matching subscribers taken under a
/// read lock, so callbacks may subscribe or unsubscribe (even on the same
/// router) without deadlocking. Changes become visible on the next dispatch.
#[derive(Debug, Default)]
pub struct ChannelRouter {
    registry: RwLock<ChannelRegistry>,
}

impl ChannelRouter {
    /// Router with no subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` on `channel` (exact name or `prefix*` pattern).
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.subscribe_arc(channel, Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn subscribe_arc(&self, channel: &str, callback: Callback) -> SubscriptionHandle {
        let handle = self.registry.write().insert(channel, callback);
        trace!(channel, id = handle.id(), "subscribed");
        handle
    }

    /// Remove a subscription. No-op if it is already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.write().remove(handle)
    }

    /// Deliver `envelope` to every matching subscriber in registration order.
    ///
    /// A panicking subscriber is logged and skipped; later subscribers still
    /// receive the message. With no subscribers the message is dropped.
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> DispatchReport {
        let subscribers = self.registry.read().matching(envelope.channel());
        let mut report = DispatchReport::default();

        if subscribers.is_empty() {
            trace!(
                channel = envelope.channel(),
                message_id = %envelope.message_id(),
                "no subscribers, dropping message"
            );
            return report;
        }

        for callback in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.panicked += 1;
                    warn!(
                        channel = envelope.channel(),
                        message_id = %envelope.message_id(),
                        reason = panic_message(panic.as_ref()),
                        "subscriber panicked"
                    );
                }
            }
        }
        report
    }

    /// Subscribers registered on exactly `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry.read().subscriber_count(channel)
    }

    /// Channels with at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.registry.read().channels()
    }

    /// Total subscriptions.
    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.registry.write().clear();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
