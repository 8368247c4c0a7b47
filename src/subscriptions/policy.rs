//! Delivery policy: whether a value update reaches a subscriber.
//!
//! Evaluation is a pure function of the options, the subscriber's context and
//! the update. Rules are checked in a fixed order and the first one that
//! matches rejects the update.

use crate::options::PubSubOptions;
use crate::types::{PublisherId, Value, ValueUpdate};

/// Per-subscriber state the policy reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscriberContext<'a> {
    /// Publisher paired with the subscriber when it belongs to an entry.
    pub entry_publisher: Option<PublisherId>,
    /// Last value delivered to this subscriber from the update's publisher.
    pub last_delivered: Option<&'a Value>,
}

/// Outcome of evaluating an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Accept,
    Reject(RejectReason),
}

/// Which rule rejected an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    TopicsOnly,
    ExcludedSelf,
    ExcludedPublisher,
    RemoteDisabled,
    LocalDisabled,
    Duplicate,
}

/// Evaluate an update against a subscriber's options.
pub fn evaluate(
    update: &ValueUpdate,
    options: &PubSubOptions,
    context: &SubscriberContext<'_>,
) -> Delivery {
    if options.topics_only {
        return Delivery::Reject(RejectReason::TopicsOnly);
    }
    if options.exclude_self && context.entry_publisher == Some(update.publisher) {
        return Delivery::Reject(RejectReason::ExcludedSelf);
    }
    if !options.exclude_publisher.is_none() && options.exclude_publisher == update.publisher {
        return Delivery::Reject(RejectReason::ExcludedPublisher);
    }
    if options.disable_remote && update.origin.is_remote() {
        return Delivery::Reject(RejectReason::RemoteDisabled);
    }
    if options.disable_local && update.origin.is_local() {
        return Delivery::Reject(RejectReason::LocalDisabled);
    }
    if !options.keep_duplicates && context.last_delivered == Some(&update.value) {
        return Delivery::Reject(RejectReason::Duplicate);
    }
    Delivery::Accept
}

/// Whether `update` should be delivered to the subscriber.
pub fn should_deliver(
    update: &ValueUpdate,
    options: &PubSubOptions,
    context: &SubscriberContext<'_>,
) -> bool {
    evaluate(update, options, context) == Delivery::Accept
}
