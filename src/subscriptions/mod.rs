//! Subscription delivery.
//!
//! This module holds the per-subscriber pieces of the delivery engine:
//! - [`policy`]: the pure accept/reject decision for a value update
//! - [`SubscriptionQueue`]: bounded buffer of accepted updates
//! - [`TopicListeners`]: in-process topic lifecycle notifications
//!
//! # Example
//!
//! ```ignore
//! let options = PubSubOptions::from_directives(&[PubSubOption::SendAll(true)]);
//! let queue = SubscriptionQueue::from_options(&options);
//!
//! if should_deliver(&update, &options, &SubscriberContext::default()) {
//!     queue.enqueue(update);
//! }
//! for update in queue.drain() {
//!     println!("{} = {:?}", update.name, update.value);
//! }
//! ```

mod listener;
pub mod policy;
mod queue;

pub use listener::{TopicEvent, TopicListenerConfig, TopicListenerHandle, TopicListeners};
pub use policy::{evaluate, should_deliver, Delivery, RejectReason, SubscriberContext};
pub use queue::{Admission, QueueMode, SubscriptionQueue};
