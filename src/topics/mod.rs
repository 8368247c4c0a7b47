//! The table namespace: topics and the publishers and subscribers bound to
//! them.

mod registry;

pub use registry::{
    merge_properties, CurrentValue, FanOut, Owner, Publisher, PublisherRelease, Subscriber,
    Topic, TopicInfo, TopicRegistry,
};
