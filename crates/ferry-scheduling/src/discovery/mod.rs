//! Service discovery that notifies a receiver about backend instances.

mod dns;
mod ring;

use std::collections::HashMap;

pub use dns::DnsServiceDiscovery;
pub use ring::{
    select_in_use_instances, InMemoryRing, MemberState, Ring, RingLifecycler, RingMember,
    RingServiceDiscovery,
};

/// A discovered backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    pub address: String,
    /// Whether the instance should receive a full share of the work.
    pub in_use: bool,
}

impl Instance {
    pub fn new(address: impl Into<String>, in_use: bool) -> Self {
        Self {
            address: address.into(),
            in_use,
        }
    }
}

/// Receives instance changes from a service discovery.
/// The methods are called one at a time and never concurrently.
#[tonic::async_trait]
pub trait Notifications: Send + Sync {
    async fn instance_added(&self, instance: Instance);
    async fn instance_removed(&self, instance: Instance);
    async fn instance_changed(&self, instance: Instance);
}

/// Notifies the receiver about the difference between two instance sets keyed by address.
/// Additions are notified first, then changes of the in-use flag, then removals.
pub(crate) async fn notify_changes(
    receiver: &dyn Notifications,
    old: &HashMap<String, Instance>,
    new: &HashMap<String, Instance>,
) {
    for (address, instance) in new {
        if !old.contains_key(address) {
            receiver.instance_added(instance.clone()).await;
        }
    }
    for (address, instance) in new {
        if let Some(previous) = old.get(address) {
            if previous.in_use != instance.in_use {
                receiver.instance_changed(instance.clone()).await;
            }
        }
    }
    for (address, instance) in old {
        if !new.contains_key(address) {
            receiver.instance_removed(instance.clone()).await;
        }
    }
}
