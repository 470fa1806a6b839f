//! Mapping from correlation id to live resources.

use std::collections::HashMap;
use std::sync::Arc;

use super::counter::CounterInner;
use super::publication::PublicationInner;
use super::subscription::SubscriptionInner;

/// Tagged sum over the resource kinds the registry tracks.
#[derive(Clone)]
pub(crate) enum Resource {
    SharedPublication(Arc<PublicationInner>),
    ExclusivePublication(Arc<PublicationInner>),
    Subscription(Arc<SubscriptionInner>),
    Counter(Arc<CounterInner>),
}

/// Registry of driver-acknowledged resources, keyed by the correlation id of
/// the request that created each one.
#[derive(Default)]
pub(crate) struct ResourceRegistry {
    by_registration_id: HashMap<i64, Resource>,
}

impl ResourceRegistry {
    /// Insert the result of an accepted driver event. Called exactly once
    /// per acknowledgement; a duplicate replaces and is reported.
    pub(crate) fn register_result(&mut self, correlation_id: i64, resource: Resource) {
        if self
            .by_registration_id
            .insert(correlation_id, resource)
            .is_some()
        {
            tracing::warn!(correlation_id, "duplicate registration replaced");
        }
    }

    pub(crate) fn get(&self, correlation_id: i64) -> Option<&Resource> {
        self.by_registration_id.get(&correlation_id)
    }

    pub(crate) fn remove(&mut self, correlation_id: i64) -> Option<Resource> {
        self.by_registration_id.remove(&correlation_id)
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Resource> {
        self.by_registration_id.values()
    }

    pub(crate) fn drain(&mut self) -> Vec<Resource> {
        self.by_registration_id.drain().map(|(_, r)| r).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_registration_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_registration_id.is_empty()
    }
}
