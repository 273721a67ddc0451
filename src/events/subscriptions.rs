//! Subscription storage indexed by user and by event type

use super::model::{EventSubscription, RealTimeEvent};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    subscriptions: HashMap<String, EventSubscription>,
    by_user: HashMap<String, Vec<String>>,
    /// Subscription ids per event type, in subscription order
    by_type: HashMap<String, Vec<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscription: EventSubscription) {
        let id = subscription.id.clone();
        self.by_user
            .entry(subscription.user_id.clone())
            .or_default()
            .push(id.clone());
        for event_type in &subscription.event_types {
            let ids = self.by_type.entry(event_type.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        self.subscriptions.insert(id, subscription);
    }

    pub fn remove(&mut self, id: &str) -> Option<EventSubscription> {
        let subscription = self.subscriptions.remove(id)?;

        if let Some(ids) = self.by_user.get_mut(&subscription.user_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_user.remove(&subscription.user_id);
            }
        }
        for event_type in &subscription.event_types {
            if let Some(ids) = self.by_type.get_mut(event_type) {
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    self.by_type.remove(event_type);
                }
            }
        }
        Some(subscription)
    }

    pub fn get(&self, id: &str) -> Option<&EventSubscription> {
        self.subscriptions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut EventSubscription> {
        self.subscriptions.get_mut(id)
    }

    pub fn for_user(&self, user_id: &str) -> Vec<EventSubscription> {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.subscriptions.get(id))
            .cloned()
            .collect()
    }

    /// Subscriptions that currently match the event, in subscription order
    pub fn matching(&self, event: &RealTimeEvent, now: i64) -> Vec<EventSubscription> {
        self.by_type
            .get(&event.event_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.subscriptions.get(id))
            .filter(|sub| sub.matches(event, now))
            .cloned()
            .collect()
    }

    pub fn active_count(&self, now: i64) -> usize {
        self.subscriptions
            .values()
            .filter(|sub| sub.is_active && !sub.is_expired(now))
            .count()
    }

    /// Remove expired subscriptions, returning them
    pub fn purge_expired(&mut self, now: i64) -> Vec<EventSubscription> {
        let expired: Vec<String> = self
            .subscriptions
            .values()
            .filter(|sub| sub.is_expired(now))
            .map(|sub| sub.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{EventSource, NewEvent, SubscriptionRequest};
    use serde_json::Value;

    fn subscribe(index: &mut SubscriptionIndex, user: &str, types: &[&str]) -> String {
        let sub = EventSubscription::from_request(SubscriptionRequest::new(
            user,
            "device",
            types.iter().copied(),
        ));
        let id = sub.id.clone();
        index.insert(sub);
        id
    }

    fn event(event_type: &str) -> RealTimeEvent {
        NewEvent::new(event_type, EventSource::user("alice"), Value::Null).into_event()
    }

    #[test]
    fn test_matching_by_type() {
        let mut index = SubscriptionIndex::new();
        let a = subscribe(&mut index, "alice", &["file_changed"]);
        let b = subscribe(&mut index, "bob", &["file_changed", "presence"]);
        subscribe(&mut index, "carol", &["presence"]);

        let ids: Vec<String> = index
            .matching(&event("file_changed"), 0)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_remove_cleans_indexes() {
        let mut index = SubscriptionIndex::new();
        let id = subscribe(&mut index, "alice", &["presence"]);

        assert!(index.remove(&id).is_some());
        assert!(index.remove(&id).is_none());
        assert!(index.for_user("alice").is_empty());
        assert!(index.matching(&event("presence"), 0).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let mut index = SubscriptionIndex::new();
        let mut sub = EventSubscription::from_request(SubscriptionRequest::new(
            "alice",
            "phone",
            ["presence"],
        ));
        sub.expires_at = Some(100);
        index.insert(sub);
        subscribe(&mut index, "alice", &["presence"]);

        assert_eq!(index.active_count(200), 1);
        assert_eq!(index.purge_expired(200).len(), 1);
        assert_eq!(index.len(), 1);
    }
}
