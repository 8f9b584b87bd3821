//! Subscription policy: decides whether a subscriber receives a publisher's
//! track. Pure logic; the room consults it while building fan-out.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionPolicy {
    auto_subscribe: bool,
}

impl SubscriptionPolicy {
    pub fn new(auto_subscribe: bool) -> Self {
        SubscriptionPolicy { auto_subscribe }
    }

    /// In auto mode every subscriber receives every track; in explicit mode
    /// only tracks in the subscriber's subscription set are delivered.
    pub fn should_receive(&self, subscriber_subscriptions: &BTreeSet<String>, track_id: &str) -> bool {
        if self.auto_subscribe {
            return true;
        }
        subscriber_subscriptions.contains(track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_subscribe_receives_everything() {
        let policy = SubscriptionPolicy::new(true);
        let subs = BTreeSet::new();
        assert!(policy.should_receive(&subs, "track-1"));
    }

    #[test]
    fn test_explicit_mode_requires_membership() {
        let policy = SubscriptionPolicy::new(false);
        let mut subs = BTreeSet::new();
        assert!(!policy.should_receive(&subs, "track-1"));

        subs.insert("track-1".to_string());
        assert!(policy.should_receive(&subs, "track-1"));
        assert!(!policy.should_receive(&subs, "track-2"));
    }
}
