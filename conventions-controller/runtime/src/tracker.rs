//! Maps collaborator objects (secrets, service accounts) to the intents that
//! consulted them, so a collaborator change requeues exactly its dependents.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use conventions_controller_k8s_api::intent::PodIntent;
use kube::runtime::reflector::ObjectRef;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Secret,
    ServiceAccount,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

/// Process-global, shared across reconciliations.
#[derive(Clone, Debug, Default)]
pub struct Tracker(Arc<RwLock<Inner>>);

#[derive(Debug, Default)]
struct Inner {
    by_key: HashMap<Key, HashSet<ObjectRef<PodIntent>>>,
    by_intent: HashMap<ObjectRef<PodIntent>, HashSet<Key>>,
}

// === impl Key ===

impl Key {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

// === impl Tracker ===

impl Tracker {
    pub fn track(&self, key: Key, intent: ObjectRef<PodIntent>) {
        let mut inner = self.0.write();
        inner
            .by_intent
            .entry(intent.clone())
            .or_default()
            .insert(key.clone());
        inner.by_key.entry(key).or_default().insert(intent);
    }

    /// Drops an intent's tracked keys; called at the start of each
    /// reconciliation so stale edges do not keep requeuing it.
    pub fn clear(&self, intent: &ObjectRef<PodIntent>) {
        let mut inner = self.0.write();
        let Some(keys) = inner.by_intent.remove(intent) else {
            return;
        };
        for key in keys {
            if let Some(intents) = inner.by_key.get_mut(&key) {
                intents.remove(intent);
                if intents.is_empty() {
                    inner.by_key.remove(&key);
                }
            }
        }
    }

    /// The intents to requeue when the keyed object changes.
    pub fn tracked_by(&self, key: &Key) -> Vec<ObjectRef<PodIntent>> {
        self.0
            .read()
            .by_key
            .get(key)
            .map(|intents| intents.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(namespace: &str, name: &str) -> ObjectRef<PodIntent> {
        ObjectRef::new(name).within(namespace)
    }

    #[test]
    fn tracked_objects_map_back_to_intents() {
        let tracker = Tracker::default();
        let key = Key::new(Kind::Secret, "apps", "regcred");
        tracker.track(key.clone(), intent("apps", "a"));
        tracker.track(key.clone(), intent("apps", "b"));

        let mut tracked = tracker.tracked_by(&key);
        tracked.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].name, "a");
        assert_eq!(tracked[1].name, "b");
    }

    #[test]
    fn clear_removes_only_that_intents_edges() {
        let tracker = Tracker::default();
        let key = Key::new(Kind::ServiceAccount, "apps", "default");
        tracker.track(key.clone(), intent("apps", "a"));
        tracker.track(key.clone(), intent("apps", "b"));

        tracker.clear(&intent("apps", "a"));
        let tracked = tracker.tracked_by(&key);
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].name, "b");
    }

    #[test]
    fn untracked_keys_requeue_nothing() {
        let tracker = Tracker::default();
        assert!(tracker
            .tracked_by(&Key::new(Kind::Secret, "apps", "absent"))
            .is_empty());
    }

    #[test]
    fn retracking_replaces_prior_edges() {
        let tracker = Tracker::default();
        let old = Key::new(Kind::Secret, "apps", "old-secret");
        tracker.track(old.clone(), intent("apps", "a"));

        // A later reconciliation consults a different secret.
        tracker.clear(&intent("apps", "a"));
        let new = Key::new(Kind::Secret, "apps", "new-secret");
        tracker.track(new.clone(), intent("apps", "a"));

        assert!(tracker.tracked_by(&old).is_empty());
        assert_eq!(tracker.tracked_by(&new).len(), 1);
    }
}
