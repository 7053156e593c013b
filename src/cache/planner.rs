//! Invalidation plan generation.
//!
//! Merges a batch of events into the minimal set of actions per instance.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use super::events::{InvalidationEvent, InvalidationKind};
use super::registry::CacheName;

/// Work for one instance.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstancePlan {
    /// Supersedes every key and tag below.
    pub clear: bool,
    pub keys: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl InstancePlan {
    pub fn action_count(&self) -> usize {
        if self.clear {
            1
        } else {
            self.keys.len() + self.tags.len()
        }
    }
}

#[derive(Debug, Default)]
pub struct InvalidationPlan {
    pub instances: BTreeMap<CacheName, InstancePlan>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidationPlan {{")?;
        for (index, (name, plan)) in self.instances.iter().enumerate() {
            let sep = if index == 0 { " " } else { ", " };
            if plan.clear {
                write!(f, "{sep}{name}: clear")?;
            } else {
                write!(
                    f,
                    "{sep}{name}: {} keys {} tags",
                    plan.keys.len(),
                    plan.tags.len()
                )?;
            }
        }
        write!(f, " }}")
    }
}

impl InvalidationPlan {
    /// Deduplicates by event id and collapses per instance.
    pub fn from_events(events: Vec<InvalidationEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        for event in events.into_iter().filter(|event| seen_ids.insert(event.id)) {
            let instance = plan.instances.entry(event.kind.cache()).or_default();
            match event.kind {
                InvalidationKind::Clear { .. } => {
                    instance.clear = true;
                    instance.keys.clear();
                    instance.tags.clear();
                }
                _ if instance.clear => {}
                InvalidationKind::Key { key, .. } => {
                    instance.keys.insert(key);
                }
                InvalidationKind::Tag { tag, .. } => {
                    instance.tags.insert(tag);
                }
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.instances.values().map(InstancePlan::action_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: InvalidationKind, epoch: u64) -> InvalidationEvent {
        InvalidationEvent::new(kind, epoch)
    }

    #[test]
    fn duplicates_collapse() {
        let kind = InvalidationKind::Key {
            cache: CacheName::Patients,
            key: "patient:1".to_string(),
        };
        let first = event(kind.clone(), 0);
        let replay = first.clone();

        let plan = InvalidationPlan::from_events(vec![first, replay, event(kind, 1)]);
        assert_eq!(plan.action_count(), 1);
    }

    #[test]
    fn clear_supersedes_keys_and_tags_in_either_order() {
        let plan = InvalidationPlan::from_events(vec![
            event(
                InvalidationKind::Tag {
                    cache: CacheName::Reports,
                    tag: "monthly".to_string(),
                },
                0,
            ),
            event(
                InvalidationKind::Clear {
                    cache: CacheName::Reports,
                },
                1,
            ),
            event(
                InvalidationKind::Key {
                    cache: CacheName::Reports,
                    key: "report:x".to_string(),
                },
                2,
            ),
            event(
                InvalidationKind::Key {
                    cache: CacheName::Patients,
                    key: "patient:1".to_string(),
                },
                3,
            ),
        ]);

        let reports = &plan.instances[&CacheName::Reports];
        assert!(reports.clear);
        assert!(reports.keys.is_empty() && reports.tags.is_empty());
        assert_eq!(plan.instances[&CacheName::Patients].keys.len(), 1);
        assert_eq!(plan.action_count(), 2);
        assert_eq!(
            plan.to_string(),
            "InvalidationPlan { patients: 1 keys 0 tags, reports: clear }"
        );
    }
}
