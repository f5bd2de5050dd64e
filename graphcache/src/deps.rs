//! Bidirectional map between entities and the callers that render them.
//!
//! Both directions are kept as exact inverses: `key ∈ normalized[caller]` iff
//! `caller ∈ denormalized[key]`. The denormalized direction drives invalidation, the
//! normalized direction makes edge diffing cheap when a caller's footprint changes.

use indexmap::IndexMap;
use indexmap::IndexSet;

use crate::store::CallerPath;
use crate::store::EntityKey;
use crate::store::NormalizedResponse;

#[derive(Debug, Default)]
pub struct DependencyIndex {
    normalized: IndexMap<CallerPath, IndexSet<EntityKey>>,
    denormalized: IndexMap<EntityKey, IndexSet<CallerPath>>,
}

impl DependencyIndex {
    /// Re-subscribes a caller to exactly the entities present in `response`: new edges are
    /// added to both maps, obsolete edges removed from both.
    pub fn add_deps(&mut self, response: &NormalizedResponse, caller: &CallerPath) {
        let next = response.entity_keys();
        let previous = self.normalized.get(caller).cloned().unwrap_or_default();

        for removed in previous.difference(&next) {
            if let Some(callers) = self.denormalized.get_mut(removed) {
                callers.shift_remove(caller);
                if callers.is_empty() {
                    self.denormalized.shift_remove(removed);
                }
            }
        }
        for added in next.difference(&previous) {
            self.denormalized
                .entry(added.clone())
                .or_default()
                .insert(caller.clone());
        }
        if next.is_empty() {
            self.normalized.shift_remove(caller);
        } else {
            self.normalized.insert(caller.clone(), next);
        }
    }

    /// Every caller subscribed to any of `changed`, except the excluded ones (the origin
    /// of the change replaces its own response in the same pass and must not be flushed).
    pub fn dependents(
        &self,
        changed: &IndexSet<EntityKey>,
        excluded: &[&CallerPath],
    ) -> IndexSet<CallerPath> {
        let mut affected = IndexSet::new();
        for key in changed {
            let Some(callers) = self.denormalized.get(key) else {
                continue;
            };
            for caller in callers {
                if !excluded.contains(&caller) {
                    affected.insert(caller.clone());
                }
            }
        }
        affected
    }

    /// Drops every edge touching the caller, in both directions.
    pub fn remove_caller(&mut self, caller: &CallerPath) {
        let Some(keys) = self.normalized.shift_remove(caller) else {
            return;
        };
        for key in &keys {
            if let Some(callers) = self.denormalized.get_mut(key) {
                callers.shift_remove(caller);
                if callers.is_empty() {
                    self.denormalized.shift_remove(key);
                }
            }
        }
    }

    pub fn dependencies_of(&self, caller: &CallerPath) -> Option<&IndexSet<EntityKey>> {
        self.normalized.get(caller)
    }

    pub fn callers_of(&self, key: &EntityKey) -> Option<&IndexSet<CallerPath>> {
        self.denormalized.get(key)
    }

    /// Checks that the two directions are exact inverses of each other.
    #[cfg(test)]
    fn is_symmetric(&self) -> bool {
        self.normalized.iter().all(|(caller, keys)| {
            keys.iter().all(|key| {
                self.denormalized
                    .get(key)
                    .is_some_and(|callers| callers.contains(caller))
            })
        }) && self.denormalized.iter().all(|(key, callers)| {
            callers.iter().all(|caller| {
                self.normalized
                    .get(caller)
                    .is_some_and(|keys| keys.contains(key))
            })
        })
    }
}
