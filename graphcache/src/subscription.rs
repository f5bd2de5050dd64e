//! The subscription engine: per-subscription denormalized views kept current by user
//! patch handlers, folded back into the store so queries touching the same entities
//! invalidate.

use std::sync::Arc;

use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::cache::Cache;
use crate::coordinator::clear_response;
use crate::coordinator::shorten;
use crate::error::CacheError;
use crate::normalize::normalize;
use crate::store::entity_keys;
use crate::store::merge_value;
use crate::store::CacheAction;
use crate::store::CallerPath;
use crate::store::CallerWrite;
use crate::store::MergeMode;

/// Tears the user's underlying channel down. Returned by [`Subscriber::subscribe`].
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// User code owning the actual wire channel (typically a websocket). It receives the
/// subscription string, the resolved variables, and a [`PatchHandle`] to feed documents
/// back through.
pub trait Subscriber: Send + Sync {
    fn subscribe(&self, query: &str, variables: &Value, patches: PatchHandle) -> Unsubscribe;
}

#[derive(Default)]
pub struct SubscriptionOptions {
    /// Defaults to the subscription string itself.
    pub caller_id: Option<String>,
    pub variables: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct PatchOptions {
    /// Dotted path to the node the patch applies to. May be omitted when the subscription
    /// has a single top-level field.
    pub path: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PatchKind {
    Add,
    Update,
    Remove,
}

pub(crate) struct CachedSubscription {
    document: Arc<Valid<ExecutableDocument>>,
    variables: Value,
    data: Value,
    unsubscribe: Option<Unsubscribe>,
}

/// The three patch channels handed to a subscriber.
#[derive(Clone)]
pub struct PatchHandle {
    cache: Cache,
    caller_id: String,
}

impl PatchHandle {
    pub fn add(&self, document: Value, options: PatchOptions) -> Result<(), CacheError> {
        self.cache
            .apply_patch(&self.caller_id, PatchKind::Add, document, options)
    }

    pub fn update(&self, document: Value, options: PatchOptions) -> Result<(), CacheError> {
        self.cache
            .apply_patch(&self.caller_id, PatchKind::Update, document, options)
    }

    pub fn remove(&self, document: Value, options: PatchOptions) -> Result<(), CacheError> {
        self.cache
            .apply_patch(&self.caller_id, PatchKind::Remove, document, options)
    }

    /// Surfaces a channel error without tearing the subscription down.
    pub fn error(&self, error: Value) {
        self.cache
            .inner
            .store
            .dispatch(CacheAction::SetError { error });
    }
}

/// The application-facing handle of one live subscription.
pub struct SubscriptionHandle {
    cache: Cache,
    caller_id: String,
}

impl SubscriptionHandle {
    /// The current denormalized view.
    pub fn data(&self) -> Value {
        let runtime = self.cache.inner.runtime.lock();
        runtime
            .subscriptions
            .get(&self.caller_id)
            .map(|subscription| subscription.data.clone())
            .unwrap_or(Value::Null)
    }

    /// Rewrites the stored variable bag. The underlying channel is the subscriber's to
    /// re-establish; the next patches are interpreted under the new variables.
    pub fn set_variables(&self, variables: Value) {
        let path = CallerPath::new(self.caller_id.clone(), None);
        self.cache.inner.store.dispatch(CacheAction::InsertQuery {
            entities: Default::default(),
            callers: vec![CallerWrite {
                path,
                result: None,
                variables: Some(variables.clone()),
            }],
        });
        let mut runtime = self.cache.inner.runtime.lock();
        if let Some(subscription) = runtime.subscriptions.get_mut(&self.caller_id) {
            subscription.variables = variables;
        }
    }

    /// Tears the channel down and forgets the subscription.
    pub fn unsubscribe(&self) {
        let teardown = {
            let mut runtime = self.cache.inner.runtime.lock();
            runtime
                .subscriptions
                .shift_remove(&self.caller_id)
                .and_then(|subscription| subscription.unsubscribe)
        };
        if let Some(teardown) = teardown {
            teardown();
        }
        let mut runtime = self.cache.inner.runtime.lock();
        runtime
            .deps
            .remove_caller(&CallerPath::new(self.caller_id.clone(), None));
    }
}

impl Cache {
    /// Opens (or returns the already open) subscription for `caller_id`.
    pub fn subscribe(
        &self,
        subscription: &str,
        subscriber: &dyn Subscriber,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, CacheError> {
        let caller_id = options
            .caller_id
            .clone()
            .unwrap_or_else(|| subscription.to_string());
        {
            let runtime = self.inner.runtime.lock();
            if runtime.subscriptions.contains_key(&caller_id) {
                return Ok(SubscriptionHandle {
                    cache: self.clone(),
                    caller_id,
                });
            }
        }

        let document = self.parse_document(subscription)?;
        let state = self.inner.store.snapshot();
        let path = CallerPath::new(caller_id.clone(), None);
        let mut variables = Map::new();
        if let Some(Value::Object(stored)) = state.variables.get(&path.storage_key()) {
            for (name, value) in stored {
                variables.insert(name.clone(), value.clone());
            }
        }
        if let Some(Value::Object(supplied)) = &options.variables {
            for (name, value) in supplied {
                variables.insert(name.clone(), value.clone());
            }
        }
        let variables = Value::Object(variables);

        // The entry must exist before the subscriber runs: it may emit patches
        // synchronously.
        {
            let mut runtime = self.inner.runtime.lock();
            runtime.subscriptions.insert(
                caller_id.clone(),
                CachedSubscription {
                    document,
                    variables: variables.clone(),
                    data: Value::Object(Map::new()),
                    unsubscribe: None,
                },
            );
        }
        let teardown = subscriber.subscribe(
            subscription,
            &variables,
            PatchHandle {
                cache: self.clone(),
                caller_id: caller_id.clone(),
            },
        );
        {
            let mut runtime = self.inner.runtime.lock();
            if let Some(cached) = runtime.subscriptions.get_mut(&caller_id) {
                cached.unsubscribe = Some(teardown);
            }
        }
        tracing::debug!(caller = %caller_id, "subscription opened");
        Ok(SubscriptionHandle {
            cache: self.clone(),
            caller_id,
        })
    }

    fn apply_patch(
        &self,
        caller_id: &str,
        kind: PatchKind,
        document: Value,
        options: PatchOptions,
    ) -> Result<(), CacheError> {
        let (ast, variables, data) = {
            let runtime = self.inner.runtime.lock();
            let cached = runtime.subscriptions.get(caller_id).ok_or_else(|| {
                CacheError::contract(format!("patch for unknown subscription \"{caller_id}\""))
            })?;
            (
                cached.document.clone(),
                cached.variables.clone(),
                cached.data.clone(),
            )
        };
        let ctx = self.context(ast, variables.clone());

        let path = match &options.path {
            Some(path) => path.clone(),
            None => {
                let operation = ctx.operation()?;
                let mut top_fields = operation
                    .selection_set
                    .selections
                    .iter()
                    .filter_map(|selection| selection.as_field());
                let (first, second) = (top_fields.next(), top_fields.next());
                match (first, second) {
                    (Some(field), None) => field.response_key().to_string(),
                    _ => {
                        return Err(CacheError::patch(
                            "",
                            "subscription has multiple top-level fields, a patch path is required",
                        ))
                    }
                }
            }
        };

        let mut next = data;
        apply_patch_at(
            &mut next,
            &path.split('.').collect::<Vec<_>>(),
            &path,
            kind,
            &document,
            &self.inner.id_field,
        )?;

        let state = self.inner.store.snapshot();
        let normalized = normalize(&ctx, &next)?;
        let shortened = shorten(&normalized.entities, &state);
        let changed = entity_keys(&shortened);
        let caller_path = CallerPath::new(caller_id, None);

        self.inner.store.dispatch(CacheAction::InsertQuery {
            entities: shortened,
            callers: vec![CallerWrite {
                path: caller_path.clone(),
                result: Some(normalized.result.clone()),
                variables: Some(variables),
            }],
        });

        let mut runtime = self.inner.runtime.lock();
        if let Some(cached) = runtime.subscriptions.get_mut(caller_id) {
            cached.data = next;
        }
        runtime.deps.add_deps(&normalized, &caller_path);
        // Queries rendering the same entities re-denormalize on their next read.
        let affected = runtime.deps.dependents(&changed, &[&caller_path]);
        for caller in &affected {
            clear_response(&mut runtime, caller);
        }
        Ok(())
    }
}

/// Walks `target` down the dotted path and applies the patch at the final node. ADD
/// appends to arrays (or installs the document at the path), UPDATE merges by identity,
/// REMOVE deletes by identity.
fn apply_patch_at(
    target: &mut Value,
    segments: &[&str],
    full_path: &str,
    kind: PatchKind,
    document: &Value,
    id_field: &str,
) -> Result<(), CacheError> {
    let [segment, rest @ ..] = segments else {
        return Err(CacheError::patch(full_path, "empty patch path"));
    };
    let Some(object) = target.as_object_mut() else {
        return Err(CacheError::patch(
            full_path,
            format!("segment \"{segment}\" does not address an object"),
        ));
    };

    if !rest.is_empty() {
        let Some(next) = object.get_mut(*segment) else {
            return Err(CacheError::patch(
                full_path,
                format!("segment \"{segment}\" not found"),
            ));
        };
        return apply_patch_at(next, rest, full_path, kind, document, id_field);
    }

    let key = ByteString::from(*segment);
    match kind {
        PatchKind::Add => match object.get_mut(*segment) {
            Some(Value::Array(items)) => items.push(document.clone()),
            Some(existing) => merge_value(existing, document, MergeMode::Mutation),
            None => {
                object.insert(key, document.clone());
            }
        },
        PatchKind::Update => match object.get_mut(*segment) {
            Some(Value::Array(items)) => {
                let identity = document.get(id_field).cloned();
                let slot = identity.as_ref().and_then(|id| {
                    items
                        .iter_mut()
                        .find(|item| item.get(id_field) == Some(id))
                });
                match slot {
                    Some(slot) => merge_value(slot, document, MergeMode::Mutation),
                    None => {
                        return Err(CacheError::patch(
                            full_path,
                            "no element matching the document's identity",
                        ))
                    }
                }
            }
            Some(existing) => merge_value(existing, document, MergeMode::Mutation),
            None => {
                return Err(CacheError::patch(
                    full_path,
                    format!("segment \"{segment}\" not found"),
                ))
            }
        },
        PatchKind::Remove => match object.get_mut(*segment) {
            Some(Value::Array(items)) => {
                let identity = document.get(id_field).cloned();
                match identity {
                    Some(id) => items.retain(|item| item.get(id_field) != Some(&id)),
                    None => {
                        return Err(CacheError::patch(
                            full_path,
                            "remove document carries no identity",
                        ))
                    }
                }
            }
            Some(_) => {
                object.remove(*segment);
            }
            None => {
                return Err(CacheError::patch(
                    full_path,
                    format!("segment \"{segment}\" not found"),
                ))
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn add_appends_to_arrays_and_installs_elsewhere() {
        let mut data = json!({"postAdded": [{"id": "p1"}]});
        apply_patch_at(
            &mut data,
            &["postAdded"],
            "postAdded",
            PatchKind::Add,
            &json!({"id": "p2"}),
            "id",
        )
        .unwrap();
        assert_eq!(data, json!({"postAdded": [{"id": "p1"}, {"id": "p2"}]}));

        let mut empty = json!({});
        apply_patch_at(
            &mut empty,
            &["postAdded"],
            "postAdded",
            PatchKind::Add,
            &json!({"id": "p1"}),
            "id",
        )
        .unwrap();
        assert_eq!(empty, json!({"postAdded": {"id": "p1"}}));
    }

    #[test]
    fn update_merges_by_identity() {
        let mut data = json!({"posts": [{"id": "p1", "title": "Old"}, {"id": "p2", "title": "Two"}]});
        apply_patch_at(
            &mut data,
            &["posts"],
            "posts",
            PatchKind::Update,
            &json!({"id": "p1", "title": "New"}),
            "id",
        )
        .unwrap();
        assert_eq!(
            data,
            json!({"posts": [{"id": "p1", "title": "New"}, {"id": "p2", "title": "Two"}]})
        );
    }

    #[test]
    fn remove_deletes_by_identity() {
        let mut data = json!({"posts": [{"id": "p1"}, {"id": "p2"}]});
        apply_patch_at(
            &mut data,
            &["posts"],
            "posts",
            PatchKind::Remove,
            &json!({"id": "p1"}),
            "id",
        )
        .unwrap();
        assert_eq!(data, json!({"posts": [{"id": "p2"}]}));
    }

    #[test]
    fn ill_formed_paths_fail_the_patch_only() {
        let mut data = json!({"posts": []});
        let error = apply_patch_at(
            &mut data,
            &["nope", "deeper"],
            "nope.deeper",
            PatchKind::Update,
            &json!({"id": "p1"}),
            "id",
        )
        .unwrap_err();
        assert!(matches!(error, CacheError::Patch { .. }));
        // The data is untouched.
        assert_eq!(data, json!({"posts": []}));
    }

    #[test]
    fn nested_paths_navigate_objects() {
        let mut data = json!({"userEvents": {"posts": [{"id": "p1"}]}});
        apply_patch_at(
            &mut data,
            &["userEvents", "posts"],
            "userEvents.posts",
            PatchKind::Add,
            &json!({"id": "p2"}),
            "id",
        )
        .unwrap();
        assert_eq!(
            data,
            json!({"userEvents": {"posts": [{"id": "p1"}, {"id": "p2"}]}})
        );
    }
}
