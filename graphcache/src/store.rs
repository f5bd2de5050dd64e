//! The persisted cache slice, its typed actions, and the pure reducer.
//!
//! The slice itself is owned by the host application's state container; the core only ever
//! reads snapshots of it and writes through dispatched [`CacheAction`]s. [`MemoryStore`] is
//! the reference container for hosts that do not bring their own.

use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

/// Field name marking a reference to a normalized entity, e.g. `{"__ref": "User.1"}`.
pub const REF_KEY: &str = "__ref";

/// Identity of a normalized entity: `(typeName, idValue)`.
///
/// Derived structures refer to entities exclusively through this key, never through
/// pointers into entity bodies, so cyclic references are free.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub type_name: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// Parses `"Type.id"`. Type names cannot contain dots; ids may, so the split is at the
    /// first dot.
    pub fn parse(raw: &str) -> Option<Self> {
        let (type_name, id) = raw.split_once('.')?;
        if type_name.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(type_name, id))
    }

    /// Extracts the key out of a `{"__ref": "Type.id"}` marker object.
    pub fn from_ref(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        Self::parse(object.get(REF_KEY)?.as_str()?)
    }

    /// The `{"__ref": "Type.id"}` marker stored in result skeletons and entity bodies.
    pub fn to_ref(&self) -> Value {
        let mut object = serde_json_bytes::Map::new();
        object.insert(
            ByteString::from(REF_KEY),
            Value::String(ByteString::from(self.to_string())),
        );
        Value::Object(object)
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.id)
    }
}

/// A logical query consumer: `(callerId, instanceKey?)` uniquely names a denormalized
/// response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerPath {
    pub caller_id: String,
    pub instance_key: Option<String>,
}

impl CallerPath {
    pub fn new(caller_id: impl Into<String>, instance_key: Option<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            instance_key,
        }
    }

    /// Key under which this caller's skeleton and variables are stored in the slice.
    pub fn storage_key(&self) -> String {
        match &self.instance_key {
            Some(instance) => format!("{}.{}", self.caller_id, instance),
            None => self.caller_id.clone(),
        }
    }
}

impl Display for CallerPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// `typeName → idValue → entity body`.
pub type Entities = IndexMap<String, IndexMap<String, Value>>;

/// Output of a normalization walk: flat entities plus the result skeleton with
/// `{"__ref": ...}` markers in leaf positions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedResponse {
    pub entities: Entities,
    pub result: Value,
}

impl NormalizedResponse {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.result.is_null()
    }

    /// Every `(type, id)` present in `entities`.
    pub fn entity_keys(&self) -> IndexSet<EntityKey> {
        entity_keys(&self.entities)
    }
}

pub(crate) fn entity_keys(entities: &Entities) -> IndexSet<EntityKey> {
    entities
        .iter()
        .flat_map(|(type_name, bodies)| {
            bodies
                .keys()
                .map(move |id| EntityKey::new(type_name.clone(), id.clone()))
        })
        .collect()
}

/// The persisted slice: `{ error, data: { entities, result, variables } }` on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "PersistedState", into = "PersistedState")]
pub struct CacheState {
    pub entities: Entities,
    /// Caller storage key → denormalized skeleton with references at leaf positions.
    pub result: IndexMap<String, Value>,
    /// Caller storage key → variable bag.
    pub variables: IndexMap<String, Value>,
    /// Last transport error, if any.
    pub error: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    error: Option<Value>,
    data: PersistedData,
}

#[derive(Serialize, Deserialize)]
struct PersistedData {
    entities: Entities,
    result: IndexMap<String, Value>,
    variables: IndexMap<String, Value>,
}

impl From<PersistedState> for CacheState {
    fn from(persisted: PersistedState) -> Self {
        Self {
            entities: persisted.data.entities,
            result: persisted.data.result,
            variables: persisted.data.variables,
            error: persisted.error,
        }
    }
}

impl From<CacheState> for PersistedState {
    fn from(state: CacheState) -> Self {
        Self {
            error: state.error,
            data: PersistedData {
                entities: state.entities,
                result: state.result,
                variables: state.variables,
            },
        }
    }
}

/// Per-caller write carried by an insert action. `result: None` updates variables without
/// touching the caller's skeleton.
#[derive(Clone, Debug)]
pub struct CallerWrite {
    pub path: CallerPath,
    pub result: Option<Value>,
    pub variables: Option<Value>,
}

/// The three action kinds the reducer understands. Action names are namespaced literals so
/// host-side logging cannot confuse them with host actions.
#[derive(Clone, Debug)]
pub enum CacheAction {
    InsertQuery {
        entities: Entities,
        callers: Vec<CallerWrite>,
    },
    InsertMutation {
        entities: Entities,
        callers: Vec<CallerWrite>,
    },
    SetError {
        error: Value,
    },
}

impl CacheAction {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheAction::InsertQuery { .. } => "graphcache/insert-query",
            CacheAction::InsertMutation { .. } => "graphcache/insert-mutation",
            CacheAction::SetError { .. } => "graphcache/set-error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MergeMode {
    /// Scalar leaves are last-write-wins, arrays replace within their bucket.
    Query,
    /// Incoming arrays are authoritative replacements even for query-populated buckets.
    Mutation,
}

/// Pure state transition. All non-pure cache work lives in the coordinator.
pub fn reduce(state: &CacheState, action: &CacheAction) -> CacheState {
    let mut next = state.clone();
    match action {
        CacheAction::InsertQuery { entities, callers } => {
            merge_entities(&mut next.entities, entities, MergeMode::Query);
            apply_caller_writes(&mut next, callers, MergeMode::Query);
            next.error = None;
        }
        CacheAction::InsertMutation { entities, callers } => {
            merge_entities(&mut next.entities, entities, MergeMode::Mutation);
            apply_caller_writes(&mut next, callers, MergeMode::Mutation);
        }
        CacheAction::SetError { error } => {
            next.error = Some(error.clone());
        }
    }
    next
}

/// Skeletons deep-merge so different argument buckets of one caller coexist; variable
/// bags replace wholesale.
fn apply_caller_writes(state: &mut CacheState, callers: &[CallerWrite], mode: MergeMode) {
    for write in callers {
        let key = write.path.storage_key();
        if let Some(result) = &write.result {
            match state.result.get_mut(&key) {
                Some(existing) => merge_value(existing, result, mode),
                None => {
                    state.result.insert(key.clone(), result.clone());
                }
            }
        }
        if let Some(variables) = &write.variables {
            state.variables.insert(key, variables.clone());
        }
    }
}

pub(crate) fn merge_entities(into: &mut Entities, from: &Entities, mode: MergeMode) {
    for (type_name, bodies) in from {
        let slot = into.entry(type_name.clone()).or_default();
        for (id, body) in bodies {
            match slot.get_mut(id) {
                Some(existing) => merge_value(existing, body, mode),
                None => {
                    slot.insert(id.clone(), body.clone());
                }
            }
        }
    }
}

/// Deep merge. Objects merge key-wise; arrays replace (page stitching happens before
/// dispatch, in the coordinator); everything else is last-write-wins.
pub(crate) fn merge_value(into: &mut Value, from: &Value, mode: MergeMode) {
    match (into, from) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming.iter() {
                match existing.get_mut(key.as_str()) {
                    Some(slot) => merge_value(slot, value, mode),
                    None => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, incoming) => {
            *slot = incoming.clone();
        }
    }
}

/// The host-side observable state container. The core reads the slice through
/// [`StateContainer::snapshot`] and mutates it only via [`StateContainer::dispatch`].
pub trait StateContainer: Send + Sync {
    fn dispatch(&self, action: CacheAction);
    fn snapshot(&self) -> Arc<CacheState>;
}

/// Reducer-backed in-memory container for hosts without their own store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<Arc<CacheState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateContainer for MemoryStore {
    fn dispatch(&self, action: CacheAction) {
        tracing::trace!(action = action.kind(), "dispatching cache action");
        let mut guard = self.state.write();
        *guard = Arc::new(reduce(&guard, &action));
    }

    fn snapshot(&self) -> Arc<CacheState> {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn entities_with(type_name: &str, id: &str, body: Value) -> Entities {
        let mut entities = Entities::default();
        entities
            .entry(type_name.to_string())
            .or_default()
            .insert(id.to_string(), body);
        entities
    }

    #[test]
    fn entity_key_ref_round_trip() {
        let key = EntityKey::new("User", "1");
        assert_eq!(key.to_string(), "User.1");
        assert_eq!(EntityKey::from_ref(&key.to_ref()), Some(key));
        // Ids may contain dots; type names may not.
        let dotted = EntityKey::parse("Doc.a.b").unwrap();
        assert_eq!(dotted.id, "a.b");
        assert_eq!(EntityKey::parse("justastring"), None);
    }

    #[test]
    fn insert_query_merges_scalars_last_write_wins() {
        let state = reduce(
            &CacheState::default(),
            &CacheAction::InsertQuery {
                entities: entities_with("User", "1", json!({"id": "1", "name": "Ada"})),
                callers: vec![],
            },
        );
        let state = reduce(
            &state,
            &CacheAction::InsertQuery {
                entities: entities_with("User", "1", json!({"name": "Grace", "email": "g@x.io"})),
                callers: vec![],
            },
        );
        assert_eq!(
            state.entities["User"]["1"],
            json!({"id": "1", "name": "Grace", "email": "g@x.io"})
        );
    }

    #[test]
    fn merging_twice_equals_merging_once() {
        let incoming = entities_with("User", "1", json!({"id": "1", "tags": ["a", "b"]}));
        let action = CacheAction::InsertQuery {
            entities: incoming,
            callers: vec![],
        };
        let once = reduce(&CacheState::default(), &action);
        let twice = reduce(&once, &action);
        assert_eq!(once.entities, twice.entities);
        assert_eq!(once.result, twice.result);
    }

    #[test]
    fn mutation_mode_replaces_arrays() {
        let state = reduce(
            &CacheState::default(),
            &CacheAction::InsertQuery {
                entities: entities_with("User", "1", json!({"posts": [{"__ref": "Post.1"}]})),
                callers: vec![],
            },
        );
        let state = reduce(
            &state,
            &CacheAction::InsertMutation {
                entities: entities_with("User", "1", json!({"posts": [{"__ref": "Post.2"}]})),
                callers: vec![],
            },
        );
        assert_eq!(
            state.entities["User"]["1"],
            json!({"posts": [{"__ref": "Post.2"}]})
        );
    }

    #[test]
    fn set_error_touches_nothing_else_and_insert_clears_it() {
        let populated = reduce(
            &CacheState::default(),
            &CacheAction::InsertQuery {
                entities: entities_with("User", "1", json!({"id": "1"})),
                callers: vec![CallerWrite {
                    path: CallerPath::new("c", None),
                    result: Some(json!({"user": {"__ref": "User.1"}})),
                    variables: Some(json!({"id": "1"})),
                }],
            },
        );
        let errored = reduce(
            &populated,
            &CacheAction::SetError {
                error: json!({"message": "boom"}),
            },
        );
        assert_eq!(errored.entities, populated.entities);
        assert_eq!(errored.result, populated.result);
        assert_eq!(errored.error, Some(json!({"message": "boom"})));

        let recovered = reduce(
            &errored,
            &CacheAction::InsertQuery {
                entities: Entities::default(),
                callers: vec![],
            },
        );
        assert_eq!(recovered.error, None);
    }

    #[test]
    fn variables_only_write_keeps_skeleton() {
        let state = reduce(
            &CacheState::default(),
            &CacheAction::InsertQuery {
                entities: Entities::default(),
                callers: vec![CallerWrite {
                    path: CallerPath::new("c", None),
                    result: Some(json!({"user": {"__ref": "User.1"}})),
                    variables: None,
                }],
            },
        );
        let state = reduce(
            &state,
            &CacheAction::InsertQuery {
                entities: Entities::default(),
                callers: vec![CallerWrite {
                    path: CallerPath::new("c", None),
                    result: None,
                    variables: Some(json!({"count": 5})),
                }],
            },
        );
        assert_eq!(state.result["c"], json!({"user": {"__ref": "User.1"}}));
        assert_eq!(state.variables["c"], json!({"count": 5}));
    }

    #[test]
    fn caller_skeletons_merge_across_argument_buckets() {
        let write = |result: Value| CacheAction::InsertQuery {
            entities: Entities::default(),
            callers: vec![CallerWrite {
                path: CallerPath::new("c", None),
                result: Some(result),
                variables: None,
            }],
        };
        let state = reduce(
            &CacheState::default(),
            &write(json!({r#"user(id:"u1")"#: {"__ref": "User.u1"}})),
        );
        let state = reduce(
            &state,
            &write(json!({r#"user(id:"u2")"#: {"__ref": "User.u2"}})),
        );
        assert_eq!(
            state.result["c"],
            json!({
                r#"user(id:"u1")"#: {"__ref": "User.u1"},
                r#"user(id:"u2")"#: {"__ref": "User.u2"},
            })
        );
    }

    #[test]
    fn persisted_layout_nests_data() {
        let mut state = CacheState::default();
        state.entities = entities_with("User", "1", json!({"id": "1"}));
        state.error = None;
        let serialized = serde_json::to_string(&state).unwrap();
        assert!(serialized.contains("\"data\""));
        assert!(serialized.contains("\"entities\""));
        let back: CacheState = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back.entities, state.entities);
    }
}
