//! The cache handle: explicit per-host construction, no module-level state.
//!
//! A [`Cache`] is cheaply cloneable; all coordinator-owned maps live behind one mutex that
//! is never held across an await. The persisted slice is owned by the host's
//! [`StateContainer`] and only read through snapshots.

use std::sync::Arc;

use apollo_compiler::ast::OperationType;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Schema;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json_bytes::Value;

use crate::context::PaginationWords;
use crate::context::QueryContext;
use crate::deps::DependencyIndex;
use crate::error::CacheError;
use crate::mutation::CachedMutation;
use crate::mutation::MutationHandler;
use crate::store::CacheState;
use crate::store::CallerPath;
use crate::store::StateContainer;
use crate::subscription::CachedSubscription;
use crate::transport::Transport;

/// Binds the core to its collaborators. One of these per host application.
pub struct CacheConfig {
    /// The external state container providing dispatch and snapshots.
    pub store: Arc<dyn StateContainer>,
    /// Default transport for queries and mutations.
    pub transport: Arc<dyn Transport>,
    /// Overrides `transport` when present (e.g. a websocket that also carries queries).
    pub priority_transport: Option<Arc<dyn Transport>>,
    /// Introspection result used for type lookups and union/interface resolution.
    pub schema: Valid<Schema>,
    /// Renames of the four reserved cursor argument names.
    pub pagination_words: PaginationWords,
    /// Identity field per entity.
    pub id_field: String,
    /// Field holding an element's pagination cursor.
    pub cursor_field: String,
}

impl CacheConfig {
    pub fn new(
        store: Arc<dyn StateContainer>,
        transport: Arc<dyn Transport>,
        schema: Valid<Schema>,
    ) -> Self {
        Self {
            store,
            transport,
            priority_transport: None,
            schema,
            pagination_words: PaginationWords::default(),
            id_field: "id".to_string(),
            cursor_field: "cursor".to_string(),
        }
    }
}

/// A denormalized response as seen by one caller.
///
/// Response objects are replaced wholesale (never mutated in place) whenever their content
/// may have changed, so hosts comparing by `Arc::ptr_eq` observe every change.
#[derive(Clone, Debug, Default)]
pub struct QueryResponse {
    pub data: Value,
    pub is_complete: bool,
    pub first_run: bool,
    pub error: Option<Value>,
}

/// An in-memory cached query: the parsed document plus one response per instance key.
pub(crate) struct CachedQuery {
    pub(crate) query: String,
    pub(crate) document: Arc<Valid<ExecutableDocument>>,
    pub(crate) responses: IndexMap<Option<String>, Arc<QueryResponse>>,
}

/// One in-flight server request, keyed by its minimized query string, with the callers
/// waiting on it in join order.
#[derive(Default)]
pub(crate) struct PendingQuery {
    pub(crate) waiters: Vec<Waiter>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Waiter {
    pub(crate) path: CallerPath,
    pub(crate) variables: Value,
}

pub(crate) struct RegisteredHandler {
    pub(crate) handler: Arc<dyn MutationHandler>,
    pub(crate) instance_key: Option<String>,
}

/// Everything the core owns itself, guarded by one mutex.
#[derive(Default)]
pub(crate) struct Runtime {
    pub(crate) queries: IndexMap<String, CachedQuery>,
    pub(crate) mutations: IndexMap<String, CachedMutation>,
    pub(crate) subscriptions: IndexMap<String, CachedSubscription>,
    pub(crate) deps: DependencyIndex,
    pub(crate) pending: IndexMap<String, PendingQuery>,
    /// Mutation name → caller id → handler.
    pub(crate) handlers: IndexMap<String, IndexMap<String, RegisteredHandler>>,
}

pub(crate) struct CacheInner {
    pub(crate) store: Arc<dyn StateContainer>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) priority_transport: Option<Arc<dyn Transport>>,
    pub(crate) schema: Arc<Valid<Schema>>,
    pub(crate) pagination_words: PaginationWords,
    pub(crate) id_field: String,
    pub(crate) cursor_field: String,
    pub(crate) runtime: Mutex<Runtime>,
}

#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        if config.schema.root_operation(OperationType::Query).is_none() {
            return Err(CacheError::configuration(
                "schema does not define a query root type",
            ));
        }
        Ok(Self {
            inner: Arc::new(CacheInner {
                store: config.store,
                transport: config.transport,
                priority_transport: config.priority_transport,
                schema: Arc::new(config.schema),
                pagination_words: config.pagination_words,
                id_field: config.id_field,
                cursor_field: config.cursor_field,
                runtime: Mutex::new(Runtime::default()),
            }),
        })
    }

    /// Current snapshot of the persisted slice.
    pub fn state(&self) -> Arc<CacheState> {
        self.inner.store.snapshot()
    }

    /// The cached response of a caller, if any.
    pub fn read(&self, caller_id: &str, instance_key: Option<&str>) -> Option<Arc<QueryResponse>> {
        let runtime = self.inner.runtime.lock();
        runtime
            .queries
            .get(caller_id)?
            .responses
            .get(&instance_key.map(str::to_string))
            .cloned()
    }

    /// Drops a caller entirely: its cached query, dependency edges, and registered
    /// mutation handlers. The persisted skeleton is left in place; it is unreachable
    /// without the caller and harmless.
    pub fn forget(&self, caller_id: &str) {
        let mut runtime = self.inner.runtime.lock();
        let removed = runtime.queries.shift_remove(caller_id);
        if let Some(removed) = removed {
            let instances: Vec<Option<String>> = removed.responses.keys().cloned().collect();
            for instance_key in instances {
                runtime
                    .deps
                    .remove_caller(&CallerPath::new(caller_id, instance_key));
            }
        }
        for callers in runtime.handlers.values_mut() {
            callers.shift_remove(caller_id);
        }
        for mutation in runtime.mutations.values_mut() {
            if mutation.active.contains_key(caller_id) {
                mutation.clear_merged();
            }
        }
    }

    pub(crate) fn context(
        &self,
        document: Arc<Valid<ExecutableDocument>>,
        variables: Value,
    ) -> QueryContext {
        QueryContext {
            document,
            schema: self.inner.schema.clone(),
            operation_name: None,
            variables,
            pagination_words: self.inner.pagination_words.clone(),
            id_field: self.inner.id_field.clone(),
            cursor_field: self.inner.cursor_field.clone(),
        }
    }

    pub(crate) fn parse_document(
        &self,
        source: &str,
    ) -> Result<Arc<Valid<ExecutableDocument>>, CacheError> {
        ExecutableDocument::parse_and_validate(&self.inner.schema, source, "operation.graphql")
            .map(Arc::new)
            .map_err(CacheError::document)
    }

    pub(crate) fn select_transport(&self) -> Arc<dyn Transport> {
        self.inner
            .priority_transport
            .clone()
            .unwrap_or_else(|| self.inner.transport.clone())
    }
}
