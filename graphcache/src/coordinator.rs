//! The query coordinator: fast path from the in-memory cache, cold path through
//! denormalization, minimization, the pending-query dedupe, and the post-await merge.

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::cache::Cache;
use crate::cache::CachedQuery;
use crate::cache::PendingQuery;
use crate::cache::QueryResponse;
use crate::cache::RegisteredHandler;
use crate::cache::Runtime;
use crate::cache::Waiter;
use crate::context::QueryContext;
use crate::denormalize::denormalize;
use crate::error::CacheError;
use crate::minimize::minimize;
use crate::minimize::whole_query;
use crate::mutation::MutationHandler;
use crate::normalize::normalize;
use crate::store::entity_keys;
use crate::store::CacheAction;
use crate::store::CacheState;
use crate::store::CallerPath;
use crate::store::CallerWrite;
use crate::store::Entities;
use crate::store::EntityKey;
use crate::store::NormalizedResponse;
use crate::transport::QueryPayload;

/// A variable computed from the caller's current partial response, so pagination cursors
/// can be derived from local data.
pub type VariableFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

#[derive(Default)]
pub struct QueryOptions {
    /// Defaults to the query string itself.
    pub caller_id: Option<String>,
    pub instance_key: Option<String>,
    /// Skip the fast path and consult the server even when a cached response exists.
    pub force_fetch: bool,
    /// Never consult the server; return whatever the store can satisfy.
    pub local_only: bool,
    pub variables: Option<Value>,
    pub variable_fns: Vec<(String, VariableFn)>,
    /// Mutation handlers to register for this caller, by mutation name.
    pub mutation_handlers: Vec<(String, Arc<dyn MutationHandler>)>,
}

impl Cache {
    /// Answers a query from the store when possible, fetching only the missing portion
    /// otherwise. Transport failures do not surface as errors: they are attached to the
    /// returned response and recorded on the store.
    pub async fn query(
        &self,
        query: &str,
        options: QueryOptions,
    ) -> Result<Arc<QueryResponse>, CacheError> {
        let caller_id = options
            .caller_id
            .clone()
            .unwrap_or_else(|| query.to_string());
        let path = CallerPath::new(caller_id.clone(), options.instance_key.clone());

        if !options.force_fetch {
            if let Some(cached) = self.read(&caller_id, options.instance_key.as_deref()) {
                tracing::trace!(caller = %path, "query served from cache");
                return Ok(cached);
            }
        }

        let existing = {
            let runtime = self.inner.runtime.lock();
            runtime
                .queries
                .get(&caller_id)
                .map(|cached| cached.document.clone())
        };
        let document = match existing {
            Some(document) => document,
            None => {
                let document = self.parse_document(query)?;
                let mut runtime = self.inner.runtime.lock();
                runtime
                    .queries
                    .entry(caller_id.clone())
                    .or_insert_with(|| CachedQuery {
                        query: query.to_string(),
                        document: document.clone(),
                        responses: IndexMap::new(),
                    });
                document
            }
        };

        {
            // A consumer joining with handlers invalidates any merged mutation that would
            // now have to include it, then registers those handlers.
            let mut runtime = self.inner.runtime.lock();
            for (name, handler) in &options.mutation_handlers {
                if let Some(mutation) = runtime.mutations.get_mut(name) {
                    mutation.clear_merged();
                }
                runtime.handlers.entry(name.clone()).or_default().insert(
                    caller_id.clone(),
                    RegisteredHandler {
                        handler: handler.clone(),
                        instance_key: options.instance_key.clone(),
                    },
                );
            }
        }

        let state = self.inner.store.snapshot();
        let caller_key = path.storage_key();
        let previous = self.read(&caller_id, options.instance_key.as_deref());
        let variables = resolve_variables(
            state.variables.get(&caller_key),
            options.variables.as_ref(),
            &options.variable_fns,
            previous.as_ref().map(|response| &response.data),
        );
        let ctx = self.context(document, variables);
        let denormalized = denormalize(&ctx, &state, &caller_key)?;

        if !denormalized.first_run {
            // Subscribe the caller to the entities it is about to render, even before the
            // server responds.
            let partial = normalize(&ctx, &denormalized.data)?;
            self.inner.runtime.lock().deps.add_deps(&partial, &path);
        }

        let response = Arc::new(QueryResponse {
            data: denormalized.data,
            is_complete: denormalized.is_complete,
            first_run: denormalized.first_run,
            error: None,
        });
        self.install_response(&path, response.clone());

        if (denormalized.is_complete && !options.force_fetch) || options.local_only {
            return Ok(response);
        }

        self.query_server(&ctx, &path, options.force_fetch).await?;
        Ok(self
            .read(&caller_id, options.instance_key.as_deref())
            .unwrap_or(response))
    }

    /// Force-fetch re-run of a caller's cached query.
    pub async fn refetch(
        &self,
        caller_id: &str,
        instance_key: Option<&str>,
    ) -> Result<Arc<QueryResponse>, CacheError> {
        let query = {
            let runtime = self.inner.runtime.lock();
            runtime
                .queries
                .get(caller_id)
                .map(|cached| cached.query.clone())
        }
        .ok_or_else(|| {
            CacheError::contract(format!("refetch for unknown caller \"{caller_id}\""))
        })?;
        self.query(
            &query,
            QueryOptions {
                caller_id: Some(caller_id.to_string()),
                instance_key: instance_key.map(str::to_string),
                force_fetch: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Rewrites the stored variable bag for a caller and re-runs its query, fetching only
    /// what the store misses under the new variables.
    pub async fn set_variables(
        &self,
        caller_id: &str,
        instance_key: Option<&str>,
        variables: Value,
    ) -> Result<Arc<QueryResponse>, CacheError> {
        let query = {
            let runtime = self.inner.runtime.lock();
            runtime
                .queries
                .get(caller_id)
                .map(|cached| cached.query.clone())
        }
        .ok_or_else(|| {
            CacheError::contract(format!("set_variables for unknown caller \"{caller_id}\""))
        })?;
        let path = CallerPath::new(caller_id, instance_key.map(str::to_string));
        self.inner.store.dispatch(CacheAction::InsertQuery {
            entities: Entities::default(),
            callers: vec![CallerWrite {
                path: path.clone(),
                result: None,
                variables: Some(variables),
            }],
        });
        {
            let mut runtime = self.inner.runtime.lock();
            clear_response(&mut runtime, &path);
        }
        self.query(
            &query,
            QueryOptions {
                caller_id: Some(caller_id.to_string()),
                instance_key: instance_key.map(str::to_string),
                ..Default::default()
            },
        )
        .await
    }

    pub(crate) async fn query_server(
        &self,
        ctx: &QueryContext,
        path: &CallerPath,
        force: bool,
    ) -> Result<(), CacheError> {
        let caller_key = path.storage_key();
        let state = self.inner.store.snapshot();
        let minimized = match minimize(ctx, &state, &caller_key)? {
            Some(minimized) => minimized,
            // Fully local, but a force-fetch still consults the server with the whole
            // operation.
            None if force => whole_query(ctx)?,
            None => return Ok(()),
        };

        let waiter = Waiter {
            path: path.clone(),
            variables: ctx.variables.clone(),
        };
        {
            let mut runtime = self.inner.runtime.lock();
            if let Some(pending) = runtime.pending.get_mut(&minimized.query) {
                if pending.waiters.contains(&waiter) {
                    tracing::trace!(caller = %path, "identical fetch already in flight");
                } else {
                    tracing::debug!(caller = %path, "joined in-flight fetch");
                    pending.waiters.push(waiter);
                }
                // The in-flight request will serve this caller too.
                return Ok(());
            }
            runtime.pending.insert(
                minimized.query.clone(),
                PendingQuery {
                    waiters: vec![waiter],
                },
            );
        }

        let payload = QueryPayload {
            query: minimized.query.clone(),
            variables: payload_variables(&ctx.variables, &minimized.variable_names),
        };
        tracing::debug!(caller = %path, query = %minimized.query, "fetching from server");
        let outcome = self.select_transport().handle_query(payload).await;

        let data = match outcome {
            Ok(response) => match response.error {
                Some(error) => {
                    self.fail_pending(&minimized.query, error);
                    return Ok(());
                }
                None => response.data,
            },
            Err(error) => {
                self.fail_pending(&minimized.query, CacheError::error_value(&error.message));
                return Ok(());
            }
        };

        // The store may have changed during the await; denormalize again before merging.
        let state = self.inner.store.snapshot();
        let local = denormalize(ctx, &state, &caller_key)?;
        let local_normalized = if local.first_run {
            NormalizedResponse::default()
        } else {
            normalize(ctx, &local.data)?
        };
        let server_ctx = QueryContext {
            document: minimized.document.clone(),
            ..ctx.clone()
        };
        let server_normalized = normalize(&server_ctx, &data)?;

        let full = merge_responses(local_normalized, &server_normalized, minimized.backward);
        let shortened = shorten(&full.entities, &state);
        let changed = entity_keys(&shortened);

        let waiters = {
            let mut runtime = self.inner.runtime.lock();
            runtime
                .pending
                .shift_remove(&minimized.query)
                .map(|pending| pending.waiters)
                .unwrap_or_default()
        };

        let skeletons_current = waiters
            .iter()
            .all(|waiter| state.result.get(&waiter.path.storage_key()) == Some(&full.result));
        if shortened.is_empty() && skeletons_current {
            tracing::trace!("server response added nothing new");
            return Ok(());
        }

        let callers = waiters
            .iter()
            .map(|waiter| CallerWrite {
                path: waiter.path.clone(),
                result: Some(full.result.clone()),
                variables: Some(waiter.variables.clone()),
            })
            .collect();
        self.inner.store.dispatch(CacheAction::InsertQuery {
            entities: shortened,
            callers,
        });

        {
            let mut runtime = self.inner.runtime.lock();
            for waiter in &waiters {
                runtime.deps.add_deps(&full, &waiter.path);
            }
            let waiter_paths: Vec<&CallerPath> =
                waiters.iter().map(|waiter| &waiter.path).collect();
            let affected = runtime.deps.dependents(&changed, &waiter_paths);
            for caller in &affected {
                clear_response(&mut runtime, caller);
            }
        }

        let fresh = self.inner.store.snapshot();
        for waiter in &waiters {
            let document = {
                let runtime = self.inner.runtime.lock();
                runtime
                    .queries
                    .get(&waiter.path.caller_id)
                    .map(|cached| cached.document.clone())
            };
            let Some(document) = document else {
                // Forgotten mid-flight.
                continue;
            };
            let ctx = self.context(document, waiter.variables.clone());
            let denormalized = denormalize(&ctx, &fresh, &waiter.path.storage_key())?;
            self.install_response(
                &waiter.path,
                Arc::new(QueryResponse {
                    data: denormalized.data,
                    is_complete: denormalized.is_complete,
                    first_run: false,
                    error: None,
                }),
            );
        }
        Ok(())
    }

    /// Attaches a transport error to every waiting caller's response and records it on the
    /// store. Caches are not invalidated.
    fn fail_pending(&self, pending_key: &str, error: Value) {
        let mut runtime = self.inner.runtime.lock();
        let waiters = runtime
            .pending
            .shift_remove(pending_key)
            .map(|pending| pending.waiters)
            .unwrap_or_default();
        for waiter in &waiters {
            if let Some(cached) = runtime.queries.get_mut(&waiter.path.caller_id) {
                let mut response = cached
                    .responses
                    .get(&waiter.path.instance_key)
                    .map(|existing| (**existing).clone())
                    .unwrap_or_default();
                response.error = Some(error.clone());
                cached
                    .responses
                    .insert(waiter.path.instance_key.clone(), Arc::new(response));
            }
        }
        drop(runtime);
        tracing::debug!("fetch failed, recording error on {} caller(s)", waiters.len());
        self.inner.store.dispatch(CacheAction::SetError { error });
    }

    pub(crate) fn install_response(&self, path: &CallerPath, response: Arc<QueryResponse>) {
        let mut runtime = self.inner.runtime.lock();
        if let Some(cached) = runtime.queries.get_mut(&path.caller_id) {
            cached
                .responses
                .insert(path.instance_key.clone(), response);
        }
    }
}

pub(crate) fn clear_response(runtime: &mut Runtime, path: &CallerPath) {
    if let Some(cached) = runtime.queries.get_mut(&path.caller_id) {
        cached.responses.shift_remove(&path.instance_key);
    }
}

fn resolve_variables(
    stored: Option<&Value>,
    supplied: Option<&Value>,
    variable_fns: &[(String, VariableFn)],
    current: Option<&Value>,
) -> Value {
    let mut merged = Map::new();
    if let Some(Value::Object(stored)) = stored {
        for (name, value) in stored {
            merged.insert(name.clone(), value.clone());
        }
    }
    if let Some(Value::Object(supplied)) = supplied {
        for (name, value) in supplied {
            merged.insert(name.clone(), value.clone());
        }
    }
    let current = current.unwrap_or(&Value::Null);
    for (name, compute) in variable_fns {
        merged.insert(ByteString::from(name.as_str()), compute(current));
    }
    Value::Object(merged)
}

fn payload_variables(variables: &Value, names: &IndexSet<String>) -> Option<Value> {
    let bag = variables.as_object()?;
    let mut out = Map::new();
    for name in names {
        if let Some(value) = bag.get(name.as_str()) {
            out.insert(ByteString::from(name.as_str()), value.clone());
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Merges the local partial normalization with the server's. Where the local side holds an
/// entity reference and the server returned inline fields (the minimizer pruned the
/// identity), the fields fold into the referenced entity. Pagination buckets concatenate,
/// new pages after (or, for backward windows, before) the cached ones.
pub(crate) fn merge_responses(
    local: NormalizedResponse,
    server: &NormalizedResponse,
    backward: bool,
) -> NormalizedResponse {
    let mut entities = local.entities;
    for (type_name, bodies) in &server.entities {
        for (id, body) in bodies {
            fold_into_entity(
                &EntityKey::new(type_name.clone(), id.clone()),
                body,
                &mut entities,
                backward,
            );
        }
    }
    let mut result = local.result;
    merge_paged(&mut result, &server.result, &mut entities, backward);
    NormalizedResponse { entities, result }
}

fn fold_into_entity(key: &EntityKey, incoming: &Value, entities: &mut Entities, backward: bool) {
    let mut body = entities
        .entry(key.type_name.clone())
        .or_default()
        .shift_remove(&key.id)
        .unwrap_or_else(|| Value::Object(Map::new()));
    merge_paged(&mut body, incoming, entities, backward);
    entities
        .entry(key.type_name.clone())
        .or_default()
        .insert(key.id.clone(), body);
}

fn merge_paged(dst: &mut Value, src: &Value, entities: &mut Entities, backward: bool) {
    if let Some(dst_key) = EntityKey::from_ref(dst) {
        match EntityKey::from_ref(src) {
            Some(src_key) => {
                if src_key != dst_key {
                    *dst = src.clone();
                }
            }
            None if src.is_object() => fold_into_entity(&dst_key, src, entities, backward),
            None => *dst = src.clone(),
        }
        return;
    }
    if EntityKey::from_ref(src).is_some() {
        *dst = src.clone();
        return;
    }
    match (dst, src) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(key.as_str()) {
                    Some(slot) => merge_paged(slot, value, entities, backward),
                    None => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(incoming)) => {
            // A re-fetched window comes back as inline objects aligned with the cached
            // references; merge positionally. New pages of references concatenate.
            let positional = !existing.is_empty()
                && existing
                    .iter()
                    .all(|item| EntityKey::from_ref(item).is_some())
                && incoming
                    .iter()
                    .any(|item| item.is_object() && EntityKey::from_ref(item).is_none());
            if positional {
                for (index, item) in incoming.iter().enumerate() {
                    match existing.get_mut(index) {
                        Some(slot) => merge_paged(slot, item, entities, backward),
                        None => existing.push(item.clone()),
                    }
                }
            } else if backward {
                let fresh: Vec<Value> = incoming
                    .iter()
                    .filter(|item| !existing.contains(item))
                    .cloned()
                    .collect();
                for (index, item) in fresh.into_iter().enumerate() {
                    existing.insert(index, item);
                }
            } else {
                for item in incoming {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
        }
        (slot, incoming) => {
            *slot = incoming.clone();
        }
    }
}

/// Strips entity fields that equal what is already stored. What remains is exactly the
/// change set a dispatch needs to carry, and its keys are the entities whose dependents
/// must be flushed.
pub(crate) fn shorten(entities: &Entities, state: &CacheState) -> Entities {
    let mut out = Entities::default();
    for (type_name, bodies) in entities {
        for (id, body) in bodies {
            let stored = state
                .entities
                .get(type_name)
                .and_then(|bodies| bodies.get(id));
            let diff = match stored {
                None => Some(body.clone()),
                Some(stored) => diff_value(body, stored),
            };
            if let Some(diff) = diff {
                out.entry(type_name.clone())
                    .or_default()
                    .insert(id.clone(), diff);
            }
        }
    }
    out
}

fn diff_value(incoming: &Value, stored: &Value) -> Option<Value> {
    if incoming == stored {
        return None;
    }
    match (incoming, stored) {
        (Value::Object(incoming), Value::Object(stored)) => {
            let mut out = Map::new();
            for (key, value) in incoming {
                match stored.get(key.as_str()) {
                    Some(existing) => {
                        if let Some(diff) = diff_value(value, existing) {
                            out.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ => Some(incoming.clone()),
    }
}
