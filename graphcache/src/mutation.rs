//! The mutation engine: builds one combined mutation document out of the callers a
//! mutation affects, runs their optimistic handlers, ships the mutation, and applies the
//! authoritative response.
//!
//! Each affected caller contributes a "single": its query's selections projected onto the
//! mutation payload type, with its variables renamed into a caller-private namespace.
//! Singles merge into the full mutation by alias-preserving union; where two callers want
//! the same response key with different arguments, the later one is aliased and the alias
//! recorded so its view of the server response can be de-namespaced again.

use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::name;
use apollo_compiler::schema::Component;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::cache::Cache;
use crate::cache::QueryResponse;
use crate::context::QueryContext;
use crate::coordinator::clear_response;
use crate::coordinator::shorten;
use crate::error::CacheError;
use crate::minimize::collect_variable_names;
use crate::minimize::keep_selection_set;
use crate::normalize::normalize;
use crate::store::entity_keys;
use crate::store::merge_entities;
use crate::store::CacheAction;
use crate::store::CacheState;
use crate::store::CallerPath;
use crate::store::CallerWrite;
use crate::store::Entities;
use crate::store::MergeMode;
use crate::transport::QueryPayload;
use crate::transport::Transport;

/// What a handler decided to do with a mutation payload.
pub enum HandlerOutcome {
    /// Replace the caller's denormalized result with this data; it will be normalized and
    /// folded back into the store.
    Replace(Value),
    /// Throw the caller's local data away and refetch its query from the server.
    Invalidate,
    /// Nothing to change for this caller.
    Noop,
}

/// Read access handed to mutation handlers.
pub struct HandlerView<'a> {
    /// The variable bag the mutation was invoked with.
    pub variables: &'a Value,
    /// The caller's current denormalized data.
    pub current: &'a Value,
    state: &'a CacheState,
}

impl HandlerView<'_> {
    /// All stored entities of a type, id-keyed, for cross-reference lookups inside a
    /// handler.
    pub fn get_type(&self, type_name: &str) -> Value {
        let mut out = Map::new();
        if let Some(bodies) = self.state.entities.get(type_name) {
            for (id, body) in bodies {
                out.insert(ByteString::from(id.as_str()), body.clone());
            }
        }
        Value::Object(out)
    }
}

/// A caller's reaction to one mutation, registered through
/// [`QueryOptions::mutation_handlers`](crate::coordinator::QueryOptions).
///
/// The optimistic and authoritative paths are distinct operations: the optimistic pass
/// runs before the server is consulted and defaults to doing nothing, the authoritative
/// pass receives the de-namespaced server payload.
pub trait MutationHandler: Send + Sync {
    fn optimistic(&self, _view: &HandlerView<'_>) -> HandlerOutcome {
        HandlerOutcome::Noop
    }

    fn authoritative(&self, response: &Value, view: &HandlerView<'_>) -> HandlerOutcome;
}

#[derive(Default)]
pub struct MutationOptions {
    pub variables: Option<Value>,
    /// Restrict the affected callers to these ids.
    pub callers: Option<Vec<String>>,
    /// Overrides the cache's transport for this mutation.
    pub transport: Option<Arc<dyn Transport>>,
}

/// Records the variable renames of one single so a user-supplied bag can be rewritten into
/// the namespaced form the full mutation expects.
#[derive(Clone, Debug, Default)]
pub struct VariableEnhancer {
    /// Original name → namespaced name.
    renames: IndexMap<String, String>,
    /// The caller's stored variable bag, consulted when the user bag lacks a name.
    source: Value,
}

impl VariableEnhancer {
    pub fn apply(&self, user: &Value, out: &mut Map<ByteString, Value>) {
        for (original, namespaced) in &self.renames {
            let value = user
                .as_object()
                .and_then(|bag| bag.get(original.as_str()))
                .or_else(|| {
                    self.source
                        .as_object()
                        .and_then(|bag| bag.get(original.as_str()))
                })
                .cloned()
                .unwrap_or(Value::Null);
            out.insert(ByteString::from(namespaced.as_str()), value);
        }
    }
}

/// One caller's contribution to a mutation, cached for reuse across mergings.
pub(crate) struct MutationSingle {
    prefix: String,
    selections: Vec<Selection>,
    variable_definitions: Vec<Node<ast::VariableDefinition>>,
    enhancer: VariableEnhancer,
}

pub(crate) struct FullMutation {
    pub(crate) query: String,
    /// Caller id → (alias → original response key).
    renames_by_caller: IndexMap<String, IndexMap<String, String>>,
    /// Every conflict alias across all singles.
    aliases: IndexSet<String>,
}

#[derive(Default)]
pub(crate) struct CachedMutation {
    pub(crate) active: IndexMap<String, Option<String>>,
    pub(crate) full: Option<FullMutation>,
    pub(crate) singles: IndexMap<String, MutationSingle>,
    pub(crate) variable_set: IndexSet<String>,
}

impl CachedMutation {
    /// Drops the merged mutation but keeps the singles for the next merging.
    pub(crate) fn clear_merged(&mut self) {
        self.full = None;
        self.active.clear();
        self.variable_set.clear();
    }
}

impl Cache {
    /// Runs a named mutation: optimistic handlers first, then the server, then the
    /// authoritative handlers with the server's payload. Transport failures are recorded
    /// on the store and leave the optimistic state in place; reverting is the
    /// application's decision (re-invoke or refetch).
    pub async fn mutate(
        &self,
        mutation_name: &str,
        options: MutationOptions,
    ) -> Result<(), CacheError> {
        let mutation_root = self
            .inner
            .schema
            .root_operation(OperationType::Mutation)
            .ok_or_else(|| {
                CacheError::configuration("schema does not define a mutation root type")
            })?
            .clone();
        let field_definition = self
            .inner
            .schema
            .type_field(&mutation_root, mutation_name)
            .map_err(|_| CacheError::UnknownMutation {
                name: mutation_name.to_string(),
            })?
            .clone();
        let payload_type = field_definition.ty.inner_named_type().clone();

        let user_variables = options
            .variables
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let variable_names: IndexSet<String> = user_variables
            .as_object()
            .map(|bag| bag.keys().map(|key| key.as_str().to_string()).collect())
            .unwrap_or_default();

        // The closure of work: callers that registered a handler for this mutation,
        // optionally restricted by the invocation.
        let active: IndexMap<String, Option<String>> = {
            let runtime = self.inner.runtime.lock();
            runtime
                .handlers
                .get(mutation_name)
                .map(|callers| {
                    callers
                        .iter()
                        .filter(|(caller_id, _)| {
                            options
                                .callers
                                .as_ref()
                                .map_or(true, |restricted| restricted.contains(*caller_id))
                        })
                        .map(|(caller_id, registered)| {
                            (caller_id.clone(), registered.instance_key.clone())
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        self.update_cached_mutation(
            mutation_name,
            &mutation_root,
            &field_definition,
            &payload_type,
            &active,
            &variable_names,
        )?;

        // Optimistic pass precedes the server dispatch.
        self.process_mutation_handlers(mutation_name, &active, None, &user_variables)
            .await?;

        let (query, variables) = {
            let runtime = self.inner.runtime.lock();
            let cached = runtime
                .mutations
                .get(mutation_name)
                .ok_or_else(|| crate::internal_error!("cached mutation disappeared"))?;
            let full = cached
                .full
                .as_ref()
                .ok_or_else(|| crate::internal_error!("merged mutation was not built"))?;
            let mut bag = Map::new();
            if let Some(user) = user_variables.as_object() {
                for (name, value) in user {
                    bag.insert(name.clone(), value.clone());
                }
            }
            for (caller_id, _) in &cached.active {
                if let Some(single) = cached.singles.get(caller_id) {
                    single.enhancer.apply(&user_variables, &mut bag);
                }
            }
            (full.query.clone(), bag)
        };

        let payload = QueryPayload {
            query,
            variables: if variables.is_empty() {
                None
            } else {
                Some(Value::Object(variables))
            },
        };
        let transport = options
            .transport
            .clone()
            .unwrap_or_else(|| self.select_transport());
        tracing::debug!(mutation = mutation_name, "sending mutation to server");
        let data = match transport.handle_query(payload).await {
            Ok(response) => match response.error {
                Some(error) => {
                    self.inner.store.dispatch(CacheAction::SetError { error });
                    return Ok(());
                }
                None => response.data,
            },
            Err(error) => {
                self.inner.store.dispatch(CacheAction::SetError {
                    error: CacheError::error_value(&error.message),
                });
                return Ok(());
            }
        };

        // De-namespace the payload once per caller, then run the authoritative pass.
        let documents: IndexMap<String, Value> = {
            let runtime = self.inner.runtime.lock();
            let cached = runtime
                .mutations
                .get(mutation_name)
                .ok_or_else(|| crate::internal_error!("cached mutation disappeared"))?;
            let full = cached
                .full
                .as_ref()
                .ok_or_else(|| crate::internal_error!("merged mutation was not built"))?;
            let payload_value = data.get(mutation_name).cloned().unwrap_or(Value::Null);
            let empty = IndexMap::new();
            active
                .keys()
                .map(|caller_id| {
                    let renames = full.renames_by_caller.get(caller_id).unwrap_or(&empty);
                    (
                        caller_id.clone(),
                        strip_aliases(&payload_value, renames, &full.aliases),
                    )
                })
                .collect()
        };
        self.process_mutation_handlers(mutation_name, &active, Some(&documents), &user_variables)
            .await
    }

    fn update_cached_mutation(
        &self,
        mutation_name: &str,
        mutation_root: &Name,
        field_definition: &Component<ast::FieldDefinition>,
        payload_type: &Name,
        active: &IndexMap<String, Option<String>>,
        variable_names: &IndexSet<String>,
    ) -> Result<(), CacheError> {
        {
            let runtime = self.inner.runtime.lock();
            if let Some(cached) = runtime.mutations.get(mutation_name) {
                if cached.full.is_some()
                    && cached.variable_set == *variable_names
                    && cached.active == *active
                {
                    return Ok(());
                }
            }
        }

        // Inputs for the singles that still need building, gathered before any AST work.
        let state = self.inner.store.snapshot();
        let mut missing: Vec<(String, Option<String>, Arc<_>, Value)> = Vec::new();
        {
            let runtime = self.inner.runtime.lock();
            let built: IndexSet<String> = runtime
                .mutations
                .get(mutation_name)
                .map(|cached| cached.singles.keys().cloned().collect())
                .unwrap_or_default();
            for (caller_id, instance_key) in active {
                if built.contains(caller_id) {
                    continue;
                }
                let cached_query = runtime.queries.get(caller_id).ok_or_else(|| {
                    CacheError::contract(format!(
                        "mutation \"{mutation_name}\" affects caller \"{caller_id}\" which never ran a query"
                    ))
                })?;
                let storage_key = CallerPath::new(caller_id.clone(), instance_key.clone()).storage_key();
                let stored_variables = state
                    .variables
                    .get(&storage_key)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                missing.push((
                    caller_id.clone(),
                    instance_key.clone(),
                    cached_query.document.clone(),
                    stored_variables,
                ));
            }
        }

        let payload_is_leaf = matches!(
            self.inner.schema.types.get(payload_type.as_str()),
            Some(ExtendedType::Scalar(_) | ExtendedType::Enum(_))
        );

        let mut built_singles: Vec<(String, MutationSingle)> = Vec::new();
        if !payload_is_leaf {
            let base_index = {
                let runtime = self.inner.runtime.lock();
                runtime
                    .mutations
                    .get(mutation_name)
                    .map(|cached| cached.singles.len())
                    .unwrap_or(0)
            };
            for (offset, (caller_id, _, document, stored_variables)) in
                missing.into_iter().enumerate()
            {
                let ctx = self.context(document, stored_variables.clone());
                let single = build_single(
                    &ctx,
                    base_index + offset,
                    payload_type.as_str(),
                    stored_variables,
                )?;
                built_singles.push((caller_id, single));
            }
        }

        let mut runtime = self.inner.runtime.lock();
        let cached = runtime.mutations.entry(mutation_name.to_string()).or_default();
        for (caller_id, single) in built_singles {
            cached.singles.insert(caller_id, single);
        }

        // Merge the active singles, alias-preserving, into one payload selection set.
        let mut merged: Vec<Selection> = Vec::new();
        let mut renames_by_caller = IndexMap::new();
        let mut aliases = IndexSet::new();
        let mut namespaced_definitions: Vec<Node<ast::VariableDefinition>> = Vec::new();
        for (caller_id, _) in active {
            let Some(single) = cached.singles.get(caller_id) else {
                continue;
            };
            let mut renames = IndexMap::new();
            merge_single_into(
                &mut merged,
                &single.selections,
                &single.prefix,
                &mut renames,
                &mut aliases,
            );
            if !renames.is_empty() {
                renames_by_caller.insert(caller_id.clone(), renames);
            }
            namespaced_definitions.extend(single.variable_definitions.iter().cloned());
        }

        let selection_set = if payload_is_leaf {
            SelectionSet::new(payload_type.clone())
        } else if merged.is_empty() {
            // No interested callers: a basic mutation selecting just the identity.
            SelectionSet {
                ty: payload_type.clone(),
                selections: vec![Selection::Field(Node::new(
                    self.identity_field(payload_type)?,
                ))],
            }
        } else {
            SelectionSet {
                ty: payload_type.clone(),
                selections: merged,
            }
        };

        let mut arguments = Vec::new();
        let mut definitions = Vec::new();
        for argument in &field_definition.arguments {
            if variable_names.contains(argument.name.as_str()) {
                arguments.push(Node::new(ast::Argument {
                    name: argument.name.clone(),
                    value: Node::new(ast::Value::Variable(argument.name.clone())),
                }));
                definitions.push(Node::new(ast::VariableDefinition {
                    name: argument.name.clone(),
                    ty: argument.ty.clone(),
                    default_value: None,
                    directives: Default::default(),
                }));
            }
        }
        definitions.extend(namespaced_definitions);

        let mutation_field = Field {
            definition: field_definition.node.clone(),
            alias: None,
            name: field_definition.name.clone(),
            arguments,
            directives: Default::default(),
            selection_set,
        };
        let operation = Operation {
            operation_type: OperationType::Mutation,
            name: None,
            variables: definitions,
            directives: Default::default(),
            selection_set: SelectionSet {
                ty: mutation_root.clone(),
                selections: vec![Selection::Field(Node::new(mutation_field))],
            },
        };
        let mut document = ExecutableDocument::new();
        document.operations.insert(operation);
        let document = document
            .validate(&self.inner.schema)
            .map_err(CacheError::document)?;

        cached.full = Some(FullMutation {
            query: document.serialize().no_indent().to_string(),
            renames_by_caller,
            aliases,
        });
        cached.active = active.clone();
        cached.variable_set = variable_names.clone();
        Ok(())
    }

    fn identity_field(&self, payload_type: &Name) -> Result<Field, CacheError> {
        let id_field = self.inner.id_field.as_str();
        if let Some(ExtendedType::Object(object)) = self.inner.schema.types.get(payload_type.as_str())
        {
            if let Some(definition) = object.fields.get(id_field) {
                return Ok(Field {
                    definition: definition.node.clone(),
                    alias: None,
                    name: definition.name.clone(),
                    arguments: Vec::new(),
                    directives: Default::default(),
                    selection_set: SelectionSet::new(definition.ty.inner_named_type().clone()),
                });
            }
        }
        // No identity on the payload: fall back to __typename.
        Ok(Field {
            definition: Node::new(ast::FieldDefinition {
                description: None,
                name: name!("__typename"),
                arguments: Vec::new(),
                ty: ast::Type::Named(name!("String")).non_null(),
                directives: Default::default(),
            }),
            alias: None,
            name: name!("__typename"),
            arguments: Vec::new(),
            directives: Default::default(),
            selection_set: SelectionSet::new(name!("String")),
        })
    }

    async fn process_mutation_handlers(
        &self,
        mutation_name: &str,
        active: &IndexMap<String, Option<String>>,
        server_documents: Option<&IndexMap<String, Value>>,
        user_variables: &Value,
    ) -> Result<(), CacheError> {
        let state = self.inner.store.snapshot();
        let mut accumulated = Entities::default();
        let mut writes: Vec<CallerWrite> = Vec::new();
        let mut refetches: Vec<CallerPath> = Vec::new();

        for (caller_id, instance_key) in active {
            let path = CallerPath::new(caller_id.clone(), instance_key.clone());
            let (handler, document, current) = {
                let runtime = self.inner.runtime.lock();
                let handler = runtime
                    .handlers
                    .get(mutation_name)
                    .and_then(|callers| callers.get(caller_id))
                    .map(|registered| registered.handler.clone())
                    .ok_or_else(|| {
                        CacheError::contract(format!(
                            "no handler registered for mutation \"{mutation_name}\" by caller \"{caller_id}\""
                        ))
                    })?;
                let cached = runtime.queries.get(caller_id).ok_or_else(|| {
                    CacheError::contract(format!(
                        "mutation \"{mutation_name}\" affects caller \"{caller_id}\" which never ran a query"
                    ))
                })?;
                let current = cached
                    .responses
                    .get(instance_key)
                    .cloned()
                    .ok_or_else(|| {
                        CacheError::contract(format!(
                            "mutation \"{mutation_name}\" affects caller \"{caller_id}\" which has no cached response"
                        ))
                    })?;
                (handler, cached.document.clone(), current)
            };

            let view = HandlerView {
                variables: user_variables,
                current: &current.data,
                state: &state,
            };
            let outcome = match server_documents {
                Some(documents) => handler.authoritative(
                    documents.get(caller_id).unwrap_or(&Value::Null),
                    &view,
                ),
                None => handler.optimistic(&view),
            };
            match outcome {
                HandlerOutcome::Noop => {}
                HandlerOutcome::Invalidate => refetches.push(path),
                HandlerOutcome::Replace(data) => {
                    let storage_key = path.storage_key();
                    let stored_variables = state
                        .variables
                        .get(&storage_key)
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    let ctx = self.context(document, stored_variables);
                    let normalized = normalize(&ctx, &data)?;
                    merge_entities(&mut accumulated, &normalized.entities, MergeMode::Mutation);
                    writes.push(CallerWrite {
                        path: path.clone(),
                        result: Some(normalized.result),
                        variables: None,
                    });
                    // Replace the response identity so identity-comparing hosts see the
                    // change, and clear any error from a previous failed fetch.
                    self.install_response(
                        &path,
                        Arc::new(QueryResponse {
                            data,
                            is_complete: current.is_complete,
                            first_run: false,
                            error: None,
                        }),
                    );
                }
            }
        }

        let shortened = shorten(&accumulated, &state);
        if !shortened.is_empty() || !writes.is_empty() {
            let changed = entity_keys(&shortened);
            self.inner.store.dispatch(CacheAction::InsertMutation {
                entities: shortened,
                callers: writes,
            });
            // Only the authoritative response cascades invalidation to other callers.
            if server_documents.is_some() && !changed.is_empty() {
                let mut runtime = self.inner.runtime.lock();
                let active_paths: Vec<CallerPath> = active
                    .iter()
                    .map(|(caller_id, instance_key)| {
                        CallerPath::new(caller_id.clone(), instance_key.clone())
                    })
                    .collect();
                let excluded: Vec<&CallerPath> = active_paths.iter().collect();
                let affected = runtime.deps.dependents(&changed, &excluded);
                for caller in &affected {
                    clear_response(&mut runtime, caller);
                }
            }
        }

        for path in refetches {
            self.refetch(&path.caller_id, path.instance_key.as_deref())
                .await?;
        }
        Ok(())
    }
}

/// Derives one caller's single: its query selections projected onto the payload type,
/// variables renamed into the caller's namespace.
fn build_single(
    ctx: &QueryContext,
    index: usize,
    payload_type: &str,
    stored_variables: Value,
) -> Result<MutationSingle, CacheError> {
    let mut collected: Vec<Selection> = Vec::new();
    collect_projection(ctx, payload_type, &mut collected)?;

    let prefix = format!("gc{index}");
    let mut used = IndexSet::new();
    collect_variable_names(&collected, &mut used);
    let mut renames = IndexMap::new();
    for name in &used {
        renames.insert(name.clone(), format!("{prefix}_{name}"));
    }
    rename_variables_in_selections(&mut collected, &renames);

    let operation = ctx.operation()?;
    let variable_definitions = operation
        .variables
        .iter()
        .filter(|definition| used.contains(definition.name.as_str()))
        .map(|definition| {
            let mut renamed = (**definition).clone();
            renamed.name = Name::new_unchecked(&format!("{prefix}_{}", renamed.name));
            Node::new(renamed)
        })
        .collect();

    Ok(MutationSingle {
        prefix,
        selections: collected,
        variable_definitions,
        enhancer: VariableEnhancer {
            renames,
            source: stored_variables,
        },
    })
}

/// Collects, from anywhere in the caller's query, the selection sets that apply to the
/// payload type. Fragment spreads are inlined on the way out.
fn collect_projection(
    ctx: &QueryContext,
    payload_type: &str,
    out: &mut Vec<Selection>,
) -> Result<(), CacheError> {
    let operation = ctx.operation()?;
    collect_from_selection_set(ctx, &operation.selection_set, payload_type, out)
}

fn collect_from_selection_set(
    ctx: &QueryContext,
    selection_set: &SelectionSet,
    payload_type: &str,
    out: &mut Vec<Selection>,
) -> Result<(), CacheError> {
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => {
                if field.definition.ty.inner_named_type().as_str() == payload_type
                    && !field.selection_set.is_empty()
                {
                    out.extend(keep_selection_set(ctx, &field.selection_set)?.selections);
                }
                collect_from_selection_set(ctx, &field.selection_set, payload_type, out)?;
            }
            Selection::InlineFragment(fragment) => {
                collect_from_selection_set(ctx, &fragment.selection_set, payload_type, out)?;
            }
            Selection::FragmentSpread(spread) => {
                let fragment = ctx.fragment(&spread.fragment_name)?;
                collect_from_selection_set(ctx, &fragment.selection_set, payload_type, out)?;
            }
        }
    }
    Ok(())
}

fn rename_variables_in_selections(
    selections: &mut [Selection],
    renames: &IndexMap<String, String>,
) {
    for selection in selections.iter_mut() {
        match selection {
            Selection::Field(field) => {
                let field = field.make_mut();
                for argument in field.arguments.iter_mut() {
                    let argument = argument.make_mut();
                    rename_variables_in_value(&mut argument.value, renames);
                }
                rename_variables_in_selections(&mut field.selection_set.selections, renames);
            }
            Selection::InlineFragment(fragment) => {
                let fragment = fragment.make_mut();
                rename_variables_in_selections(&mut fragment.selection_set.selections, renames);
            }
            // Spreads were inlined during projection.
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn rename_variables_in_value(value: &mut Node<ast::Value>, renames: &IndexMap<String, String>) {
    match value.make_mut() {
        ast::Value::Variable(variable) => {
            if let Some(namespaced) = renames.get(variable.as_str()) {
                *variable = Name::new_unchecked(namespaced);
            }
        }
        ast::Value::List(items) => {
            for item in items {
                rename_variables_in_value(item, renames);
            }
        }
        ast::Value::Object(fields) => {
            for (_, item) in fields {
                rename_variables_in_value(item, renames);
            }
        }
        _ => {}
    }
}

/// Alias-preserving union of one single into the merged payload selection set. Same
/// response key with the same field and arguments merges subselections; a conflicting
/// response key gets an alias private to the incoming single.
fn merge_single_into(
    target: &mut Vec<Selection>,
    incoming: &[Selection],
    prefix: &str,
    renames: &mut IndexMap<String, String>,
    aliases: &mut IndexSet<String>,
) {
    for selection in incoming {
        match selection {
            Selection::Field(field) => {
                let key = field.response_key().clone();
                let position = target.iter().position(|existing| {
                    matches!(existing, Selection::Field(existing) if *existing.response_key() == key)
                });
                match position {
                    None => target.push(selection.clone()),
                    Some(index) => {
                        let Selection::Field(existing) = &mut target[index] else {
                            continue;
                        };
                        if existing.name == field.name && existing.arguments == field.arguments {
                            let existing = existing.make_mut();
                            merge_single_into(
                                &mut existing.selection_set.selections,
                                &field.selection_set.selections,
                                prefix,
                                renames,
                                aliases,
                            );
                        } else {
                            let alias = format!("{prefix}_{key}");
                            let mut aliased = (**field).clone();
                            aliased.alias = Some(Name::new_unchecked(&alias));
                            renames.insert(alias.clone(), key.to_string());
                            aliases.insert(alias);
                            target.push(Selection::Field(Node::new(aliased)));
                        }
                    }
                }
            }
            Selection::InlineFragment(fragment) => {
                let position = target.iter().position(|existing| {
                    matches!(
                        existing,
                        Selection::InlineFragment(existing)
                            if existing.type_condition == fragment.type_condition
                    )
                });
                match position {
                    None => target.push(selection.clone()),
                    Some(index) => {
                        let Selection::InlineFragment(existing) = &mut target[index] else {
                            continue;
                        };
                        let existing = existing.make_mut();
                        merge_single_into(
                            &mut existing.selection_set.selections,
                            &fragment.selection_set.selections,
                            prefix,
                            renames,
                            aliases,
                        );
                    }
                }
            }
            Selection::FragmentSpread(_) => target.push(selection.clone()),
        }
    }
}

/// Rewrites a caller's view of the payload: its own aliases fold back to their original
/// response keys, other callers' aliased fields drop out.
fn strip_aliases(
    value: &Value,
    renames: &IndexMap<String, String>,
    aliases: &IndexSet<String>,
) -> Value {
    match value {
        Value::Object(object) => {
            let mut out = Map::new();
            for (key, item) in object {
                if let Some(original) = renames.get(key.as_str()) {
                    out.insert(
                        ByteString::from(original.as_str()),
                        strip_aliases(item, renames, aliases),
                    );
                } else if aliases.contains(key.as_str()) {
                    continue;
                } else {
                    out.insert(key.clone(), strip_aliases(item, renames, aliases));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| strip_aliases(item, renames, aliases))
                .collect(),
        ),
        _ => value.clone(),
    }
}
