//! Rewrites a query into the smallest valid document that still asks for everything the
//! caller needs but the store cannot already satisfy.
//!
//! Satisfied selections are pruned. Partially satisfied pagination fields get their
//! arguments rewritten so the server is asked only for the missing slice. Fragment spreads
//! surviving the prune are inlined, so no fragment definitions need to be emitted; variable
//! definitions not referenced by any surviving selection are dropped. Variable names are
//! preserved and no new names are introduced.

use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::InlineFragment;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use indexmap::IndexSet;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::context::FieldWindow;
use crate::context::QueryContext;
use crate::error::CacheError;
use crate::store::CacheState;
use crate::store::EntityKey;

const TYPENAME: &str = "__typename";

/// A minimized server request.
pub struct MinimizedQuery {
    pub query: String,
    pub document: Arc<Valid<ExecutableDocument>>,
    /// Variable names still referenced by the minimized document.
    pub variable_names: IndexSet<String>,
    /// True when the missing slice was expressed with `last`/`before`: merged pages are
    /// prepended instead of appended.
    pub backward: bool,
}

/// Returns `None` when the caller is fully local.
pub fn minimize(
    ctx: &QueryContext,
    state: &CacheState,
    caller_key: &str,
) -> Result<Option<MinimizedQuery>, CacheError> {
    let operation = ctx.operation()?;
    let mut minimizer = Minimizer {
        ctx,
        state,
        backward: false,
    };
    let coverage = match state.result.get(caller_key).and_then(Value::as_object) {
        Some(skeleton) => Coverage::Stored(vec![SourceNode {
            body: skeleton,
            type_name: ctx.root_type_name(operation)?.to_string(),
        }]),
        None => Coverage::Missing,
    };
    let survivors = minimizer.prune_selections(&operation.selection_set, &coverage)?;
    if survivors.is_empty() {
        return Ok(None);
    }

    let mut used = IndexSet::new();
    collect_variable_names(&survivors, &mut used);
    let variables = operation
        .variables
        .iter()
        .filter(|definition| used.contains(definition.name.as_str()))
        .cloned()
        .collect();

    let minimized = Operation {
        operation_type: operation.operation_type,
        name: operation.name.clone(),
        variables,
        directives: operation.directives.clone(),
        selection_set: SelectionSet {
            ty: operation.selection_set.ty.clone(),
            selections: survivors,
        },
    };
    let mut document = ExecutableDocument::new();
    document.operations.insert(minimized);
    let document = document
        .validate(&ctx.schema)
        .map_err(CacheError::document)?;
    let query = document.serialize().no_indent().to_string();
    Ok(Some(MinimizedQuery {
        query,
        document: Arc::new(document),
        variable_names: used,
        backward: minimizer.backward,
    }))
}

/// The un-minimized fallback: the whole operation as one server request. Used by
/// force-fetches when the store could already satisfy everything.
pub(crate) fn whole_query(ctx: &QueryContext) -> Result<MinimizedQuery, CacheError> {
    let operation = ctx.operation()?;
    let mut variable_names = IndexSet::new();
    for definition in &operation.variables {
        variable_names.insert(definition.name.to_string());
    }
    Ok(MinimizedQuery {
        query: ctx.document.serialize().no_indent().to_string(),
        document: ctx.document.clone(),
        variable_names,
        backward: false,
    })
}

/// A stored node a selection set applies to, with the concrete type that drives fragment
/// matching.
struct SourceNode<'a> {
    body: &'a Map<ByteString, Value>,
    type_name: String,
}

enum Coverage<'a> {
    /// Nothing stored at this position: the whole subtree is missing.
    Missing,
    /// The stored nodes this selection applies to. An empty list (an empty stored list)
    /// is trivially satisfied.
    Stored(Vec<SourceNode<'a>>),
}

/// Classified stored values of one field across all source nodes.
struct StoredField<'a> {
    nodes: Vec<SourceNode<'a>>,
    dangling: bool,
    /// Bucket lengths per source, for pagination window checks.
    bucket_lengths: Vec<usize>,
    /// The raw stored value of the single source, for cursor extraction.
    single_bucket: Option<&'a Vec<Value>>,
}

struct Minimizer<'a> {
    ctx: &'a QueryContext,
    state: &'a CacheState,
    backward: bool,
}

impl<'a> Minimizer<'a> {
    fn prune_selections(
        &mut self,
        selection_set: &SelectionSet,
        coverage: &Coverage<'a>,
    ) -> Result<Vec<Selection>, CacheError> {
        let mut survivors = Vec::new();
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    if field.name == TYPENAME {
                        continue;
                    }
                    match coverage {
                        Coverage::Missing => {
                            survivors.push(Selection::Field(Node::new(keep_field(self.ctx, field)?)));
                        }
                        Coverage::Stored(sources) => {
                            if let Some(kept) = self.prune_field(field, sources)? {
                                survivors.push(Selection::Field(Node::new(kept)));
                            }
                        }
                    }
                }
                Selection::InlineFragment(fragment) => {
                    let narrowed = self.narrow(coverage, fragment.type_condition.as_ref());
                    let kept =
                        self.prune_selections(&fragment.selection_set, &narrowed)?;
                    if !kept.is_empty() {
                        survivors.push(Selection::InlineFragment(Node::new(InlineFragment {
                            type_condition: fragment.type_condition.clone(),
                            directives: fragment.directives.clone(),
                            selection_set: SelectionSet {
                                ty: fragment.selection_set.ty.clone(),
                                selections: kept,
                            },
                        })));
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = self.ctx.fragment(&spread.fragment_name)?;
                    let condition = fragment.type_condition();
                    let narrowed = self.narrow(coverage, Some(condition));
                    let kept = self.prune_selections(&fragment.selection_set, &narrowed)?;
                    if !kept.is_empty() {
                        // Surviving spreads are inlined so the emitted document needs no
                        // fragment definitions.
                        survivors.push(Selection::InlineFragment(Node::new(InlineFragment {
                            type_condition: Some(condition.clone()),
                            directives: spread.directives.clone(),
                            selection_set: SelectionSet {
                                ty: fragment.selection_set.ty.clone(),
                                selections: kept,
                            },
                        })));
                    }
                }
            }
        }
        Ok(survivors)
    }

    fn narrow(&self, coverage: &Coverage<'a>, condition: Option<&Name>) -> Coverage<'a> {
        match (coverage, condition) {
            (Coverage::Missing, _) => Coverage::Missing,
            (Coverage::Stored(sources), None) => Coverage::Stored(
                sources
                    .iter()
                    .map(|source| SourceNode {
                        body: source.body,
                        type_name: source.type_name.clone(),
                    })
                    .collect(),
            ),
            (Coverage::Stored(sources), Some(condition)) => Coverage::Stored(
                sources
                    .iter()
                    .filter(|source| {
                        self.ctx
                            .type_condition_matches(condition, &source.type_name)
                    })
                    .map(|source| SourceNode {
                        body: source.body,
                        type_name: source.type_name.clone(),
                    })
                    .collect(),
            ),
        }
    }

    fn prune_field(
        &mut self,
        field: &Field,
        sources: &[SourceNode<'a>],
    ) -> Result<Option<Field>, CacheError> {
        let storage_key = self.ctx.field_storage_key(field);
        let mut stored_values = Vec::with_capacity(sources.len());
        for source in sources {
            match source.body.get(storage_key.as_str()) {
                Some(value) => stored_values.push(value),
                // Any source missing the field means the field is missing.
                None => return Ok(Some(keep_field(self.ctx, field)?)),
            }
        }
        if field.selection_set.is_empty() {
            // A leaf stored in every source is satisfied.
            return Ok(None);
        }

        let stored = self.classify(field, &stored_values);
        if stored.dangling {
            return Ok(Some(keep_field(self.ctx, field)?));
        }

        let survivors =
            self.prune_selections(&field.selection_set, &Coverage::Stored(stored.nodes))?;

        let window = self.ctx.field_window(field);
        let want = window.first.or(window.last);
        let short_bucket = match (window.paginated, want) {
            (true, Some(want)) => stored.bucket_lengths.iter().any(|len| *len < want),
            _ => false,
        };

        if !short_bucket {
            if survivors.is_empty() {
                return Ok(None);
            }
            return Ok(Some(field_with(field, field.arguments.clone(), survivors)));
        }

        // A short bucket: ask for the missing slice when a cursor is available, otherwise
        // re-fetch the whole window.
        if let (Some(want), Some(bucket)) = (want, stored.single_bucket) {
            if let Some(arguments) = self.sliced_arguments(field, &window, want, bucket)? {
                let selections = keep_selection_set(self.ctx, &field.selection_set)?;
                return Ok(Some(field_with(field, arguments, selections.selections)));
            }
        }
        Ok(Some(keep_field(self.ctx, field)?))
    }

    fn classify(&self, field: &Field, stored_values: &[&'a Value]) -> StoredField<'a> {
        let field_type = field.definition.ty.inner_named_type().as_str();
        let mut stored = StoredField {
            nodes: Vec::new(),
            dangling: false,
            bucket_lengths: Vec::new(),
            single_bucket: None,
        };
        for value in stored_values.iter().copied() {
            match value {
                Value::Array(items) => {
                    stored.bucket_lengths.push(items.len());
                    if stored_values.len() == 1 {
                        stored.single_bucket = Some(items);
                    }
                    for item in items {
                        self.classify_node(field_type, item, &mut stored);
                    }
                }
                other => self.classify_node(field_type, other, &mut stored),
            }
        }
        stored
    }

    fn classify_node(&self, field_type: &str, value: &'a Value, stored: &mut StoredField<'a>) {
        if let Some(key) = EntityKey::from_ref(value) {
            match self
                .state
                .entities
                .get(&key.type_name)
                .and_then(|bodies| bodies.get(&key.id))
                .and_then(Value::as_object)
            {
                Some(body) => stored.nodes.push(SourceNode {
                    body,
                    type_name: key.type_name,
                }),
                None => stored.dangling = true,
            }
            return;
        }
        match value {
            Value::Object(body) => {
                let type_name = body
                    .get(TYPENAME)
                    .and_then(Value::as_str)
                    .unwrap_or(field_type)
                    .to_string();
                stored.nodes.push(SourceNode { body, type_name });
            }
            // Null and stray scalars are satisfied data.
            _ => {}
        }
    }

    /// Arguments asking only for the missing slice of a pagination window, preferring the
    /// form of the original operation. Returns `None` when no boundary cursor is stored.
    fn sliced_arguments(
        &mut self,
        field: &Field,
        window: &FieldWindow,
        want: usize,
        bucket: &[Value],
    ) -> Result<Option<Vec<Node<ast::Argument>>>, CacheError> {
        crate::ensure!(
            bucket.len() < want,
            "pagination slice requested for a bucket that already satisfies the window"
        );
        let missing = want - bucket.len();
        let forward = window.first.is_some();
        let boundary = if forward {
            bucket.last()
        } else {
            bucket.first()
        };
        let Some(cursor) = boundary.and_then(|item| self.cursor_of(item)) else {
            return Ok(None);
        };

        let words = &self.ctx.pagination_words;
        let (count_word, cursor_word) = if forward {
            (words.first.as_str(), words.after.as_str())
        } else {
            self.backward = true;
            (words.last.as_str(), words.before.as_str())
        };
        let mut arguments: Vec<Node<ast::Argument>> = field
            .arguments
            .iter()
            .filter(|argument| !words.contains(argument.name.as_str()))
            .cloned()
            .collect();
        arguments.push(Node::new(ast::Argument {
            name: pagination_name(count_word)?,
            value: Node::new(ast::Value::Int((missing as i32).into())),
        }));
        arguments.push(Node::new(ast::Argument {
            name: pagination_name(cursor_word)?,
            value: Node::new(ast::Value::String(cursor)),
        }));
        Ok(Some(arguments))
    }

    fn cursor_of(&self, item: &Value) -> Option<String> {
        let body = match EntityKey::from_ref(item) {
            Some(key) => self
                .state
                .entities
                .get(&key.type_name)
                .and_then(|bodies| bodies.get(&key.id))?,
            None => item,
        };
        body.as_object()?
            .get(self.ctx.cursor_field.as_str())?
            .as_str()
            .map(str::to_string)
    }
}

fn pagination_name(word: &str) -> Result<Name, CacheError> {
    Name::new(word)
        .map_err(|_| CacheError::configuration(format!("invalid pagination word \"{word}\"")))
}

fn field_with(field: &Field, arguments: Vec<Node<ast::Argument>>, selections: Vec<Selection>) -> Field {
    Field {
        definition: field.definition.clone(),
        alias: field.alias.clone(),
        name: field.name.clone(),
        arguments,
        directives: field.directives.clone(),
        selection_set: SelectionSet {
            ty: field.selection_set.ty.clone(),
            selections,
        },
    }
}

/// A verbatim keep of a field, with fragment spreads in its subtree inlined.
fn keep_field(ctx: &QueryContext, field: &Field) -> Result<Field, CacheError> {
    Ok(field_with(
        field,
        field.arguments.clone(),
        keep_selection_set(ctx, &field.selection_set)?.selections,
    ))
}

pub(crate) fn keep_selection_set(
    ctx: &QueryContext,
    selection_set: &SelectionSet,
) -> Result<SelectionSet, CacheError> {
    let mut selections = Vec::with_capacity(selection_set.selections.len());
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => {
                selections.push(Selection::Field(Node::new(keep_field(ctx, field)?)));
            }
            Selection::InlineFragment(fragment) => {
                selections.push(Selection::InlineFragment(Node::new(InlineFragment {
                    type_condition: fragment.type_condition.clone(),
                    directives: fragment.directives.clone(),
                    selection_set: keep_selection_set(ctx, &fragment.selection_set)?,
                })));
            }
            Selection::FragmentSpread(spread) => {
                let fragment = ctx.fragment(&spread.fragment_name)?;
                selections.push(Selection::InlineFragment(Node::new(InlineFragment {
                    type_condition: Some(fragment.type_condition().clone()),
                    directives: spread.directives.clone(),
                    selection_set: keep_selection_set(ctx, &fragment.selection_set)?,
                })));
            }
        }
    }
    Ok(SelectionSet {
        ty: selection_set.ty.clone(),
        selections,
    })
}

pub(crate) fn collect_variable_names(selections: &[Selection], out: &mut IndexSet<String>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                for argument in &field.arguments {
                    collect_value_variables(&argument.value, out);
                }
                for directive in field.directives.iter() {
                    for argument in &directive.arguments {
                        collect_value_variables(&argument.value, out);
                    }
                }
                collect_variable_names(&field.selection_set.selections, out);
            }
            Selection::InlineFragment(fragment) => {
                for directive in fragment.directives.iter() {
                    for argument in &directive.arguments {
                        collect_value_variables(&argument.value, out);
                    }
                }
                collect_variable_names(&fragment.selection_set.selections, out);
            }
            Selection::FragmentSpread(spread) => {
                for directive in spread.directives.iter() {
                    for argument in &directive.arguments {
                        collect_value_variables(&argument.value, out);
                    }
                }
            }
        }
    }
}

fn collect_value_variables(value: &ast::Value, out: &mut IndexSet<String>) {
    match value {
        ast::Value::Variable(name) => {
            out.insert(name.to_string());
        }
        ast::Value::List(items) => {
            for item in items {
                collect_value_variables(item, out);
            }
        }
        ast::Value::Object(fields) => {
            for (_, item) in fields {
                collect_value_variables(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::normalize::normalize;
    use crate::test_support::test_context;

    fn seeded_state(query: &str, data: Value, caller_key: &str) -> CacheState {
        let ctx = test_context(query, json!({}));
        let normalized = normalize(&ctx, &data).unwrap();
        let mut state = CacheState::default();
        state.entities = normalized.entities;
        state.result.insert(caller_key.to_string(), normalized.result);
        state
    }

    #[test]
    fn fully_local_query_minimizes_to_nothing() {
        let query = r#"{ user(id: "u1") { id name } }"#;
        let state = seeded_state(query, json!({"user": {"id": "u1", "name": "Ada"}}), "c");
        let ctx = test_context(query, json!({}));
        assert!(minimize(&ctx, &state, "c").unwrap().is_none());
    }

    /// The sole surviving field of the sole surviving top-level selection.
    fn single_survivor(minimized: &MinimizedQuery) -> (String, Vec<String>) {
        let operation = minimized.document.operations.get(None).unwrap();
        assert_eq!(operation.selection_set.selections.len(), 1);
        let field = operation.selection_set.selections[0].as_field().unwrap();
        let subfields = field
            .selection_set
            .selections
            .iter()
            .flat_map(|selection| match selection {
                Selection::Field(sub) => vec![sub.name.to_string()],
                Selection::InlineFragment(fragment) => fragment
                    .selection_set
                    .selections
                    .iter()
                    .filter_map(|s| s.as_field().map(|f| f.name.to_string()))
                    .collect(),
                Selection::FragmentSpread(_) => vec![],
            })
            .collect();
        (field.name.to_string(), subfields)
    }

    #[test]
    fn asks_only_for_the_missing_field() {
        let state = seeded_state(
            r#"{ user(id: "u1") { id name } }"#,
            json!({"user": {"id": "u1", "name": "Ada"}}),
            "c",
        );
        let ctx = test_context(r#"{ user(id: "u1") { id name email } }"#, json!({}));
        let minimized = minimize(&ctx, &state, "c").unwrap().unwrap();
        let (field, subfields) = single_survivor(&minimized);
        assert_eq!(field, "user");
        assert_eq!(subfields, vec!["email".to_string()]);
        assert!(!minimized.backward);
    }

    #[test]
    fn cold_caller_keeps_the_whole_query_and_its_variables() {
        let ctx = test_context(
            "query ($id: ID!, $unused: Int) { user(id: $id) { id name posts(first: $unused) { id } } }",
            json!({"id": "u1"}),
        );
        let minimized = minimize(&ctx, &CacheState::default(), "c").unwrap().unwrap();
        assert!(minimized.query.contains("$id"));
        assert!(minimized.variable_names.contains("id"));
        assert!(minimized.variable_names.contains("unused"));
    }

    #[test]
    fn unreferenced_variables_are_pruned() {
        let state = seeded_state(
            r#"{ user(id: "u1") { id posts(first: 2) { id title } } }"#,
            json!({"user": {"id": "u1", "posts": [
                {"id": "p1", "title": "One"},
                {"id": "p2", "title": "Two"},
            ]}}),
            "c",
        );
        // `$n` only feeds the satisfied posts window; `email` is the only survivor.
        let ctx = test_context(
            r#"query ($n: Int) { user(id: "u1") { id email posts(first: $n) { id title } } }"#,
            json!({"n": 2}),
        );
        let minimized = minimize(&ctx, &state, "c").unwrap().unwrap();
        let (field, subfields) = single_survivor(&minimized);
        assert_eq!(field, "user");
        assert_eq!(subfields, vec!["email".to_string()]);
        assert!(minimized.variable_names.is_empty());
        assert!(!minimized.query.contains("$n"));
    }

    #[test]
    fn short_window_is_rewritten_to_the_missing_slice() {
        let state = seeded_state(
            r#"{ user(id: "u1") { id posts(first: 2) { id title cursor } } }"#,
            json!({"user": {"id": "u1", "posts": [
                {"id": "p1", "title": "One", "cursor": "c1"},
                {"id": "p2", "title": "Two", "cursor": "c2"},
            ]}}),
            "c",
        );
        let ctx = test_context(
            r#"{ user(id: "u1") { id posts(first: 5) { id title cursor } } }"#,
            json!({}),
        );
        let minimized = minimize(&ctx, &state, "c").unwrap().unwrap();
        let operation = minimized.document.operations.get(None).unwrap();
        let user = operation.selection_set.selections[0].as_field().unwrap();
        let posts = user.selection_set.selections[0].as_field().unwrap();
        assert_eq!(posts.name.as_str(), "posts");
        let window = ctx.field_window(posts);
        assert_eq!(window.first, Some(3));
        assert_eq!(window.after.as_deref(), Some("c2"));
        assert!(!minimized.backward);
    }

    #[test]
    fn backward_window_prefers_last_and_before() {
        let state = seeded_state(
            r#"{ user(id: "u1") { id posts(last: 1) { id cursor } } }"#,
            json!({"user": {"id": "u1", "posts": [
                {"id": "p9", "cursor": "c9"},
            ]}}),
            "c",
        );
        let ctx = test_context(
            r#"{ user(id: "u1") { id posts(last: 3) { id cursor } } }"#,
            json!({}),
        );
        let minimized = minimize(&ctx, &state, "c").unwrap().unwrap();
        let operation = minimized.document.operations.get(None).unwrap();
        let user = operation.selection_set.selections[0].as_field().unwrap();
        let posts = user.selection_set.selections[0].as_field().unwrap();
        let window = ctx.field_window(posts);
        assert_eq!(window.last, Some(2));
        assert_eq!(window.before.as_deref(), Some("c9"));
        assert!(minimized.backward);
    }

    #[test]
    fn fragment_spreads_survive_as_inline_fragments() {
        let state = seeded_state(
            r#"{ user(id: "u1") { id name } }"#,
            json!({"user": {"id": "u1", "name": "Ada"}}),
            "c",
        );
        let ctx = test_context(
            r#"{ user(id: "u1") { id ...details } } fragment details on User { name email }"#,
            json!({}),
        );
        let minimized = minimize(&ctx, &state, "c").unwrap().unwrap();
        let (field, subfields) = single_survivor(&minimized);
        assert_eq!(field, "user");
        assert_eq!(subfields, vec!["email".to_string()]);
        // The spread was inlined; no fragment definitions survive.
        assert!(minimized.document.fragments.is_empty());
        assert!(!minimized.query.contains("fragment"));
    }
}
