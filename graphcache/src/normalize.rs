//! Flattens a server-shaped response into `{ entities, result }`, guided by the query AST
//! and the schema.
//!
//! For each selection: scalars copy, objects carrying the identity field become entities
//! keyed `(type, id)` with a reference left behind in the result, identity-less objects
//! inline, arrays map recursively. Fields with pagination arguments are stored in arg-keyed
//! buckets (see [`QueryContext::field_storage_key`]) so different pages of one logical list
//! coexist.

use apollo_compiler::executable::Field;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::context::QueryContext;
use crate::error::CacheError;
use crate::store::merge_value;
use crate::store::Entities;
use crate::store::EntityKey;
use crate::store::MergeMode;
use crate::store::NormalizedResponse;

const TYPENAME: &str = "__typename";

/// Normalizes `data` against the context's operation. Missing fields are tolerated: the
/// walk only flattens what the response actually carries.
pub fn normalize(ctx: &QueryContext, data: &Value) -> Result<NormalizedResponse, CacheError> {
    let operation = ctx.operation()?;
    let root = ctx.root_type_name(operation)?.to_string();
    let mut normalizer = Normalizer {
        ctx,
        entities: Entities::default(),
    };
    let result = normalizer.object_value(&root, &operation.selection_set, data)?;
    Ok(NormalizedResponse {
        entities: normalizer.entities,
        result,
    })
}

struct Normalizer<'a> {
    ctx: &'a QueryContext,
    entities: Entities,
}

impl Normalizer<'_> {
    fn object_value(
        &mut self,
        parent_type: &str,
        selection_set: &SelectionSet,
        data: &Value,
    ) -> Result<Value, CacheError> {
        let Some(source) = data.as_object() else {
            return Ok(Value::Null);
        };
        let mut out = Map::new();
        self.apply_selections(parent_type, selection_set, source, &mut out)?;
        Ok(Value::Object(out))
    }

    fn apply_selections(
        &mut self,
        parent_type: &str,
        selection_set: &SelectionSet,
        source: &Map<ByteString, Value>,
        out: &mut Map<ByteString, Value>,
    ) -> Result<(), CacheError> {
        let concrete = concrete_type(source, parent_type);
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    let response_key = field.response_key().as_str();
                    if field.name == TYPENAME {
                        if let Some(value) = source.get(response_key) {
                            out.insert(ByteString::from(response_key), value.clone());
                        }
                        continue;
                    }
                    let Some(value) = source.get(response_key) else {
                        continue;
                    };
                    let field_type = field.definition.ty.inner_named_type().as_str();
                    let normalized = self.field_value(field_type, field, value)?;
                    out.insert(
                        ByteString::from(self.ctx.field_storage_key(field)),
                        normalized,
                    );
                }
                Selection::InlineFragment(fragment) => {
                    let matches = fragment
                        .type_condition
                        .as_ref()
                        .map_or(true, |condition| {
                            self.ctx.type_condition_matches(condition, concrete)
                        });
                    if matches {
                        self.apply_selections(concrete, &fragment.selection_set, source, out)?;
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = self.ctx.fragment(&spread.fragment_name)?;
                    if self
                        .ctx
                        .type_condition_matches(fragment.type_condition(), concrete)
                    {
                        self.apply_selections(concrete, &fragment.selection_set, source, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn field_value(
        &mut self,
        field_type: &str,
        field: &Field,
        value: &Value,
    ) -> Result<Value, CacheError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Array(items) => items
                .iter()
                .map(|item| self.field_value(field_type, field, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(object) => {
                if field.selection_set.is_empty() {
                    // Custom scalar with an object representation.
                    return Ok(value.clone());
                }
                let concrete = concrete_type(object, field_type).to_string();
                let mut body = Map::new();
                self.apply_selections(&concrete, &field.selection_set, object, &mut body)?;
                match identity_of(&body, &self.ctx.id_field) {
                    Some(id) => {
                        let key = EntityKey::new(concrete, id);
                        self.insert_entity(&key, Value::Object(body));
                        Ok(key.to_ref())
                    }
                    None => Ok(Value::Object(body)),
                }
            }
            _ => Ok(value.clone()),
        }
    }

    fn insert_entity(&mut self, key: &EntityKey, body: Value) {
        let slot = self.entities.entry(key.type_name.clone()).or_default();
        match slot.get_mut(&key.id) {
            Some(existing) => merge_value(existing, &body, MergeMode::Query),
            None => {
                slot.insert(key.id.clone(), body);
            }
        }
    }
}

/// The concrete type of an object: its served `__typename` when present (unions and
/// interfaces), the statically known type otherwise.
fn concrete_type<'a>(object: &'a Map<ByteString, Value>, fallback: &'a str) -> &'a str {
    object
        .get(TYPENAME)
        .and_then(Value::as_str)
        .unwrap_or(fallback)
}

fn identity_of(body: &Map<ByteString, Value>, id_field: &str) -> Option<String> {
    match body.get(id_field)? {
        Value::String(s) => Some(s.as_str().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
