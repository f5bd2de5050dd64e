//! Reconstructs a response shape from the normalized store, marking completeness.
//!
//! The inverse of the normalization walk: references resolve through `entities`, missing
//! references or scalars omit their subtree and clear `is_complete`. A missing entity is
//! data, never an error.

use apollo_compiler::executable::Field;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::context::QueryContext;
use crate::error::CacheError;
use crate::store::CacheState;
use crate::store::EntityKey;

const TYPENAME: &str = "__typename";

#[derive(Clone, Debug)]
pub struct DenormalizedResult {
    pub data: Value,
    pub is_complete: bool,
    /// True when no skeleton is stored for the caller yet: the first run of this query.
    pub first_run: bool,
}

/// Denormalizes the context's operation for the caller stored under `caller_key`.
pub fn denormalize(
    ctx: &QueryContext,
    state: &CacheState,
    caller_key: &str,
) -> Result<DenormalizedResult, CacheError> {
    let operation = ctx.operation()?;
    let Some(skeleton) = state.result.get(caller_key) else {
        return Ok(DenormalizedResult {
            data: Value::Object(Map::new()),
            is_complete: false,
            first_run: true,
        });
    };
    let root = ctx.root_type_name(operation)?.to_string();
    let mut denormalizer = Denormalizer {
        ctx,
        state,
        complete: true,
    };
    let data = denormalizer.object_value(&root, &operation.selection_set, skeleton)?;
    Ok(DenormalizedResult {
        data,
        is_complete: denormalizer.complete,
        first_run: false,
    })
}

struct Denormalizer<'a> {
    ctx: &'a QueryContext,
    state: &'a CacheState,
    complete: bool,
}

impl Denormalizer<'_> {
    fn object_value(
        &mut self,
        parent_type: &str,
        selection_set: &SelectionSet,
        source: &Value,
    ) -> Result<Value, CacheError> {
        let Some(source) = source.as_object() else {
            self.complete = false;
            return Ok(Value::Object(Map::new()));
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
        for selection in &selection_set.selections {
            match selection {
                Selection::Field(field) => {
                    let response_key = field.response_key().as_str();
                    if field.name == TYPENAME {
                        let value = source
                            .get(response_key)
                            .cloned()
                            .unwrap_or_else(|| Value::String(ByteString::from(parent_type)));
                        out.insert(ByteString::from(response_key), value);
                        continue;
                    }
                    let storage_key = self.ctx.field_storage_key(field);
                    let Some(stored) = source.get(storage_key.as_str()) else {
                        self.complete = false;
                        continue;
                    };
                    let field_type = field.definition.ty.inner_named_type().as_str();
                    let value = self.field_value(field_type, field, stored)?;
                    out.insert(ByteString::from(response_key), value);
                }
                Selection::InlineFragment(fragment) => {
                    let matches = fragment
                        .type_condition
                        .as_ref()
                        .map_or(true, |condition| {
                            self.ctx.type_condition_matches(condition, parent_type)
                        });
                    if matches {
                        self.apply_selections(parent_type, &fragment.selection_set, source, out)?;
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = self.ctx.fragment(&spread.fragment_name)?;
                    if self
                        .ctx
                        .type_condition_matches(fragment.type_condition(), parent_type)
                    {
                        self.apply_selections(parent_type, &fragment.selection_set, source, out)?;
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
        stored: &Value,
    ) -> Result<Value, CacheError> {
        if let Some(key) = EntityKey::from_ref(stored) {
            return self.entity_value(&key, field);
        }
        match stored {
            Value::Array(items) => {
                let window = self.ctx.field_window(field);
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.field_value(field_type, field, item)?);
                }
                if window.paginated {
                    if let Some(first) = window.first {
                        if resolved.len() < first {
                            self.complete = false;
                        } else {
                            resolved.truncate(first);
                        }
                    } else if let Some(last) = window.last {
                        if resolved.len() < last {
                            self.complete = false;
                        } else {
                            let keep_from = resolved.len() - last;
                            resolved.drain(..keep_from);
                        }
                    }
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(_) if !field.selection_set.is_empty() => {
                // Identity-less object, inlined at normalization time.
                self.object_value(field_type, &field.selection_set, stored)
            }
            _ => Ok(stored.clone()),
        }
    }

    fn entity_value(&mut self, key: &EntityKey, field: &Field) -> Result<Value, CacheError> {
        let Some(body) = self
            .state
            .entities
            .get(&key.type_name)
            .and_then(|bodies| bodies.get(&key.id))
        else {
            self.complete = false;
            return Ok(Value::Null);
        };
        if field.selection_set.is_empty() {
            // A reference in a leaf position cannot be reconstructed into a scalar.
            self.complete = false;
            return Ok(Value::Null);
        }
        // The reference key carries the concrete type, which drives fragment matching.
        self.object_value(&key.type_name, &field.selection_set, body)
    }
}
