//! The execution context shared by the normalization, denormalization, and minimization
//! walks: one parsed document, the schema, and the resolved variable bag.

use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Fragment;
use apollo_compiler::executable::Operation;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use itertools::Itertools;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::error::CacheError;

/// The four reserved cursor argument names, renameable via configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaginationWords {
    pub before: String,
    pub after: String,
    pub first: String,
    pub last: String,
}

impl Default for PaginationWords {
    fn default() -> Self {
        Self {
            before: "before".to_string(),
            after: "after".to_string(),
            first: "first".to_string(),
            last: "last".to_string(),
        }
    }
}

impl PaginationWords {
    pub fn contains(&self, word: &str) -> bool {
        word == self.before || word == self.after || word == self.first || word == self.last
    }
}

/// Everything a walk needs. Contexts are cheap to build and never mutated by the walks
/// themselves: the minimizer constructs new AST nodes instead of rewriting arguments in
/// place, so there is no argument stash to restore.
#[derive(Clone)]
pub struct QueryContext {
    pub document: Arc<Valid<ExecutableDocument>>,
    pub schema: Arc<Valid<Schema>>,
    pub operation_name: Option<String>,
    /// Resolved variable bag, always an object.
    pub variables: Value,
    pub pagination_words: PaginationWords,
    pub id_field: String,
    pub cursor_field: String,
}

/// Evaluated pagination arguments of one field occurrence.
#[derive(Clone, Debug, Default)]
pub struct FieldWindow {
    pub paginated: bool,
    pub first: Option<usize>,
    pub last: Option<usize>,
    pub after: Option<String>,
    pub before: Option<String>,
}

impl QueryContext {
    pub fn operation(&self) -> Result<&Node<Operation>, CacheError> {
        self.document
            .operations
            .get(self.operation_name.as_deref())
            .map_err(|_| {
                CacheError::document(match &self.operation_name {
                    Some(name) => format!("operation \"{name}\" not found in document"),
                    None => "document has no single anonymous operation".to_string(),
                })
            })
    }

    pub fn root_type_name(&self, operation: &Operation) -> Result<&Name, CacheError> {
        self.schema
            .root_operation(operation.operation_type)
            .ok_or_else(|| {
                CacheError::document(format!(
                    "schema has no {} root type",
                    operation.operation_type
                ))
            })
    }

    pub fn fragment(&self, name: &Name) -> Result<&Node<Fragment>, CacheError> {
        self.document
            .fragments
            .get(name)
            .ok_or_else(|| CacheError::document(format!("fragment \"{name}\" is not defined")))
    }

    /// Evaluates an AST argument value against the variable bag. Unbound variables become
    /// `null`, which downstream walks treat as missing data rather than an error.
    pub fn argument_value(&self, value: &ast::Value) -> Value {
        match value {
            ast::Value::Null => Value::Null,
            ast::Value::Boolean(b) => Value::Bool(*b),
            ast::Value::Enum(name) => Value::String(ByteString::from(name.as_str())),
            ast::Value::String(s) => Value::String(ByteString::from(s.as_str())),
            ast::Value::Variable(name) => self
                .variables
                .as_object()
                .and_then(|vars| vars.get(name.as_str()))
                .cloned()
                .unwrap_or(Value::Null),
            ast::Value::Int(i) => i
                .as_str()
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .unwrap_or(Value::Null),
            ast::Value::Float(f) => f
                .as_str()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ast::Value::List(items) => {
                Value::Array(items.iter().map(|item| self.argument_value(item)).collect())
            }
            ast::Value::Object(fields) => {
                let mut object = serde_json_bytes::Map::new();
                for (name, value) in fields {
                    object.insert(ByteString::from(name.as_str()), self.argument_value(value));
                }
                Value::Object(object)
            }
        }
    }

    /// Key under which a field occurrence is stored in skeletons and entity bodies.
    ///
    /// The response key is suffixed with the evaluated non-pagination arguments so calls
    /// with different arguments occupy distinct slots, while pagination arguments are
    /// excluded so every page of one logical list lands in the same bucket.
    pub fn field_storage_key(&self, field: &Field) -> String {
        let filtered = field
            .arguments
            .iter()
            .filter(|argument| !self.pagination_words.contains(argument.name.as_str()))
            .sorted_by(|a, b| a.name.as_str().cmp(b.name.as_str()))
            .map(|argument| {
                let value = self.argument_value(&argument.value);
                format!(
                    "{}:{}",
                    argument.name,
                    serde_json::to_string(&value).unwrap_or_default()
                )
            })
            .join(",");
        if filtered.is_empty() {
            field.response_key().to_string()
        } else {
            format!("{}({})", field.response_key(), filtered)
        }
    }

    /// Evaluates the pagination window requested by a field occurrence.
    pub fn field_window(&self, field: &Field) -> FieldWindow {
        let mut window = FieldWindow::default();
        for argument in &field.arguments {
            let name = argument.name.as_str();
            if !self.pagination_words.contains(name) {
                continue;
            }
            window.paginated = true;
            let value = self.argument_value(&argument.value);
            if name == self.pagination_words.first {
                window.first = value.as_i64().and_then(|n| usize::try_from(n).ok());
            } else if name == self.pagination_words.last {
                window.last = value.as_i64().and_then(|n| usize::try_from(n).ok());
            } else if name == self.pagination_words.after {
                window.after = value.as_str().map(str::to_string);
            } else if name == self.pagination_words.before {
                window.before = value.as_str().map(str::to_string);
            }
        }
        window
    }

    /// Whether a concrete type satisfies a fragment's type condition: an exact match, a
    /// union the type is a member of, or an interface the type implements.
    pub fn type_condition_matches(&self, condition: &Name, concrete: &str) -> bool {
        if condition.as_str() == concrete {
            return true;
        }
        match self.schema.types.get(condition.as_str()) {
            Some(ExtendedType::Union(union_type)) => union_type
                .members
                .iter()
                .any(|member| member.name.as_str() == concrete),
            Some(ExtendedType::Interface(_)) => {
                matches!(
                    self.schema.types.get(concrete),
                    Some(ExtendedType::Object(object)) if object
                        .implements_interfaces
                        .iter()
                        .any(|interface| interface.name == *condition)
                )
            }
            _ => false,
        }
    }

}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use crate::test_support::test_context;

    #[test]
    fn arguments_resolve_variables_and_literals() {
        let ctx = test_context(
            "query ($id: ID!) { user(id: $id) { id name } }",
            json!({"id": "u1"}),
        );
        let operation = ctx.operation().unwrap();
        let field = operation.selection_set.selections[0].as_field().unwrap();
        assert_eq!(ctx.field_storage_key(field), r#"user(id:"u1")"#);
    }

    #[test]
    fn pagination_words_are_excluded_from_storage_keys() {
        let ctx = test_context(
            r#"{ user(id: "u1") { posts(first: 5, after: "c") { id } } }"#,
            json!({}),
        );
        let operation = ctx.operation().unwrap();
        let user = operation.selection_set.selections[0].as_field().unwrap();
        let posts = user.selection_set.selections[0].as_field().unwrap();
        assert_eq!(ctx.field_storage_key(posts), "posts");
        let window = ctx.field_window(posts);
        assert!(window.paginated);
        assert_eq!(window.first, Some(5));
        assert_eq!(window.after.as_deref(), Some("c"));
    }

    #[test]
    fn type_conditions_match_unions_and_interfaces() {
        let ctx = test_context("{ feed { __typename } }", json!({}));
        let item = apollo_compiler::name!("FeedItem");
        let named = apollo_compiler::name!("Post");
        assert!(ctx.type_condition_matches(&item, "Post"));
        assert!(ctx.type_condition_matches(&named, "Post"));
        assert!(!ctx.type_condition_matches(&named, "User"));
    }
}
