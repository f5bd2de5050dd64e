//! Shared fixtures for unit tests.

use std::sync::Arc;

use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Schema;
use serde_json_bytes::Value;

use crate::context::PaginationWords;
use crate::context::QueryContext;

pub(crate) const TEST_SCHEMA: &str = r#"
type Query {
    user(id: ID!): User
    users: [User]
    post(id: ID!): Post
    feed: [FeedItem]
}

type Mutation {
    renamePost(postId: ID!, title: String!): Post
    addPost(userId: ID!, title: String!): Post
    ping: Boolean
}

type Subscription {
    postAdded(userId: ID!): Post
}

type User {
    id: ID!
    name: String
    email: String
    posts(first: Int, after: String, last: Int, before: String): [Post]
}

type Post {
    id: ID!
    title: String
    cursor: String
    author: User
}

type Comment {
    id: ID!
    text: String
}

union FeedItem = Post | Comment
"#;

pub(crate) fn test_schema() -> Arc<Valid<Schema>> {
    Arc::new(
        Schema::parse_and_validate(TEST_SCHEMA, "schema.graphql")
            .expect("test schema is valid"),
    )
}

pub(crate) fn test_context(query: &str, variables: Value) -> QueryContext {
    let schema = test_schema();
    let document = ExecutableDocument::parse_and_validate(&schema, query, "query.graphql")
        .expect("test query is valid");
    QueryContext {
        document: Arc::new(document),
        schema,
        operation_name: None,
        variables,
        pagination_words: PaginationWords::default(),
        id_field: "id".to_string(),
        cursor_field: "cursor".to_string(),
    }
}
