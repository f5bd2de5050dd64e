//! Shared fixtures: the test schema, scripted transports, and store seeding.

use std::sync::Arc;

use async_trait::async_trait;
use graphcache::store::Entities;
use graphcache::Cache;
use graphcache::CacheAction;
use graphcache::CacheConfig;
use graphcache::CallerPath;
use graphcache::CallerWrite;
use graphcache::MemoryStore;
use graphcache::QueryPayload;
use graphcache::ServerResponse;
use graphcache::StateContainer;
use graphcache::Transport;
use graphcache::TransportError;
use parking_lot::Mutex;
use serde_json_bytes::Value;
use tokio::sync::Notify;

pub const SCHEMA: &str = r#"
type Query {
    user(id: ID!): User
    post(id: ID!): Post
}

type Mutation {
    renamePost(postId: ID!, title: String!): Post
    addPost(userId: ID!, title: String!): Post
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
"#;

pub fn build_cache(transport: Arc<dyn Transport>) -> (Cache, Arc<MemoryStore>) {
    let schema =
        apollo_compiler::Schema::parse_and_validate(SCHEMA, "schema.graphql").expect("test schema");
    let store = Arc::new(MemoryStore::new());
    let cache =
        Cache::new(CacheConfig::new(store.clone(), transport, schema)).expect("cache config");
    (cache, store)
}

/// Installs entities and caller skeletons through the regular action path.
pub fn seed(store: &MemoryStore, entities: &[(&str, &str, Value)], skeletons: &[(&str, Value)]) {
    let mut seeded = Entities::default();
    for (type_name, id, body) in entities {
        seeded
            .entry(type_name.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
    }
    let callers = skeletons
        .iter()
        .map(|(caller_id, result)| CallerWrite {
            path: CallerPath::new(*caller_id, None),
            result: Some(result.clone()),
            variables: None,
        })
        .collect();
    store.dispatch(CacheAction::InsertQuery {
        entities: seeded,
        callers,
    });
}

/// Records every payload and answers from a scripted response list, in order.
pub struct RecordingTransport {
    calls: Mutex<Vec<QueryPayload>>,
    responses: Mutex<Vec<ServerResponse>>,
}

impl RecordingTransport {
    pub fn new(responses: Vec<ServerResponse>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(responses),
        })
    }

    pub fn ok(data: Value) -> ServerResponse {
        ServerResponse { data, error: None }
    }

    pub fn calls(&self) -> Vec<QueryPayload> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn handle_query(&self, payload: QueryPayload) -> Result<ServerResponse, TransportError> {
        self.calls.lock().push(payload);
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            return Err(TransportError::new("no scripted response left"));
        }
        Ok(responses.remove(0))
    }
}

/// Like [`RecordingTransport`], but every request parks until released, so tests can
/// overlap callers on one in-flight fetch.
pub struct GatedTransport {
    calls: Mutex<Vec<QueryPayload>>,
    responses: Mutex<Vec<ServerResponse>>,
    gate: Notify,
}

impl GatedTransport {
    pub fn new(responses: Vec<ServerResponse>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(responses),
            gate: Notify::new(),
        })
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn handle_query(&self, payload: QueryPayload) -> Result<ServerResponse, TransportError> {
        self.calls.lock().push(payload);
        self.gate.notified().await;
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            return Err(TransportError::new("no scripted response left"));
        }
        Ok(responses.remove(0))
    }
}
