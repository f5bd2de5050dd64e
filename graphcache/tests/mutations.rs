//! Mutation-path scenarios: merged mutation projection, optimistic and authoritative
//! handlers, the invalidate path, and failure behavior.

use std::sync::Arc;

use graphcache::HandlerOutcome;
use graphcache::HandlerView;
use graphcache::MutationHandler;
use graphcache::MutationOptions;
use graphcache::QueryOptions;
use pretty_assertions::assert_eq;
use serde_json_bytes::json;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::common::build_cache;
use crate::common::RecordingTransport;

/// Rewrites the title of the post named by the payload, optimistically from the mutation
/// variables and authoritatively from the server document.
struct RenamePostHandler;

impl RenamePostHandler {
    fn rename(current: &Value, post_id: &Value, title: &Value) -> Value {
        let mut data = current.clone();
        let posts = data
            .as_object_mut()
            .and_then(|data| data.get_mut("user"))
            .and_then(Value::as_object_mut)
            .and_then(|user| user.get_mut("posts"))
            .and_then(Value::as_array_mut);
        if let Some(posts) = posts {
            for post in posts {
                if post.get("id") == Some(post_id) {
                    if let Some(post) = post.as_object_mut() {
                        post.insert(ByteString::from("title"), title.clone());
                    }
                }
            }
        }
        data
    }
}

impl MutationHandler for RenamePostHandler {
    fn optimistic(&self, view: &HandlerView<'_>) -> HandlerOutcome {
        let (Some(post_id), Some(title)) =
            (view.variables.get("postId"), view.variables.get("title"))
        else {
            return HandlerOutcome::Noop;
        };
        HandlerOutcome::Replace(Self::rename(view.current, post_id, title))
    }

    fn authoritative(&self, response: &Value, view: &HandlerView<'_>) -> HandlerOutcome {
        let (Some(post_id), Some(title)) = (response.get("id"), response.get("title")) else {
            return HandlerOutcome::Noop;
        };
        HandlerOutcome::Replace(Self::rename(view.current, post_id, title))
    }
}

struct InvalidatingHandler;

impl MutationHandler for InvalidatingHandler {
    fn authoritative(&self, _response: &Value, _view: &HandlerView<'_>) -> HandlerOutcome {
        HandlerOutcome::Invalidate
    }
}

const POSTS_QUERY: &str = r#"{ user(id: "u1") { id posts(first: 2) { id title } } }"#;
const NAME_QUERY: &str = r#"{ user(id: "u1") { id name } }"#;

fn posts_data() -> Value {
    json!({
        "user": {
            "id": "u1",
            "posts": [
                {"id": "p1", "title": "One"},
                {"id": "p2", "title": "Two"},
            ],
        }
    })
}

#[tokio::test]
async fn mutation_projects_only_the_interested_caller() {
    let transport = RecordingTransport::new(vec![
        RecordingTransport::ok(posts_data()),
        RecordingTransport::ok(json!({"user": {"id": "u1", "name": "Ada"}})),
        RecordingTransport::ok(json!({"renamePost": {"id": "p1", "title": "Renamed"}})),
    ]);
    let (cache, _) = build_cache(transport.clone());

    cache
        .query(
            POSTS_QUERY,
            QueryOptions {
                caller_id: Some("list".to_string()),
                mutation_handlers: vec![("renamePost".to_string(), Arc::new(RenamePostHandler))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    cache
        .query(
            NAME_QUERY,
            QueryOptions {
                caller_id: Some("header".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let header_before = cache.read("header", None).unwrap();

    cache
        .mutate(
            "renamePost",
            MutationOptions {
                variables: Some(json!({"postId": "p1", "title": "Renamed"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    let mutation = &calls[2];
    assert!(mutation.query.contains("renamePost"));
    // Only the interested caller's projection: post fields, not the header's user fields.
    assert!(mutation.query.contains("title"));
    assert!(!mutation.query.contains("name"));
    assert_eq!(
        mutation.variables,
        Some(json!({"postId": "p1", "title": "Renamed"}))
    );

    // The interested caller sees the rename and got a fresh response object.
    let list = cache.read("list", None).unwrap();
    assert_eq!(
        list.data
            .get("user")
            .and_then(|user| user.get("posts"))
            .and_then(|posts| posts.get(0))
            .and_then(|post| post.get("title")),
        Some(&json!("Renamed"))
    );

    // The store holds the authoritative title.
    let state = cache.state();
    assert_eq!(
        state
            .entities
            .get("Post")
            .and_then(|posts| posts.get("p1"))
            .and_then(|post| post.get("title")),
        Some(&json!("Renamed"))
    );

    // The uninterested caller depends only on User.u1, which did not change: its cached
    // response is untouched.
    let header_after = cache.read("header", None).unwrap();
    assert!(Arc::ptr_eq(&header_before, &header_after));
}

#[tokio::test]
async fn optimistic_update_applies_before_the_server_responds() {
    // The mutation transport fails: only the optimistic pass can have run.
    let transport = RecordingTransport::new(vec![RecordingTransport::ok(posts_data())]);
    let (cache, _) = build_cache(transport.clone());

    cache
        .query(
            POSTS_QUERY,
            QueryOptions {
                caller_id: Some("list".to_string()),
                mutation_handlers: vec![("renamePost".to_string(), Arc::new(RenamePostHandler))],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    cache
        .mutate(
            "renamePost",
            MutationOptions {
                variables: Some(json!({"postId": "p2", "title": "Optimistic"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The optimistic state is left in place; the error is recorded, not auto-reverted.
    let list = cache.read("list", None).unwrap();
    assert_eq!(
        list.data
            .get("user")
            .and_then(|user| user.get("posts"))
            .and_then(|posts| posts.get(1))
            .and_then(|post| post.get("title")),
        Some(&json!("Optimistic"))
    );
    assert!(cache.state().error.is_some());
}

#[tokio::test]
async fn invalidating_handler_triggers_a_refetch_for_its_caller_only() {
    let transport = RecordingTransport::new(vec![
        RecordingTransport::ok(posts_data()),
        RecordingTransport::ok(json!({"renamePost": {"id": "p1", "title": "Renamed"}})),
        // The refetch of the full query.
        RecordingTransport::ok(json!({
            "user": {
                "id": "u1",
                "posts": [
                    {"id": "p1", "title": "Renamed"},
                    {"id": "p2", "title": "Two"},
                ],
            }
        })),
    ]);
    let (cache, _) = build_cache(transport.clone());

    cache
        .query(
            POSTS_QUERY,
            QueryOptions {
                caller_id: Some("list".to_string()),
                mutation_handlers: vec![("renamePost".to_string(), Arc::new(InvalidatingHandler))],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    cache
        .mutate(
            "renamePost",
            MutationOptions {
                variables: Some(json!({"postId": "p1", "title": "Renamed"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    // The third call is the caller's refetch, not another mutation.
    assert!(calls[2].query.contains("user"));
    assert!(!calls[2].query.contains("renamePost"));

    let list = cache.read("list", None).unwrap();
    assert!(list.is_complete);
    assert_eq!(
        list.data
            .get("user")
            .and_then(|user| user.get("posts"))
            .and_then(|posts| posts.get(0))
            .and_then(|post| post.get("title")),
        Some(&json!("Renamed"))
    );
}

#[tokio::test]
async fn unknown_mutation_names_fail_immediately() {
    let transport = RecordingTransport::new(vec![]);
    let (cache, _) = build_cache(transport.clone());
    let error = cache
        .mutate("doesNotExist", MutationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        graphcache::CacheError::UnknownMutation { .. }
    ));
    assert_eq!(transport.call_count(), 0);
}
