//! A client-side GraphQL cache and query coordinator.
//!
//! The core sits between an application and a GraphQL server and keeps one normalized
//! store coherent across four tightly coupled paths:
//!
//! - a normalized/denormalized store duality with a bidirectional dependency index
//!   between entities and the callers rendering them,
//! - a query path that answers from the store when possible, asks the server for the
//!   minimal missing subtree otherwise, and dedupes identical in-flight requests,
//! - a mutation pipeline with optimistic handlers, a merged per-caller mutation
//!   document, and selective invalidation,
//! - a subscription path applying ADD/UPDATE/REMOVE patches whose effects cascade into
//!   query invalidation.
//!
//! GraphQL parsing and schema introspection are delegated to [`apollo_compiler`]; the
//! transport and the host's observable state container are traits the application
//! implements ([`Transport`], [`StateContainer`]). Construct a [`Cache`] per host
//! application via [`CacheConfig`]; there is no process-wide state.

mod context;
mod coordinator;
mod denormalize;
mod deps;
mod minimize;
mod normalize;
#[cfg(test)]
mod test_support;

pub mod cache;
pub mod error;
pub mod mutation;
pub mod store;
pub mod subscription;
pub mod transport;

pub use crate::cache::Cache;
pub use crate::cache::CacheConfig;
pub use crate::cache::QueryResponse;
pub use crate::context::PaginationWords;
pub use crate::coordinator::QueryOptions;
pub use crate::coordinator::VariableFn;
pub use crate::error::CacheError;
pub use crate::mutation::HandlerOutcome;
pub use crate::mutation::HandlerView;
pub use crate::mutation::MutationHandler;
pub use crate::mutation::MutationOptions;
pub use crate::mutation::VariableEnhancer;
pub use crate::store::CacheAction;
pub use crate::store::CacheState;
pub use crate::store::CallerPath;
pub use crate::store::CallerWrite;
pub use crate::store::EntityKey;
pub use crate::store::MemoryStore;
pub use crate::store::NormalizedResponse;
pub use crate::store::StateContainer;
pub use crate::subscription::PatchHandle;
pub use crate::subscription::PatchOptions;
pub use crate::subscription::SubscriptionHandle;
pub use crate::subscription::SubscriptionOptions;
pub use crate::subscription::Subscriber;
pub use crate::subscription::Unsubscribe;
pub use crate::transport::QueryPayload;
pub use crate::transport::ServerResponse;
pub use crate::transport::Transport;
pub use crate::transport::TransportError;
