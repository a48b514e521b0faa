// Entwine - association-aware query engine over SQLite

// Schema layer - entities, attributes, associations and the registry
pub mod schema;

// Query layer - condition trees, join planning and scope merging
pub mod query;

// Execution - SQL rendering and row decoding
mod executor;

// Model surface - Db handle and per-entity CRUD operations
pub mod model;

// Lifecycle hooks around every write path
pub mod hooks;

// Transactions - managed and unmanaged, explicit context passing
pub mod txn;

// Common utilities
pub mod config;
pub mod error;

/// Install the default tracing subscriber. Intended for binaries and test
/// harnesses; a second call is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// Re-exports for convenience
pub use config::Config;
pub use error::{OrmError, OrmResult, ValidationItem};
pub use hooks::{init_global_hooks, Hook, HookContext, HookPoint, HookRegistry};
pub use model::{
    BulkCreateOptions, BulkFailure, BulkOutcome, CreateOptions, Db, DestroyOptions, FindOptions,
    Model, SaveOptions, UpdateOptions,
};
pub use query::{
    Cond, Include, LockHint, Operator, OrderBy, OrderDir, OrderTarget, QueryFragment, ScopeDef,
    ScopeRegistry,
};
pub use schema::{AssociationDef, AttributeDef, EntityDef, SchemaRegistry, SemanticType};
pub use txn::{IsolationLevel, Txn, TxnOptions};
