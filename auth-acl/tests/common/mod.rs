use auth_acl::repository::{EntityStore, InMemoryAccessStore};
use auth_acl::{AccessControlEngine, NewUser, User};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test output; `RUST_LOG=auth_acl=debug` for detail
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("auth_acl=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Engine over a fresh in-memory store with the two well-known principals
/// (root = 1, nobody = 2) already present
pub async fn create_test_engine() -> (Arc<InMemoryAccessStore>, AccessControlEngine) {
    init_tracing();
    let store = Arc::new(InMemoryAccessStore::new());
    for name in ["root", "nobody"] {
        store
            .create_user(NewUser::new(name, "", "", 0.0))
            .await
            .unwrap();
    }
    let engine = AccessControlEngine::new(store.clone(), store.clone());
    (store, engine)
}

pub async fn create_user(store: &InMemoryAccessStore, name: &str) -> User {
    store
        .create_user(NewUser::new(name, "hash", &format!("{}@campus.edu", name), 20.0))
        .await
        .unwrap()
}
