//! Access-control engine for the campus print server
//!
//! Permissions are plain strings such as `"print"` or `"admin"`. Whether a
//! user or group holds one is decided from independently stored facts:
//! - **Access facts** grant or revoke one permission for one subject at a level
//! - **Groups** pass their facts on to member users
//! - **Inheritance** passes a group's facts on to the groups that inherit from it
//!
//! # Resolution
//!
//! All facts in a subject's closure are collected into an [`AccessToken`].
//! For each permission the fact with the greatest `level * 2 + revoke` key
//! governs, so a revoke beats a grant at the same level and any higher level
//! beats both. Equal keys go to the fact merged last. A permission with no
//! facts is denied.
//!
//! The root principal (user id 1 by default) gets [`AccessToken::GrantAll`]
//! and is never checked against facts.
//!
//! # Example
//!
//! ```rust
//! use auth_acl::{AccessControlEngine, NewUser, Subject};
//! use auth_acl::repository::{EntityStore, InMemoryAccessStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryAccessStore::new());
//!     let engine = AccessControlEngine::new(store.clone(), store.clone());
//!
//!     let root = store.create_user(NewUser::new("root", "", "", 0.0)).await?;
//!     let alice = store.create_user(NewUser::new("alice", "hash", "alice@example.edu", 5.0)).await?;
//!     let students = store.create_group("students", None).await?;
//!
//!     engine.add_member(&alice, &students).await?;
//!     engine.grant(&students, "print", 0).await?;
//!     engine.revoke(&alice, "print-color", 0).await?;
//!
//!     assert!(engine.check(&alice, "print").await?);
//!     assert!(!engine.check(&alice, "print-color").await?);
//!     assert!(engine.check(Subject::user(root.id), "print-color").await?);
//!
//!     Ok(())
//! }
//! ```

pub mod models;
pub mod error;
pub mod config;
pub mod repository;
pub mod graph;
pub mod token;
pub mod resolver;
pub mod engine;

pub use models::*;
pub use error::*;
pub use config::AclConfig;
pub use graph::{GroupGraph, Parent};
pub use token::{AccessToken, FactIndex};
pub use resolver::AccessResolver;
pub use engine::*;
