//! # Repository Module
//!
//! Document store repositories for the garden federation.
//!
//! ## Store Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Every repository offers the same three primitives:                    │
//! │                                                                         │
//! │    lookup-by-id              get(key)                                  │
//! │    filter-by-field-equality  list / list_remote / list_for_garden      │
//! │    upsert-by-key             upsert(document)                          │
//! │                                                                         │
//! │  Single-document writes are atomic. There are no cross-document        │
//! │  transactions; read-modify-write is last-writer-wins.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`UserRepository`] - Local users keyed by username
//! - [`RemoteUserRepository`] - Shadows keyed by (garden, username)
//! - [`GardenRepository`] - Federation members keyed by name
//! - [`JobRepository`] - Scheduled jobs keyed by id

pub mod garden;
pub mod job;
pub mod remote_user;
pub mod user;

pub use garden::GardenRepository;
pub use job::JobRepository;
pub use remote_user::RemoteUserRepository;
pub use user::UserRepository;
