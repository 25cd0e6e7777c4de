//! # garden-db: Document Store for Beer Garden
//!
//! Storage for the documents the federation core reads and writes: gardens,
//! users, remote user shadows and jobs. Backed by SQLite through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Garden Data Flow                                 │
//! │                                                                         │
//! │  UserSync / JobControl / GardenAgent (garden-sync)                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     garden-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐ │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │ │   │
//! │  │   │   (pool.rs)   │◄───│ users, gardens │    │  (embedded)  │ │   │
//! │  │   │  SqlitePool   │    │ remote_users   │    │ 001_init.sql │ │   │
//! │  │   │               │    │ jobs           │    │              │ │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘ │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use garden_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("garden.db")).await?;
//! let remote = db.gardens().list_remote().await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::{GardenRepository, JobRepository, RemoteUserRepository, UserRepository};
