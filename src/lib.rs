//! Salon API: multi-tenant back office for salons.
//!
//! Staff accounts log in with Argon2id-hashed passwords and receive HS256
//! session tokens. Protected routes run behind a bearer-token gate.
//! Multi-visit course tickets are consumed through the ticket ledger,
//! which serializes visits per (customer, course) and commits each one
//! atomically in sled.

pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod password;
// REST API module: Axum HTTP handlers under /api/v1
pub mod rest;
pub mod storage;
pub mod token;

pub use rest::{create_router, AppState};
