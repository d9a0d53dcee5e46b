//! Bulb: a truth-or-dare card collection service in Rust
//!
//! Sled holds users, collections and their cards; Axum serves them over REST.
//! The access-control core lives in [`auth`] (passwords and tokens) and
//! [`authz`] (ownership of collections and cards).

pub mod accounts;
pub mod auth;
pub mod authz;
pub mod config;
pub mod error;
pub mod models;
pub mod storage;
// REST API module: Axum HTTP handlers, bearer middleware and error mapping
pub mod rest;
