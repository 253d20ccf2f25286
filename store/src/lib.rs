//! The record store service: a thin frame server over SQLite.
//!
//! It exposes CRUD/query actions for the seven record kinds the developer
//! and lobby services depend on.  One request per frame, one reply per
//! frame; callers open short-lived connections.

pub mod db;
pub mod server;

pub use db::Database;
pub use server::StoreServer;
