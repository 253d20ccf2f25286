//! The lobby service: player accounts, catalog browsing, chunked downloads,
//! and the room & match-lifecycle engine that spawns and supervises the
//! uploaded games' server processes.

pub mod catalog;
pub mod context;
pub mod match_runner;
pub mod room;
pub mod server;

pub use context::LobbyContext;
pub use server::LobbyServer;
