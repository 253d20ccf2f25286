//! Shared building blocks for the arcade platform services.
//!
//! Every TCP edge of the system speaks the same length-prefixed JSON frame
//! protocol ([`frame`]), with the request/reply/event envelopes defined in
//! [`protocol`].  The developer and lobby services talk to the record store
//! through [`rpc::StoreClient`].

pub mod error;
pub mod frame;
pub mod manifest;
pub mod protocol;
pub mod rpc;
pub mod types;

pub use error::ApiError;

pub type Result<T> = std::result::Result<T, ApiError>;
