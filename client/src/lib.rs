//! Client-side plumbing for the arcade services.
//!
//! [`Connection`] demultiplexes server-pushed `{type:"event"}` frames from
//! request replies, so a caller can await a reply while events accumulate on
//! their own channel.  [`transfer`] drives the chunked upload and download
//! loops.

mod connection;
pub mod transfer;

pub use connection::{Connection, EventFrame};
