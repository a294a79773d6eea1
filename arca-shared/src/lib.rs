//! Arca shared types - common code for the host bridge and guest agents.
//!
//! This crate contains the error taxonomy, the vsock wire protocol spoken
//! between the host bridge and the in-guest services, the frame codec, and
//! the constants that must be identical on both sides of the boundary.

pub mod codec;
pub mod constants;
pub mod errors;
pub mod wire;

pub use errors::{ArcaError, ArcaResult, ResourceKind};
