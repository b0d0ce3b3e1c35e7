//! # fleet-id
//!
//! Typed identifiers for the game-server fleet.
//!
//! ## Design Principles
//!
//! - Build and session identifiers are caller-supplied, so parsing is strict
//! - Every identifier has exactly one canonical string form (hyphenated, lowercase)
//! - Identifiers are typed so a `SessionId` can never be passed where a `BuildId` is expected
//!
//! ## ID Format
//!
//! Identifiers are random (version 4) UUIDs with the RFC 4122 variant, written in
//! the 36 character hyphenated form:
//!
//! - `85ffe8da-c82f-4035-86c5-9d2b5f42d6f5`
//!
//! Other UUID spellings (braced, URN, simple) and other versions are rejected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;

#[doc(hidden)]
pub use uuid::Variant as uuid_variant;
