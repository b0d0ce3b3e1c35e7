//! Typed ID definitions.

use crate::define_uuid_id;

// =============================================================================
// Fleet
// =============================================================================

define_uuid_id!(BuildId, "build");

// =============================================================================
// Sessions
// =============================================================================

define_uuid_id!(SessionId, "session");
