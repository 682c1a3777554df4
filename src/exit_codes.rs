//! Stable exit codes for `ralph` commands.

/// All stories complete, or the command succeeded.
pub const SUCCESS: i32 = 0;
/// Unrecoverable validation, structural or deadlock failure.
pub const FAILURE: i32 = 1;
/// Iteration budget exhausted with work remaining.
pub const PARTIAL: i32 = 2;
/// A crash was detected and the operator declined recovery.
pub const RECOVERY_DECLINED: i32 = 3;
