//! Pure data types for rankpipe: ranks, SPMD/MPMD rank groups, exit statuses.
//!
//! This crate is a leaf dependency with no async runtime, no system calls, no
//! I/O. Job descriptions built from these types are handed to `rankpipe-kernel`
//! for argument compilation and launch.

pub mod error;
pub mod group;
pub mod rank;
pub mod status;

// Flat re-exports for convenience
pub use error::*;
pub use group::*;
pub use rank::*;
pub use status::*;
