//! Generalized multi-mode locks and reader-writer locks.
//!
//! See [`lockking_core`] for the details, everything is re-exported here.

pub use lockking_core::*;
