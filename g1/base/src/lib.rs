//! Base Library
//!
//! Opinionated extensions to the Rust stdlib that the other `g1` crates share.
//!
//! NOTE: The base library should only depend on the Rust stdlib.

pub mod sync;
