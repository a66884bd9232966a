//! Store-facing jobs built on the cache primitives.
//!
//! - [`insert`]: InsertionDriver, batched chunk writes with failure reporting
//! - [`lookup`]: cached-prefix detection and retrieval
//! - [`cancel`]: cooperative cancellation token

pub mod cancel;
pub mod insert;
pub mod lookup;
