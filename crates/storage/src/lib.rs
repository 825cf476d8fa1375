#![forbid(unsafe_code)]

//! SQLite persistence for hierarchies, cross-references, dependents, the
//! pass lock and pass history.

mod store;

pub use store::*;
