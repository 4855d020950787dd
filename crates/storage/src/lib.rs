#![forbid(unsafe_code)]

//! Local record store and mutation outbox with SQLite and in-memory backends.

mod store;

pub use store::*;
