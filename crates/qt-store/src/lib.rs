//! Per-account embedded database. Plain prepared statements over rusqlite;
//! the schema mirrors the entities in `qt-types`. Callers on the async side
//! go through `tokio::task::spawn_blocking`.

pub mod schema;
pub mod store;

pub use store::*;
