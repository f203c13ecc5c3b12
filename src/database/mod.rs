pub mod connection;
pub mod operations;
pub mod store;

pub use store::{PostgresStore, ReadingStore};
