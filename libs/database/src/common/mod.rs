//! Shared error taxonomy for database operations.

pub mod error;

pub use error::{DatabaseError, DatabaseResult};
