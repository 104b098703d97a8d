//! Domain layer types for content chunks and their queries.

pub mod entities;
pub mod search;
pub mod types;
