pub mod chunks;
pub mod error;
pub mod repos;
