// ABOUTME: PostgreSQL utilities module
// ABOUTME: Exports connection helpers shared by the destination and the CLI

pub mod connection;

pub use connection::{connect, connect_with_retry};
