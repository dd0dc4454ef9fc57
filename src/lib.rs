pub mod codec;
pub mod commands;
pub mod connection;
pub mod counters;
pub mod error;
pub mod features;
pub mod frame;
pub mod queue;
pub mod sentinel;
pub mod subscriptions;

pub use connection::{Connection, ConnectionState};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
