//! Connection actor plus its per-socket writer.

pub mod connection;
pub mod writer;

pub use connection::*;
pub use writer::*;
