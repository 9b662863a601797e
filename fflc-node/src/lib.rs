//! FFLC node: TCP listener, session transport, chat consensus driving and history sync on tokio.

pub mod config;
pub mod error;
pub mod transport;

mod dispatcher;
mod node;
mod sync;

pub use config::Config;
pub use error::NodeError;
pub use node::{Inbound, Node};
