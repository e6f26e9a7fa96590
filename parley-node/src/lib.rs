//! Parley node: the tokio host around `parley-core`.

pub mod call;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod files;
pub mod media;
pub mod messenger;
pub mod node;
pub mod presence;
pub mod transport;

pub use config::Config;
pub use context::ClientContext;
pub use node::{Node, NodeEvents};
