//! In-process real-time messaging engine: a pub/sub hub, client session
//! state machine, and the cluster plug-points (broker, presence, history) a
//! deployment wires up to scale past one process.
//!
//! This crate stops at typed commands/replies (see `signalhub-messages`) and
//! in-process state; wire framing (WebSocket, JSON/protobuf encoding) and
//! the network listener loop are a caller's concern, not this crate's.

pub mod batch;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod node;
pub mod queue;

pub use batch::{BatchSink, PerChannelWriter};
pub use config::{ChannelBatchConfig, NodeConfig};
pub use error::SessionError;
pub use hub::{Hub, Subscriber};
pub use node::{Node, NodeBuilder};
pub use queue::{ByteSized, Queue};
