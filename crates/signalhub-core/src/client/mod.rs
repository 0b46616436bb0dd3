//! Client-facing state: the session state machine, per-channel subscription
//! bookkeeping and recovery, and the bounded write queue sessions use to
//! push frames back to their transport.

pub mod session;
pub mod subscription;
pub mod writer;

pub use session::{ClientSession, MessageHandler, ReplySink, RpcHandler, SessionDeps, SessionState};
pub use subscription::{recover, RecoveryResult, Subscription};
pub use writer::{TransportSink, TransportWriteError, TransportWriter};
