//! The three cluster plug-points from spec §4.7: [`broker::Broker`] fans
//! publications out across nodes, [`presence::PresenceManager`] tracks who
//! is subscribed right now, [`history::HistoryManager`] retains a bounded
//! recoverable log per channel. [`memory`] provides the in-process default
//! implementation of each (§4.7.1); a clustered deployment supplies its own.

pub mod broker;
pub mod history;
pub mod memory;
pub mod presence;

pub use broker::{Broker, BrokerEventHandler};
pub use history::HistoryManager;
pub use memory::{MemoryBroker, MemoryHistoryManager, MemoryPresenceManager};
pub use presence::{PresenceManager, PresenceStats};
