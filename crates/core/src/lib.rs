//! The ledgerd log server.
//!
//! Every committed mutation of the database passes through here before it
//! reaches storage: the commit path appends proxy batches to a durable
//! queue and an in-memory per-team index, a background committer publishes
//! the durable version, a spiller moves aged data into a sorted persistent
//! store under a memory budget, and the peek/pop services feed storage
//! servers from whichever of the two places the data currently lives in.
//!
//! The server is a cooperative single-threaded core: every component is a
//! task over one executor, communicating through versioned notifiers.
//! Blocking device I/O (queue fsync, store commit) runs on worker threads
//! and is awaited as futures.

pub mod acs;
pub mod counters;
pub mod error;
pub mod generation;
pub mod group;
pub mod keys;
pub mod messages;
pub mod mutation;
pub mod notify;
pub mod settings;
pub mod team;

mod commit;
mod committer;
mod lifecycle;
mod peek;
mod pop;
mod recovery;
mod server;
mod spill;

pub use error::{Result, TLogError};
pub use generation::{Generation, SpillType};
pub use group::Group;
pub use recovery::GroupDevices;
pub use server::TLogServer;
pub use settings::Settings;
