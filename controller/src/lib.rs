//! Matter (CHIP) controller core: paired-node lifecycle management and
//! mDNS-based device discovery, built atop externally-supplied transport,
//! peer-set, persistence, and crypto collaborators (see [`collab`]).

pub mod cache;
pub mod clock;
pub mod collab;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod mdns;
pub mod node;
pub mod pairing;
pub mod query;
pub mod store;
pub mod subscription;
pub mod waiter;

pub use clock::{Clock, SharedClock, SystemClock, VirtualClock};
pub use config::ControllerConfig;
pub use error::{ControllerError, Result};
