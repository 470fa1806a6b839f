#![forbid(unsafe_code)]

pub mod client;
pub mod cluster;
pub mod concurrent;
pub mod config;
pub mod driver;
pub mod error;
pub mod testing;

pub use error::{CountedErrorHandler, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the callable surface at the crate root for convenience
pub use crate::client::{
    Client, ClientContext, ClientError, Counter, Image, Publication, Subscription,
};
pub use crate::cluster::{ClusterContext, ClusterError, SequencerAgent};
pub use crate::concurrent::agent::{Agent, AgentError, AgentInvoker, AgentRunner};
pub use crate::concurrent::idle::IdleStrategy;
pub use crate::config::{ClientConfig, ClusterConfig};
