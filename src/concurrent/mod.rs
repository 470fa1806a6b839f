//! Concurrency primitives shared by the conductor and the sequencer:
//! time sources, cooperative idle strategies, the agent framework, bounded
//! record rings, and the shared counters buffer.

pub mod agent;
pub mod clock;
pub mod counters;
pub mod idle;
pub mod ring;

pub use agent::{Agent, AgentError, AgentInvoker, AgentRunner, AgentRunnerHandle};
pub use clock::{CachedEpochClock, EpochClock, NanoClock, SystemEpochClock, SystemNanoClock};
pub use counters::{CountersBuffer, Position, StatusIndicator};
pub use idle::IdleStrategy;
pub use ring::{FrameQueue, RecordRing};
