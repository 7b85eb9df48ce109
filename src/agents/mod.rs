pub mod profile;
pub mod runtime;

pub use profile::{executive_team, AgentProfile, AgentRegistry};
pub use runtime::{AgentOutcome, AgentRun, AgentRuntime};
