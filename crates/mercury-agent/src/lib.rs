pub mod agent;
pub mod scripted;

pub use agent::{delta_stream, AgentError, AgentFactory, AiAgent, ResponseStream};
pub use scripted::{Script, ScriptedAgent};
