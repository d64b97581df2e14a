//! Agent process backend: spawning, decoding and streaming.

pub mod channel;
pub mod claudecode;
pub mod decoder;
pub mod env_policy;
pub mod error;
pub mod events;
pub mod supervisor;
pub mod wire;

pub use channel::{event_channel, EventChannel, EventSender};
pub use decoder::{DedupeState, StreamEventDecoder};
pub use env_policy::{EnvAction, EnvPolicy, EnvRule};
pub use error::ProcessError;
pub use events::{AgentMessage, SideEffect};
pub use supervisor::{NonZeroExitPolicy, ProcessHandle, ProcessOutput, ProcessSupervisor, SpawnRequest};
