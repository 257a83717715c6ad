pub mod cli;
pub mod logging;
pub mod protocol;
pub mod queue;

pub use cli::{Command, prompt};
pub use protocol::{ConnectionPool, Server, ServerConfig, listen};
pub use queue::{QueueConfig, TaskQueue};
