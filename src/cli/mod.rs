pub mod commands;
pub mod helpers;
pub mod processor;

pub use commands::{Command, CommandContext, CommandResult};
pub use helpers::ConsoleSink;
pub use processor::CommandProcessor;
