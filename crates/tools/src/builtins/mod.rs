//! Built-in tool implementations.

mod fs;
mod shell;

pub use fs::ReaderTool;
pub use shell::ShellTool;
