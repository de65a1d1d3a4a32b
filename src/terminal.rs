use std::io::{self, IsTerminal};

/// Reports whether the process streams are attached to a terminal.
///
/// Injected so tests can force plain output.
pub trait TerminalClient: Send + Sync {
    fn stdout_is_terminal(&self) -> bool;

    fn stderr_is_terminal(&self) -> bool;
}

/// Terminal probe for the real process streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTerminalClient;

impl TerminalClient for SystemTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        io::stdout().is_terminal()
    }

    fn stderr_is_terminal(&self) -> bool {
        io::stderr().is_terminal()
    }
}
