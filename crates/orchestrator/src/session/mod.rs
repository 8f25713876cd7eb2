#![forbid(unsafe_code)]

mod pool;
mod prompt;

pub use pool::{ExecOpts, SessionPool};
pub use prompt::{PromptAction, PromptGuard, PromptState, is_privilege_prompt};

use crate::domain::HostId;
use crate::error::Error;
use crate::vault::Secret;
use async_trait::async_trait;

/// One chunk of remote output. Stderr is inspected for privilege prompts
/// before anything is surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
    /// Final exit status of the command; the last chunk before the stream
    /// ends.
    Exit(i32),
}

/// A live command-execution channel to one scan host.
#[async_trait]
pub trait ShellSession: Send {
    /// Begin executing a command. Only one command runs at a time on a
    /// session; the pool serializes callers per host.
    async fn start(&mut self, command: &str) -> Result<(), Error>;

    /// Next chunk of output from the running command, `None` once it has
    /// finished.
    async fn next_chunk(&mut self) -> Result<Option<OutputChunk>, Error>;

    /// Write a secret to the command's stdin (privilege prompt answer).
    async fn write_secret(&mut self, secret: &Secret) -> Result<(), Error>;

    /// Trivial no-side-effect probe of the underlying connection.
    async fn probe(&mut self) -> Result<(), Error>;

    async fn close(&mut self);
}

/// Factory for shell sessions; the transport half of the pool.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(
        &self,
        host: &HostId,
        username: &str,
        secret: &Secret,
    ) -> Result<Box<dyn ShellSession>, Error>;
}

/// Receives session connectivity changes so they can be persisted for
/// operational recovery. The sqlite store implements this.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn session_status_changed(&self, host: &HostId, connected: bool);
}

#[derive(Debug, Default)]
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn session_status_changed(&self, _host: &HostId, _connected: bool) {}
}
