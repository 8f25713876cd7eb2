//! Concrete `ssh`-subprocess transports. Authentication is key-based
//! (`BatchMode=yes`); the vault secret is only ever written to answer
//! privilege prompts inside a session.

use async_trait::async_trait;
use orchestrator::session::{OutputChunk, RemoteShell, ShellSession};
use orchestrator::vault::Secret;
use orchestrator::{ControlPlaneTransport, Error, HostId};
use std::process::Stdio;
use tokio::io::{AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

fn ssh_command(target: &str) -> Command {
    let mut command = Command::new("ssh");
    command
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg(target)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

async fn run_to_completion(target: &str, remote: &str, stdin: Option<&str>) -> Result<String, Error> {
    let mut child = ssh_command(target).arg(remote).spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.write_all(b"\n").await?;
        pipe.shutdown().await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::TransientRemote(format!(
            "ssh to {target} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Control-plane transport that runs the remote agent over ssh, one process
/// per request, with the request body on stdin.
#[derive(Default)]
pub struct SshControlPlane {
    target: Mutex<Option<String>>,
}

/// Remote entry point that accepts one scripted request on stdin and prints
/// a sentinel-framed reply.
const AGENT_COMMAND: &str = "snapscan-agent";

#[async_trait]
impl ControlPlaneTransport for SshControlPlane {
    async fn connect(&self, endpoint: &str, username: &str, _secret: &Secret) -> Result<(), Error> {
        let target = format!("{username}@{endpoint}");
        run_to_completion(&target, "true", None).await?;
        debug!(target, "control-plane endpoint reachable");
        *self.target.lock().await = Some(target);
        Ok(())
    }

    async fn execute(&self, body: &str) -> Result<String, Error> {
        let target = self
            .target
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::TransientRemote("control-plane session not connected".into()))?;
        run_to_completion(&target, AGENT_COMMAND, Some(body)).await
    }

    async fn probe(&self) -> Result<(), Error> {
        let target = self
            .target
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::TransientRemote("control-plane session not connected".into()))?;
        run_to_completion(&target, "true", None).await.map(|_| ())
    }
}

/// Shell factory spawning one ssh process per command against a host.
#[derive(Debug, Default)]
pub struct SshShell;

struct RunningCommand {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
    stdout_done: bool,
    stderr_done: bool,
}

struct SshSession {
    target: String,
    current: Option<RunningCommand>,
}

#[async_trait]
impl ShellSession for SshSession {
    async fn start(&mut self, command: &str) -> Result<(), Error> {
        self.current = None;
        let mut child = ssh_command(&self.target).arg(command).spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TransientRemote("ssh stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::TransientRemote("ssh stderr not captured".into()))?;
        self.current = Some(RunningCommand {
            child,
            stdin,
            stdout: tokio::io::AsyncBufReadExt::lines(BufReader::new(stdout)),
            stderr: tokio::io::AsyncBufReadExt::lines(BufReader::new(stderr)),
            stdout_done: false,
            stderr_done: false,
        });
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<OutputChunk>, Error> {
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };

        loop {
            if current.stdout_done && current.stderr_done {
                let status = current.child.wait().await?;
                self.current = None;
                return Ok(Some(OutputChunk::Exit(status.code().unwrap_or(-1))));
            }

            tokio::select! {
                line = current.stdout.next_line(), if !current.stdout_done => match line? {
                    Some(mut text) => {
                        text.push('\n');
                        return Ok(Some(OutputChunk::Stdout(text)));
                    }
                    None => current.stdout_done = true,
                },
                line = current.stderr.next_line(), if !current.stderr_done => match line? {
                    Some(text) => return Ok(Some(OutputChunk::Stderr(text))),
                    None => current.stderr_done = true,
                },
            }
        }
    }

    async fn write_secret(&mut self, secret: &Secret) -> Result<(), Error> {
        let stdin = self
            .current
            .as_mut()
            .and_then(|current| current.stdin.as_mut())
            .ok_or_else(|| Error::TransientRemote("no command awaiting input".into()))?;
        stdin.write_all(secret.expose().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn probe(&mut self) -> Result<(), Error> {
        run_to_completion(&self.target, "true", None).await.map(|_| ())
    }

    async fn close(&mut self) {
        if let Some(mut current) = self.current.take() {
            let _ = current.child.start_kill();
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(
        &self,
        host: &HostId,
        username: &str,
        _secret: &Secret,
    ) -> Result<Box<dyn ShellSession>, Error> {
        let target = format!("{username}@{host}");
        run_to_completion(&target, "true", None).await?;
        debug!(target, "scan host reachable");
        Ok(Box::new(SshSession {
            target,
            current: None,
        }))
    }
}
