#![forbid(unsafe_code)]

use crate::clock::Clock;
use crate::domain::HostId;
use crate::error::Error;
use crate::session::prompt::{PromptAction, PromptGuard};
use crate::session::{OutputChunk, RemoteShell, ShellSession, StatusSink};
use crate::vault::CredentialVault;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    /// Hard timeout; falls back to the pool's configured default.
    pub timeout: Option<Duration>,
    /// Suppress per-line output tracing for chatty commands.
    pub silent: bool,
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            silent: false,
        }
    }
}

struct SessionEntry {
    host: HostId,
    username: String,
    credential_ref: String,
    session: Box<dyn ShellSession>,
    last_activity: Instant,
    /// Scanner name → installed version, cached by provisioning.
    inventory: HashMap<String, String>,
}

/// One long-lived command-execution session per scan host. All mutation of
/// a host's entry happens under that entry's lock, so two reconnect
/// attempts for the same host can never race.
pub struct SessionPool {
    config: config::Pool,
    shell: Box<dyn RemoteShell>,
    vault: Arc<dyn CredentialVault>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn StatusSink>,
    sessions: Mutex<HashMap<HostId, Arc<Mutex<SessionEntry>>>>,
}

impl SessionPool {
    pub fn new(
        config: config::Pool,
        shell: Box<dyn RemoteShell>,
        vault: Arc<dyn CredentialVault>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            config,
            shell,
            vault,
            clock,
            sink,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Connect a host. Connecting an already-connected host with identical
    /// credentials is a no-op returning success; different credentials
    /// replace the session.
    pub async fn connect(
        &self,
        host: &HostId,
        username: &str,
        credential_ref: &str,
    ) -> Result<(), Error> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(entry) = sessions.get(host) {
                let entry = entry.lock().await;
                if entry.username == username && entry.credential_ref == credential_ref {
                    debug!(%host, "session already connected, reusing");
                    return Ok(());
                }
            }
        }

        let secret = self.vault.reveal(credential_ref)?;
        let session = self.shell.connect(host, username, &secret).await?;
        let entry = SessionEntry {
            host: host.clone(),
            username: username.to_string(),
            credential_ref: credential_ref.to_string(),
            session,
            last_activity: self.clock.now(),
            inventory: HashMap::new(),
        };

        let previous = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(host.clone(), Arc::new(Mutex::new(entry)))
        };
        if let Some(previous) = previous {
            previous.lock().await.session.close().await;
        }

        self.sink.session_status_changed(host, true).await;
        info!(%host, "session connected");
        Ok(())
    }

    /// Execute a command on a host's session and return its stdout.
    /// Commands against the same host run one at a time in issuance order.
    pub async fn execute(
        &self,
        host: &HostId,
        command: &str,
        opts: &ExecOpts,
    ) -> Result<String, Error> {
        let entry = self.entry(host).await?;
        let timeout = opts.timeout.unwrap_or(self.config.command_timeout);

        let mut locked = entry.lock().await;
        let result = tokio::time::timeout(timeout, self.drive(&mut locked, command, opts)).await;
        match result {
            Ok(Ok(stdout)) => {
                locked.last_activity = self.clock.now();
                Ok(stdout)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                // The command is still running remotely; the session cannot
                // be reused mid-command, so tear it down.
                warn!(%host, ?timeout, "command timed out, evicting session");
                locked.session.close().await;
                drop(locked);
                self.remove(host).await;
                Err(Error::CommandTimeout(timeout))
            }
        }
    }

    async fn drive(
        &self,
        entry: &mut SessionEntry,
        command: &str,
        opts: &ExecOpts,
    ) -> Result<String, Error> {
        let mut guard = PromptGuard::new(self.config.prompt_responses);
        let secret = self.vault.reveal(&entry.credential_ref)?;

        entry.session.start(command).await?;
        let mut stdout = String::new();
        let mut stderr_tail = String::new();
        let mut exit_code = 0;

        while let Some(chunk) = entry.session.next_chunk().await? {
            match chunk {
                OutputChunk::Stdout(text) => stdout.push_str(&text),
                OutputChunk::Stderr(text) => {
                    for line in text.lines() {
                        match guard.observe(line) {
                            PromptAction::Respond => {
                                entry.session.write_secret(&secret).await?;
                                guard.responded();
                            }
                            PromptAction::PassThrough => {
                                if !opts.silent {
                                    debug!(line, "remote stderr");
                                }
                                stderr_tail.push_str(line);
                                stderr_tail.push('\n');
                            }
                            PromptAction::Fail => {
                                return Err(Error::PromptRejected(guard.responses()));
                            }
                        }
                    }
                }
                OutputChunk::Exit(code) => exit_code = code,
            }
        }

        if exit_code != 0 {
            return Err(Error::CommandFailed {
                host: entry.host.to_string(),
                detail: format!("exit {exit_code}: {}", stderr_tail.trim_end()),
            });
        }
        Ok(stdout)
    }

    /// Probe a host's session with a trivial command.
    pub async fn is_alive(&self, host: &HostId) -> bool {
        let Ok(entry) = self.entry(host).await else {
            return false;
        };
        let mut locked = entry.lock().await;
        locked.session.probe().await.is_ok()
    }

    /// Explicitly disconnect a host and drop its session.
    pub async fn disconnect(&self, host: &HostId) {
        if let Some(entry) = self.sessions.lock().await.remove(host) {
            entry.lock().await.session.close().await;
            self.sink.session_status_changed(host, false).await;
            info!(%host, "session disconnected");
        }
    }

    pub async fn connected_hosts(&self) -> Vec<HostId> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Cached installed-version for a scanner on a host, if provisioning
    /// has recorded one on this session.
    pub async fn cached_scanner_version(&self, host: &HostId, scanner: &str) -> Option<String> {
        let entry = self.entry(host).await.ok()?;
        let locked = entry.lock().await;
        locked.inventory.get(scanner).cloned()
    }

    pub async fn cache_scanner_version(&self, host: &HostId, scanner: &str, version: &str) {
        if let Ok(entry) = self.entry(host).await {
            let mut locked = entry.lock().await;
            locked
                .inventory
                .insert(scanner.to_string(), version.to_string());
        }
    }

    /// One pass of the proactive keep-alive: probe every session, reconnect
    /// failing ones up to the configured bound, evict on exhaustion.
    /// Holding the entry lock for the whole pass keeps probes from
    /// overlapping an in-flight command or a concurrent sweep.
    pub async fn keepalive_once(&self) {
        for host in self.connected_hosts().await {
            let Ok(entry) = self.entry(&host).await else {
                continue;
            };
            let mut locked = entry.lock().await;
            if locked.session.probe().await.is_ok() {
                continue;
            }

            debug!(%host, "keep-alive probe failed, reconnecting");
            if self.reconnect_locked(&host, &mut locked).await.is_err() {
                locked.session.close().await;
                drop(locked);
                self.remove(&host).await;
                warn!(%host, "session evicted after exhausting reconnect attempts");
            }
        }
    }

    /// One pass of the idle sweep: probe everything, tear down what fails.
    /// Unlike keep-alive this never reconnects; a swept session is gone.
    pub async fn sweep_once(&self) {
        for host in self.connected_hosts().await {
            let Ok(entry) = self.entry(&host).await else {
                continue;
            };
            let mut locked = entry.lock().await;
            if locked.session.probe().await.is_ok() {
                continue;
            }
            locked.session.close().await;
            drop(locked);
            self.remove(&host).await;
            info!(%host, "stale session swept");
        }
    }

    /// Run keep-alive and sweep timers until cancelled. Intended to be
    /// spawned; runs concurrently with any in-flight scan.
    pub async fn run_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("pool maintenance stopped");
                    break;
                }
                _ = keepalive.tick() => self.keepalive_once().await,
                _ = sweep.tick() => self.sweep_once().await,
            }
        }
    }

    /// Bounded reconnect with the entry's last-known credentials. The entry
    /// lock is held throughout, serializing reconnects per host.
    async fn reconnect_locked(
        &self,
        host: &HostId,
        entry: &mut SessionEntry,
    ) -> Result<(), Error> {
        let secret = self.vault.reveal(&entry.credential_ref)?;
        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.shell.connect(host, &entry.username, &secret).await {
                Ok(session) => {
                    entry.session.close().await;
                    entry.session = session;
                    entry.last_activity = self.clock.now();
                    info!(%host, attempt, "session reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%host, attempt, %err, "reconnect attempt failed");
                }
            }
        }
        Err(Error::SessionEvicted(host.to_string()))
    }

    async fn entry(&self, host: &HostId) -> Result<Arc<Mutex<SessionEntry>>, Error> {
        self.sessions
            .lock()
            .await
            .get(host)
            .cloned()
            .ok_or_else(|| Error::SessionMissing(host.to_string()))
    }

    async fn remove(&self, host: &HostId) {
        if self.sessions.lock().await.remove(host).is_some() {
            self.sink.session_status_changed(host, false).await;
        }
    }
}
