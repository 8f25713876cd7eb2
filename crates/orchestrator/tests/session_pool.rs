use async_trait::async_trait;
use orchestrator::clock::SystemClock;
use orchestrator::session::{
    ExecOpts, OutputChunk, RemoteShell, SessionPool, ShellSession, StatusSink,
};
use orchestrator::vault::{Secret, StaticVault};
use orchestrator::{Error, HostId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, PartialEq)]
enum SessionMode {
    /// Every command prints "ok" and exits 0.
    Normal,
    /// Every command asks for a password; accepted after N secret writes.
    Prompting { accept_after: u32 },
    /// Commands never produce output and never finish.
    Hang,
}

struct FakeSession {
    mode: SessionMode,
    queue: VecDeque<OutputChunk>,
    probe_ok: Arc<AtomicBool>,
    secret_writes: Arc<AtomicU32>,
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn start(&mut self, _command: &str) -> Result<(), Error> {
        self.queue.clear();
        match self.mode {
            SessionMode::Normal => {
                self.queue.push_back(OutputChunk::Stdout("ok\n".into()));
                self.queue.push_back(OutputChunk::Exit(0));
            }
            SessionMode::Prompting { .. } => {
                self.queue
                    .push_back(OutputChunk::Stderr("[sudo] password for svc:".into()));
            }
            SessionMode::Hang => {}
        }
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<OutputChunk>, Error> {
        match self.queue.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.mode == SessionMode::Hang => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn write_secret(&mut self, _secret: &Secret) -> Result<(), Error> {
        let writes = self.secret_writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let SessionMode::Prompting { accept_after } = self.mode {
            if writes >= accept_after {
                self.queue.push_back(OutputChunk::Stdout("ok\n".into()));
                self.queue.push_back(OutputChunk::Exit(0));
            } else {
                self.queue
                    .push_back(OutputChunk::Stderr("[sudo] password for svc:".into()));
            }
        }
        Ok(())
    }

    async fn probe(&mut self) -> Result<(), Error> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::TransientRemote("probe failed".into()))
        }
    }

    async fn close(&mut self) {}
}

struct FakeShell {
    mode: SessionMode,
    connects: AtomicU32,
    /// Connect attempts beyond this count fail.
    connect_budget: u32,
    probe_ok: Arc<AtomicBool>,
    secret_writes: Arc<AtomicU32>,
}

impl FakeShell {
    fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            connects: AtomicU32::new(0),
            connect_budget: u32::MAX,
            probe_ok: Arc::new(AtomicBool::new(true)),
            secret_writes: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// Shell handle handed to the pool; counters stay shared with the test body.
struct FakeShellHandle(Arc<FakeShell>);

#[async_trait]
impl RemoteShell for FakeShellHandle {
    async fn connect(
        &self,
        _host: &HostId,
        _username: &str,
        _secret: &Secret,
    ) -> Result<Box<dyn ShellSession>, Error> {
        let attempts = self.0.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > self.0.connect_budget {
            return Err(Error::TransientRemote("connection refused".into()));
        }
        Ok(Box::new(FakeSession {
            mode: self.0.mode,
            queue: VecDeque::new(),
            probe_ok: self.0.probe_ok.clone(),
            secret_writes: self.0.secret_writes.clone(),
        }))
    }
}

#[derive(Default)]
struct RecordingSink {
    events: std::sync::Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn session_status_changed(&self, host: &HostId, connected: bool) {
        self.events
            .lock()
            .unwrap()
            .push((host.to_string(), connected));
    }
}

fn pool_with(shell: Arc<FakeShell>, sink: Arc<RecordingSink>) -> SessionPool {
    let vault = StaticVault::new([("host-cred".to_string(), "pw".to_string())]);
    SessionPool::new(
        config::Pool::default(),
        Box::new(FakeShellHandle(shell)),
        Arc::new(vault),
        Arc::new(SystemClock),
        sink,
    )
}

#[tokio::test]
async fn connect_is_idempotent_for_identical_credentials() {
    let shell = Arc::new(FakeShell::new(SessionMode::Normal));
    let pool = pool_with(shell.clone(), Arc::new(RecordingSink::default()));
    let host = HostId::new("scanhost-1");

    pool.connect(&host, "svc", "host-cred").await.unwrap();
    pool.connect(&host, "svc", "host-cred").await.unwrap();
    assert_eq!(shell.connects.load(Ordering::SeqCst), 1);

    let out = pool.execute(&host, "true", &ExecOpts::default()).await.unwrap();
    assert_eq!(out, "ok\n");
}

#[tokio::test]
async fn keepalive_evicts_after_exactly_the_reconnect_bound() {
    // the first connect succeeds and seeds the pool; the host then dies,
    // its probe fails, and every reconnect is refused
    let shell = Arc::new(FakeShell {
        mode: SessionMode::Normal,
        connects: AtomicU32::new(0),
        connect_budget: 1,
        probe_ok: Arc::new(AtomicBool::new(false)),
        secret_writes: Arc::new(AtomicU32::new(0)),
    });
    let sink = Arc::new(RecordingSink::default());
    let pool = pool_with(shell.clone(), sink.clone());
    let host = HostId::new("scanhost-1");

    pool.connect(&host, "svc", "host-cred").await.unwrap();
    assert_eq!(shell.connects.load(Ordering::SeqCst), 1);

    pool.keepalive_once().await;

    // one initial connect plus exactly the configured reconnect bound (3)
    assert_eq!(shell.connects.load(Ordering::SeqCst), 1 + 3);
    assert!(pool.connected_hosts().await.is_empty());
    assert!(!pool.is_alive(&host).await);

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(events.last(), Some(&("scanhost-1".to_string(), false)));
}

#[tokio::test]
async fn sweep_tears_down_unresponsive_sessions_without_reconnecting() {
    let shell = Arc::new(FakeShell::new(SessionMode::Normal));
    let sink = Arc::new(RecordingSink::default());
    let pool = pool_with(shell.clone(), sink.clone());
    let host = HostId::new("scanhost-1");

    pool.connect(&host, "svc", "host-cred").await.unwrap();
    shell.probe_ok.store(false, Ordering::SeqCst);

    pool.sweep_once().await;

    // the sweep never reconnects
    assert_eq!(shell.connects.load(Ordering::SeqCst), 1);
    assert!(pool.connected_hosts().await.is_empty());
}

#[tokio::test]
async fn privilege_prompt_is_answered_with_the_cached_secret() {
    let shell = Arc::new(FakeShell::new(SessionMode::Prompting { accept_after: 1 }));
    let pool = pool_with(shell.clone(), Arc::new(RecordingSink::default()));
    let host = HostId::new("scanhost-1");

    pool.connect(&host, "svc", "host-cred").await.unwrap();
    let out = pool
        .execute(&host, "sudo true", &ExecOpts::default())
        .await
        .unwrap();
    assert_eq!(out, "ok\n");
    assert_eq!(shell.secret_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn endless_prompts_fail_the_command_after_the_budget() {
    let shell = Arc::new(FakeShell::new(SessionMode::Prompting {
        accept_after: u32::MAX,
    }));
    let pool = pool_with(shell.clone(), Arc::new(RecordingSink::default()));
    let host = HostId::new("scanhost-1");

    pool.connect(&host, "svc", "host-cred").await.unwrap();
    let err = pool
        .execute(&host, "sudo true", &ExecOpts::default())
        .await
        .unwrap_err();

    // default budget is 3 responses; the 4th prompt fails the command
    assert!(matches!(err, Error::PromptRejected(3)));
    assert_eq!(shell.secret_writes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn timed_out_command_surfaces_and_evicts_the_session() {
    let shell = Arc::new(FakeShell::new(SessionMode::Hang));
    let pool = pool_with(shell.clone(), Arc::new(RecordingSink::default()));
    let host = HostId::new("scanhost-1");

    pool.connect(&host, "svc", "host-cred").await.unwrap();
    let err = pool
        .execute(
            &host,
            "sleep 3600",
            &ExecOpts::with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CommandTimeout(_)));
    assert!(pool.connected_hosts().await.is_empty());

    // the next command without a session is an explicit error
    let err = pool.execute(&host, "true", &ExecOpts::default()).await.unwrap_err();
    assert!(matches!(err, Error::SessionMissing(_)));
}
