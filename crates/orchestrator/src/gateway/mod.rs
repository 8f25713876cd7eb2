#![forbid(unsafe_code)]

mod framing;

pub use framing::{END_SENTINEL, FramedResponse, START_SENTINEL, extract_frame, parse_framed};

use crate::clock::Clock;
use crate::error::Error;
use crate::vault::{CredentialVault, Secret};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Remote operations the gateway is willing to send. Anything else is
/// rejected locally before it reaches the control plane.
pub const ALLOWED_OPERATIONS: &[&str] = &[
    "publish-backup",
    "verify-mount",
    "unpublish",
    "list-restore-points",
    "probe",
];

/// A scripted request addressed to one named remote operation.
#[derive(Debug, Clone)]
pub struct Script {
    operation: String,
    body: String,
}

impl Script {
    pub fn new(operation: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            body: body.into(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Transport holding the single underlying control-plane session. The
/// gateway drives reconnects; the transport only moves bytes.
#[async_trait]
pub trait ControlPlaneTransport: Send + Sync {
    async fn connect(&self, endpoint: &str, username: &str, secret: &Secret) -> Result<(), Error>;
    async fn execute(&self, body: &str) -> Result<String, Error>;
    /// Cheap liveness probe of the current session.
    async fn probe(&self) -> Result<(), Error>;
}

pub struct ControlPlaneGateway {
    config: config::ControlPlane,
    transport: Box<dyn ControlPlaneTransport>,
    vault: Arc<dyn CredentialVault>,
    clock: Arc<dyn Clock>,
    last_command: Mutex<Option<Instant>>,
}

impl ControlPlaneGateway {
    pub fn new(
        config: config::ControlPlane,
        transport: Box<dyn ControlPlaneTransport>,
        vault: Arc<dyn CredentialVault>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            transport,
            vault,
            clock,
            last_command: Mutex::new(None),
        }
    }

    /// Establish the control-plane session with vault credentials.
    pub async fn connect(&self) -> Result<(), Error> {
        let secret = self.vault.reveal(&self.config.credential_ref)?;
        self.transport
            .connect(&self.config.endpoint, &self.config.username, &secret)
            .await
    }

    /// Send a scripted request and return its raw text output. Transient
    /// failures trigger a reconnect and a bounded retry of the same request.
    pub async fn execute(&self, script: &Script) -> Result<String, Error> {
        if !ALLOWED_OPERATIONS.contains(&script.operation()) {
            return Err(Error::UnauthorizedOperation(script.operation().to_string()));
        }

        self.ensure_live().await?;

        let attempts = self.config.request_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.config.request_timeout,
                self.transport.execute(script.body()),
            )
            .await
            .map_err(|_| Error::CommandTimeout(self.config.request_timeout))
            .and_then(|inner| inner);

            match result {
                Ok(output) => {
                    *self.last_command.lock().await = Some(self.clock.now());
                    return Ok(output);
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(
                        operation = script.operation(),
                        attempt, %err, "transient control-plane failure, reconnecting"
                    );
                    if let Err(reconnect_err) = self.connect().await {
                        warn!(%reconnect_err, "reconnect failed");
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::TransientRemote("retries exhausted".into())))
    }

    /// Send a scripted request and decode its STARTJSON/ENDJSON frame. A
    /// reply with `success: false` surfaces as a control-plane error.
    pub async fn execute_framed(&self, script: &Script) -> Result<FramedResponse, Error> {
        let output = self.execute(script).await?;
        let response = parse_framed(&output)?;
        if !response.success {
            let message = response
                .error
                .clone()
                .unwrap_or_else(|| "unspecified control-plane error".into());
            return Err(Error::ControlPlane {
                code: response.code.clone(),
                message,
            });
        }
        Ok(response)
    }

    /// Probe the session if it has been idle past the liveness window and
    /// reconnect with last-known-good credentials on probe failure.
    async fn ensure_live(&self) -> Result<(), Error> {
        let mut last = self.last_command.lock().await;
        let idle_past_window = match *last {
            Some(at) => self.clock.now().duration_since(at) > self.config.liveness_window,
            None => true,
        };
        if !idle_past_window {
            return Ok(());
        }

        if let Err(err) = self.transport.probe().await {
            debug!(%err, "liveness probe failed, reconnecting");
            self.connect().await?;
        }
        *last = Some(self.clock.now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::InstantClock;
    use crate::vault::StaticVault;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        failures_before_success: AtomicU32,
        executes: AtomicU32,
        connects: AtomicU32,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures_before_success: AtomicU32::new(failures),
                executes: AtomicU32::new(0),
                connects: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ControlPlaneTransport for FlakyTransport {
        async fn connect(&self, _: &str, _: &str, _: &Secret) -> Result<(), Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(&self, _: &str) -> Result<String, Error> {
            self.executes.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::TransientRemote("session not ready".into()));
            }
            Ok("STARTJSON\n{\"success\":true,\"data\":{}}\nENDJSON\n".into())
        }

        async fn probe(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn gateway(transport: FlakyTransport) -> ControlPlaneGateway {
        let vault = StaticVault::new([("control-plane".to_string(), "pw".to_string())]);
        ControlPlaneGateway::new(
            config::ControlPlane::default(),
            Box::new(transport),
            Arc::new(vault),
            Arc::new(InstantClock::default()),
        )
    }

    #[tokio::test]
    async fn disallowed_operation_is_rejected_before_send() {
        let gw = gateway(FlakyTransport::new(0));
        let script = Script::new("rm-rf", "anything");
        let err = gw.execute(&script).await.unwrap_err();
        assert!(matches!(err, Error::UnauthorizedOperation(op) if op == "rm-rf"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_up_to_bound() {
        let gw = gateway(FlakyTransport::new(2));
        let script = Script::new("probe", "probe");
        let response = gw.execute_framed(&script).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn retries_exhausted_surfaces_transient_error() {
        let gw = gateway(FlakyTransport::new(10));
        let script = Script::new("probe", "probe");
        let err = gw.execute(&script).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn failure_reply_becomes_control_plane_error() {
        struct FailingTransport;

        #[async_trait]
        impl ControlPlaneTransport for FailingTransport {
            async fn connect(&self, _: &str, _: &str, _: &Secret) -> Result<(), Error> {
                Ok(())
            }
            async fn execute(&self, _: &str) -> Result<String, Error> {
                Ok("STARTJSON\n{\"success\":false,\"error\":\"no such restore point\"}\nENDJSON\n"
                    .into())
            }
            async fn probe(&self) -> Result<(), Error> {
                Ok(())
            }
        }

        let vault = StaticVault::new([("control-plane".to_string(), "pw".to_string())]);
        let gw = ControlPlaneGateway::new(
            config::ControlPlane::default(),
            Box::new(FailingTransport),
            Arc::new(vault),
            Arc::new(InstantClock::default()),
        );
        let err = gw
            .execute_framed(&Script::new("verify-mount", "verify"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::ControlPlane { message, .. } if message.contains("no such restore point"))
        );
    }
}
