use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use ddx_core::config::DdxConfig;
use ddx_core::device::DisconnectReason;
use ddx_ipc::{
    tls, ConnectionContext, ConnectionSettings, DevMgr, DeviceEvent, DeviceHandle, RejectAll,
    Response, ResponseQueue,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A registered connection to one daemon.
pub struct Session {
    device: DeviceHandle,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    poller: JoinHandle<()>,
}

impl Session {
    /// Connects to `host:port` and waits until both sides have registered.
    pub async fn open(config: &DdxConfig, host: &str, port: u16) -> Result<Self> {
        config.validate(false).context("Invalid configuration")?;
        let connector = tls::connector(&config.tls, host).context("Failed to set up TLS")?;
        let settings = ConnectionSettings::from_config(config);
        let wait = settings.registration_timeout + Duration::from_secs(1);

        let (registry, events) = DevMgr::new();
        let poller = ddx_ipc::spawn_timeout_poller(&registry, config.network.poll_interval());
        let ctx = ConnectionContext::new(registry, Arc::new(RejectAll), settings);
        let device = ddx_ipc::connect(host, port, connector, &ctx);

        let mut session = Self {
            device,
            events,
            poller,
        };
        tokio::time::timeout(wait, session.wait_registered())
            .await
            .map_err(|_| anyhow!("Timed out waiting for {}:{} to register", host, port))??;
        Ok(session)
    }

    async fn wait_registered(&mut self) -> Result<()> {
        loop {
            match self.events.recv().await {
                Some(DeviceEvent::Registered { .. }) => return Ok(()),
                Some(DeviceEvent::Disconnected { reason, .. }) => {
                    return Err(anyhow!("Connection closed before registration: {}", reason));
                }
                Some(DeviceEvent::Log {
                    message,
                    alert: true,
                    ..
                }) => eprintln!("{} {}", "warning:".yellow().bold(), message),
                Some(_) => {}
                None => return Err(anyhow!("Connection task ended unexpectedly")),
            }
        }
    }

    /// The daemon's registered name.
    pub fn peer(&self) -> String {
        self.device.cid()
    }

    /// Sends one request and waits for its response or timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Response> {
        let (responses, mut rx) = ResponseQueue::new();
        let id = self
            .device
            .send_request(&responses, method, params)
            .ok_or_else(|| anyhow!("Connection to {} is closed", self.peer()))?;
        debug!("Sent {} as request {}", method, id);
        rx.recv()
            .await
            .ok_or_else(|| anyhow!("No response to {}", method))
    }

    /// Announces the disconnect and waits for it to be flushed.
    pub async fn close(self) {
        self.device.close(DisconnectReason::ShuttingDown, false);
        self.device.closed().await;
        self.poller.abort();
    }
}
