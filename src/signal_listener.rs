use crate::service::Service;
use anyhow::Context;
use futures::StreamExt;
use libc::{c_int, SIGINT, SIGTERM};
use log::{debug, info};
use signal_hook_tokio::{Handle, Signals};
use std::future::pending;
use tokio_util::sync::CancellationToken;

/// Service turning SIGINT and SIGTERM into a server shutdown.
pub struct SignalListener {
    signals: Signals,
    handle: Handle,

    /// Cancelled on the first termination signal.
    shutdown: CancellationToken,
}

impl SignalListener {
    pub fn new(shutdown: CancellationToken) -> Result<Self, anyhow::Error> {
        let signals = Signals::new([SIGINT, SIGTERM]).context("failed to add signal listener")?;
        let handle = signals.handle();
        Ok(Self { signals, handle, shutdown })
    }
}

impl Service for SignalListener {
    type TaskOutput = c_int;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        match self.signals.next().await {
            Some(signal) => signal,
            // The signal stream only ends once closed by on_terminate.
            None => pending().await,
        }
    }

    async fn on_task_ready(&mut self, signal: Self::TaskOutput) -> Result<(), anyhow::Error> {
        match signal {
            SIGINT | SIGTERM => {
                info!(signal; "Received termination signal");
                self.shutdown.cancel();
            }
            other => debug!(signal = other; "Ignoring signal"),
        }
        Ok(())
    }

    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        self.handle.close();
        info!("Signal listener stopped");
        Ok(())
    }
}
