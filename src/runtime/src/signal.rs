//! SIGINT / SIGTERM handling for long-running pipelines.
//!
//! Both signals are caught from the moment [`ShutdownSignals::listen`]
//! returns, so a signal delivered while a blocking step runs is still seen
//! at the next await. Work raced against [`ShutdownSignals::run`] is dropped
//! on a signal, which lets its cleanup guards fire.

use std::future::Future;

use tokio::signal::unix::{signal, Signal, SignalKind};

use firebox_core::error::{BoxError, Result};

pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    /// Start catching SIGINT and SIGTERM.
    pub fn listen() -> Result<Self> {
        let register = |kind: SignalKind, name: &str| {
            signal(kind).map_err(|e| {
                BoxError::Other(format!("Failed to install {} handler: {}", name, e))
            })
        };
        Ok(Self {
            interrupt: register(SignalKind::interrupt(), "SIGINT")?,
            terminate: register(SignalKind::terminate(), "SIGTERM")?,
        })
    }

    /// Wait for the next signal; returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    /// Drive `work` to completion unless a signal arrives first.
    ///
    /// # Errors
    ///
    /// The signal name when `work` was abandoned.
    pub async fn run<F>(&mut self, work: F) -> std::result::Result<F::Output, &'static str>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            name = self.recv() => {
                tracing::warn!(signal = name, "Interrupted");
                Err(name)
            }
            output = work => Ok(output),
        }
    }
}
