/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C) and SIGTERM. Handlers are registered when the
/// waiter is installed; `recv` resolves on the first signal after that.
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// The termination request that ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// One-shot subscription to process termination signals.
pub struct SignalWaiter {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl SignalWaiter {
    /// Register the termination handlers. Must be called inside a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        let interrupt = signal(SignalKind::interrupt())?;
        let terminate = signal(SignalKind::terminate())?;
        tracing::debug!("registered SIGINT and SIGTERM handlers");
        Ok(Self {
            interrupt,
            terminate,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the first termination signal.
    ///
    /// Consumes the waiter. The process-level handlers stay registered, so
    /// later signals are absorbed rather than killing the process mid-shutdown.
    #[cfg(unix)]
    pub async fn recv(mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(self) -> ShutdownSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c listener failed, shutting down");
        }
        ShutdownSignal::Interrupt
    }
}
