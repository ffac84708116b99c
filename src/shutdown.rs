use tokio::signal::unix::{signal, SignalKind};

/// The signal that ended [`wait_for_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Keyboard,
    Terminate,
}

impl Interrupt {
    /// Reason carried by the abort this signal triggers.
    pub fn reason(&self) -> &'static str {
        match self {
            Interrupt::Keyboard => "Keyboard Interrupt",
            Interrupt::Terminate => "Terminated",
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_interrupt() -> std::io::Result<Interrupt> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let interrupt = tokio::select! {
        _ = sigterm.recv() => Interrupt::Terminate,
        _ = sigint.recv() => Interrupt::Keyboard,
    };
    tracing::info!(signal = ?interrupt, "Received interrupt");
    Ok(interrupt)
}
