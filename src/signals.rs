//! Termination-signal interception
//!
//! SIGINT, SIGTERM, and SIGHUP no longer end the process directly; each one
//! becomes an [`ExitRequest`] for the engine to grant or deny.

use crate::engine::{ExitRequest, ExitSource};
use crate::error::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Install the handlers and forward every signal as an exit request
///
/// The task ends when the receiver is dropped.
pub fn spawn_signal_listener(tx: mpsc::Sender<ExitRequest>) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                Some(()) = hangup.recv() => "SIGHUP",
                else => break,
            };
            tracing::info!(signal = name, "Termination signal intercepted");
            if tx
                .send(ExitRequest::new(ExitSource::Signal(name.to_string())))
                .await
                .is_err()
            {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_hangup_becomes_exit_request() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_signal_listener(tx).unwrap();

        raise(Signal::SIGHUP).unwrap();
        let request = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.source, ExitSource::Signal("SIGHUP".into()));

        drop(rx);
        handle.abort();
    }
}
