//! Job lifecycle controller.
//!
//! Owns the launcher, turns UI commands into launcher operations and emits
//! events for presentation layers.

use crate::launcher::Launcher;
use crate::model::{Alert, InfoEvent, JobEvent, JobRequest};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

/// Commands emitted by UI layers to control registration jobs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Register(JobRequest),
    Cancel,
    Quit,
}

/// Drive the launcher from UI commands until `Quit` or the command channel closes.
///
/// Quitting tears down a running job through `Launcher::shutdown`.
pub(crate) async fn run_controller(
    mut launcher: Launcher,
    event_tx: UnboundedSender<JobEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    // Cancel watchdog: if elastix ignores the terminate request for a while, say so.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Register(request)) => {
                        match launcher.start(&request, event_tx.clone()) {
                            Ok(job) => {
                                let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(
                                    format!("Registration #{job} running…"),
                                )));
                            }
                            Err(e) => {
                                tracing::warn!("registration not started: {e}");
                                let alert = if e.is_validation() {
                                    Alert::warning(e.to_string())
                                } else {
                                    Alert::error(e.to_string())
                                };
                                let _ = event_tx.send(JobEvent::Alert(alert));
                            }
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        if let Some(job) = launcher.current_job() {
                            launcher.cancel();
                            let _ = event_tx.send(JobEvent::Info(InfoEvent::Cancelling { job }));
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(
                                "No registration is running.".into(),
                            )));
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        if launcher.is_busy() {
                            let _ = event_tx.send(JobEvent::Info(InfoEvent::ShuttingDown));
                            if let Some((job, outcome)) = launcher.shutdown().await {
                                let _ = event_tx.send(JobEvent::Finished { job, outcome });
                            }
                        }
                        break Ok(());
                    }
                }
            }
            (job, outcome) = launcher.wait_finished() => {
                cancel_deadline = None;
                let _ = event_tx.send(JobEvent::Finished { job, outcome });
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && launcher.is_busy() {
                        let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(
                            "Still waiting for elastix to exit…".into(),
                        )));
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}
