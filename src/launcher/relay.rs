//! Per-job output relay.
//!
//! One task per job reads whatever the child has buffered on stdout and
//! stderr, forwards each non-empty read as an `Output` event and, once both
//! pipes are closed, reaps the child. The outcome is the task's return value,
//! so it is always observed after every output event of the job.

use crate::model::{JobEvent, JobId, JobOutcome, OutputStream};
use std::process::ExitStatus;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

const READ_CHUNK: usize = 8 * 1024;

pub(super) async fn relay(
    job: JobId,
    mut child: Child,
    events: mpsc::UnboundedSender<JobEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> JobOutcome {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    // A closed cancel channel (launcher dropped) counts as a request too.
    let mut cancel_requested = false;

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            res = read_chunk(stdout.as_mut(), &mut out_buf) => {
                if !forward(job, OutputStream::Stdout, res, &out_buf, &events) {
                    stdout = None;
                }
            }
            res = read_chunk(stderr.as_mut(), &mut err_buf) => {
                if !forward(job, OutputStream::Stderr, res, &err_buf, &events) {
                    stderr = None;
                }
            }
            _ = &mut cancel_rx, if !cancel_requested => {
                cancel_requested = true;
                request_terminate(job, &mut child);
            }
        }
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut cancel_rx, if !cancel_requested => {
                cancel_requested = true;
                request_terminate(job, &mut child);
            }
        }
    };

    match status {
        Ok(status) => classify(status, cancel_requested),
        Err(e) => {
            tracing::error!(job, "failed to wait for elastix: {e}");
            if cancel_requested {
                JobOutcome::Cancelled { code: None }
            } else {
                JobOutcome::Crashed
            }
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    pipe: Option<&mut R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => futures::future::pending().await,
    }
}

/// Forward one read result. Returns false once the stream is finished.
fn forward(
    job: JobId,
    stream: OutputStream,
    res: std::io::Result<usize>,
    buf: &[u8],
    events: &mpsc::UnboundedSender<JobEvent>,
) -> bool {
    match res {
        Ok(0) => false,
        Ok(n) => {
            let _ = events.send(JobEvent::Output {
                job,
                stream,
                text: decode_chunk(&buf[..n]),
            });
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => true,
        Err(e) => {
            tracing::warn!(job, ?stream, "read failed: {e}");
            false
        }
    }
}

/// Decode a chunk of console output as written, replacing invalid UTF-8.
fn decode_chunk(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn classify(status: ExitStatus, cancel_requested: bool) -> JobOutcome {
    match (status.code(), cancel_requested) {
        (Some(0), _) => JobOutcome::Success,
        (code, true) => JobOutcome::Cancelled { code },
        (Some(code), false) if cfg!(windows) && is_ntstatus_error(code) => JobOutcome::Crashed,
        (Some(code), false) => JobOutcome::Failed { code },
        (None, false) => JobOutcome::Crashed,
    }
}

/// Windows reports a crash as an exit code carrying an NTSTATUS error
/// (severity bits `11`, e.g. `0xC0000005` for an access violation).
fn is_ntstatus_error(code: i32) -> bool {
    (code as u32) >> 30 == 0b11
}

/// SIGTERM on Unix so elastix can exit on its own; a hard kill elsewhere.
fn request_terminate(job: JobId, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            tracing::info!(job, pid, "sending SIGTERM");
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(job, pid, "failed to send SIGTERM: {e}");
            }
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(job, "failed to kill elastix: {e}");
    }
}
