//! elastix process launcher.
//!
//! Owns the single "current job" slot: a job is spawned into it by `start`,
//! its stdout/stderr are relayed as `JobEvent::Output` by a task bound to that
//! job, and the slot is released once `wait_finished` observes completion.

mod relay;

use crate::error::LaunchError;
use crate::model::{JobEvent, JobId, JobOutcome, JobRequest};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Default executable name, resolved through `PATH`.
pub fn default_program() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("elastix.exe")
    } else {
        PathBuf::from("elastix")
    }
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub program: PathBuf,
    /// How long teardown waits for a terminated job before giving up on it.
    pub grace_period: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Build the elastix argument list: `-f <ref> -m <mov> -out <out> -p <param>`.
pub fn build_args(request: &JobRequest) -> Vec<OsString> {
    vec![
        "-f".into(),
        request.reference_image.clone().into_os_string(),
        "-m".into(),
        request.moving_image.clone().into_os_string(),
        "-out".into(),
        request.output_folder.clone().into_os_string(),
        "-p".into(),
        request.parameter_file.clone().into_os_string(),
    ]
}

/// Internal handle for a running job.
struct JobHandle {
    id: JobId,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<JobOutcome>,
}

pub struct Launcher {
    cfg: LauncherConfig,
    next_id: JobId,
    current: Option<JobHandle>,
}

impl Launcher {
    pub fn new(cfg: LauncherConfig) -> Self {
        Self {
            cfg,
            next_id: 1,
            current: None,
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.cfg.program
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current.as_ref().map(|h| h.id)
    }

    #[cfg(any(test, feature = "tui"))]
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Validate `request` and spawn elastix for it.
    ///
    /// Rejected while another job occupies the slot. Emits `Started`, then the
    /// relay task emits `Output` events on `events` as the child writes.
    pub fn start(
        &mut self,
        request: &JobRequest,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Result<JobId, LaunchError> {
        if let Some(field) = request.missing_field() {
            return Err(LaunchError::MissingField(field));
        }
        if let Some(active) = self.current_job() {
            return Err(LaunchError::JobActive(active));
        }

        let args = build_args(request);
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let program = self.cfg.program.display().to_string();
        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;

        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(job = id, pid = ?child.id(), program = %program, "started registration");

        let _ = events.send(JobEvent::Started {
            job: id,
            program,
            args: args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            started_at: now_rfc3339(),
        });

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(relay::relay(id, child, events, cancel_rx));
        self.current = Some(JobHandle {
            id,
            cancel_tx: Some(cancel_tx),
            task,
        });
        Ok(id)
    }

    /// Ask the running job to terminate. Returns false when idle.
    ///
    /// The job still finishes through `wait_finished`.
    #[cfg(any(test, feature = "tui"))]
    pub fn cancel(&mut self) -> bool {
        match self.current.as_mut() {
            Some(handle) => {
                if let Some(tx) = handle.cancel_tx.take() {
                    tracing::info!(job = handle.id, "cancel requested");
                    let _ = tx.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Resolve when the current job finishes and release its slot.
    ///
    /// Pending forever while idle, so it can sit in a `select!` branch. Dropping
    /// the future before it resolves leaves the job in place.
    pub async fn wait_finished(&mut self) -> (JobId, JobOutcome) {
        let Some(handle) = self.current.as_mut() else {
            return futures::future::pending().await;
        };
        let outcome = match (&mut handle.task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job = handle.id, "relay task failed: {e}");
                JobOutcome::Crashed
            }
        };
        let id = handle.id;
        self.current = None;
        tracing::info!(job = id, ?outcome, "registration finished");
        (id, outcome)
    }

    /// Terminate the current job and wait up to the grace period for it.
    ///
    /// The slot is empty afterwards whether or not the job exited in time.
    pub async fn shutdown(&mut self) -> Option<(JobId, JobOutcome)> {
        let mut handle = self.current.take()?;
        if let Some(tx) = handle.cancel_tx.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(self.cfg.grace_period, &mut handle.task).await {
            Ok(Ok(outcome)) => Some((handle.id, outcome)),
            Ok(Err(e)) => {
                tracing::warn!(job = handle.id, "relay task failed during shutdown: {e}");
                None
            }
            Err(_) => {
                tracing::warn!(
                    job = handle.id,
                    "job did not exit within {:?}; abandoning it",
                    self.cfg.grace_period
                );
                // Dropping the child inside the task kills it.
                handle.task.abort();
                None
            }
        }
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        // Closing the cancel channel makes the relay terminate the child; the
        // task itself is detached.
        if let Some(handle) = self.current.take() {
            tracing::debug!(job = handle.id, "launcher dropped with a live job");
            drop(handle.cancel_tx);
        }
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use crate::model::{OutputStream, RequestField};
    use std::time::Instant;

    fn request(reference: &str) -> JobRequest {
        JobRequest {
            reference_image: reference.into(),
            moving_image: "moving.nii.gz".into(),
            output_folder: "out".into(),
            parameter_file: "rigid.txt".into(),
        }
    }

    #[test]
    fn args_follow_elastix_flag_order() {
        let args = build_args(&JobRequest {
            reference_image: "/data/fixed.nii".into(),
            moving_image: "/data/moving.nii.gz".into(),
            output_folder: "/data/out".into(),
            parameter_file: "/opt/parameter-files/rigid.txt".into(),
        });
        assert_eq!(
            args,
            [
                "-f",
                "/data/fixed.nii",
                "-m",
                "/data/moving.nii.gz",
                "-out",
                "/data/out",
                "-p",
                "/opt/parameter-files/rigid.txt",
            ]
            .map(OsString::from)
        );
    }

    #[tokio::test]
    async fn incomplete_request_spawns_nothing() {
        let mut launcher = Launcher::new(LauncherConfig {
            program: "/nonexistent/elastix".into(),
            grace_period: Duration::from_secs(1),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut req = request("fixed.nii");
        req.output_folder = PathBuf::new();

        let err = launcher.start(&req, tx).unwrap_err();
        assert!(matches!(
            err,
            LaunchError::MissingField(RequestField::OutputFolder)
        ));
        assert!(err.is_validation());
        assert!(!launcher.is_busy());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut launcher = Launcher::new(LauncherConfig {
            program: "/nonexistent/elastix".into(),
            grace_period: Duration::from_secs(1),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = launcher.start(&request("fixed.nii"), tx).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(!launcher.is_busy());
    }

    /// Fake elastix for Unix tests.
    ///
    /// The launcher runs `sh`, so the generated command line is
    /// `sh -f <script> -m <mov> -out <out> -p <param>`: `-f` only disables
    /// globbing and the reference path becomes the script sh executes, with
    /// the remaining elastix flags as `$1..$6`.
    #[cfg(unix)]
    mod fake_elastix {
        use super::*;

        pub struct Fixture {
            pub dir: tempfile::TempDir,
            pub launcher: Launcher,
        }

        impl Fixture {
            pub fn new(grace_period: Duration) -> Self {
                Self {
                    dir: tempfile::tempdir().unwrap(),
                    launcher: Launcher::new(LauncherConfig {
                        program: "sh".into(),
                        grace_period,
                    }),
                }
            }

            pub fn request(&self, script: &str) -> JobRequest {
                let path = self.dir.path().join("fake-elastix.sh");
                std::fs::write(&path, script).unwrap();
                request(path.to_str().unwrap())
            }
        }

        pub async fn finish(launcher: &mut Launcher) -> (JobId, JobOutcome) {
            tokio::time::timeout(Duration::from_secs(10), launcher.wait_finished())
                .await
                .expect("job did not finish")
        }

        pub fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
            let mut events = Vec::new();
            while let Ok(ev) = rx.try_recv() {
                events.push(ev);
            }
            events
        }

        pub fn joined(events: &[JobEvent], wanted: OutputStream) -> String {
            events
                .iter()
                .filter_map(|ev| match ev {
                    JobEvent::Output { stream, text, .. } if *stream == wanted => {
                        Some(text.as_str())
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_run_relays_output_then_reports_success() {
        use fake_elastix::*;
        let mut fx = Fixture::new(Duration::from_secs(2));
        let req = fx.request("echo \"$1 $2\"\necho \"$3 $4\"\necho \"$5 $6\"\n");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = fx.launcher.start(&req, tx).unwrap();
        assert_eq!(fx.launcher.current_job(), Some(id));

        let (done, outcome) = finish(&mut fx.launcher).await;
        assert_eq!(done, id);
        assert_eq!(outcome, JobOutcome::Success);
        assert!(!fx.launcher.is_busy());

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(JobEvent::Started { job, .. }) if *job == id));
        let stdout = joined(&events, OutputStream::Stdout);
        assert!(stdout.contains("-m moving.nii.gz"), "{stdout}");
        assert!(stdout.contains("-out out"), "{stdout}");
        assert!(stdout.contains("-p rigid.txt"), "{stdout}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_the_code_and_stderr() {
        use fake_elastix::*;
        let mut fx = Fixture::new(Duration::from_secs(2));
        let req = fx.request("echo 'itk::ExceptionObject' >&2\nexit 3\n");
        let (tx, mut rx) = mpsc::unbounded_channel();

        fx.launcher.start(&req, tx).unwrap();
        let (_, outcome) = finish(&mut fx.launcher).await;
        assert_eq!(outcome, JobOutcome::Failed { code: 3 });
        let stderr = joined(&drain(&mut rx), OutputStream::Stderr);
        assert!(stderr.contains("itk::ExceptionObject"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_process_reports_crash() {
        use fake_elastix::*;
        let mut fx = Fixture::new(Duration::from_secs(2));
        let req = fx.request("echo starting\nkill -KILL $$\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        fx.launcher.start(&req, tx).unwrap();
        let (_, outcome) = finish(&mut fx.launcher).await;
        assert_eq!(outcome, JobOutcome::Crashed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_is_rejected_while_busy_and_cancel_ends_the_job() {
        use fake_elastix::*;
        let mut fx = Fixture::new(Duration::from_secs(2));
        let req = fx.request("exec sleep 30\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = fx.launcher.start(&req, tx.clone()).unwrap();
        let err = fx.launcher.start(&req, tx).unwrap_err();
        assert!(matches!(err, LaunchError::JobActive(active) if active == id));

        assert!(fx.launcher.cancel());
        let (done, outcome) = finish(&mut fx.launcher).await;
        assert_eq!(done, id);
        assert!(matches!(outcome, JobOutcome::Cancelled { code: None }));
        assert!(!fx.launcher.cancel());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_abandons_a_job_that_ignores_terminate() {
        use fake_elastix::*;
        let mut fx = Fixture::new(Duration::from_millis(300));
        let req = fx.request("trap '' TERM\nexec sleep 30\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        fx.launcher.start(&req, tx).unwrap();
        // Let sh install the trap before terminating.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let t0 = Instant::now();
        assert_eq!(fx.launcher.shutdown().await, None);
        assert!(t0.elapsed() < Duration::from_secs(5));
        assert!(!fx.launcher.is_busy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_reports_the_outcome_when_the_job_exits_in_time() {
        use fake_elastix::*;
        let mut fx = Fixture::new(Duration::from_secs(5));
        let req = fx.request("exec sleep 30\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = fx.launcher.start(&req, tx).unwrap();
        let (done, outcome) = fx.launcher.shutdown().await.expect("job exits on SIGTERM");
        assert_eq!(done, id);
        assert!(matches!(outcome, JobOutcome::Cancelled { .. }));
        assert_eq!(fx.launcher.shutdown().await, None);
    }
}
