use crate::launcher::{Launcher, LauncherConfig};
use crate::model::{default_output_folder, JobEvent, JobOutcome, JobRequest, OutputStream};
use crate::params::{self, ParameterFile};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output routing for the headless writer.
enum OutputLine {
    /// elastix stdout, written exactly as read.
    Stdout(String),
    /// elastix stderr, written exactly as read.
    Stderr(String),
    /// A line of our own (run banner, outcome) on stderr.
    Notice(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    spawn_writer(std::io::stdout, std::io::stderr)
}

/// Writer loop over arbitrary sinks. A sink is opened per message, so the
/// stream lock is never held between messages and tracing can share stderr.
fn spawn_writer<O, E>(
    stdout: impl Fn() -> O + Send + 'static,
    stderr: impl Fn() -> E + Send + 'static,
) -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
)
where
    O: Write,
    E: Write,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        // Notices start on a fresh line even when elastix left stderr mid-line.
        let mut stderr_mid_line = false;

        while let Some(line) = rx.blocking_recv() {
            let _ = match line {
                OutputLine::Stdout(text) => write_flushed(stdout(), &text),
                OutputLine::Stderr(text) => {
                    if !text.is_empty() {
                        stderr_mid_line = !text.ends_with('\n');
                    }
                    write_flushed(stderr(), &text)
                }
                OutputLine::Notice(msg) => {
                    let sep = if stderr_mid_line { "\n" } else { "" };
                    stderr_mid_line = false;
                    write_flushed(stderr(), &format!("{sep}{msg}\n"))
                }
            };
        }
    });
    (tx, handle)
}

fn write_flushed(mut w: impl Write, text: &str) -> std::io::Result<()> {
    w.write_all(text.as_bytes())?;
    w.flush()
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "elastix-tui",
    version,
    about = "Run elastix image registrations from a terminal UI"
)]
pub struct Cli {
    /// Reference (fixed) image, passed to elastix as -f
    #[arg(long, value_name = "PATH")]
    pub reference: Option<PathBuf>,

    /// Moving image, passed to elastix as -m
    #[arg(long, value_name = "PATH")]
    pub moving: Option<PathBuf>,

    /// Output folder, passed to elastix as -out (defaults to the moving image's folder)
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Parameter file, by file name or full path, from the parameter-files folder
    #[arg(long, value_name = "NAME")]
    pub parameter_file: Option<String>,

    /// Folder to read parameter files from (defaults to parameter-files next to the executable)
    #[arg(long, value_name = "DIR")]
    pub parameter_dir: Option<PathBuf>,

    /// elastix executable
    #[arg(long, env = "ELASTIX_PATH", default_value_os_t = crate::launcher::default_program())]
    pub elastix: PathBuf,

    /// How long to wait for elastix to exit after asking it to terminate
    #[arg(long, default_value = "5s")]
    pub grace_period: humantime::Duration,

    /// Run the registration, print elastix output and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run the registration, print events as JSON lines and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print the available parameter files and exit
    #[arg(long)]
    pub list_parameter_files: bool,

    /// Log file used by the TUI
    #[cfg(feature = "tui")]
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn parameter_dir(&self) -> PathBuf {
        self.parameter_dir.clone().unwrap_or_else(params::default_dir)
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.text && args.json {
        return Err(anyhow::anyhow!(
            "--text and --json are mutually exclusive. Pick one output mode."
        ));
    }

    if !args.json && !args.text && !args.list_parameter_files {
        #[cfg(feature = "tui")]
        {
            if let Some(path) = args.log_file.clone().or_else(crate::logging::default_log_file) {
                crate::logging::init_file(&path);
            }
            return crate::tui::run(args).await;
        }
    }

    crate::logging::init_stderr();

    if args.list_parameter_files {
        return list_parameter_files(&args);
    }

    run_headless(args).await
}

/// Build a `LauncherConfig` from CLI arguments.
pub fn launcher_config(args: &Cli) -> LauncherConfig {
    LauncherConfig {
        program: args.elastix.clone(),
        grace_period: Duration::from(args.grace_period),
    }
}

/// Build a `JobRequest` from CLI arguments, resolving the parameter file in `files`.
///
/// Missing paths are left empty; the launcher reports them.
pub fn build_request(args: &Cli, files: &[ParameterFile]) -> Result<JobRequest> {
    let parameter_file = match args.parameter_file.as_deref() {
        Some(wanted) => params::select(files, wanted)?.path.clone(),
        None => files
            .first()
            .map(|f| f.path.clone())
            .context("no parameter file available")?,
    };
    let output_folder = args
        .output
        .clone()
        .or_else(|| args.moving.as_deref().and_then(default_output_folder))
        .unwrap_or_default();

    Ok(JobRequest {
        reference_image: args.reference.clone().unwrap_or_default(),
        moving_image: args.moving.clone().unwrap_or_default(),
        output_folder,
        parameter_file,
    })
}

fn list_parameter_files(args: &Cli) -> Result<()> {
    let files = params::discover(&args.parameter_dir())?;
    let mut out = std::io::stdout().lock();
    for f in files {
        writeln!(out, "{}\t{}", f.label, f.path.display())?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Text,
    Json,
}

/// Run one registration without the TUI, streaming events to stdout/stderr.
async fn run_headless(args: Cli) -> Result<()> {
    let mode = if args.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let files = params::discover(&args.parameter_dir())?;
    let request = build_request(&args, &files)?;

    let mut launcher = Launcher::new(launcher_config(&args));
    let (out_tx, out_handle) = spawn_output_writer();
    let interrupt = async {
        // No signal handler means no interrupt, not an immediate one.
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    };

    let res = stream_job(&mut launcher, &request, mode, &out_tx, interrupt).await;

    drop(out_tx);
    let _ = out_handle.await;

    outcome_result(res?)
}

/// Start `request` and relay its events to `out_tx` until it finishes.
///
/// When `interrupt` resolves first the job goes through `Launcher::shutdown`.
async fn stream_job(
    launcher: &mut Launcher,
    request: &JobRequest,
    mode: OutputMode,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<JobOutcome> {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let job = launcher
        .start(request, evt_tx)
        .context("registration not started")?;
    tokio::pin!(interrupt);

    let finished = loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => emit(out_tx, mode, ev)?,
            done = launcher.wait_finished() => break Some(done),
            _ = &mut interrupt => {
                tracing::info!("interrupted; terminating {}", launcher.program().display());
                break launcher.shutdown().await;
            }
        }
    };

    // Everything the job wrote was sent before it finished.
    while let Ok(ev) = evt_rx.try_recv() {
        emit(out_tx, mode, ev)?;
    }

    let outcome = finished
        .map(|(_, outcome)| outcome)
        .unwrap_or(JobOutcome::Cancelled { code: None });
    emit(out_tx, mode, JobEvent::Finished { job, outcome })?;
    Ok(outcome)
}

/// Anything but success makes the process exit non-zero.
fn outcome_result(outcome: JobOutcome) -> Result<()> {
    if outcome.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(outcome.to_message()))
    }
}

fn emit(out_tx: &mpsc::UnboundedSender<OutputLine>, mode: OutputMode, ev: JobEvent) -> Result<()> {
    if mode == OutputMode::Json {
        let line = serde_json::to_string(&ev).context("serialize event")?;
        let _ = out_tx.send(OutputLine::Stdout(line + "\n"));
        return Ok(());
    }

    let line = match ev {
        JobEvent::Started { program, args, .. } => {
            OutputLine::Notice(format!("Running: {} {}", program, args.join(" ")))
        }
        JobEvent::Output {
            stream: OutputStream::Stdout,
            text,
            ..
        } => OutputLine::Stdout(text),
        JobEvent::Output {
            stream: OutputStream::Stderr,
            text,
            ..
        } => OutputLine::Stderr(text),
        JobEvent::Finished { outcome, .. } => OutputLine::Notice(outcome.to_message()),
        JobEvent::Info(info) => OutputLine::Notice(info.to_message()),
        JobEvent::Alert(alert) => OutputLine::Notice(format!("{}: {}", alert.title, alert.message)),
    };
    let _ = out_tx.send(line);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn catalog(dir: &std::path::Path) -> Vec<ParameterFile> {
        std::fs::write(dir.join("rigid.txt"), "").unwrap();
        std::fs::write(dir.join("affine.txt"), "").unwrap();
        params::discover(dir).unwrap()
    }

    #[test]
    fn parses_paths_and_defaults() {
        let args = Cli::parse_from([
            "elastix-tui",
            "--reference",
            "fixed.nii",
            "--moving",
            "moving.nii.gz",
            "--text",
        ]);
        assert!(args.text);
        assert_eq!(args.reference.as_deref(), Some(std::path::Path::new("fixed.nii")));
        assert_eq!(
            launcher_config(&args).grace_period,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn request_uses_named_parameter_file_and_moving_folder() {
        let dir = tempfile::tempdir().unwrap();
        let files = catalog(dir.path());
        let moving = dir.path().join("moving.nii.gz");
        let args = Cli::parse_from([
            OsString::from("elastix-tui"),
            "--reference".into(),
            "fixed.nii".into(),
            "--moving".into(),
            moving.clone().into_os_string(),
            "--parameter-file".into(),
            "rigid.txt".into(),
        ]);

        let req = build_request(&args, &files).unwrap();
        assert_eq!(req.parameter_file, dir.path().join("rigid.txt"));
        assert_eq!(req.output_folder, std::fs::canonicalize(dir.path()).unwrap());
        assert_eq!(req.missing_field(), None);
    }

    #[test]
    fn request_defaults_to_first_parameter_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = catalog(dir.path());
        let args = Cli::parse_from(["elastix-tui"]);

        let req = build_request(&args, &files).unwrap();
        assert_eq!(req.parameter_file, dir.path().join("affine.txt"));
        assert!(req.reference_image.as_os_str().is_empty());
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Captured {
        fn sink(&self) -> impl Fn() -> Captured + Send + 'static {
            let this = self.clone();
            move || this.clone()
        }

        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    fn fake_elastix(dir: &std::path::Path, script: &str) -> (Launcher, JobRequest) {
        // `sh -f <script> -m ... -out ... -p ...` runs the reference path as a script.
        let path = dir.join("fake-elastix.sh");
        std::fs::write(&path, script).unwrap();
        let launcher = Launcher::new(LauncherConfig {
            program: "sh".into(),
            grace_period: Duration::from_secs(2),
        });
        let request = JobRequest {
            reference_image: path,
            moving_image: "moving.nii.gz".into(),
            output_folder: dir.to_path_buf(),
            parameter_file: "rigid.txt".into(),
        };
        (launcher, request)
    }

    fn info_logging_to_stderr() -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_max_level(tracing::Level::INFO)
                .finish(),
        )
    }

    #[tokio::test]
    async fn writer_leaves_stderr_free_for_logging() {
        let (tx, writer) = spawn_output_writer();
        tx.send(OutputLine::Stderr(String::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let log = tokio::task::spawn_blocking(|| {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_max_level(tracing::Level::INFO)
                .finish();
            tracing::subscriber::with_default(subscriber, || tracing::info!("writer running"));
        });
        tokio::time::timeout(Duration::from_secs(5), log)
            .await
            .expect("stderr stayed locked by the output writer")
            .unwrap();

        drop(tx);
        writer.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn text_mode_passes_elastix_output_through_unchanged() {
        let _log = info_logging_to_stderr();
        let dir = tempfile::tempdir().unwrap();
        let (mut launcher, request) = fake_elastix(
            dir.path(),
            "printf 'Resolution: '\nsleep 0.2\nprintf '0\\n'\necho 'Resolution: 1'\nprintf 'warn' >&2\nexit 2\n",
        );
        let (out, err) = (Captured::default(), Captured::default());
        let (tx, writer) = spawn_writer(out.sink(), err.sink());

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            stream_job(&mut launcher, &request, OutputMode::Text, &tx, futures::future::pending()),
        )
        .await
        .expect("headless run did not finish")
        .unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(outcome, JobOutcome::Failed { code: 2 });
        assert!(outcome_result(outcome).is_err());
        assert_eq!(out.text(), "Resolution: 0\nResolution: 1\n");
        let err = err.text();
        assert!(err.starts_with("Running: sh -f "), "{err}");
        assert!(
            err.ends_with("warn\nImage registration failed with exit code 2.\n"),
            "{err}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn json_mode_writes_one_event_per_line() {
        let _log = info_logging_to_stderr();
        let dir = tempfile::tempdir().unwrap();
        let (mut launcher, request) = fake_elastix(dir.path(), "echo 'Total time elapsed: 1.2s'\n");
        let out = Captured::default();
        let (tx, writer) = spawn_writer(out.sink(), Captured::default().sink());

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            stream_job(&mut launcher, &request, OutputMode::Json, &tx, futures::future::pending()),
        )
        .await
        .expect("headless run did not finish")
        .unwrap();
        drop(tx);
        writer.await.unwrap();

        assert!(outcome_result(outcome).is_ok());
        let events: Vec<serde_json::Value> = out
            .text()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.first().unwrap()["event"], "started");
        assert!(events.iter().any(|e| e["event"] == "output"
            && e["data"]["text"] == "Total time elapsed: 1.2s\n"));
        let last = events.last().unwrap();
        assert_eq!(last["event"], "finished");
        assert_eq!(last["data"]["outcome"]["kind"], "success");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_tears_the_job_down() {
        let dir = tempfile::tempdir().unwrap();
        let (mut launcher, request) = fake_elastix(dir.path(), "exec sleep 30\n");
        let (tx, writer) = spawn_writer(Captured::default().sink(), Captured::default().sink());

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            stream_job(
                &mut launcher,
                &request,
                OutputMode::Text,
                &tx,
                tokio::time::sleep(Duration::from_millis(200)),
            ),
        )
        .await
        .expect("interrupted run did not finish")
        .unwrap();
        drop(tx);
        writer.await.unwrap();

        assert!(matches!(outcome, JobOutcome::Cancelled { .. }));
        assert!(!launcher.is_busy());
    }

    #[test]
    fn unknown_parameter_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = catalog(dir.path());
        let args = Cli::parse_from(["elastix-tui", "--parameter-file", "bspline.txt"]);
        assert!(build_request(&args, &files).is_err());
    }
}
