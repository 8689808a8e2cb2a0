use serde::Serialize;
use std::path::{Path, PathBuf};

/// The four paths elastix needs for one registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    pub reference_image: PathBuf,
    pub moving_image: PathBuf,
    pub output_folder: PathBuf,
    pub parameter_file: PathBuf,
}

/// Names the request fields in user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestField {
    ReferenceImage,
    MovingImage,
    OutputFolder,
    ParameterFile,
}

impl RequestField {
    pub fn label(self) -> &'static str {
        match self {
            RequestField::ReferenceImage => "reference image",
            RequestField::MovingImage => "moving image",
            RequestField::OutputFolder => "output folder",
            RequestField::ParameterFile => "parameter file",
        }
    }
}

impl JobRequest {
    /// First empty field, in argument order.
    pub fn missing_field(&self) -> Option<RequestField> {
        [
            (RequestField::ReferenceImage, &self.reference_image),
            (RequestField::MovingImage, &self.moving_image),
            (RequestField::OutputFolder, &self.output_folder),
            (RequestField::ParameterFile, &self.parameter_file),
        ]
        .into_iter()
        .find(|(_, p)| p.as_os_str().is_empty())
        .map(|(field, _)| field)
    }
}

/// Output folder implied by a moving image: the directory that contains it.
pub fn default_output_folder(moving_image: &Path) -> Option<PathBuf> {
    let parent = moving_image.parent()?;
    if parent.as_os_str().is_empty() {
        return std::env::current_dir().ok();
    }
    Some(std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf()))
}

/// True for paths elastix reads as NIfTI volumes (`*.nii`, `*.nii.gz`).
#[cfg(feature = "tui")]
pub fn is_nifti_path(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_ascii_lowercase(),
        None => return false,
    };
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failed { code: i32 },
    /// Terminated abnormally; no meaningful exit code.
    Crashed,
    /// Ended after a cancel or teardown request.
    Cancelled { code: Option<i32> },
}

impl JobOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(self) -> String {
        match self {
            JobOutcome::Success => "Image registration completed successfully.".to_string(),
            JobOutcome::Failed { code } => {
                format!("Image registration failed with exit code {code}.")
            }
            JobOutcome::Crashed => "Image registration process crashed.".to_string(),
            JobOutcome::Cancelled { .. } => "Image registration was cancelled.".to_string(),
        }
    }
}

#[cfg_attr(not(feature = "tui"), allow(dead_code))]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job: JobId,
        program: String,
        args: Vec<String>,
        started_at: String,
    },
    Output {
        job: JobId,
        stream: OutputStream,
        text: String,
    },
    Finished {
        job: JobId,
        outcome: JobOutcome,
    },
    Info(InfoEvent),
    Alert(Alert),
}

/// Structured info events emitted by the controller and consumed by UI/CLI layers.
#[cfg_attr(not(feature = "tui"), allow(dead_code))]
#[derive(Debug, Clone, Serialize)]
pub enum InfoEvent {
    Message(String),
    Cancelling { job: JobId },
    ShuttingDown,
}

impl InfoEvent {
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Cancelling { job } => format!("Cancelling job #{job}…"),
            InfoEvent::ShuttingDown => "Shutting down…".to_string(),
        }
    }
}

#[cfg_attr(not(feature = "tui"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A message the user has to acknowledge before continuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

#[cfg(feature = "tui")]
impl Alert {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            title: "Error".into(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            title: "Error".into(),
            message: message.into(),
        }
    }

    pub fn for_outcome(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Success => Self {
                severity: Severity::Info,
                title: "Success".into(),
                message: outcome.to_message(),
            },
            JobOutcome::Cancelled { .. } => Self {
                severity: Severity::Warning,
                title: "Cancelled".into(),
                message: outcome.to_message(),
            },
            _ => Self::error(outcome.to_message()),
        }
    }
}
