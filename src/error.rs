//! Error types for job launching and parameter-file discovery.

use crate::model::{JobId, RequestField};
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("Please fill in all the required fields (missing {}).", .0.label())]
    MissingField(RequestField),

    #[error("A registration (job #{0}) is already running")]
    JobActive(JobId),

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Validation problems are warnings; everything else is an error.
    #[cfg(any(test, feature = "tui"))]
    pub fn is_validation(&self) -> bool {
        matches!(self, LaunchError::MissingField(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("No parameter files found in the 'parameter-files' folder ({}). Exiting.", .0.display())]
    Empty(PathBuf),

    #[error("Parameter file '{0}' is not in the parameter-files folder")]
    UnknownSelection(String),
}
