//! Parameter-file discovery.
//!
//! elastix parameter files live in a `parameter-files` folder next to the
//! executable. Every readable `*.txt` file directly inside it is offered as a
//! choice, labeled by its file name.

use crate::error::CatalogError;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const PARAMETER_DIR_NAME: &str = "parameter-files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterFile {
    pub label: String,
    pub path: PathBuf,
}

/// `parameter-files` beside the running executable.
pub fn default_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PARAMETER_DIR_NAME)
}

/// List eligible parameter files in `dir`, sorted by label.
///
/// A missing or unreadable directory counts as empty.
pub fn discover(dir: &Path) -> Result<Vec<ParameterFile>, CatalogError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("cannot read parameter directory {}: {}", dir.display(), e);
            return Err(CatalogError::Empty(dir.to_path_buf()));
        }
    };

    let mut files: Vec<ParameterFile> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let label = entry.file_name().to_str()?.to_string();
            if !label.to_ascii_lowercase().ends_with(".txt") {
                return None;
            }
            let path = entry.path();
            // Readable only.
            std::fs::File::open(&path).ok()?;
            Some(ParameterFile { label, path })
        })
        .collect();

    if files.is_empty() {
        return Err(CatalogError::Empty(dir.to_path_buf()));
    }

    files.sort_by(|a, b| a.label.cmp(&b.label));
    tracing::debug!(count = files.len(), dir = %dir.display(), "discovered parameter files");
    Ok(files)
}

/// Resolve a user selection against the catalog, by label or by full path.
pub fn select<'a>(files: &'a [ParameterFile], wanted: &str) -> Result<&'a ParameterFile, CatalogError> {
    files
        .iter()
        .find(|f| f.label == wanted)
        .or_else(|| files.iter().find(|f| f.path == Path::new(wanted)))
        .ok_or_else(|| CatalogError::UnknownSelection(wanted.to_string()))
}
