//! Diagnostics setup.
//!
//! Headless modes log to stderr. The TUI owns the terminal, so it logs to a
//! file instead; if that file cannot be opened logging is simply off.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `<data-local-dir>/elastix-tui/elastix-tui.log`
#[cfg(feature = "tui")]
pub fn default_log_file() -> Option<std::path::PathBuf> {
    dirs::data_local_dir().map(|d| d.join("elastix-tui").join("elastix-tui.log"))
}

pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

#[cfg(feature = "tui")]
pub fn init_file(path: &std::path::Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(f) => f,
        Err(_) => return,
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::sync::Mutex::new(file))
        .with_env_filter(env_filter())
        .with_ansi(false)
        .try_init();
}
