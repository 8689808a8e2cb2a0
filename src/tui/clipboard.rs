//! Ctrl-Y: copy the elastix output pane.
//!
//! On X11 and Wayland a selection lives only as long as the `arboard::Clipboard`
//! that set it, so copies go to one background thread that holds each
//! selection for a while after setting it.

use anyhow::{Context, Result};
use std::sync::mpsc::{channel, Sender};
use std::sync::OnceLock;
use std::time::Duration;

const HOLD_SELECTION: Duration = Duration::from_secs(2);

static COPIER: OnceLock<Sender<String>> = OnceLock::new();

fn copier() -> &'static Sender<String> {
    COPIER.get_or_init(|| {
        let (tx, rx) = channel::<String>();
        let spawned = std::thread::Builder::new()
            .name("clipboard".into())
            .spawn(move || {
                for output in rx {
                    hold_selection(&output);
                }
            });
        if let Err(e) = spawned {
            // The receiver is gone with the closure, so every copy reports failure.
            tracing::warn!("clipboard thread not started: {e}");
        }
        tx
    })
}

fn hold_selection(output: &str) {
    let mut clipboard = match arboard::Clipboard::new() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("no clipboard available: {e}");
            return;
        }
    };
    match clipboard.set_text(output) {
        Ok(()) => std::thread::sleep(HOLD_SELECTION),
        Err(e) => tracing::warn!("copying elastix output failed: {e}"),
    }
}

/// Hand the output text to the clipboard thread; never blocks the UI loop.
pub fn copy_output(output: &str) -> Result<()> {
    copier()
        .send(output.to_owned())
        .context("clipboard thread has stopped")
}
