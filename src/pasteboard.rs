//! Pasteboard collaborator seam
//!
//! Writing to the system clipboard is the one place the core touches the
//! host pasteboard, and it is behind a trait so the real and test wirings
//! are just two implementations - no runtime patching.

use crate::error::{Error, Result};
use std::sync::Mutex;

pub trait Pasteboard: Send + Sync {
    /// Place text on the pasteboard. Non-text items surface their
    /// plain-text form (caption or path list).
    fn set_text(&self, text: &str) -> Result<()>;
}

/// Real clipboard via `arboard`. The handle is created per call: arboard
/// contexts are not `Sync` and a clipboard write is rare enough that setup
/// cost does not matter.
pub struct SystemPasteboard;

impl Pasteboard for SystemPasteboard {
    fn set_text(&self, text: &str) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|e| Error::IoFailed(format!("clipboard unavailable: {e}")))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|e| Error::IoFailed(format!("clipboard write: {e}")))?;
        Ok(())
    }
}

/// Capture-only implementation for tests and headless environments.
#[derive(Default)]
pub struct NullPasteboard {
    last: Mutex<Option<String>>,
}

impl NullPasteboard {
    pub fn last_text(&self) -> Option<String> {
        self.last.lock().unwrap().clone()
    }
}

impl Pasteboard for NullPasteboard {
    fn set_text(&self, text: &str) -> Result<()> {
        *self.last.lock().unwrap() = Some(text.to_string());
        Ok(())
    }
}
