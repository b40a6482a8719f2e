//! Recorder (C11).
//!
//! Per-call append-only PCM writer, grounded on the bridge's
//! `audio_save_dir` knob (declared there but never wired to a writer;
//! implemented here for real). Opening the file is non-fatal: a missing
//! directory or permission error just means the call runs unrecorded.
//! A write failure disables recording for the rest of the call instead
//! of propagating (§4.11).

use tokio::io::AsyncWriteExt;
use tracing::{ debug, warn };

pub struct Recorder {
    file: Option<tokio::fs::File>,
    path: String,
}

impl Recorder {
    /// Open `<dir>/call_<call_id>_<YYYYMMDD_HHMMSS>.raw` for append. Any
    /// error (missing dir, permissions) leaves the recorder disabled,
    /// logged once here rather than on every subsequent write.
    pub async fn open(dir: &str, call_id: &str, opened_at: chrono::DateTime<chrono::Utc>) -> Self {
        let timestamp = opened_at.format("%Y%m%d_%H%M%S");
        let path = format!("{dir}/call_{call_id}_{timestamp}.raw");
        match
            tokio::fs::OpenOptions
                ::new()
                .create(true)
                .append(true)
                .open(&path).await
        {
            Ok(file) => {
                debug!(path = %path, "recorder opened");
                Recorder { file: Some(file), path }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "failed to open recording file, call will run unrecorded");
                Recorder { file: None, path }
            }
        }
    }

    /// Append one frame's audio payload. No-op once disabled.
    pub async fn write(&mut self, payload: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(payload).await {
            warn!(path = %self.path, error = %e, "recording write failed, disabling recorder for this call");
            self.file = None;
        }
    }

    pub fn is_recording(&self) -> bool {
        self.file.is_some()
    }

    /// Flush and close. Errors here are logged, not propagated — the
    /// call has already ended by the time this runs.
    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!(path = %self.path, error = %e, "recorder flush failed on close");
            }
        }
    }
}
