//! JSON-lines record sink.
//!
//! Every answer and transcript entry becomes one line in a single
//! append-only file, tagged with its kind:
//!
//! ```text
//! {"kind":"answer","nodeId":"q1","question":"...","answer":"...","recordedAt":"..."}
//! {"kind":"transcript","nodeId":"q1","role":"assistant","text":"...","recordedAt":"..."}
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use surveycoach_core::{AnswerRecord, RecordSinkError, SurveyRecordSink, TranscriptEntry};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RecordLine<'a> {
    Answer(&'a AnswerRecord),
    Transcript(&'a TranscriptEntry),
}

/// Appends records to a `.jsonl` file, creating it (and its parent
/// directory) on first write.
#[derive(Debug)]
pub struct JsonlRecordSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRecordSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &RecordLine<'_>) -> Result<(), RecordSinkError> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Record appended");
        Ok(())
    }
}

#[async_trait]
impl SurveyRecordSink for JsonlRecordSink {
    async fn append_answer(&self, record: AnswerRecord) -> Result<(), RecordSinkError> {
        self.append(&RecordLine::Answer(&record)).await
    }

    async fn append_transcript(&self, entry: TranscriptEntry) -> Result<(), RecordSinkError> {
        self.append(&RecordLine::Transcript(&entry)).await
    }
}
