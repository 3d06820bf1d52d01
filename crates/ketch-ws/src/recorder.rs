//! Append-only session recording.
//!
//! Every inbound and outbound frame is shipped asynchronously to a writer
//! task as one JSON line. Recording is strictly best-effort: a slow or
//! failing sink drops entries and logs, it never touches the data path.

use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
const FLUSH_THRESHOLD: usize = 100;
const CHANNEL_CAPACITY: usize = 1024;

/// Frame direction relative to this client.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Serialize)]
struct RecordEntry {
    direction: Direction,
    frame_kind: &'static str,
    payload: String,
    timestamp_iso: String,
}

/// Cheap handle to the writer task.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<RecordEntry>,
}

impl Recorder {
    /// Open (append) the session log at `path` and start the writer task.
    ///
    /// The task performs a final flush and exits when the last handle is
    /// dropped.
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_writer(BufWriter::new(file), rx));
        Ok(Self { tx })
    }

    /// Enqueue one frame. Drops the entry when the writer is saturated.
    pub fn record(&self, direction: Direction, frame_kind: &'static str, payload: impl Into<String>) {
        let entry = RecordEntry {
            direction,
            frame_kind,
            payload: payload.into(),
            timestamp_iso: Utc::now().to_rfc3339(),
        };
        if self.tx.try_send(entry).is_err() {
            debug!("Recorder backlogged, entry dropped");
        }
    }
}

async fn run_writer(
    mut writer: BufWriter<tokio::fs::File>,
    mut rx: mpsc::Receiver<RecordEntry>,
) {
    let mut ticker = interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut unflushed = 0usize;

    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => {
                    match serde_json::to_vec(&entry) {
                        Ok(mut line) => {
                            line.push(b'\n');
                            if let Err(e) = writer.write_all(&line).await {
                                warn!(error = %e, "Recorder write failed");
                            } else {
                                unflushed += 1;
                            }
                        }
                        Err(e) => warn!(error = %e, "Recorder entry serialization failed"),
                    }
                    if unflushed >= FLUSH_THRESHOLD {
                        flush(&mut writer).await;
                        unflushed = 0;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if unflushed > 0 {
                    flush(&mut writer).await;
                    unflushed = 0;
                }
            }
        }
    }

    flush(&mut writer).await;
}

async fn flush(writer: &mut BufWriter<tokio::fs::File>) {
    if let Err(e) = writer.flush().await {
        warn!(error = %e, "Recorder flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn temp_log() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ketch-recorder-{}.jsonl", uuid::Uuid::new_v4()))
    }

    async fn read_lines(path: &Path) -> Vec<Value> {
        // The writer flushes on handle drop; poll briefly for the file
        for _ in 0..50 {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if !content.is_empty() {
                    return content
                        .lines()
                        .map(|l| serde_json::from_str(l).unwrap())
                        .collect();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_entries_written_as_json_lines() {
        let path = temp_log();
        let recorder = Recorder::create(&path).await.unwrap();

        recorder.record(Direction::In, "text", r#"{"result":"ok"}"#);
        recorder.record(Direction::Out, "text", r#"{"method":"public/test"}"#);
        drop(recorder);

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["direction"], "in");
        assert_eq!(lines[0]["frame_kind"], "text");
        assert_eq!(lines[0]["payload"], r#"{"result":"ok"}"#);
        assert!(lines[0]["timestamp_iso"].as_str().unwrap().contains('T'));
        assert_eq!(lines[1]["direction"], "out");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_final_flush_on_drop() {
        let path = temp_log();
        let recorder = Recorder::create(&path).await.unwrap();
        for i in 0..10 {
            recorder.record(Direction::In, "text", format!("{{\"n\":{i}}}"));
        }
        drop(recorder);

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 10);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_create_fails_on_bad_path() {
        let path = std::path::Path::new("/nonexistent-dir/deeper/session.jsonl");
        assert!(Recorder::create(path).await.is_err());
    }
}
