//! Newline-delimited JSON replay for backtests
//!
//! Each non-empty line is one PumpPortal-shaped record. Records take the same
//! validation path as the live feed; timestamps come from the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::stream::event::RawFeedRecord;
use crate::stream::pumpportal::FeedSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: u64,
    pub delivered: u64,
    pub malformed: u64,
}

pub struct ReplaySource {
    path: PathBuf,
}

impl ReplaySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Push every record into `sink`, stopping early if cancelled
    pub async fn run(
        &self,
        sink: Arc<dyn FeedSink>,
        cancel: CancellationToken,
    ) -> Result<ReplayStats> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| Error::Io(format!("open {}: {}", self.path.display(), e)))?;
        let mut lines = BufReader::new(file).lines();
        let mut stats = ReplayStats::default();

        info!(path = %self.path.display(), "Replaying feed");
        while let Some(line) = lines.next_line().await? {
            if cancel.is_cancelled() {
                debug!("Replay cancelled");
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            stats.lines += 1;
            match serde_json::from_str::<RawFeedRecord>(line) {
                Ok(record) => {
                    sink.deliver(record).await?;
                    stats.delivered += 1;
                }
                Err(e) => {
                    stats.malformed += 1;
                    sink.malformed(&format!("line {}: {}", stats.lines, e));
                }
            }
        }

        info!(
            lines = stats.lines,
            delivered = stats.delivered,
            malformed = stats.malformed,
            "Replay finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        records: Mutex<Vec<RawFeedRecord>>,
        malformed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FeedSink for Collect {
        async fn deliver(&self, record: RawFeedRecord) -> Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        fn malformed(&self, detail: &str) {
            self.malformed.lock().unwrap().push(detail.to_string());
        }
    }

    #[tokio::test]
    async fn test_replay_reads_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.ndjson");
        std::fs::write(
            &path,
            concat!(
                r#"{"txType":"create","mint":"a","timestamp":1}"#,
                "\n\n",
                "not json\n",
                r#"{"txType":"buy","mint":"a","timestamp":2}"#,
                "\n"
            ),
        )
        .unwrap();

        let sink = Arc::new(Collect::default());
        let stats = ReplaySource::new(&path)
            .run(sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            ReplayStats {
                lines: 3,
                delivered: 2,
                malformed: 1
            }
        );
        let records = sink.records.lock().unwrap();
        assert_eq!(records[1].timestamp, Some(2));
        assert!(sink.malformed.lock().unwrap()[0].starts_with("line 2"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let sink = Arc::new(Collect::default());
        let result = ReplaySource::new("/nonexistent/feed.ndjson")
            .run(sink, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
