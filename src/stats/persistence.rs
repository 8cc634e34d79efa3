//! Crash-safe snapshots
//!
//! Record layout: 4-byte magic, u32 little-endian payload length, bincode
//! payload, SHA-256 of the payload. Files are written to a temp path and
//! renamed into place, so a reader sees either the old or the new snapshot.
//!
//! Writes go through a dedicated writer task; callers only enqueue.

use backoff::{future::retry, ExponentialBackoff};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use crate::events::{BotEvent, EventBus};
use crate::position::position::Position;
use crate::stats::analytics::AnalyticsSnapshot;
use crate::wallet::WalletState;

pub const MAGIC: [u8; 4] = *b"PFTS";
pub const POSITIONS_FILE: &str = "positions.snapshot";
pub const ANALYTICS_FILE: &str = "analytics.snapshot";

const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 32;

/// Active position and wallet, restored together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsSnapshot {
    pub position: Option<Position>,
    pub wallet: WalletState,
    /// Close time of the last position, for the reopen cooldown
    pub last_closed_at: Option<i64>,
    pub saved_at: i64,
}

pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| {
            Error::Serialization(format!("snapshot payload too large: {} bytes", payload.len()))
        })?;

    let mut record = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    record.extend_from_slice(&MAGIC);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&Sha256::digest(&payload));
    Ok(record)
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(Error::SnapshotCorrupt(format!("record too short: {} bytes", bytes.len())));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::SnapshotCorrupt("bad magic".to_string()));
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if bytes.len() != HEADER_LEN + len + CHECKSUM_LEN {
        return Err(Error::SnapshotCorrupt(format!(
            "length mismatch: header says {} payload bytes, file has {}",
            len,
            bytes.len().saturating_sub(HEADER_LEN + CHECKSUM_LEN)
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let checksum = &bytes[HEADER_LEN + len..];
    if Sha256::digest(payload).as_slice() != checksum {
        return Err(Error::SnapshotCorrupt("checksum mismatch".to_string()));
    }

    bincode::deserialize(payload).map_err(|e| Error::SnapshotCorrupt(e.to_string()))
}

/// Snapshot files in one directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically replace `name` with `bytes`
    pub async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| {
                Error::PersistenceFailure(format!("create {}: {}", self.dir.display(), e))
            })?;

        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &target).await
        };
        write
            .await
            .map_err(|e| Error::PersistenceFailure(format!("write {}: {}", target.display(), e)))
    }

    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_positions(&self, snapshot: &PositionsSnapshot) -> Result<()> {
        self.write_atomic(POSITIONS_FILE, &encode_record(snapshot)?).await
    }

    pub async fn save_analytics(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        self.write_atomic(ANALYTICS_FILE, &encode_record(snapshot)?).await
    }

    /// Missing files are fine; a present but unreadable file is corruption
    pub async fn load_positions(&self) -> Result<Option<PositionsSnapshot>> {
        self.read(POSITIONS_FILE).await?.map(|b| decode_record(&b)).transpose()
    }

    pub async fn load_analytics(&self) -> Result<Option<AnalyticsSnapshot>> {
        self.read(ANALYTICS_FILE).await?.map(|b| decode_record(&b)).transpose()
    }
}

/// One unit of work for the writer
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub positions: PositionsSnapshot,
    pub analytics: AnalyticsSnapshot,
}

enum WriterCommand {
    Write(Box<Snapshot>),
    Flush(oneshot::Sender<()>),
}

/// Enqueue side of the snapshot writer
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl SnapshotHandle {
    /// Queue a snapshot; never waits on disk
    pub fn enqueue(&self, snapshot: Snapshot) {
        if let Err(e) = self.tx.try_send(WriterCommand::Write(Box::new(snapshot))) {
            warn!("Snapshot queue full or closed, skipping: {}", e);
        }
    }

    /// Wait until everything queued so far has been written
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .await
            .map_err(|_| Error::PersistenceFailure("snapshot writer stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::PersistenceFailure("snapshot writer stopped".to_string()))
    }
}

pub struct SnapshotWriter {
    store: SnapshotStore,
    config: PersistenceConfig,
    events: EventBus,
    cancel: CancellationToken,
}

impl SnapshotWriter {
    pub fn new(
        store: SnapshotStore,
        config: PersistenceConfig,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            events,
            cancel,
        }
    }

    /// Start the writer task. It exits once every handle is dropped.
    pub fn spawn(self) -> (SnapshotHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(rx));
        (SnapshotHandle { tx }, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<WriterCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                WriterCommand::Write(mut snapshot) => {
                    // only the newest pending snapshot matters
                    let mut flushes = Vec::new();
                    while let Ok(next) = rx.try_recv() {
                        match next {
                            WriterCommand::Write(newer) => snapshot = newer,
                            WriterCommand::Flush(done) => flushes.push(done),
                        }
                    }
                    if let Err(e) = self.write_with_retry(&snapshot).await {
                        error!("Giving up on snapshot: {}", e);
                        self.events
                            .publish(BotEvent::error(&e, "snapshot writer retries exhausted"));
                        self.cancel.cancel();
                    }
                    for done in flushes {
                        let _ = done.send(());
                    }
                }
                WriterCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Snapshot writer stopped");
    }

    async fn write_with_retry(&self, snapshot: &Snapshot) -> Result<()> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.initial_retry_ms),
            max_interval: Duration::from_millis(
                self.config.initial_retry_ms.saturating_mul(8).max(1),
            ),
            max_elapsed_time: Some(Duration::from_millis(self.config.max_retry_elapsed_ms)),
            ..Default::default()
        };

        retry(policy, || async {
            let result = async {
                self.store.save_positions(&snapshot.positions).await?;
                self.store.save_analytics(&snapshot.analytics).await
            }
            .await;
            match result {
                Ok(()) => Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!("Snapshot write failed, retrying: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await?;

        info!(dir = %self.store.dir().display(), "Snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::types::ExitReason;

    fn sample_positions() -> PositionsSnapshot {
        let mut position = Position::pending("mint", "SYM", 0.44, 1.0e-8, 1_000);
        position.open(1.01e-8, 0.01, 2_000).unwrap();
        position.update_price(1.2e-8, 3_000).unwrap();
        position
            .apply_exit(0.3, 1.2e-8, ExitReason::TakeProfit { tier: 1 }, 3_000, 150.0)
            .unwrap();
        PositionsSnapshot {
            position: Some(position),
            wallet: WalletState {
                balance_sol: 9.7,
                initial_balance_sol: 10.0,
            },
            last_closed_at: None,
            saved_at: 3_000,
        }
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let snapshot = sample_positions();
        let bytes = encode_record(&snapshot).unwrap();
        let decoded: PositionsSnapshot = decode_record(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(encode_record(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut bytes = encode_record(&sample_positions()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(
            decode_record::<PositionsSnapshot>(&bytes),
            Err(Error::SnapshotCorrupt(_))
        ));

        let truncated = &encode_record(&sample_positions()).unwrap()[..20];
        assert!(matches!(
            decode_record::<PositionsSnapshot>(truncated),
            Err(Error::SnapshotCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_store_load_missing_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_positions().await.unwrap().is_none());

        let snapshot = sample_positions();
        store.save_positions(&snapshot).await.unwrap();
        assert_eq!(store.load_positions().await.unwrap(), Some(snapshot));
        assert!(!dir.path().join("positions.snapshot.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ANALYTICS_FILE), b"garbage").unwrap();
        let err = SnapshotStore::new(dir.path()).load_analytics().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_writer_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let writer = SnapshotWriter::new(
            store.clone(),
            PersistenceConfig::default(),
            EventBus::new(8),
            CancellationToken::new(),
        );
        let (handle, task) = writer.spawn();

        let positions = sample_positions();
        handle.enqueue(Snapshot {
            positions: positions.clone(),
            analytics: AnalyticsSnapshot::default(),
        });
        handle.flush().await.unwrap();

        assert_eq!(store.load_positions().await.unwrap(), Some(positions));
        assert_eq!(store.load_analytics().await.unwrap(), Some(AnalyticsSnapshot::default()));

        drop(handle);
        task.await.unwrap();
    }
}
