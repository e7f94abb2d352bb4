use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use snafu::ResultExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::error::{
    DeserializeSnapshotSnafu, PersistenceExhaustedSnafu, SerializeSnapshotSnafu, StorageResult,
};
use super::snapshot::{SNAPSHOT_KEY, Snapshot, SnapshotStore};

pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(16);

/// Receives save requests from stores on every mutation.
pub trait SaveTrigger: Send + Sync {
    fn request_save(&self);
}

/// Trigger that drops every request, for stores without durable backing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSaveTrigger;

impl SaveTrigger for NoopSaveTrigger {
    fn request_save(&self) {}
}

/// Produces the state image written by the bridge.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

/// Called when both snapshot channels failed for one write.
pub trait PersistenceFailureSink: Send + Sync {
    fn persistence_failed(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveChannel {
    Primary,
    Fallback,
}

/// Debounced write-back of the chat state.
///
/// Every `request_save` restarts a short trailing-edge timer; when it elapses the
/// writer task takes one snapshot and writes it once, so bursts of mutations turn
/// into a single durable write. Callers never wait on the write.
pub struct PersistenceBridge {
    primary: Arc<dyn SnapshotStore>,
    fallback: Arc<dyn SnapshotStore>,
    failure_sink: Option<Arc<dyn PersistenceFailureSink>>,
    debounce: Duration,
    dirty: AtomicBool,
    trigger: Notify,
    writes: AtomicU64,
}

impl PersistenceBridge {
    pub fn new(primary: Arc<dyn SnapshotStore>, fallback: Arc<dyn SnapshotStore>) -> Self {
        Self {
            primary,
            fallback,
            failure_sink: None,
            debounce: DEFAULT_SAVE_DEBOUNCE,
            dirty: AtomicBool::new(false),
            trigger: Notify::new(),
            writes: AtomicU64::new(0),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn PersistenceFailureSink>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    /// Number of completed writes, on either channel.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Starts the writer task. It stops once the source has been dropped.
    pub fn spawn_writer<S>(self: &Arc<Self>, source: Weak<S>) -> JoinHandle<()>
    where
        S: SnapshotSource + 'static,
    {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                bridge.trigger.notified().await;

                // Trailing edge: every further request inside the window restarts it.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(bridge.debounce) => break,
                        _ = bridge.trigger.notified() => continue,
                    }
                }

                if !bridge.dirty.swap(false, Ordering::AcqRel) {
                    continue;
                }

                let Some(source) = source.upgrade() else {
                    tracing::debug!("snapshot source dropped, stopping persistence writer");
                    break;
                };
                let snapshot = source.snapshot();
                drop(source);

                let writer = Arc::clone(&bridge);
                match tokio::task::spawn_blocking(move || writer.write(&snapshot)).await {
                    Ok(Ok(channel)) => {
                        tracing::debug!(?channel, "persisted chat snapshot");
                    }
                    Ok(Err(error)) => {
                        tracing::error!("debounced snapshot write failed: {error}");
                    }
                    Err(error) => {
                        tracing::error!("snapshot writer task failed: {error}");
                    }
                }
            }
        })
    }

    /// Writes `snapshot` right away, bypassing the debounce. Used before teardown.
    pub fn flush(&self, source: &dyn SnapshotSource) -> StorageResult<SaveChannel> {
        self.dirty.store(false, Ordering::Release);
        self.write(&source.snapshot())
    }

    /// Serializes and writes one snapshot: primary channel first, then one retry
    /// through the fallback channel. When both fail the failure sink is told.
    pub fn write(&self, snapshot: &Snapshot) -> StorageResult<SaveChannel> {
        let payload = serde_json::to_string(snapshot).context(SerializeSnapshotSnafu {
            stage: "bridge-serialize-snapshot",
        })?;

        let primary_error = match self.primary.save(SNAPSHOT_KEY, &payload) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::AcqRel);
                return Ok(SaveChannel::Primary);
            }
            Err(error) => error,
        };

        tracing::warn!(
            channel = self.primary.channel(),
            "primary snapshot write failed, retrying through fallback: {primary_error}"
        );

        match self.fallback.save(SNAPSHOT_KEY, &payload) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::AcqRel);
                Ok(SaveChannel::Fallback)
            }
            Err(fallback_error) => {
                let error = PersistenceExhaustedSnafu {
                    stage: "bridge-write-snapshot",
                    primary: primary_error.to_string(),
                    fallback: fallback_error.to_string(),
                }
                .build();
                tracing::error!("chat state could not be saved: {error}");
                if let Some(sink) = &self.failure_sink {
                    sink.persistence_failed(&error.to_string());
                }
                Err(error)
            }
        }
    }

    /// Loads the newest readable snapshot, preferring the primary channel.
    pub fn load(&self) -> StorageResult<Option<Snapshot>> {
        let payload = match self.primary.load(SNAPSHOT_KEY) {
            Ok(Some(payload)) => Some((payload, self.primary.channel())),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    channel = self.primary.channel(),
                    "primary snapshot read failed, trying fallback: {error}"
                );
                None
            }
        };

        let payload = match payload {
            Some(found) => Some(found),
            None => self
                .fallback
                .load(SNAPSHOT_KEY)?
                .map(|payload| (payload, self.fallback.channel())),
        };

        let Some((payload, channel)) = payload else {
            return Ok(None);
        };

        let snapshot = serde_json::from_str(&payload).context(DeserializeSnapshotSnafu {
            stage: "bridge-load-snapshot",
            channel,
        })?;
        Ok(Some(snapshot))
    }
}

impl SaveTrigger for PersistenceBridge {
    fn request_save(&self) {
        self.dirty.store(true, Ordering::Release);
        self.trigger.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::StorageError;
    use crate::snapshot::MemorySnapshotStore;

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn channel(&self) -> &'static str {
            "failing"
        }

        fn save(&self, _key: &str, _payload: &str) -> StorageResult<()> {
            Err(StorageError::WriteFile {
                stage: "test-failing-save",
                path: "/dev/full".to_string(),
                source: std::io::Error::other("disk full"),
            })
        }

        fn load(&self, _key: &str) -> StorageResult<Option<String>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct CountingSource {
        snapshots: AtomicUsize,
    }

    impl SnapshotSource for CountingSource {
        fn snapshot(&self) -> Snapshot {
            self.snapshots.fetch_add(1, Ordering::AcqRel);
            Snapshot::empty()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl PersistenceFailureSink for RecordingSink {
        fn persistence_failed(&self, message: &str) {
            self.messages.lock().push(message.to_string());
        }
    }

    #[test]
    fn write_falls_back_once_when_primary_fails() {
        let fallback = Arc::new(MemorySnapshotStore::new());
        let bridge = PersistenceBridge::new(Arc::new(FailingStore), fallback.clone());

        let channel = bridge.write(&Snapshot::empty()).expect("fallback write");
        assert_eq!(channel, SaveChannel::Fallback);
        assert!(fallback.load(SNAPSHOT_KEY).expect("load").is_some());
        assert_eq!(bridge.load().expect("load").expect("snapshot"), Snapshot::empty());
    }

    #[test]
    fn double_failure_reaches_the_failure_sink() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = PersistenceBridge::new(Arc::new(FailingStore), Arc::new(FailingStore))
            .with_failure_sink(sink.clone());

        let error = bridge.write(&Snapshot::empty()).expect_err("both fail");
        assert!(matches!(error, StorageError::PersistenceExhausted { .. }));
        assert_eq!(sink.messages.lock().len(), 1);
        assert_eq!(bridge.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_of_requests_coalesce_into_one_write() {
        let primary = Arc::new(MemorySnapshotStore::new());
        let bridge = Arc::new(PersistenceBridge::new(
            primary.clone(),
            Arc::new(MemorySnapshotStore::new()),
        ));
        let source = Arc::new(CountingSource::default());
        let writer = bridge.spawn_writer(Arc::downgrade(&source));

        for _ in 0..10 {
            bridge.request_save();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(source.snapshots.load(Ordering::Acquire), 1);
        assert_eq!(bridge.write_count(), 1);
        assert!(primary.load(SNAPSHOT_KEY).expect("load").is_some());

        bridge.request_save();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bridge.write_count(), 2);

        writer.abort();
    }

    #[test]
    fn flush_writes_synchronously_and_clears_dirty_flag() {
        let bridge = PersistenceBridge::new(
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(MemorySnapshotStore::new()),
        );
        bridge.request_save();
        assert!(bridge.is_dirty());

        let source = CountingSource::default();
        assert_eq!(bridge.flush(&source).expect("flush"), SaveChannel::Primary);
        assert!(!bridge.is_dirty());
        assert_eq!(bridge.write_count(), 1);
    }
}
