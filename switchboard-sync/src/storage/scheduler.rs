//! Throttled, coalescing persistence writes.
//!
//! Each replicant gets a writer task. The first change after a quiet period
//! is written at once; changes that arrive within the next
//! `persistence_interval_ms` collapse into a single trailing write of the
//! latest value. A writer never has more than one write in flight, and the
//! blocking adapter call runs on tokio's blocking pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use switchboard_core::ReplicantKey;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{PersistedRecord, PersistenceAdapter, StoreError};

#[derive(Default)]
struct Counters {
    persisted: AtomicU64,
    failed: AtomicU64,
}

struct Writer {
    key: ReplicantKey,
    latest: Mutex<Option<PersistedRecord>>,
    interval_ms: AtomicU64,
    wake: Notify,
    /// Held for the duration of a write
    in_flight: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    fn new(key: ReplicantKey) -> Self {
        Self {
            key,
            latest: Mutex::new(None),
            interval_ms: AtomicU64::new(0),
            wake: Notify::new(),
            in_flight: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    fn take(&self) -> Option<PersistedRecord> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Put a failed record back unless a newer one arrived meanwhile.
    fn restore(&self, record: PersistedRecord) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if latest.is_none() {
            *latest = Some(record);
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }
}

pub struct PersistenceScheduler {
    adapter: Arc<dyn PersistenceAdapter>,
    writers: Mutex<HashMap<ReplicantKey, Arc<Writer>>>,
    counters: Arc<Counters>,
}

impl PersistenceScheduler {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            adapter,
            writers: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.adapter
    }

    /// Record the latest state of a replicant and make sure it gets written.
    pub fn schedule(&self, record: PersistedRecord, interval: Duration) {
        let writer = {
            let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
            writers
                .entry(record.key.clone())
                .or_insert_with(|| Arc::new(Writer::new(record.key.clone())))
                .clone()
        };
        writer
            .interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        *writer.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime: write synchronously, unthrottled.
            if let Some(record) = writer.take() {
                self.write_blocking(&writer, record);
            }
            return;
        };
        {
            let mut task = writer.task.lock().unwrap_or_else(PoisonError::into_inner);
            if task.is_none() {
                *task = Some(runtime.spawn(run_writer(
                    writer.clone(),
                    self.adapter.clone(),
                    self.counters.clone(),
                )));
            }
        }
        writer.wake.notify_one();
    }

    fn write_blocking(&self, writer: &Writer, record: PersistedRecord) {
        match self.adapter.save(&record) {
            Ok(()) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist {}: {e}", writer.key);
                writer.restore(record);
            }
        }
    }

    /// Write every pending value now, bypassing the throttle, after any
    /// write already in flight. Every writer is attempted; the first error
    /// is returned.
    pub async fn flush_all(&self) -> Result<usize, StoreError> {
        let writers: Vec<Arc<Writer>> = self
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut written = 0;
        let mut first_error = None;
        for writer in writers {
            let _guard = writer.in_flight.lock().await;
            let Some(record) = writer.take() else {
                continue;
            };
            match save(&self.adapter, &writer, record, &self.counters).await {
                Ok(()) => written += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Number of replicants with a change not yet written.
    pub fn pending(&self) -> usize {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.latest.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    pub fn persisted_writes(&self) -> u64 {
        self.counters.persisted.load(Ordering::Relaxed)
    }

    pub fn failed_writes(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

impl Drop for PersistenceScheduler {
    fn drop(&mut self) {
        let writers = self.writers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for writer in writers.values() {
            if let Some(task) = writer.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }
}

async fn run_writer(writer: Arc<Writer>, adapter: Arc<dyn PersistenceAdapter>, counters: Arc<Counters>) {
    loop {
        writer.wake.notified().await;
        // Leading write, then one trailing write per interval while changes
        // keep arriving.
        loop {
            let wrote = {
                let _guard = writer.in_flight.lock().await;
                match writer.take() {
                    Some(record) => {
                        let _ = save(&adapter, &writer, record, &counters).await;
                        true
                    }
                    None => false,
                }
            };
            if !wrote {
                break;
            }
            tokio::time::sleep(writer.interval()).await;
        }
    }
}

async fn save(
    adapter: &Arc<dyn PersistenceAdapter>,
    writer: &Writer,
    record: PersistedRecord,
    counters: &Counters,
) -> Result<(), StoreError> {
    let adapter = adapter.clone();
    let result = tokio::task::spawn_blocking(move || {
        let result = adapter.save(&record);
        (record, result)
    })
    .await;

    match result {
        Ok((_, Ok(()))) => {
            counters.persisted.fetch_add(1, Ordering::Relaxed);
            log::trace!("Persisted {}", writer.key);
            Ok(())
        }
        Ok((record, Err(e))) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to persist {}: {e}", writer.key);
            writer.restore(record);
            Err(e)
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("Persistence task for {} failed: {e}", writer.key);
            Err(StoreError::Io(e.to_string()))
        }
    }
}
