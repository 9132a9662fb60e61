//! Periodic append of the newest window sample to the durable store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::{PersistedRecord, SampleStore, StoreError, StoreOpener};
use crate::window::WindowReader;
use crate::worker::sleep_while_alive;
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceStats {
    pub appended: u64,
    pub failed: u64,
}

/// Owns the store connection for one run of the pipeline.
///
/// The connection is closed when the worker is dropped.
pub struct PersistenceWorker {
    opener: Arc<dyn StoreOpener>,
    store: Option<Box<dyn SampleStore>>,
    window: WindowReader,
    interval: Duration,
    stats: PersistenceStats,
}

impl PersistenceWorker {
    pub fn new(opener: Arc<dyn StoreOpener>, window: WindowReader, interval: Duration) -> Self {
        Self {
            opener,
            store: None,
            window,
            interval,
            stats: PersistenceStats::default(),
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        self.stats
    }

    fn open_store(&self) -> std::result::Result<Box<dyn SampleStore>, StoreError> {
        let store = self.opener.open()?;
        info!("opened store {}", self.opener.describe());
        Ok(store)
    }

    /// Open the store now unless it is open already.
    pub fn ensure_open(&mut self) -> Result<()> {
        if self.store.is_none() {
            self.store = Some(self.open_store()?);
        }
        Ok(())
    }

    /// Append the newest window sample as one row.
    ///
    /// If the store is not open, opening it is attempted first.
    pub fn tick(&mut self) -> Result<PersistedRecord> {
        let record = PersistedRecord::from(self.window.newest());
        let result = self.append(&record);
        match &result {
            Ok(()) => self.stats.appended += 1,
            Err(_) => self.stats.failed += 1,
        }
        result.map(|()| record)
    }

    fn append(&mut self, record: &PersistedRecord) -> Result<()> {
        let mut store = match self.store.take() {
            Some(store) => store,
            None => self.open_store()?,
        };
        let result = store.append(record);
        self.store = Some(store);
        result.map_err(Error::StorageWriteFailure)
    }

    /// Close the store connection if it is open.
    pub fn close(&mut self) {
        if let Some(store) = self.store.take() {
            match store.close() {
                Ok(()) => debug!("closed store {}", self.opener.describe()),
                Err(e) => warn!("error closing store {}: {e}", self.opener.describe()),
            }
        }
    }

    /// Tick once per interval until `flag` is stopped.
    pub fn run(mut self, flag: &thread_control::Flag) -> PersistenceStats {
        if let Err(e) = self.ensure_open() {
            warn!("{e}. Retrying on next tick.");
        }
        while sleep_while_alive(flag, self.interval) {
            match self.tick() {
                Ok(record) => debug!("persisted {record:?}"),
                Err(e) => warn!("{e}"),
            }
        }
        self.close();
        info!(
            "persistence done: {} rows appended, {} failed",
            self.stats.appended, self.stats.failed
        );
        self.stats
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::window::{MetricSample, MetricWindow};

    #[derive(Default)]
    struct Shared {
        rows: Vec<PersistedRecord>,
        appends: usize,
        opens: usize,
        closes: usize,
    }

    /// An in-memory store whose n-th append (counting from 1) fails if n is
    /// listed in `fail_appends`, and whose first `fail_opens` opens fail.
    struct FlakyOpener {
        shared: Arc<Mutex<Shared>>,
        fail_appends: Vec<usize>,
        fail_opens: usize,
    }

    struct FlakyStore {
        shared: Arc<Mutex<Shared>>,
        fail_appends: Vec<usize>,
    }

    impl StoreOpener for FlakyOpener {
        fn describe(&self) -> String {
            "flaky".to_string()
        }
        fn open(&self) -> std::result::Result<Box<dyn SampleStore>, StoreError> {
            let mut shared = self.shared.lock();
            shared.opens += 1;
            if shared.opens <= self.fail_opens {
                return Err(StoreError::Backend("disk not mounted".to_string()));
            }
            Ok(Box::new(FlakyStore {
                shared: self.shared.clone(),
                fail_appends: self.fail_appends.clone(),
            }))
        }
    }

    impl SampleStore for FlakyStore {
        fn append(&mut self, record: &PersistedRecord) -> std::result::Result<(), StoreError> {
            let mut shared = self.shared.lock();
            shared.appends += 1;
            if self.fail_appends.contains(&shared.appends) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            shared.rows.push(*record);
            Ok(())
        }
        fn close(self: Box<Self>) -> std::result::Result<(), StoreError> {
            self.shared.lock().closes += 1;
            Ok(())
        }
    }

    fn sample(timestamp: i64, value: u64) -> MetricSample {
        MetricSample { timestamp, value }
    }

    #[test]
    fn failed_write_is_skipped_and_next_tick_proceeds() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let opener = Arc::new(FlakyOpener {
            shared: shared.clone(),
            fail_appends: vec![3],
            fail_opens: 0,
        });
        let window = MetricWindow::new(NonZeroUsize::new(10).unwrap(), 0);
        let mut writer = window.claim_writer().unwrap();
        let mut worker = PersistenceWorker::new(opener, window.reader(), Duration::from_secs(1));
        for tick in 1..=4 {
            writer.push(sample(tick, tick as u64 * 10));
            let result = worker.tick();
            if tick == 3 {
                match result {
                    Err(e @ Error::StorageWriteFailure(_)) => {
                        assert_eq!(e.to_string(), "storage write failure: disk full")
                    }
                    other => panic!("unexpected {other:?}"),
                }
            } else {
                assert_eq!(result.unwrap().timestamp, tick);
            }
        }
        assert_eq!(
            shared.lock().rows,
            vec![
                PersistedRecord {
                    timestamp: 1,
                    blink_count: 10
                },
                PersistedRecord {
                    timestamp: 2,
                    blink_count: 20
                },
                PersistedRecord {
                    timestamp: 4,
                    blink_count: 40
                },
            ]
        );
        assert_eq!(
            worker.stats(),
            PersistenceStats {
                appended: 3,
                failed: 1
            }
        );
        drop(worker);
        assert_eq!(shared.lock().closes, 1);
    }

    #[test]
    fn open_is_retried_on_next_tick() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let opener = Arc::new(FlakyOpener {
            shared: shared.clone(),
            fail_appends: vec![],
            fail_opens: 2,
        });
        let window = MetricWindow::new(NonZeroUsize::new(10).unwrap(), 0);
        let mut worker = PersistenceWorker::new(opener, window.reader(), Duration::from_secs(1));
        assert!(worker.ensure_open().is_err());
        assert!(worker.tick().is_err());
        assert!(worker.tick().is_ok());
        assert!(worker.tick().is_ok());
        let shared = shared.lock();
        assert_eq!(shared.opens, 3);
        assert_eq!(shared.rows.len(), 2);
    }

    #[test]
    fn run_persists_newest_sample_and_closes() {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let opener = Arc::new(FlakyOpener {
            shared: shared.clone(),
            fail_appends: vec![],
            fail_opens: 0,
        });
        let window = MetricWindow::new(NonZeroUsize::new(10).unwrap(), 0);
        let mut writer = window.claim_writer().unwrap();
        writer.push(sample(5, 9));
        let worker = PersistenceWorker::new(opener, window.reader(), Duration::from_millis(10));
        let (flag, control) = thread_control::make_pair();
        let join = std::thread::spawn(move || worker.run(&flag));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while shared.lock().rows.len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        control.stop();
        let stats = join.join().unwrap();
        let shared = shared.lock();
        assert!(stats.appended >= 2);
        assert_eq!(shared.closes, 1);
        assert!(shared.rows.iter().all(|r| r.timestamp == 5 && r.blink_count == 9));
    }
}
