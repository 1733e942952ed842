//! Source and destination capabilities used by the engines.
//!
//! Every connection is scoped to one execution: the engine opens it before
//! the first read or write and closes it on every exit path, including
//! stop and failure.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::transform::Record;
use crate::healing::delay_for;
use crate::{Error, Result};

/// Batch extraction side.
#[async_trait]
pub trait Source: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn extract(&self) -> Result<Vec<Record>>;

    async fn close(&self) -> Result<()>;
}

/// Batch load side.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn open(&self) -> Result<()>;

    /// Write `records`, returning how many were accepted.
    async fn load(&self, records: &[Record]) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

/// A record read from one partition of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub partition: u32,
    pub offset: u64,
    pub record: Record,
}

/// Partitioned, ordered stream input.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(&self) -> Result<()>;

    fn partitions(&self) -> Vec<u32>;

    /// Up to `max` events of `partition` in offset order, starting after the
    /// last committed offset. Uncommitted events are returned again by the
    /// next poll. `None` once the partition has ended and everything was
    /// committed; an empty vec when nothing is available yet.
    async fn poll(&self, partition: u32, max: usize) -> Result<Option<Vec<StreamEvent>>>;

    /// Mark every event up to and including `offset` as processed.
    async fn commit(&self, partition: u32, offset: u64) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Stream output. `produce` reports how long the destination took to
/// acknowledge, which drives backpressure.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn produce(&self, partition: u32, record: &Record) -> Result<Duration>;

    /// Current acknowledgement latency, sampled while consumption is paused.
    async fn probe(&self) -> Result<Duration>;

    async fn close(&self) -> Result<()>;
}

/// Run an I/O call, retrying `TransportFailure` up to `attempts` times in
/// total with exponential backoff from `base`.
///
/// Anything else, and the last transport failure, is returned as is.
pub async fn with_transport_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::TransportFailure(msg)) if attempt < attempts => {
                let delay = delay_for(attempt, base, base.saturating_mul(32));
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %msg, "transport failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn poisoned(what: &str) -> Error {
    Error::StructuralFailure(format!("{what} lock poisoned"))
}

/// Fixed set of records, for tests and embedded use.
#[derive(Default)]
pub struct MemorySource {
    records: Vec<Record>,
    open: AtomicBool,
    closed: AtomicBool,
    failures: Mutex<VecDeque<Error>>,
}

impl MemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Queue `error` for an upcoming `extract`. Each queued error fails one
    /// call, in order.
    pub fn fail_next(&self, error: Error) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(error);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn extract(&self) -> Result<Vec<Record>> {
        if let Some(e) = self.failures.lock().map_err(|_| poisoned("source"))?.pop_front() {
            return Err(e);
        }
        Ok(self.records.clone())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects loaded records in memory.
#[derive(Default)]
pub struct MemoryDestination {
    loaded: Mutex<Vec<Record>>,
    rejected: Mutex<Vec<Record>>,
    closed: AtomicBool,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded(&self) -> Vec<Record> {
        self.loaded.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Refuse every load containing `record`. A refused load writes nothing.
    pub fn reject(&self, record: Record) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.push(record);
        }
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self, records: &[Record]) -> Result<u64> {
        let refused = {
            let rejected = self.rejected.lock().map_err(|_| poisoned("destination"))?;
            records.iter().find(|r| rejected.contains(r)).cloned()
        };
        if let Some(record) = refused {
            return Err(Error::RecordRejected {
                reason: "constraint violation".into(),
                record,
            });
        }
        let mut loaded = self.loaded.lock().map_err(|_| poisoned("destination"))?;
        loaded.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Partition {
    events: Vec<StreamEvent>,
    next_offset: u64,
    committed: Option<u64>,
    ended: bool,
}

/// Partitioned in-memory stream. A partition ends once `close_partition`
/// was called and all its events are committed.
#[derive(Default)]
pub struct MemoryStreamSource {
    partitions: Mutex<BTreeMap<u32, Partition>>,
    connected: AtomicBool,
}

impl MemoryStreamSource {
    pub fn new(partitions: impl IntoIterator<Item = u32>) -> Self {
        let map = partitions
            .into_iter()
            .map(|p| (p, Partition::default()))
            .collect();
        Self {
            partitions: Mutex::new(map),
            connected: AtomicBool::new(false),
        }
    }

    /// Append a record, returning its offset.
    pub fn push(&self, partition: u32, record: Record) -> Result<u64> {
        let mut partitions = self.partitions.lock().map_err(|_| poisoned("stream source"))?;
        let p = partitions.entry(partition).or_default();
        let offset = p.next_offset;
        p.next_offset += 1;
        p.events.push(StreamEvent {
            partition,
            offset,
            record,
        });
        Ok(offset)
    }

    pub fn close_partition(&self, partition: u32) -> Result<()> {
        let mut partitions = self.partitions.lock().map_err(|_| poisoned("stream source"))?;
        partitions.entry(partition).or_default().ended = true;
        Ok(())
    }

    /// Number of events committed on `partition`.
    pub fn committed_count(&self, partition: u32) -> u64 {
        self.partitions
            .lock()
            .ok()
            .and_then(|p| p.get(&partition).and_then(|p| p.committed))
            .map_or(0, |offset| offset + 1)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn partitions(&self) -> Vec<u32> {
        self.partitions
            .lock()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn poll(&self, partition: u32, max: usize) -> Result<Option<Vec<StreamEvent>>> {
        if !self.is_connected() {
            return Err(Error::StructuralFailure("stream source not connected".into()));
        }
        let mut partitions = self.partitions.lock().map_err(|_| poisoned("stream source"))?;
        let p = partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::StructuralFailure(format!("unknown partition {partition}")))?;
        let committed = p.committed;
        let ready: Vec<StreamEvent> = p
            .events
            .iter()
            .filter(|e| committed.map_or(true, |c| e.offset > c))
            .take(max)
            .cloned()
            .collect();
        if ready.is_empty() && p.ended {
            return Ok(None);
        }
        Ok(Some(ready))
    }

    async fn commit(&self, partition: u32, offset: u64) -> Result<()> {
        let mut partitions = self.partitions.lock().map_err(|_| poisoned("stream source"))?;
        if let Some(p) = partitions.get_mut(&partition) {
            p.committed = Some(p.committed.map_or(offset, |c| c.max(offset)));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory stream sink with scripted acknowledgement latencies.
///
/// Each `produce` and `probe` consumes the next scripted latency; once the
/// script is exhausted the latency is zero.
#[derive(Default)]
pub struct MemoryStreamSink {
    produced: Mutex<BTreeMap<u32, Vec<Record>>>,
    latencies: Mutex<VecDeque<Duration>>,
    rejected: Mutex<Vec<Record>>,
    closed: AtomicBool,
}

impl MemoryStreamSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latencies(latencies: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            latencies: Mutex::new(latencies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Refuse to produce `record`.
    pub fn reject(&self, record: Record) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.push(record);
        }
    }

    pub fn produced(&self, partition: u32) -> Vec<Record> {
        self.produced
            .lock()
            .ok()
            .and_then(|p| p.get(&partition).cloned())
            .unwrap_or_default()
    }

    pub fn total_produced(&self) -> usize {
        self.produced
            .lock()
            .map(|p| p.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_latency(&self) -> Result<Duration> {
        let mut latencies = self.latencies.lock().map_err(|_| poisoned("stream sink"))?;
        Ok(latencies.pop_front().unwrap_or(Duration::ZERO))
    }
}

#[async_trait]
impl StreamSink for MemoryStreamSink {
    async fn produce(&self, partition: u32, record: &Record) -> Result<Duration> {
        if self
            .rejected
            .lock()
            .map_err(|_| poisoned("stream sink"))?
            .contains(record)
        {
            return Err(Error::RecordRejected {
                reason: "constraint violation".into(),
                record: record.clone(),
            });
        }
        self.produced
            .lock()
            .map_err(|_| poisoned("stream sink"))?
            .entry(partition)
            .or_default()
            .push(record.clone());
        self.next_latency()
    }

    async fn probe(&self) -> Result<Duration> {
        self.next_latency()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
