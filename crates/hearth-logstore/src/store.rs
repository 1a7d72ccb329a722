//! Per-stream log stores
//!
//! A log store is one totally ordered, recoverable stream over the
//! shared log device. Records are addressed by store-local sequence
//! numbers; durability is batch-aligned, and device space is only
//! reclaimed through the global safe-truncation protocol.
//!
//! The split between [`LogStore`] (the caller-facing handle, holding
//! the log device reference) and `LogStoreCore` (the completion sink
//! the log device dispatches into by store id) breaks the would-be
//! reference cycle between the two layers.

use crate::logdev::{LogDev, FLAG_DATA, FLAG_ROLLBACK};
use crate::tracker::{SlotStatus, StreamTracker};
use crate::types::{
    Cookie, LogDevKey, LogFoundCb, LogReplayDoneCb, LogWriteCompCb, Lsn, ReadCb, RollbackCb,
    TruncationInfo, INVALID_LSN,
};
use bytes::Bytes;
use hearth_common::{Error, LogStoreId, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Cheap point-in-time summary of one log store
#[derive(Clone, Copy, Debug)]
pub struct LogStoreStatus {
    pub store_id: LogStoreId,
    pub seq_num: Lsn,
    pub truncated_upto: Lsn,
    pub completed_upto: Lsn,
    pub truncation_barriers: usize,
}

struct ReplayBuf {
    records: BTreeMap<Lsn, Bytes>,
    done: bool,
}

/// Completion sink and per-stream state; the log device dispatches into
/// it by store id
pub(crate) struct LogStoreCore {
    id: LogStoreId,
    append_mode: bool,
    start_lsn: Lsn,
    /// Next lsn in append mode; high watermark + 1 otherwise
    seq_num: AtomicI64,
    truncated_upto: AtomicI64,
    tracker: Mutex<StreamTracker>,

    comp_cb: RwLock<Option<LogWriteCompCb>>,
    found_cb: RwLock<Option<LogFoundCb>>,
    replay_done_cb: RwLock<Option<LogReplayDoneCb>>,
    pending_cbs: Mutex<HashMap<Lsn, LogWriteCompCb>>,
    pending_rollbacks: Mutex<HashMap<Lsn, RollbackCb>>,

    /// Highest lsn seen among this store's records in the current flush
    /// batch window
    flush_batch_max_lsn: AtomicI64,
    /// Flush-aligned truncation barriers; only `on_batch_completion`
    /// appends and only `post_device_truncation` trims
    barriers: Mutex<Vec<TruncationInfo>>,

    replay: Mutex<ReplayBuf>,

    sync_mtx: Mutex<()>,
    sync_cv: Condvar,
}

impl LogStoreCore {
    pub(crate) fn new(id: LogStoreId, append_mode: bool, start_lsn: Lsn) -> Arc<Self> {
        Arc::new(Self {
            id,
            append_mode,
            start_lsn,
            seq_num: AtomicI64::new(start_lsn),
            truncated_upto: AtomicI64::new(start_lsn - 1),
            tracker: Mutex::new(StreamTracker::new(start_lsn)),
            comp_cb: RwLock::new(None),
            found_cb: RwLock::new(None),
            replay_done_cb: RwLock::new(None),
            pending_cbs: Mutex::new(HashMap::new()),
            pending_rollbacks: Mutex::new(HashMap::new()),
            flush_batch_max_lsn: AtomicI64::new(INVALID_LSN),
            barriers: Mutex::new(Vec::new()),
            replay: Mutex::new(ReplayBuf {
                records: BTreeMap::new(),
                done: false,
            }),
            sync_mtx: Mutex::new(()),
            sync_cv: Condvar::new(),
        })
    }

    fn notify_waiters(&self) {
        let _guard = self.sync_mtx.lock();
        self.sync_cv.notify_all();
    }

    /// A record of ours became durable; its device key is now known
    pub(crate) fn on_write_completion(&self, seq: Lsn, ld_key: LogDevKey, cookie: Cookie, flags: u8) {
        if flags == FLAG_ROLLBACK {
            if let Some(cb) = self.pending_rollbacks.lock().remove(&seq) {
                cb(seq);
            }
            self.notify_waiters();
            return;
        }

        if let Err(e) = self.tracker.lock().set_completed(seq, ld_key) {
            warn!(store = self.id, lsn = seq, "completion for unexpected slot: {e}");
            return;
        }
        self.flush_batch_max_lsn.fetch_max(seq, Ordering::AcqRel);

        let cb = self
            .pending_cbs
            .lock()
            .remove(&seq)
            .or_else(|| self.comp_cb.read().clone());
        if let Some(cb) = cb {
            cb(seq, ld_key, cookie);
        }
        self.notify_waiters();
    }

    /// The flush batch ending at `flush_key` is on media; record the
    /// truncation barrier. This is the sole admission rule for barriers.
    pub(crate) fn on_batch_completion(&self, flush_key: LogDevKey) {
        let max_lsn = self.flush_batch_max_lsn.load(Ordering::Acquire);
        if max_lsn == INVALID_LSN {
            return;
        }
        self.barriers.lock().push(TruncationInfo {
            lsn: max_lsn,
            key: flush_key,
        });
    }

    /// A record was found during replay. Records are buffered and
    /// surfaced in sequence order once the scan finishes, so a later
    /// rollback marker can discard them before the caller sees them.
    pub(crate) fn on_replay_found(
        &self,
        seq: Lsn,
        ld_key: LogDevKey,
        flush_key: LogDevKey,
        flags: u8,
        buf: Bytes,
    ) {
        if flags == FLAG_ROLLBACK {
            let mut tracker = self.tracker.lock();
            tracker.rollback(seq);
            self.replay.lock().records.retain(|&lsn, _| lsn <= seq);
            self.seq_num.store(seq + 1, Ordering::Release);
            return;
        }

        let mut tracker = self.tracker.lock();
        if let Err(e) = tracker.set_replayed(seq, ld_key) {
            warn!(store = self.id, lsn = seq, "replayed record ignored: {e}");
            return;
        }
        self.seq_num.fetch_max(seq + 1, Ordering::AcqRel);
        self.flush_batch_max_lsn.fetch_max(seq, Ordering::AcqRel);
        drop(tracker);

        self.barriers.lock().push(TruncationInfo {
            lsn: seq,
            key: flush_key,
        });
        self.replay.lock().records.insert(seq, buf);
    }

    /// Surface the buffered replay records in order and signal the end
    /// of replay
    pub(crate) fn finish_replay(&self) {
        let records = {
            let mut replay = self.replay.lock();
            if replay.done {
                return;
            }
            replay.done = true;
            std::mem::take(&mut replay.records)
        };

        if let Some((&first, _)) = records.first_key_value() {
            // Everything below the first surviving record was reclaimed
            // in a previous incarnation
            let floor = first - 1;
            if floor > self.truncated_upto.load(Ordering::Acquire) {
                self.tracker.lock().truncate(floor);
                self.truncated_upto.store(floor, Ordering::Release);
            }
        }

        let found_cb = self.found_cb.read().clone();
        if let Some(cb) = &found_cb {
            for (lsn, buf) in &records {
                cb(*lsn, buf.clone());
            }
        }
        if let Some(cb) = self.replay_done_cb.read().clone() {
            cb();
        }
        info!(store = self.id, records = records.len(), "log replay done");
    }

    /// This store's current safe boundary: the highest barrier at or
    /// below the in-memory truncation floor
    pub(crate) fn pre_device_truncation(&self) -> Option<TruncationInfo> {
        let floor = self.truncated_upto.load(Ordering::Acquire);
        self.barriers
            .lock()
            .iter()
            .filter(|b| b.lsn <= floor)
            .max_by_key(|b| b.key)
            .copied()
    }

    /// The device truncated up to `key`; drop the barriers it consumed
    pub(crate) fn post_device_truncation(&self, key: LogDevKey) {
        self.barriers.lock().retain(|b| b.key > key);
    }
}

/// Caller-facing handle to one log stream
#[derive(Clone)]
pub struct LogStore {
    core: Arc<LogStoreCore>,
    logdev: Arc<LogDev>,
}

impl LogStore {
    pub(crate) fn new(core: Arc<LogStoreCore>, logdev: Arc<LogDev>) -> Self {
        Self { core, logdev }
    }

    /// Store id within the log device
    pub fn store_id(&self) -> LogStoreId {
        self.core.id
    }

    /// Next sequence number (append mode) or high watermark + 1
    pub fn seq_num(&self) -> Lsn {
        self.core.seq_num.load(Ordering::Acquire)
    }

    /// The floor below which every sequence number is truncated;
    /// `-1` for an empty store
    pub fn truncated_upto(&self) -> Lsn {
        self.core.truncated_upto.load(Ordering::Acquire)
    }

    /// Register the default completion callback used when a write
    /// carries none of its own
    pub fn register_req_comp_cb(&self, cb: LogWriteCompCb) {
        *self.core.comp_cb.write() = Some(cb);
    }

    /// Register the callback invoked per replayed record
    pub fn register_log_found_cb(&self, cb: LogFoundCb) {
        *self.core.found_cb.write() = Some(cb);
    }

    /// Register the callback invoked once replay finishes
    pub fn register_log_replay_done_cb(&self, cb: LogReplayDoneCb) {
        *self.core.replay_done_cb.write() = Some(cb);
    }

    /// Queue a write at a caller-chosen sequence number
    pub fn write_async(
        &self,
        seq: Lsn,
        buf: Bytes,
        cookie: Cookie,
        cb: Option<LogWriteCompCb>,
    ) -> Result<()> {
        if self.core.append_mode {
            return Err(Error::invalid_argument(
                "store is in append mode; use append_async",
            ));
        }
        self.submit(seq, buf, cookie, cb)
    }

    fn submit(&self, seq: Lsn, buf: Bytes, cookie: Cookie, cb: Option<LogWriteCompCb>) -> Result<()> {
        if seq < self.core.start_lsn {
            return Err(Error::invalid_argument(format!(
                "lsn {seq} below store start lsn {}",
                self.core.start_lsn
            )));
        }
        self.core.tracker.lock().set_issued(seq)?;
        if let Some(cb) = cb {
            self.core.pending_cbs.lock().insert(seq, cb);
        }
        if !self.core.append_mode {
            self.core.seq_num.fetch_max(seq + 1, Ordering::AcqRel);
        }
        self.logdev
            .append(self.core.id, seq, FLAG_DATA, buf, cookie)?;
        Ok(())
    }

    /// Write at a caller-chosen sequence number and wait for durability
    pub fn write_sync(&self, seq: Lsn, buf: Bytes) -> Result<()> {
        self.write_async(seq, buf, 0, None)?;
        self.wait_completed(seq)
    }

    /// Append at the next sequence number; returns the assigned lsn
    /// synchronously, completion later
    pub fn append_async(&self, buf: Bytes, cookie: Cookie, cb: Option<LogWriteCompCb>) -> Result<Lsn> {
        if !self.core.append_mode {
            return Err(Error::invalid_argument(
                "store is not in append mode; use write_async",
            ));
        }
        let seq = self
            .core
            .seq_num
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v < i64::MAX).then(|| v + 1)
            })
            .map_err(|_| Error::out_of_range("sequence number space exhausted"))?;

        self.core.tracker.lock().set_issued(seq)?;
        if let Some(cb) = cb {
            self.core.pending_cbs.lock().insert(seq, cb);
        }
        self.logdev
            .append(self.core.id, seq, FLAG_DATA, buf, cookie)?;
        Ok(seq)
    }

    /// Append and wait for durability; returns the assigned lsn
    pub fn append_sync(&self, buf: Bytes) -> Result<Lsn> {
        let seq = self.append_async(buf, 0, None)?;
        self.wait_completed(seq)?;
        Ok(seq)
    }

    /// Read the record at `seq`, blocking on the device read
    pub fn read_sync(&self, seq: Lsn) -> Result<Bytes> {
        if seq <= self.truncated_upto() {
            return Err(Error::out_of_range(format!("lsn {seq} already truncated")));
        }
        let ld_key = {
            let tracker = self.core.tracker.lock();
            match tracker.status(seq) {
                Some(SlotStatus::Completed) => tracker.ld_key(seq).unwrap(),
                Some(SlotStatus::GapFilled) => {
                    return Err(Error::out_of_range(format!("lsn {seq} is gap-filled")))
                }
                Some(SlotStatus::Issued) => {
                    return Err(Error::out_of_range(format!("lsn {seq} not yet flushed")))
                }
                _ => return Err(Error::out_of_range(format!("lsn {seq} was never issued"))),
            }
        };
        self.logdev.read(ld_key)
    }

    /// Read the record at `seq` and hand it to `cb`
    pub fn read_async(&self, seq: Lsn, cookie: Cookie, cb: ReadCb) -> Result<()> {
        let buf = self.read_sync(seq)?;
        cb(seq, buf, cookie);
        Ok(())
    }

    /// Mark a never-written sequence number as intentionally skipped so
    /// contiguity queries can advance past it. A skip is always an
    /// application decision.
    pub fn fill_gap(&self, seq: Lsn) -> Result<()> {
        self.core.tracker.lock().fill_gap(seq)?;
        if !self.core.append_mode {
            self.core.seq_num.fetch_max(seq + 1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Advance the in-memory truncation floor to `upto` (inclusive).
    /// With `in_memory_only` unset, a global device-truncation round is
    /// triggered as well.
    pub fn truncate(&self, upto: Lsn, in_memory_only: bool) -> Result<()> {
        if upto <= self.truncated_upto() {
            return Ok(());
        }
        {
            let mut tracker = self.core.tracker.lock();
            let highest = tracker.highest_filled().unwrap_or(tracker.floor());
            if upto > highest {
                return Err(Error::out_of_range(format!(
                    "cannot truncate to {upto}: highest completed lsn is {highest}"
                )));
            }
            tracker.truncate(upto);
            self.core.truncated_upto.store(upto, Ordering::Release);
        }
        if !in_memory_only {
            self.logdev.run_truncation_round()?;
        }
        Ok(())
    }

    /// Logically discard every sequence number above `to_lsn` and emit
    /// a durable rollback marker so replay after a crash does the same.
    /// Returns the number of discarded records.
    ///
    /// The caller must have quiesced writes above `to_lsn`; a rollback
    /// racing an in-flight write above it leaves that write's
    /// completion stale (it is rejected, never resurrected).
    pub fn rollback_async(&self, to_lsn: Lsn, cb: Option<RollbackCb>) -> Result<u64> {
        if to_lsn > self.seq_num() {
            return Err(Error::invalid_argument(format!(
                "cannot roll back to {to_lsn}: beyond seq_num {}",
                self.seq_num()
            )));
        }
        if to_lsn < self.truncated_upto() {
            return Err(Error::out_of_range(format!(
                "cannot roll back to truncated lsn {to_lsn}"
            )));
        }

        let dropped = self.core.tracker.lock().rollback(to_lsn);
        if self.core.append_mode {
            self.core.seq_num.store(to_lsn + 1, Ordering::Release);
        }
        if let Some(cb) = cb {
            self.core.pending_rollbacks.lock().insert(to_lsn, cb);
        }
        self.logdev
            .append(self.core.id, to_lsn, FLAG_ROLLBACK, Bytes::new(), 0)?;
        info!(store = self.store_id(), to_lsn, dropped, "rollback issued");
        Ok(dropped)
    }

    /// Block until every issued sequence number at or below `upto` is
    /// durable. `None` waits for everything issued so far.
    pub fn flush_sync(&self, upto: Option<Lsn>) -> Result<()> {
        let upto = upto.unwrap_or_else(|| self.seq_num() - 1);
        self.wait_until(|| !self.core.tracker.lock().has_issued_below(upto))
    }

    /// Iterate completed records in sequence order, stopping when `cb`
    /// returns `false`. Truncated and gap-filled records are skipped;
    /// concurrent writers see a snapshot of the completed tail.
    pub fn foreach(&self, start: Lsn, mut cb: impl FnMut(Lsn, Bytes) -> bool) -> Result<()> {
        let entries = self.core.tracker.lock().completed_from(start);
        for (lsn, ld_key) in entries {
            let buf = self.logdev.read(ld_key)?;
            if !cb(lsn, buf) {
                break;
            }
        }
        Ok(())
    }

    /// Largest contiguously issued sequence number above `from`
    pub fn get_contiguous_issued_seq_num(&self, from: Lsn) -> Lsn {
        self.core.tracker.lock().contiguous_issued(from)
    }

    /// Largest contiguously completed sequence number above `from`
    pub fn get_contiguous_completed_seq_num(&self, from: Lsn) -> Lsn {
        self.core.tracker.lock().contiguous_completed(from)
    }

    /// Point-in-time summary
    pub fn status(&self) -> LogStoreStatus {
        LogStoreStatus {
            store_id: self.core.id,
            seq_num: self.seq_num(),
            truncated_upto: self.truncated_upto(),
            completed_upto: self.get_contiguous_completed_seq_num(self.truncated_upto()),
            truncation_barriers: self.core.barriers.lock().len(),
        }
    }

    fn wait_completed(&self, seq: Lsn) -> Result<()> {
        self.wait_until(|| {
            matches!(
                self.core.tracker.lock().status(seq),
                Some(SlotStatus::Completed) | None
            )
        })
    }

    fn wait_until(&self, cond: impl Fn() -> bool) -> Result<()> {
        if cond() {
            return Ok(());
        }
        // Force the open batch out rather than waiting a flush interval
        self.logdev.flush()?;
        let mut guard = self.core.sync_mtx.lock();
        while !cond() {
            self.core
                .sync_cv
                .wait_for(&mut guard, Duration::from_millis(20));
        }
        Ok(())
    }
}
