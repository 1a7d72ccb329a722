//! Dense per-stream record tracker
//!
//! Tracks one slot per sequence number from the truncation floor
//! upward. Slot statuses move monotonically: Empty -> Issued ->
//! Completed, or Empty -> GapFilled. Anything at or below the floor is
//! truncated and no longer tracked.

use crate::types::{LogDevKey, Lsn};
use hearth_common::{Error, Result};
use std::collections::VecDeque;

/// Status of one tracked sequence number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    /// Nothing written at this sequence number yet
    Empty,
    /// Submitted to the log device, not yet durable
    Issued,
    /// Durable; the device key is known
    Completed,
    /// Skipped by the application via `fill_gap`
    GapFilled,
}

#[derive(Clone, Copy)]
struct Slot {
    status: SlotStatus,
    ld_key: LogDevKey,
}

impl Slot {
    const EMPTY: Slot = Slot {
        status: SlotStatus::Empty,
        ld_key: LogDevKey::INVALID,
    };

    fn is_filled(&self) -> bool {
        matches!(self.status, SlotStatus::Completed | SlotStatus::GapFilled)
    }
}

/// Dense tracker of record slots for contiguous sequence numbers
/// starting just above the truncation floor
pub struct StreamTracker {
    /// Sequence number of `slots[0]`; the floor is `start - 1`
    start: Lsn,
    slots: VecDeque<Slot>,
}

impl StreamTracker {
    /// Create a tracker whose first tracked sequence number is `start`
    pub fn new(start: Lsn) -> Self {
        Self {
            start,
            slots: VecDeque::new(),
        }
    }

    /// Truncation floor: every lsn at or below it is truncated
    pub fn floor(&self) -> Lsn {
        self.start - 1
    }

    fn index(&self, lsn: Lsn) -> Option<usize> {
        if lsn < self.start {
            return None;
        }
        Some((lsn - self.start) as usize)
    }

    fn ensure(&mut self, lsn: Lsn) -> usize {
        let idx = (lsn - self.start) as usize;
        while self.slots.len() <= idx {
            self.slots.push_back(Slot::EMPTY);
        }
        idx
    }

    /// Status of a sequence number; `None` means truncated
    pub fn status(&self, lsn: Lsn) -> Option<SlotStatus> {
        let idx = self.index(lsn)?;
        Some(self.slots.get(idx).map_or(SlotStatus::Empty, |s| s.status))
    }

    /// Device key of a completed sequence number
    pub fn ld_key(&self, lsn: Lsn) -> Option<LogDevKey> {
        let idx = self.index(lsn)?;
        self.slots
            .get(idx)
            .filter(|s| s.status == SlotStatus::Completed)
            .map(|s| s.ld_key)
    }

    /// Mark a sequence number as issued to the log device
    pub fn set_issued(&mut self, lsn: Lsn) -> Result<()> {
        if lsn < self.start {
            return Err(Error::out_of_range(format!("lsn {lsn} already truncated")));
        }
        let idx = self.ensure(lsn);
        let slot = &mut self.slots[idx];
        if slot.status != SlotStatus::Empty {
            return Err(Error::invalid_argument(format!(
                "lsn {lsn} already {:?}",
                slot.status
            )));
        }
        slot.status = SlotStatus::Issued;
        Ok(())
    }

    /// Mark an issued sequence number durable with its device key.
    /// A completion for any other status is stale (e.g. a record that
    /// was rolled back while in flight) and is rejected.
    pub fn set_completed(&mut self, lsn: Lsn, ld_key: LogDevKey) -> Result<()> {
        if lsn < self.start {
            return Err(Error::out_of_range(format!("lsn {lsn} already truncated")));
        }
        let idx = self.ensure(lsn);
        let slot = &mut self.slots[idx];
        if slot.status != SlotStatus::Issued {
            return Err(Error::invalid_argument(format!(
                "completion for lsn {lsn} in state {:?}",
                slot.status
            )));
        }
        slot.status = SlotStatus::Completed;
        slot.ld_key = ld_key;
        Ok(())
    }

    /// Record a replayed sequence number: the slot transitions straight
    /// from Empty to Completed.
    pub fn set_replayed(&mut self, lsn: Lsn, ld_key: LogDevKey) -> Result<()> {
        if lsn < self.start {
            return Err(Error::out_of_range(format!("lsn {lsn} already truncated")));
        }
        let idx = self.ensure(lsn);
        let slot = &mut self.slots[idx];
        if slot.status != SlotStatus::Empty {
            return Err(Error::invalid_argument(format!(
                "replayed lsn {lsn} already {:?}",
                slot.status
            )));
        }
        slot.status = SlotStatus::Completed;
        slot.ld_key = ld_key;
        Ok(())
    }

    /// Mark an empty slot as intentionally skipped
    pub fn fill_gap(&mut self, lsn: Lsn) -> Result<()> {
        if lsn < self.start {
            return Err(Error::out_of_range(format!("lsn {lsn} already truncated")));
        }
        let idx = self.ensure(lsn);
        let slot = &mut self.slots[idx];
        if slot.status != SlotStatus::Empty {
            return Err(Error::invalid_argument(format!(
                "cannot gap-fill lsn {lsn}: already {:?}",
                slot.status
            )));
        }
        slot.status = SlotStatus::GapFilled;
        Ok(())
    }

    /// Advance the floor to `upto`, dropping the truncated slots
    pub fn truncate(&mut self, upto: Lsn) {
        if upto < self.start {
            return;
        }
        let drop = ((upto - self.start) as usize + 1).min(self.slots.len());
        self.slots.drain(..drop);
        self.start = upto + 1;
    }

    /// Discard every slot above `to_lsn`; returns how many were dropped
    pub fn rollback(&mut self, to_lsn: Lsn) -> u64 {
        let keep = if to_lsn < self.start {
            0
        } else {
            ((to_lsn - self.start) as usize + 1).min(self.slots.len())
        };
        let dropped = self.slots.len() - keep;
        self.slots.truncate(keep);
        dropped as u64
    }

    /// Largest `k >= from` such that every slot in `(from, k]` is
    /// completed or gap-filled
    pub fn contiguous_completed(&self, from: Lsn) -> Lsn {
        self.contiguous(from, Slot::is_filled)
    }

    /// Largest `k >= from` such that every slot in `(from, k]` has at
    /// least been issued
    pub fn contiguous_issued(&self, from: Lsn) -> Lsn {
        self.contiguous(from, |s| s.status != SlotStatus::Empty)
    }

    fn contiguous(&self, from: Lsn, pred: impl Fn(&Slot) -> bool) -> Lsn {
        let mut last = from;
        let mut lsn = from.max(self.floor()) + 1;
        while let Some(idx) = self.index(lsn) {
            match self.slots.get(idx) {
                Some(slot) if pred(slot) => {
                    last = lsn;
                    lsn += 1;
                }
                _ => break,
            }
        }
        last
    }

    /// Whether any slot in `(floor, upto]` is still only issued
    pub fn has_issued_below(&self, upto: Lsn) -> bool {
        let mut lsn = self.start;
        while lsn <= upto {
            match self.index(lsn).and_then(|i| self.slots.get(i)) {
                Some(slot) if slot.status == SlotStatus::Issued => return true,
                Some(_) => lsn += 1,
                None => break,
            }
        }
        false
    }

    /// Highest completed or gap-filled sequence number, if any
    pub fn highest_filled(&self) -> Option<Lsn> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| s.is_filled())
            .map(|(idx, _)| self.start + idx as Lsn)
    }

    /// Completed records (lsn, device key) from `from` upward,
    /// skipping gap-filled slots
    pub fn completed_from(&self, from: Lsn) -> Vec<(Lsn, LogDevKey)> {
        let begin = from.max(self.start);
        let Some(mut idx) = self.index(begin) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(slot) = self.slots.get(idx) {
            if slot.status == SlotStatus::Completed {
                out.push((self.start + idx as Lsn, slot.ld_key));
            }
            idx += 1;
        }
        out
    }
}
