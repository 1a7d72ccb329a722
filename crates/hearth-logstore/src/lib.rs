//! Hearth Log Store - multi-stream write-ahead logging
//!
//! This crate implements the log service of hearth:
//! - The log device: an append-only batch ring over the logdev block
//!   store, with flush barriers and per-record device keys
//! - Log stores: per-stream sequence-numbered append/read/truncate with
//!   gap filling and rollback
//! - The log-store service: store registry, recovery replay and the
//!   safe device-truncation protocol across streams

pub mod logdev;
pub mod service;
pub mod store;
pub mod tracker;
pub mod types;

pub use logdev::{LogDev, LogDevConfig};
pub use service::LogStoreService;
pub use store::{LogStore, LogStoreStatus};
pub use tracker::{SlotStatus, StreamTracker};
pub use types::{
    Cookie, LogDevKey, LogFoundCb, LogReplayDoneCb, LogWriteCompCb, Lsn, ReadCb, RollbackCb,
    TruncationInfo, INVALID_LSN,
};
