//! Vellum: an embedded transactional page storage engine.
//!
//! A fixed-size-page data file protected by a write-ahead log, with
//! checkpointing, crash recovery, log compaction and log-shipping support.
//! [`PageStorage`] is the entry point; [`admin`] carries backup, restore and
//! reporting helpers.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{
    ModifyTransaction, PageStorage, ReadTransaction, StorageOptions, Synchronous, Transaction,
};
pub use types::{LogId, PageId, Result, TrxId, VellumError};
