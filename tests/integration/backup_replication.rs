#![allow(missing_docs)]

use std::path::Path;

use tempfile::tempdir;
use vellum::primitives::pagefile::SliceSource;
use vellum::{admin, PageId, PageStorage, Result, StorageOptions, Transaction, VellumError};

const PAGE_SIZE: u32 = 256;

fn options() -> StorageOptions {
    StorageOptions {
        page_size: PAGE_SIZE,
        log_window_pages: 4,
        transfer_chunk_pages: 5,
        ..StorageOptions::default()
    }
}

fn write_fill(storage: &PageStorage, ids: &[u64], fill: u8) -> Result<()> {
    let mut trx = storage.start_modify()?;
    for id in ids {
        trx.get_page_for_modify(PageId(*id))?.fill(fill);
    }
    trx.commit()
}

fn fills(storage: &PageStorage) -> Result<Vec<u8>> {
    let mut trx = storage.start_read()?;
    let mut out = Vec::new();
    for id in 0..trx.data_length() {
        out.push(trx.get_page(PageId(id))?[0]);
    }
    trx.commit()?;
    Ok(out)
}

/// Reads the master's committed log pages `[from, to)`.
fn ship(master: &PageStorage, from: u64, to: u64) -> Result<Vec<u8>> {
    let mut pages = vec![0u8; (to - from) as usize * PAGE_SIZE as usize];
    master.admin_log_read(from, &mut pages)?;
    Ok(pages)
}

fn restore_replica(master: &PageStorage, dir: &Path) -> Result<PageStorage> {
    let backup_path = dir.join("snapshot.bak");
    let report = admin::backup(master, &backup_path)?;
    assert_eq!(report.pages, master.data_length());
    assert_eq!(report.start, master.log_info()?.next);

    let (replica, restored) = admin::restore(
        &backup_path,
        dir.join("replica-data"),
        dir.join("replica-log"),
        &options(),
    )?;
    assert_eq!(restored.pages, report.pages);
    assert_eq!(restored.master_log_id, report.master_log_id);
    assert_ne!(restored.log_id, report.master_log_id);
    Ok(replica)
}

#[test]
fn backup_restores_a_replica_at_the_master_position() -> Result<()> {
    let dir = tempdir()?;
    let master = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &options())?;
    write_fill(&master, &[0, 1, 2], 1)?;
    write_fill(&master, &[1, 3], 2)?;

    let replica = restore_replica(&master, dir.path())?;
    let info = replica.log_info()?;
    let master_info = master.log_info()?;
    assert!(info.slave);
    assert_eq!(info.master_log_id, master_info.log_id);
    assert_eq!((info.start, info.checkpoint, info.next), (5, 5, 5));
    assert_eq!(info.data_length, 4);
    assert_eq!(fills(&replica)?, fills(&master)?);
    assert!(matches!(replica.start_modify(), Err(VellumError::Invalid(_))));

    assert!(admin::backup(&master, dir.path().join("snapshot.bak")).is_err());
    assert!(!master.is_closed());
    Ok(())
}

#[test]
fn shipped_log_pages_keep_the_replica_in_step() -> Result<()> {
    let dir = tempdir()?;
    let master = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &options())?;
    write_fill(&master, &[0, 1], 1)?;
    let replica = restore_replica(&master, dir.path())?;

    write_fill(&master, &[0, 2, 3], 2)?;
    write_fill(&master, &[4], 3)?;
    write_fill(&master, &[1, 5, 6, 7, 8, 9], 4)?;

    let from = replica.log_info()?.next;
    let to = master.log_info()?.next;
    let pages = ship(&master, from, to)?;
    let applied = replica.apply_log_pages(from, &mut SliceSource::new(&pages), to - from)?;
    assert_eq!(applied, 3);
    assert_eq!(replica.log_info()?.next, to);
    assert_eq!(replica.data_length(), master.data_length());
    assert_eq!(fills(&replica)?, fills(&master)?);

    // Shipping from anywhere but the replica's `next` is refused.
    assert!(matches!(
        replica.apply_log_pages(from, &mut SliceSource::new(&pages), to - from),
        Err(VellumError::WrongPageId { .. })
    ));
    assert!(!replica.is_closed());
    Ok(())
}

#[test]
fn partial_shipment_applies_complete_transactions_only() -> Result<()> {
    let dir = tempdir()?;
    let master = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &options())?;
    write_fill(&master, &[0], 1)?;
    let replica = restore_replica(&master, dir.path())?;

    write_fill(&master, &[0, 1], 2)?;
    write_fill(&master, &[2, 3, 4], 3)?;
    let from = replica.log_info()?.next;
    let to = master.log_info()?.next;
    assert_eq!(to - from, 5);

    // The first transaction and two pages of the second.
    let head = ship(&master, from, from + 4)?;
    assert!(matches!(
        replica.apply_log_pages(from, &mut SliceSource::new(&head), 4),
        Err(VellumError::TrxCorrupted(_))
    ));
    assert!(!replica.is_closed());
    assert_eq!(replica.log_info()?.next, from + 2);
    assert_eq!(fills(&replica)?, vec![2, 2]);

    // Resume from the replica's position with the whole second transaction.
    let resume = replica.log_info()?.next;
    let tail = ship(&master, resume, to)?;
    assert_eq!(replica.apply_log_pages(resume, &mut SliceSource::new(&tail), to - resume)?, 1);
    assert_eq!(fills(&replica)?, fills(&master)?);
    Ok(())
}

#[test]
fn promoted_replica_accepts_local_transactions() -> Result<()> {
    let dir = tempdir()?;
    let master = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &options())?;
    write_fill(&master, &[0, 1], 6)?;
    let replica = restore_replica(&master, dir.path())?;

    replica.clear_slave()?;
    let info = replica.log_info()?;
    assert!(!info.slave);
    write_fill(&replica, &[1, 2], 7)?;
    assert_eq!(fills(&replica)?, vec![6, 7, 7]);
    assert!(matches!(
        replica.apply_log_pages(info.next, &mut SliceSource::new(&[]), 0),
        Err(VellumError::Invalid(_))
    ));

    let stats = admin::stats(&replica)?;
    assert_eq!(stats.log.data_length, 3);
    let json = serde_json::to_string(&stats).expect("stats serialize");
    assert!(json.contains("\"slave\":false"));
    assert!(json.contains("\"data_size_bytes\""));

    replica.close()?;
    drop(replica);
    let reopened = PageStorage::open(
        dir.path().join("replica-data"),
        dir.path().join("replica-log"),
        &options(),
    )?;
    assert!(reopened.recovery().is_none());
    assert_eq!(fills(&reopened)?, vec![6, 7, 7]);
    assert!(!reopened.log_info()?.slave);
    Ok(())
}
