#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use vellum::types::page::PAGE_HDR_LEN;
use vellum::{PageId, PageStorage, Result, StorageOptions, Transaction};

const PAGE_SIZE: u32 = 512;
const LOG_HEADER_LEN: u64 = 512;
const SEED: u64 = 0xc4a5_4e11;

fn options() -> StorageOptions {
    StorageOptions {
        page_size: PAGE_SIZE,
        modify_buffer_pages: 1024,
        log_window_pages: 4,
        read_cache_pages: 32,
        ..StorageOptions::default()
    }
}

fn create(dir: &Path) -> Result<PageStorage> {
    PageStorage::create(dir.join("data"), dir.join("log"), &options())
}

fn open(dir: &Path) -> Result<PageStorage> {
    PageStorage::open(dir.join("data"), dir.join("log"), &options())
}

fn write_fill(storage: &PageStorage, ids: &[u64], fill: u8) -> Result<()> {
    let mut trx = storage.start_modify()?;
    for id in ids {
        trx.get_page_for_modify(PageId(*id))?.fill(fill);
    }
    trx.commit()
}

fn page_fills(storage: &PageStorage) -> Result<Vec<u8>> {
    let mut trx = storage.start_read()?;
    let mut fills = Vec::new();
    for id in 0..trx.data_length() {
        let page = trx.get_page(PageId(id))?;
        assert!(page.iter().all(|b| *b == page[0]), "page {id} is torn");
        fills.push(page[0]);
    }
    trx.commit()?;
    Ok(fills)
}

#[test]
fn unclean_stop_replays_committed_and_drops_partial() -> Result<()> {
    let dir = tempdir()?;
    let storage = create(dir.path())?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut expected: Vec<u8> = Vec::new();

    const COMMITS: u64 = 9;
    for round in 0..COMMITS {
        let fill = round as u8 + 1;
        let mut ids: Vec<u64> = (0..rng.gen_range(0..4))
            .filter(|_| !expected.is_empty())
            .map(|_| rng.gen_range(0..expected.len() as u64))
            .collect();
        ids.extend(expected.len() as u64..expected.len() as u64 + rng.gen_range(1..4));
        write_fill(&storage, &ids, fill)?;
        for id in ids {
            let id = id as usize;
            if id == expected.len() {
                expected.push(fill);
            } else {
                expected[id] = fill;
            }
        }
    }
    let committed = storage.log_info()?;

    // Ten pages with a window of four: eight reach the log, none is a STOP.
    let mut partial = storage.start_modify()?;
    for id in 0..10u64 {
        partial.get_page_for_modify(PageId(id))?.fill(0xAA);
    }
    mem::forget(partial);
    drop(storage);

    let reopened = open(dir.path())?;
    let outcome = reopened.recovery().cloned().expect("recovery should have run");
    assert_eq!(outcome.transactions, COMMITS);
    assert_eq!(outcome.pages, committed.next);
    assert_eq!(outcome.discarded_pages, 8);

    let info = reopened.log_info()?;
    assert_eq!(info.next, committed.next);
    assert_eq!(info.checkpoint, info.next);
    assert_eq!(info.data_length, committed.data_length);
    assert_eq!(page_fills(&reopened)?, expected);
    Ok(())
}

#[test]
fn torn_stop_page_discards_its_transaction() -> Result<()> {
    let dir = tempdir()?;
    let storage = create(dir.path())?;
    write_fill(&storage, &[0, 1, 2], 1)?;
    write_fill(&storage, &[1, 3, 4], 2)?;
    let info = storage.log_info()?;
    assert_eq!(info.next, 6);
    drop(storage);

    // Damage the payload of the second transaction's STOP page.
    let stop = info.next - 1;
    let offset = LOG_HEADER_LEN + stop * u64::from(PAGE_SIZE) + PAGE_HDR_LEN as u64 + 7;
    let mut log = OpenOptions::new().write(true).open(dir.path().join("log"))?;
    log.seek(SeekFrom::Start(offset))?;
    log.write_all(&[0x5A; 16])?;
    log.sync_all()?;
    drop(log);

    let reopened = open(dir.path())?;
    let outcome = reopened.recovery().cloned().expect("recovery should have run");
    assert_eq!(outcome.transactions, 1);
    assert_eq!(outcome.discarded_pages, 3);
    assert_eq!(reopened.data_length(), 3);
    assert_eq!(page_fills(&reopened)?, vec![1, 1, 1]);
    Ok(())
}

#[test]
fn recovered_storage_keeps_committing() -> Result<()> {
    let dir = tempdir()?;
    let storage = create(dir.path())?;
    write_fill(&storage, &[0, 1], 3)?;
    drop(storage);

    let reopened = open(dir.path())?;
    assert!(reopened.recovery().is_some());
    write_fill(&reopened, &[1, 2], 4)?;
    // A second crash right after recovery replays only the new transaction.
    drop(reopened);

    let again = open(dir.path())?;
    assert_eq!(again.recovery().map(|r| r.transactions), Some(1));
    assert_eq!(page_fills(&again)?, vec![3, 4, 4]);
    again.close()?;
    drop(again);

    let clean = open(dir.path())?;
    assert!(clean.recovery().is_none());
    assert_eq!(page_fills(&clean)?, vec![3, 4, 4]);
    Ok(())
}

#[test]
fn recovery_after_forced_checkpoint_starts_at_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let opts = StorageOptions {
        modify_buffer_pages: 4,
        ..options()
    };
    let storage = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &opts)?;
    write_fill(&storage, &[0, 1, 2], 1)?;
    // Exceeds the remaining buffer room: checkpoint, then a direct write.
    write_fill(&storage, &[3, 4, 5], 2)?;
    write_fill(&storage, &[0], 3)?;
    assert_eq!(storage.log_info()?.checkpoint, 3);
    drop(storage);

    let reopened = PageStorage::open(dir.path().join("data"), dir.path().join("log"), &opts)?;
    assert_eq!(reopened.recovery().map(|r| r.transactions), Some(2));
    assert_eq!(page_fills(&reopened)?, vec![3, 1, 1, 2, 2, 2]);
    Ok(())
}
