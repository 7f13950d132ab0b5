#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::Path;

use proptest::prelude::*;
use rand::prelude::*;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use vellum::{PageId, PageStorage, Result, StorageOptions, Transaction, VellumError};

const PAGE_SIZE: u32 = 512;
const SEED: u64 = 0x7e11_0b0c;

fn options(modify_buffer_pages: usize) -> StorageOptions {
    StorageOptions {
        page_size: PAGE_SIZE,
        modify_buffer_pages,
        log_window_pages: 8,
        data2log_memory_entries: 32,
        read_cache_pages: 64,
        ..StorageOptions::default()
    }
}

fn create(dir: &Path, opts: &StorageOptions) -> Result<PageStorage> {
    PageStorage::create(dir.join("data"), dir.join("log"), opts)
}

fn open(dir: &Path, opts: &StorageOptions) -> Result<PageStorage> {
    PageStorage::open(dir.join("data"), dir.join("log"), opts)
}

fn payload(id: u64, version: u32) -> Vec<u8> {
    let len = PAGE_SIZE as usize - vellum::types::page::PAGE_HDR_LEN;
    let mut rng = ChaCha8Rng::seed_from_u64(id ^ (u64::from(version) << 32));
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

fn commit_pages(storage: &PageStorage, pages: &[(u64, Vec<u8>)]) -> Result<()> {
    let mut trx = storage.start_modify()?;
    for (id, bytes) in pages {
        trx.get_page_for_modify(PageId(*id))?.copy_from_slice(bytes);
    }
    trx.commit()
}

fn snapshot(storage: &PageStorage) -> Result<Vec<Vec<u8>>> {
    let mut trx = storage.start_read()?;
    let mut pages = Vec::new();
    for id in 0..trx.data_length() {
        pages.push(trx.get_page(PageId(id))?.to_vec());
    }
    trx.commit()?;
    Ok(pages)
}

#[test]
fn committed_pages_survive_close_and_reopen() -> Result<()> {
    let dir = tempdir()?;
    let opts = options(128);
    let storage = create(dir.path(), &opts)?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut expected: HashMap<u64, Vec<u8>> = HashMap::new();

    for round in 0..12u32 {
        let data_length = storage.data_length();
        let mut pages = Vec::new();
        if data_length > 0 {
            for _ in 0..rng.gen_range(0..12) {
                let id = rng.gen_range(0..data_length);
                pages.push((id, payload(id, round)));
            }
        }
        for id in data_length..data_length + rng.gen_range(1..6) {
            pages.push((id, payload(id, round)));
        }
        commit_pages(&storage, &pages)?;
        for (id, bytes) in pages {
            expected.insert(id, bytes);
        }
    }

    let max_id = *expected.keys().max().unwrap();
    assert_eq!(storage.data_length(), max_id + 1);
    storage.close()?;
    drop(storage);

    let reopened = open(dir.path(), &opts)?;
    assert!(reopened.recovery().is_none());
    assert_eq!(reopened.data_length(), max_id + 1);
    let pages = snapshot(&reopened)?;
    for (id, bytes) in &expected {
        assert_eq!(&pages[*id as usize], bytes, "page {id}");
    }
    Ok(())
}

#[test]
fn rolled_back_pages_are_never_visible() -> Result<()> {
    let dir = tempdir()?;
    let opts = options(128);
    let storage = create(dir.path(), &opts)?;
    commit_pages(&storage, &[(0, payload(0, 1)), (1, payload(1, 1))])?;
    let before = storage.log_info()?;

    let mut trx = storage.start_modify()?;
    for id in 0..40u64 {
        trx.get_page_for_modify(PageId(id))?.copy_from_slice(&payload(id, 2));
    }
    trx.rollback();

    let after = storage.log_info()?;
    assert_eq!(after.next, before.next);
    assert_eq!(after.data_length, 2);
    let pages = snapshot(&storage)?;
    assert_eq!(pages, vec![payload(0, 1), payload(1, 1)]);

    // The next transaction reuses the space the rolled-back one wrote to.
    commit_pages(&storage, &[(2, payload(2, 3))])?;
    storage.close()?;
    drop(storage);
    let reopened = open(dir.path(), &opts)?;
    assert_eq!(snapshot(&reopened)?.len(), 3);
    Ok(())
}

#[test]
fn empty_checkpoint_leaves_files_untouched() -> Result<()> {
    let dir = tempdir()?;
    let opts = options(128);
    let storage = create(dir.path(), &opts)?;
    commit_pages(&storage, &[(0, payload(0, 1))])?;
    assert_eq!(storage.checkpoint()?, 1);

    let data_before = std::fs::read(dir.path().join("data"))?;
    let log_before = std::fs::read(dir.path().join("log"))?;
    let report = vellum::admin::checkpoint(&storage)?;
    assert_eq!(report.pages_written, 0);
    assert_eq!(std::fs::read(dir.path().join("data"))?, data_before);
    assert_eq!(std::fs::read(dir.path().join("log"))?, log_before);
    Ok(())
}

#[test]
fn oversized_transaction_matches_small_transactions() -> Result<()> {
    const CAPACITY: usize = 50;
    let opts = options(CAPACITY);
    let pages: Vec<(u64, Vec<u8>)> = (0..60u64).map(|id| (id, payload(id, 7))).collect();

    let big_dir = tempdir()?;
    let big = create(big_dir.path(), &opts)?;
    commit_pages(&big, &pages)?;

    let small_dir = tempdir()?;
    let small = create(small_dir.path(), &opts)?;
    for chunk in pages.chunks(7) {
        commit_pages(&small, chunk)?;
    }

    assert_eq!(snapshot(&big)?, snapshot(&small)?);
    assert_eq!(big.data_stats().direct_pages, 60);
    assert_eq!(big.data_length(), small.data_length());
    Ok(())
}

#[test]
fn full_buffer_then_oversized_transaction_checkpoints_once() -> Result<()> {
    const CAPACITY: usize = 25;
    let dir = tempdir()?;
    let opts = options(CAPACITY);
    let storage = create(dir.path(), &opts)?;

    let seed: Vec<(u64, Vec<u8>)> = (0..CAPACITY as u64).map(|id| (id, payload(id, 1))).collect();
    commit_pages(&storage, &seed)?;
    assert_eq!(storage.data_stats().checkpoints, 0);

    // 30 log pages touching ids 10..40: 15 existing pages and 15 new ones.
    let mut trx = storage.start_modify()?;
    for id in 10..40u64 {
        trx.get_page_for_modify(PageId(id))?.copy_from_slice(&payload(id, 2));
    }
    trx.commit()?;

    let stats = storage.data_stats();
    assert_eq!(stats.checkpoints, 1);
    assert_eq!(stats.pages_checkpointed, CAPACITY as u64);
    assert_eq!(stats.direct_pages, 30);
    assert_eq!(storage.data_length(), 40);
    let info = storage.log_info()?;
    assert_eq!(info.checkpoint, CAPACITY as u64);
    assert_eq!(info.next, CAPACITY as u64 + 30);

    let pages = snapshot(&storage)?;
    assert_eq!(pages[5], payload(5, 1));
    assert_eq!(pages[39], payload(39, 2));
    Ok(())
}

#[test]
fn pages_beyond_data_length_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let storage = create(dir.path(), &options(16))?;
    commit_pages(&storage, &[(0, payload(0, 1))])?;
    let mut read = storage.start_read()?;
    assert!(matches!(
        read.get_page(PageId(1)),
        Err(VellumError::WrongPageId { page: 1, .. })
    ));
    drop(read);
    let mut trx = storage.start_modify()?;
    assert!(matches!(
        trx.get_page_for_modify(PageId(5)),
        Err(VellumError::WrongPageId { .. })
    ));
    assert!(!storage.is_closed());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn repeated_writes_coalesce_to_last_version(
        writes in prop::collection::vec((0u64..12, any::<u8>()), 1..60)
    ) {
        let dir = tempdir().unwrap();
        let storage = create(dir.path(), &options(64)).unwrap();
        let base: Vec<(u64, Vec<u8>)> = (0..12u64).map(|id| (id, payload(id, 0))).collect();
        commit_pages(&storage, &base).unwrap();
        let next_before = storage.log_info().unwrap().next;

        let mut last: HashMap<u64, u8> = HashMap::new();
        let mut trx = storage.start_modify().unwrap();
        for (id, byte) in &writes {
            trx.get_page_for_modify(PageId(*id)).unwrap().fill(*byte);
            last.insert(*id, *byte);
        }
        trx.commit().unwrap();

        let info = storage.log_info().unwrap();
        prop_assert_eq!(info.next - next_before, last.len() as u64);
        let pages = snapshot(&storage).unwrap();
        for id in 0..12u64 {
            match last.get(&id) {
                Some(byte) => prop_assert!(pages[id as usize].iter().all(|b| b == byte)),
                None => prop_assert_eq!(&pages[id as usize], &payload(id, 0)),
            }
        }
    }
}
