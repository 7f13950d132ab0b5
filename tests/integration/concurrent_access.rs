#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use vellum::{PageId, PageStorage, Result, StorageOptions, Transaction};

const SEED: u64 = 0x5eed_c0de;
const READERS: u64 = 4;
const ROUNDS: u32 = 60;

fn options() -> StorageOptions {
    StorageOptions {
        page_size: 512,
        read_cache_pages: 8,
        modify_buffer_pages: 4096,
        log_window_pages: 4,
        read_pool_size: 2,
        ..StorageOptions::default()
    }
}

#[test]
fn readers_never_observe_torn_pages() -> Result<()> {
    let dir = tempdir()?;
    let storage = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &options())?;
    {
        let mut trx = storage.start_modify()?;
        for id in 0..16u64 {
            trx.get_page_for_modify(PageId(id))?.fill(1);
        }
        trx.commit()?;
    }

    let done = AtomicBool::new(false);
    let pages_read = AtomicU64::new(0);
    thread::scope(|scope| -> Result<()> {
        let mut readers = Vec::new();
        for reader in 0..READERS {
            let storage = &storage;
            let done = &done;
            let pages_read = &pages_read;
            readers.push(scope.spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED + reader);
                while !done.load(Ordering::Acquire) {
                    let mut trx = storage.start_read()?;
                    for _ in 0..8 {
                        let id = rng.gen_range(0..trx.data_length());
                        let page = trx.get_page(PageId(id))?;
                        let first = page[0];
                        assert!(first > 0, "page {id} read before it was written");
                        assert!(page.iter().all(|b| *b == first), "page {id} is torn");
                        pages_read.fetch_add(1, Ordering::Relaxed);
                    }
                    trx.commit()?;
                }
                Ok(())
            }));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(SEED);
        let writer = (|| -> Result<()> {
            for round in 0..ROUNDS {
                let fill = (round % 250) as u8 + 2;
                let mut trx = storage.start_modify()?;
                let data_length = trx.data_length();
                for _ in 0..rng.gen_range(1..12) {
                    let id = rng.gen_range(0..data_length);
                    trx.get_page_for_modify(PageId(id))?.fill(fill);
                }
                if round % 5 == 0 {
                    trx.get_page_for_modify(PageId(data_length))?.fill(fill);
                }
                trx.commit()?;
                if round % 17 == 0 {
                    storage.checkpoint()?;
                }
            }
            Ok(())
        })();
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().expect("reader panicked")?;
        }
        writer
    })?;

    assert!(pages_read.load(Ordering::Relaxed) > 0);
    assert_eq!(storage.data_length(), 16 + u64::from(ROUNDS.div_ceil(5)));
    let snapshot = storage.lock_snapshot();
    assert_eq!(snapshot.readers, 0);
    assert!(!snapshot.modify);
    storage.close()?;
    Ok(())
}

#[test]
fn open_reader_does_not_block_writer() -> Result<()> {
    let dir = tempdir()?;
    let storage = PageStorage::create(dir.path().join("data"), dir.path().join("log"), &options())?;
    {
        let mut trx = storage.start_modify()?;
        trx.get_page_for_modify(PageId(0))?.fill(3);
        trx.commit()?;
    }

    // An open read transaction does not block a modify transaction.
    let mut read = storage.start_read()?;
    assert_eq!(read.get_page(PageId(0))?[0], 3);
    let mut trx = storage.start_modify()?;
    trx.get_page_for_modify(PageId(0))?.fill(4);
    trx.commit()?;
    assert_eq!(read.get_page(PageId(0))?[0], 3);
    read.rollback();

    let mut read = storage.start_read()?;
    assert_eq!(read.get_page(PageId(0))?[0], 4);
    read.commit()?;
    Ok(())
}
