//! Shared test harness: deterministic key streams and index builders.
#![allow(dead_code)]

use std::path::PathBuf;

use flintdb::{BTreeIndex, FileMedium, IndexConfig, PageStore};
use tempfile::TempDir;

/// Generates every value in `[0, size)` exactly once, in a pseudo-random
/// order that is a pure function of `(size, seed)`. The order is a
/// quadratic-residue permutation: squares modulo a prime `p ≡ 3 (mod 4)`
/// hit each residue exactly once when folded the right way, so no
/// bookkeeping of already-emitted values is needed.
pub struct KeySequence {
    index: u32,
    seed1: u32,
    seed2: u32,
    size: u32,
    prime: u32,
}

fn scramble(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl KeySequence {
    pub fn new(size: u32, seed: u64) -> Self {
        let prime = if size <= 100 {
            103
        } else if size <= 1_000 {
            1_019
        } else if size <= 10_000 {
            10_007
        } else if size <= 100_000 {
            100_003
        } else {
            1_000_003
        };
        let golden = 0x9e37_79b9_7f4a_7c15u64;
        let seed1 = (scramble(seed.wrapping_add(golden)) % prime as u64) as u32;
        let seed2 = (scramble(seed.wrapping_add(golden.wrapping_mul(2))) % prime as u64) as u32;
        Self {
            index: 0,
            seed1,
            seed2,
            size,
            prime,
        }
    }

    fn permute(&self, value: u32) -> u32 {
        let residue = ((value as u64 * value as u64) % self.prime as u64) as u32;
        if value * 2 < self.prime {
            residue
        } else {
            self.prime - residue
        }
    }

    pub fn next(&mut self) -> u32 {
        loop {
            let mut tmp = (self.index + self.seed1) % self.prime;
            tmp = (tmp + self.seed2) % self.prime;
            let out = self.permute(self.permute(tmp));
            self.index += 1;
            if self.index == self.prime {
                self.index = 0;
            }
            if out < self.size {
                return out;
            }
        }
    }
}

pub fn key(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// 12-byte value echoing the key, like the reference workload's records.
pub fn value(v: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(&v.to_le_bytes());
    out
}

pub struct TestIndex {
    pub dir: TempDir,
    pub path: PathBuf,
    pub config: IndexConfig,
    pub index: BTreeIndex,
}

pub struct IndexParams {
    pub page_size: usize,
    pub num_buffers: usize,
    pub pages: u32,
    pub erase_block_pages: u32,
    pub mapping_capacity: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            page_size: 512,
            num_buffers: 3,
            pages: 4096,
            erase_block_pages: 1,
            mapping_capacity: 64,
        }
    }
}

pub fn build_index(params: IndexParams) -> TestIndex {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.bin");
    let mut config = IndexConfig::new(params.pages as u64 * params.page_size as u64);
    config.page_size = params.page_size;
    config.num_buffers = params.num_buffers;
    config.erase_block_pages = params.erase_block_pages;
    config.mapping_capacity = params.mapping_capacity;

    let medium = FileMedium::create(&path, config.end_addr).unwrap();
    let store = PageStore::new(Box::new(medium), &config).unwrap();
    let index = BTreeIndex::create(store, &config).unwrap();

    TestIndex {
        dir,
        path,
        config,
        index,
    }
}

/// Reattaches to an existing index file with the same configuration.
pub fn reopen_index(path: &PathBuf, config: &IndexConfig) -> BTreeIndex {
    let medium = FileMedium::open(path).unwrap();
    let store = PageStore::attach(Box::new(medium), config).unwrap();
    BTreeIndex::recover(store, config).unwrap()
}

/// Asserts that every key in `keys` is present with its echoed value.
pub fn check_all(index: &mut BTreeIndex, keys: impl Iterator<Item = u32>) {
    let mut out = [0u8; 12];
    for k in keys {
        assert!(
            index.get(&key(k), &mut out).unwrap(),
            "key {} not found",
            k
        );
        assert_eq!(out, value(k), "wrong value for key {}", k);
    }
}
