//! Replay defence.
//!
//! Two independent structures: a rotating pair of disk-backed Bloom filters
//! for Shadowsocks salts, and a time-sharded cuckoo filter for VMess
//! EAuthIDs. Loss of the Bloom files on crash is acceptable — the replay
//! window they protect is short — so fsync defaults to never.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use memmap2::MmapMut;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tokio::time::Instant;

pub const BLOOM_FILE_A: &str = "disk_bloom_a";
pub const BLOOM_FILE_B: &str = "disk_bloom_b";

/// Entries per filter before rotation.
const BLOOM_CAPACITY: u64 = 1_000_000;
/// Bits per filter, sized for ~1e-6 false positives at capacity.
const BLOOM_BITS: u64 = 28_755_176;
/// Hash probes per entry.
const BLOOM_PROBES: u64 = 20;

const HEADER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncMode {
    Never,
    EveryWrite,
}

struct BloomFile {
    map: MmapMut,
    count: u64,
}

impl BloomFile {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open bloom file {}", path.display()))?;
        let wanted = HEADER_LEN + BLOOM_BITS.div_ceil(8);
        if file.metadata()?.len() != wanted {
            file.set_len(wanted)?;
        }
        // SAFETY: the file is owned by this process for its whole lifetime;
        // concurrent mutation is serialized by the group mutex.
        let map = unsafe { MmapMut::map_mut(&file) }.context("mmap bloom file")?;
        let count = u64::from_le_bytes(map[..8].try_into().expect("header length"));
        Ok(BloomFile { map, count })
    }

    fn probes(data: &[u8]) -> impl Iterator<Item = u64> {
        let digest = Sha256::digest(data);
        let h1 = u64::from_le_bytes(digest[..8].try_into().expect("digest length"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("digest length"));
        (0..BLOOM_PROBES).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % BLOOM_BITS)
    }

    fn contains(&self, data: &[u8]) -> bool {
        Self::probes(data).all(|bit| {
            let byte = HEADER_LEN as usize + (bit / 8) as usize;
            self.map[byte] & (1 << (bit % 8)) != 0
        })
    }

    fn insert(&mut self, data: &[u8]) {
        for bit in Self::probes(data) {
            let byte = HEADER_LEN as usize + (bit / 8) as usize;
            self.map[byte] |= 1 << (bit % 8);
        }
        self.count += 1;
        let count = self.count;
        self.map[..8].copy_from_slice(&count.to_le_bytes());
    }

    fn clear(&mut self) {
        self.map.fill(0);
        self.count = 0;
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.map.flush().context("flush bloom file")
    }
}

/// Rotating pair of disk-backed Bloom filters.
///
/// New salts go into the active filter; lookups consult both. When the
/// active filter reaches capacity the sibling is zeroed and becomes active,
/// so a salt is remembered for at least one full capacity window.
pub struct BloomGroup {
    inner: Mutex<GroupInner>,
    fsync: FsyncMode,
}

struct GroupInner {
    filters: [BloomFile; 2],
    active: usize,
}

impl BloomGroup {
    pub fn open(dir: &Path, fsync: FsyncMode) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create data directory {}", dir.display()))?;
        let a = BloomFile::open(&dir.join(BLOOM_FILE_A))?;
        let b = BloomFile::open(&dir.join(BLOOM_FILE_B))?;
        // The emptier side resumes as active after a restart.
        let active = usize::from(b.count < a.count);
        Ok(BloomGroup {
            inner: Mutex::new(GroupInner { filters: [a, b], active }),
            fsync,
        })
    }

    pub fn paths(dir: &Path) -> [PathBuf; 2] {
        [dir.join(BLOOM_FILE_A), dir.join(BLOOM_FILE_B)]
    }

    /// Returns whether `data` was already present, inserting it atomically
    /// when it was not.
    pub fn exist_or_add(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.filters.iter().any(|f| f.contains(data)) {
            return true;
        }
        let active = inner.active;
        if inner.filters[active].count >= BLOOM_CAPACITY {
            let next = 1 - active;
            inner.filters[next].clear();
            inner.active = next;
        }
        let active = inner.active;
        inner.filters[active].insert(data);
        if self.fsync == FsyncMode::EveryWrite {
            if let Err(error) = inner.filters[active].flush() {
                warn!(%error, "failed to fsync bloom filter");
            }
        }
        false
    }
}

const CUCKOO_BUCKETS: usize = 1 << 16;
const CUCKOO_WAYS: usize = 4;
const CUCKOO_MAX_KICKS: usize = 512;

/// One generation of the EAuthID filter: a 4-way cuckoo table of 16-bit
/// fingerprints.
struct CuckooShard {
    buckets: Vec<[u16; CUCKOO_WAYS]>,
}

impl CuckooShard {
    fn new() -> Self {
        CuckooShard {
            buckets: vec![[0; CUCKOO_WAYS]; CUCKOO_BUCKETS],
        }
    }

    fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = [0; CUCKOO_WAYS];
        }
    }

    fn contains(&self, fp: u16, i1: usize, i2: usize) -> bool {
        self.buckets[i1].contains(&fp) || self.buckets[i2].contains(&fp)
    }

    fn insert(&mut self, mut fp: u16, i1: usize) -> bool {
        let mut index = i1;
        for _ in 0..CUCKOO_MAX_KICKS {
            if let Some(slot) = self.buckets[index].iter_mut().find(|slot| **slot == 0) {
                *slot = fp;
                return true;
            }
            // Kick a resident fingerprint to its alternate bucket.
            let victim = (fp as usize) % CUCKOO_WAYS;
            std::mem::swap(&mut self.buckets[index][victim], &mut fp);
            index = alt_index(index, fp);
        }
        false
    }
}

fn fingerprint_and_index(tag: &[u8]) -> (u16, usize) {
    let h = fnv1a64(tag);
    let mut fp = (h >> 48) as u16;
    if fp == 0 {
        fp = 1;
    }
    (fp, (h as usize) % CUCKOO_BUCKETS)
}

fn alt_index(index: usize, fp: u16) -> usize {
    index ^ (fnv1a64(&fp.to_le_bytes()) as usize) % CUCKOO_BUCKETS
}

pub(crate) fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Sliding-window replay filter for VMess EAuthIDs: two cuckoo shards
/// rotated every `window`, covering at least one and at most two windows.
pub struct ReplayFilter {
    window: Duration,
    inner: Mutex<ReplayInner>,
}

struct ReplayInner {
    shards: [CuckooShard; 2],
    current: usize,
    rotated_at: Instant,
}

impl ReplayFilter {
    pub fn new(window: Duration) -> Self {
        ReplayFilter {
            window,
            inner: Mutex::new(ReplayInner {
                shards: [CuckooShard::new(), CuckooShard::new()],
                current: 0,
                rotated_at: Instant::now(),
            }),
        }
    }

    /// Insert-if-absent. Returns false when the tag was already seen inside
    /// the window.
    pub fn insert(&self, tag: &[u8]) -> bool {
        let (fp, i1) = fingerprint_and_index(tag);
        let i2 = alt_index(i1, fp);

        let mut inner = self.inner.lock();
        if inner.rotated_at.elapsed() >= self.window {
            let stale = 1 - inner.current;
            inner.shards[stale].clear();
            inner.current = stale;
            inner.rotated_at = Instant::now();
        }
        if inner.shards.iter().any(|s| s.contains(fp, i1, i2)) {
            return false;
        }
        let current = inner.current;
        if !inner.shards[current].insert(fp, i1) {
            // Table saturated; reject rather than forget an earlier entry.
            warn!("replay filter shard is saturated");
            return false;
        }
        true
    }
}
