//! Process-wide byte pool.
//!
//! Buffers are handed out as [`PooledBuf`] guards; the storage goes back to
//! the pool when the guard is dropped, on every exit path. Initialised once
//! and never freed.

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use parking_lot::Mutex;

// Size classes are powers of two; requests above the largest class get a
// one-off allocation that is dropped instead of recycled.
const MIN_CLASS_SHIFT: u32 = 5; // 32 B
const MAX_CLASS_SHIFT: u32 = 17; // 128 KiB
const PER_CLASS_CAP: usize = 64;

struct Shelf {
    slots: Mutex<Vec<Box<[u8]>>>,
}

struct Pool {
    shelves: Vec<Shelf>,
}

impl Pool {
    fn new() -> Self {
        let shelves = (MIN_CLASS_SHIFT..=MAX_CLASS_SHIFT)
            .map(|_| Shelf {
                slots: Mutex::new(Vec::new()),
            })
            .collect();
        Pool { shelves }
    }

    fn class_of(len: usize) -> Option<usize> {
        let shift = usize::BITS - len.saturating_sub(1).leading_zeros();
        let shift = shift.max(MIN_CLASS_SHIFT);
        (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
    }

    fn acquire(&self, len: usize) -> Box<[u8]> {
        match Self::class_of(len) {
            Some(class) => {
                let recycled = self.shelves[class].slots.lock().pop();
                recycled.unwrap_or_else(|| vec![0u8; 1 << (class as u32 + MIN_CLASS_SHIFT)].into_boxed_slice())
            }
            None => vec![0u8; len].into_boxed_slice(),
        }
    }

    fn release(&self, storage: Box<[u8]>) {
        if let Some(class) = Self::class_of(storage.len()) {
            if storage.len() == 1 << (class as u32 + MIN_CLASS_SHIFT) {
                let mut slots = self.shelves[class].slots.lock();
                if slots.len() < PER_CLASS_CAP {
                    slots.push(storage);
                }
            }
        }
    }
}

fn pool() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(Pool::new)
}

/// A buffer borrowed from the pool, exactly `len` bytes long as seen through
/// `Deref`. Returned to the pool on drop.
pub struct PooledBuf {
    storage: Option<Box<[u8]>>,
    len: usize,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the visible window. Storage keeps its class size.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage.as_ref().expect("present until drop")[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage.as_mut().expect("present until drop")[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            pool().release(storage);
        }
    }
}

/// Get a buffer of length `n`. Contents are unspecified.
pub fn get(n: usize) -> PooledBuf {
    PooledBuf {
        storage: Some(pool().acquire(n)),
        len: n,
    }
}

/// Get a buffer of length `n`, zero-filled.
pub fn get_zeroed(n: usize) -> PooledBuf {
    let mut buf = get(n);
    buf.fill(0);
    buf
}
