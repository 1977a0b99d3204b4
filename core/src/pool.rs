// SPDX-License-Identifier: MIT

//! A sensitive memory pool: an exact-size, slab-backed allocator that
//! zeroises every cell before it can be reused or observed again.
//!
//! Every byte that is ever a TPM key, nonce, HMAC tag, or authValue passes
//! through this pool. [`SensitiveBuffer`] is the unique owner of such a
//! cell; dropping it (explicitly via [`SensitiveBuffer::release`] or
//! implicitly via `Drop`) always zeroises the backing memory before it can
//! be handed to another renter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, trace};
use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::error::{TpmCoreError, TpmResult};

/// Number of cells a slab's backing store grows by each time it is
/// exhausted. Chosen to amortise allocation cost for the small, fixed
/// handful of buffer sizes (digest sizes, nonce sizes) the protocol
/// actually uses.
const INITIAL_SLAB_CAPACITY: usize = 64;

#[derive(Clone, Copy, Eq, PartialEq)]
struct CellRef {
    block: usize,
    offset: usize,
}

struct SlabData {
    cell_size: usize,
    /// Backing stores, each holding `capacity_per_block` cells back to back.
    blocks: Vec<Vec<u8>>,
    capacity_per_block: usize,
    free: VecDeque<CellRef>,
    in_use: usize,
}

impl SlabData {
    fn new(cell_size: usize) -> Self {
        SlabData {
            cell_size,
            blocks: Vec::new(),
            capacity_per_block: INITIAL_SLAB_CAPACITY,
            free: VecDeque::new(),
            in_use: 0,
        }
    }

    fn grow(&mut self) {
        let block = self.blocks.len();
        self.blocks.push(vec![0u8; self.cell_size * self.capacity_per_block]);
        for offset in 0..self.capacity_per_block {
            self.free.push_back(CellRef { block, offset });
        }
    }

    fn cell_slice(&self, cell: CellRef) -> &[u8] {
        let start = cell.offset * self.cell_size;
        &self.blocks[cell.block][start..start + self.cell_size]
    }

    fn cell_slice_mut(&mut self, cell: CellRef) -> &mut [u8] {
        let start = cell.offset * self.cell_size;
        &mut self.blocks[cell.block][start..start + self.cell_size]
    }

    fn total_cells(&self) -> usize {
        self.blocks.len() * self.capacity_per_block
    }
}

/// One slab per distinct cell size, discovered lazily and cached by [`Pool`].
struct Slab {
    cell_size: usize,
    data: Mutex<SlabData>,
    rents: AtomicU64,
    releases: AtomicU64,
}

impl Slab {
    fn new(cell_size: usize) -> Self {
        Slab {
            cell_size,
            data: Mutex::new(SlabData::new(cell_size)),
            rents: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    fn rent(&self) -> CellRef {
        let mut data = self.data.lock();
        if data.free.is_empty() {
            data.grow();
            trace!(
                "pool: grew slab(cell_size={}) to {} cells",
                self.cell_size,
                data.total_cells()
            );
        }
        let cell = data.free.pop_front().expect("slab just grew, free list non-empty");
        data.in_use += 1;
        self.rents.fetch_add(1, Ordering::Relaxed);
        debug!(
            "pool: rent cell_size={} in_use={} total={}",
            self.cell_size,
            data.in_use,
            data.total_cells()
        );
        cell
    }

    /// Zeroises the cell, then returns it to the free list. Returns a
    /// `Precondition` error if the cell was not tracked as in-use, which
    /// can only happen if a caller bypasses the owning-type discipline of
    /// [`SensitiveBuffer`] (defence in depth; the public API makes this
    /// unreachable because `release` consumes the buffer by value).
    fn release(&self, cell: CellRef) -> TpmResult<()> {
        let mut data = self.data.lock();
        if data.in_use == 0 {
            return Err(TpmCoreError::Precondition {
                context: format!("double release of cell_size={} buffer", self.cell_size),
            });
        }
        data.cell_slice_mut(cell).zeroize();
        data.free.push_back(cell);
        data.in_use -= 1;
        self.releases.fetch_add(1, Ordering::Relaxed);
        debug!(
            "pool: release cell_size={} in_use={} total={}",
            self.cell_size,
            data.in_use,
            data.total_cells()
        );
        Ok(())
    }

    fn zeroise_all(&self) {
        let mut data = self.data.lock();
        for block in &mut data.blocks {
            block.zeroize();
        }
    }
}

/// A set of slabs keyed by exact cell size.
///
/// `Pool` is cheap to clone (it is an `Arc` internally is not required —
/// callers share a `Pool` behind their own `Arc` or use [`global`]).
pub struct Pool {
    slabs: Mutex<std::collections::HashMap<usize, Arc<Slab>>>,
}

impl Pool {
    /// Creates a fresh, empty pool. Tests should always construct their own
    /// pool rather than reaching for [`global`], so that buffers from one
    /// test cannot be observed by another.
    #[must_use]
    pub fn new() -> Self {
        Pool {
            slabs: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn slab_for(&self, cell_size: usize) -> Arc<Slab> {
        let mut slabs = self.slabs.lock();
        slabs
            .entry(cell_size)
            .or_insert_with(|| Arc::new(Slab::new(cell_size)))
            .clone()
    }

    /// Rents a uniquely-owned, exact-size buffer of `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if `n == 0`.
    pub fn rent(&self, n: usize) -> TpmResult<SensitiveBuffer> {
        if n == 0 {
            return Err(TpmCoreError::Precondition {
                context: "rent(0) is not allowed".to_string(),
            });
        }
        let slab = self.slab_for(n);
        let cell = slab.rent();
        Ok(SensitiveBuffer {
            slab,
            cell: Some(cell),
            len: n,
        })
    }

    /// Rents a buffer and copies `bytes` into it. A convenience used
    /// whenever the core needs to move caller-supplied secret material
    /// (a password, an authValue) into pooled memory immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if `bytes` is empty.
    pub fn rent_copy(&self, bytes: &[u8]) -> TpmResult<SensitiveBuffer> {
        let mut buf = self.rent(bytes.len())?;
        buf.with_bytes_mut(|dst| dst.copy_from_slice(bytes))?;
        Ok(buf)
    }

    /// Zeroises every cell in every slab. Intended for process shutdown.
    pub fn shutdown(&self) {
        let slabs = self.slabs.lock();
        for slab in slabs.values() {
            slab.zeroise_all();
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_POOL: OnceLock<Arc<Pool>> = OnceLock::new();

/// Returns the process-wide sensitive pool, creating it on first use.
///
/// Production code that has no natural owner for a `Pool` (the CLI, the
/// default [`crate::executor::NameResolver`], ad-hoc scripts) uses this.
/// Tests should prefer a fresh `Arc::new(Pool::new())` so pooled buffers
/// from one test can never leak state into another.
pub fn global() -> Arc<Pool> {
    GLOBAL_POOL.get_or_init(|| Arc::new(Pool::new())).clone()
}

/// Zeroises the global pool's memory. Call this on process shutdown if the
/// global pool was ever used.
pub fn shutdown_global() {
    if let Some(pool) = GLOBAL_POOL.get() {
        pool.shutdown();
    }
}

/// A uniquely-owned handle to exactly `len` bytes of zero-on-release memory.
///
/// `SensitiveBuffer` has no `Clone` impl: ownership is unique and transfer
/// is explicit, matching the data model's "no sharing" rule. Reading or
/// writing the bytes always goes through a closure (`with_bytes` /
/// `with_bytes_mut`) because the backing storage lives behind the owning
/// slab's lock; there is no outstanding borrow to hold across calls.
pub struct SensitiveBuffer {
    slab: Arc<Slab>,
    cell: Option<CellRef>,
    len: usize,
}

impl SensitiveBuffer {
    /// The number of bytes this buffer owns. This is plain metadata, not a
    /// read of the buffer's content, and unlike content access it never
    /// fails — construction guarantees a buffer always has a length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// A rented buffer is never empty: `rent(0)` is rejected at the pool.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Runs `f` with read access to the buffer's bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if the buffer has already
    /// been released (unreachable through the owned `SensitiveBuffer` API
    /// itself, since `release` consumes `self`, but kept as a defensive
    /// check for future internal callers).
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> TpmResult<R> {
        let cell = self.cell.ok_or_else(|| TpmCoreError::Precondition {
            context: "read of released sensitive buffer".to_string(),
        })?;
        let data = self.slab.data.lock();
        Ok(f(data.cell_slice(cell)))
    }

    /// Runs `f` with mutable access to the buffer's bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if the buffer has already
    /// been released.
    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> TpmResult<R> {
        let cell = self.cell.ok_or_else(|| TpmCoreError::Precondition {
            context: "write to released sensitive buffer".to_string(),
        })?;
        let mut data = self.slab.data.lock();
        Ok(f(data.cell_slice_mut(cell)))
    }

    /// Copies the buffer's content into a plain `Vec<u8>`.
    ///
    /// This escapes the pool's zeroisation guarantee and must only be used
    /// at the boundary where the bytes are about to leave the process's
    /// control anyway (e.g. handing a freshly-generated random buffer back
    /// to an external caller). Session-internal code never calls this for
    /// `sessionKey` or `authValue`.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if the buffer has already
    /// been released.
    pub fn to_vec(&self) -> TpmResult<Vec<u8>> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Explicitly releases the buffer: zeroises it and returns the cell to
    /// its slab. Consuming `self` by value makes "double release" and
    /// "access after release" unrepresentable at the type level, which is
    /// a strictly stronger guarantee than the reference design's runtime
    /// check (see `DESIGN.md`).
    ///
    /// # Errors
    ///
    /// Propagates [`TpmCoreError::Precondition`] from the underlying slab,
    /// which can only occur if pool-internal bookkeeping has already been
    /// violated.
    pub fn release(mut self) -> TpmResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> TpmResult<()> {
        if let Some(cell) = self.cell.take() {
            self.slab.release(cell)
        } else {
            Ok(())
        }
    }
}

impl Drop for SensitiveBuffer {
    fn drop(&mut self) {
        // Best-effort: a buffer that reaches here without having been
        // explicitly released (the common case) must still be zeroised,
        // including on an unwinding panic.
        let _ = self.release_inner();
    }
}

impl std::fmt::Debug for SensitiveBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensitiveBuffer")
            .field("len", &self.len)
            .field("released", &self.cell.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_size_rent() {
        let pool = Pool::new();
        for n in [1usize, 2, 16, 20, 32, 48, 64, 100] {
            let buf = pool.rent(n).unwrap();
            assert_eq!(buf.len(), n);
        }
    }

    #[test]
    fn zero_length_rent_is_precondition_error() {
        let pool = Pool::new();
        let err = pool.rent(0).unwrap_err();
        assert!(matches!(err, TpmCoreError::Precondition { .. }));
    }

    #[test]
    fn release_zeroises_before_reuse() {
        let pool = Pool::new();
        let mut buf = pool.rent(8).unwrap();
        buf.with_bytes_mut(|b| b.copy_from_slice(&[0xAA; 8])).unwrap();
        buf.release().unwrap();

        let reused = pool.rent(8).unwrap();
        let bytes = reused.to_vec().unwrap();
        assert_eq!(bytes, vec![0u8; 8]);
    }

    #[test]
    fn access_after_release_is_a_type_error_not_a_runtime_one() {
        let pool = Pool::new();
        let buf = pool.rent(4).unwrap();
        // `release` takes `self` by value: `buf` cannot be read afterwards,
        // enforced by the borrow checker. We only assert the release itself
        // succeeds here.
        buf.release().unwrap();
    }

    #[test]
    fn rent_copy_matches_input() {
        let pool = Pool::new();
        let buf = pool.rent_copy(b"hunter2").unwrap();
        assert_eq!(buf.to_vec().unwrap(), b"hunter2");
    }

    #[test]
    fn slab_grows_past_initial_capacity() {
        let pool = Pool::new();
        let mut bufs = Vec::new();
        for _ in 0..(INITIAL_SLAB_CAPACITY * 2 + 1) {
            bufs.push(pool.rent(32).unwrap());
        }
        assert_eq!(bufs.len(), INITIAL_SLAB_CAPACITY * 2 + 1);
        for buf in &bufs {
            assert_eq!(buf.len(), 32);
        }
    }

    #[test]
    fn concurrent_rent_release_never_misbehaves() {
        use std::thread;

        let pool = Arc::new(Pool::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let mut buf = pool.rent(24).unwrap();
                    assert_eq!(buf.len(), 24);
                    buf.with_bytes_mut(|b| b.fill(0x42)).unwrap();
                    buf.release().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
