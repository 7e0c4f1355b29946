//! Per-instance VM memory: globals plus pooled arrays.
//!
//! A [`MemoryContext`] is created by a factory that validates the three
//! size parameters against the compile-time maxima and zero-initializes
//! all storage. Arrays are ranges carved out of a single backing pool by
//! a bump watermark; descriptors map array ids to their range. There is
//! no per-array free: [`MemoryContext::reset`] is the only way to reclaim
//! pool space, and the pool is never compacted within a session.
//!
//! Every rejected operation leaves the context byte-for-byte unchanged.
//! Storage is zeroed again on drop so no user data survives teardown.

use crate::config::{A_MAX, E_MAX, G_MAX, POOL_SLOTS};
use crate::error::{ConfigError, VmError};

/// Metadata for one array id.
#[derive(Debug, Clone, Copy, Default)]
struct ArrayDescriptor {
    /// First pool slot of the array's range.
    offset: u16,
    /// Element count, `1..=E_MAX` while active.
    len: u16,
    /// Whether the id is allocated.
    active: bool,
}

/// Statically sized storage exclusively owned by one VM instance.
#[derive(Debug)]
pub struct MemoryContext {
    globals: [i32; G_MAX],
    pool: [i32; POOL_SLOTS],
    descriptors: [ArrayDescriptor; A_MAX],
    /// Validated instance limits (each ≤ its compile-time maximum).
    g_limit: usize,
    a_limit: usize,
    e_limit: usize,
    /// Highest-used global + 1. Diagnostics only.
    global_count: usize,
    /// Pool slots handed out. Monotonic within a context lifetime.
    watermark: usize,
}

impl MemoryContext {
    /// Creates a zeroed context with validated instance limits.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when any parameter is zero or exceeds
    /// its compile-time maximum (`G_MAX`, `A_MAX`, `E_MAX`).
    pub fn create(
        g_size: usize,
        a_size: usize,
        a_elems: usize,
    ) -> Result<Self, ConfigError> {
        if g_size == 0 || g_size > G_MAX {
            return Err(ConfigError::GlobalCount);
        }
        if a_size == 0 || a_size > A_MAX {
            return Err(ConfigError::ArrayCount);
        }
        if a_elems == 0 || a_elems > E_MAX {
            return Err(ConfigError::ElementCount);
        }
        Ok(Self {
            globals: [0; G_MAX],
            pool: [0; POOL_SLOTS],
            descriptors: [ArrayDescriptor::default(); A_MAX],
            g_limit: g_size,
            a_limit: a_size,
            e_limit: a_elems,
            global_count: 0,
            watermark: 0,
        })
    }

    /// Pool capacity of this instance (limits, not compile-time maxima).
    fn pool_limit(&self) -> usize {
        self.a_limit * self.e_limit
    }

    /// Zeroes globals and handed-out pool slots, clears descriptors and
    /// the watermark. Instance limits are unchanged.
    pub fn reset(&mut self) {
        self.globals = [0; G_MAX];
        for slot in &mut self.pool[..self.watermark] {
            *slot = 0;
        }
        self.descriptors = [ArrayDescriptor::default(); A_MAX];
        self.global_count = 0;
        self.watermark = 0;
    }

    // -----------------------------------------------------------------
    // Globals
    // -----------------------------------------------------------------

    /// Reads global `id`, or `None` outside the instance limit.
    #[must_use]
    pub fn load_global(&self, id: usize) -> Option<i32> {
        if id >= self.g_limit {
            return None;
        }
        Some(self.globals[id])
    }

    /// Writes global `id`.
    ///
    /// # Errors
    ///
    /// `MemoryBounds` outside the instance limit.
    pub fn store_global(&mut self, id: usize, value: i32) -> Result<(), VmError> {
        if id >= self.g_limit {
            return Err(VmError::MemoryBounds);
        }
        self.globals[id] = value;
        if id + 1 > self.global_count {
            self.global_count = id + 1;
        }
        Ok(())
    }

    /// Highest-used global + 1. Diagnostics only.
    #[must_use]
    pub fn global_count(&self) -> usize {
        self.global_count
    }

    // -----------------------------------------------------------------
    // Arrays
    // -----------------------------------------------------------------

    /// Allocates array `id` with `len` elements from the pool.
    ///
    /// The range starts at the current watermark; elements were zeroed at
    /// creation/reset and stay zeroed until stored to.
    ///
    /// # Errors
    ///
    /// `MemoryBounds` when `id` is outside the instance limit, `len` is
    /// zero or above the per-array limit, the id is already active, or
    /// the pool would overflow.
    pub fn create_array(&mut self, id: usize, len: usize) -> Result<(), VmError> {
        if id >= self.a_limit {
            return Err(VmError::MemoryBounds);
        }
        if len == 0 || len > self.e_limit {
            return Err(VmError::MemoryBounds);
        }
        if self.descriptors[id].active {
            // No double allocation; reset is the only reclaim path.
            return Err(VmError::MemoryBounds);
        }
        if self.watermark + len > self.pool_limit() {
            return Err(VmError::MemoryBounds);
        }

        self.descriptors[id] = ArrayDescriptor {
            offset: self.watermark as u16,
            len: len as u16,
            active: true,
        };
        self.watermark += len;
        Ok(())
    }

    /// Reads element `idx` of array `id`.
    ///
    /// # Errors
    ///
    /// `MemoryBounds` when the array is inactive or `idx` is past its
    /// length.
    pub fn load_array(&self, id: usize, idx: usize) -> Result<i32, VmError> {
        let (offset, len) = self.active_range(id)?;
        if idx >= len {
            return Err(VmError::MemoryBounds);
        }
        Ok(self.pool[offset + idx])
    }

    /// Writes element `idx` of array `id`.
    ///
    /// # Errors
    ///
    /// Same bounds discipline as [`load_array`](Self::load_array).
    pub fn store_array(&mut self, id: usize, idx: usize, value: i32) -> Result<(), VmError> {
        let (offset, len) = self.active_range(id)?;
        if idx >= len {
            return Err(VmError::MemoryBounds);
        }
        self.pool[offset + idx] = value;
        Ok(())
    }

    /// Pool slots handed out so far.
    #[must_use]
    pub fn pool_watermark(&self) -> usize {
        self.watermark
    }

    fn active_range(&self, id: usize) -> Result<(usize, usize), VmError> {
        if id >= self.a_limit {
            return Err(VmError::MemoryBounds);
        }
        let desc = &self.descriptors[id];
        if !desc.active {
            return Err(VmError::MemoryBounds);
        }
        debug_assert!(
            desc.offset as usize + desc.len as usize <= self.watermark,
            "descriptor range beyond watermark"
        );
        Ok((desc.offset as usize, desc.len as usize))
    }

    /// Zeroes a slice through volatile writes so teardown scrubbing is
    /// not elided.
    fn scrub(slice: &mut [i32]) {
        for slot in slice {
            // SAFETY: `slot` is a valid, exclusive reference.
            unsafe { core::ptr::write_volatile(slot, 0) };
        }
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        Self::scrub(&mut self.globals);
        Self::scrub(&mut self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MemoryContext {
        MemoryContext::create(8, 4, 16).unwrap()
    }

    // --- factory -----------------------------------------------------

    #[test]
    fn create_validates_sizes() {
        assert!(MemoryContext::create(G_MAX, A_MAX, E_MAX).is_ok());
        assert_eq!(
            MemoryContext::create(0, 4, 16).unwrap_err(),
            ConfigError::GlobalCount
        );
        assert_eq!(
            MemoryContext::create(G_MAX + 1, 4, 16).unwrap_err(),
            ConfigError::GlobalCount
        );
        assert_eq!(
            MemoryContext::create(8, 0, 16).unwrap_err(),
            ConfigError::ArrayCount
        );
        assert_eq!(
            MemoryContext::create(8, A_MAX + 1, 16).unwrap_err(),
            ConfigError::ArrayCount
        );
        assert_eq!(
            MemoryContext::create(8, 4, 0).unwrap_err(),
            ConfigError::ElementCount
        );
        assert_eq!(
            MemoryContext::create(8, 4, E_MAX + 1).unwrap_err(),
            ConfigError::ElementCount
        );
    }

    #[test]
    fn fresh_context_is_zeroed() {
        let c = ctx();
        for id in 0..8 {
            assert_eq!(c.load_global(id), Some(0));
        }
        assert_eq!(c.global_count(), 0);
        assert_eq!(c.pool_watermark(), 0);
    }

    // --- globals -----------------------------------------------------

    #[test]
    fn global_store_load() {
        let mut c = ctx();
        c.store_global(3, -77).unwrap();
        assert_eq!(c.load_global(3), Some(-77));
        assert_eq!(c.global_count(), 4);
    }

    #[test]
    fn global_bounds() {
        let mut c = ctx();
        assert_eq!(c.load_global(8), None);
        assert_eq!(c.store_global(8, 1).unwrap_err(), VmError::MemoryBounds);
        // Rejected store left everything untouched.
        assert_eq!(c.global_count(), 0);
    }

    // --- arrays ------------------------------------------------------

    #[test]
    fn array_create_and_access() {
        let mut c = ctx();
        c.create_array(0, 10).unwrap();
        assert_eq!(c.pool_watermark(), 10);
        assert_eq!(c.load_array(0, 9).unwrap(), 0);
        c.store_array(0, 9, 42).unwrap();
        assert_eq!(c.load_array(0, 9).unwrap(), 42);
    }

    #[test]
    fn arrays_never_overlap() {
        let mut c = ctx();
        c.create_array(0, 5).unwrap();
        c.create_array(1, 5).unwrap();
        for i in 0..5 {
            c.store_array(0, i, 1).unwrap();
            c.store_array(1, i, 2).unwrap();
        }
        for i in 0..5 {
            assert_eq!(c.load_array(0, i).unwrap(), 1);
            assert_eq!(c.load_array(1, i).unwrap(), 2);
        }
    }

    #[test]
    fn array_len_limits() {
        let mut c = ctx();
        // Per-array limit is the validated e_limit (16 here).
        c.create_array(0, 16).unwrap();
        assert_eq!(c.create_array(1, 17).unwrap_err(), VmError::MemoryBounds);
        assert_eq!(c.create_array(1, 0).unwrap_err(), VmError::MemoryBounds);
    }

    #[test]
    fn array_len_limits_at_compile_time_maxima() {
        let mut c = MemoryContext::create(G_MAX, A_MAX, E_MAX).unwrap();
        c.create_array(0, E_MAX).unwrap();
        assert_eq!(
            c.create_array(1, E_MAX + 1).unwrap_err(),
            VmError::MemoryBounds
        );
    }

    #[test]
    fn array_double_allocation_rejected() {
        let mut c = ctx();
        c.create_array(2, 4).unwrap();
        assert_eq!(c.create_array(2, 4).unwrap_err(), VmError::MemoryBounds);
        assert_eq!(c.pool_watermark(), 4);
    }

    #[test]
    fn array_pool_exhaustion() {
        let mut c = ctx();
        // Pool limit is 4 * 16 = 64 slots.
        for id in 0..4 {
            c.create_array(id, 16).unwrap();
        }
        assert_eq!(c.pool_watermark(), 64);
        // All ids used AND pool full; either check rejects.
        assert_eq!(c.create_array(3, 1).unwrap_err(), VmError::MemoryBounds);
    }

    #[test]
    fn array_index_bounds() {
        let mut c = ctx();
        c.create_array(0, 4).unwrap();
        assert_eq!(c.load_array(0, 4).unwrap_err(), VmError::MemoryBounds);
        assert_eq!(c.store_array(0, 4, 1).unwrap_err(), VmError::MemoryBounds);
        assert_eq!(c.load_array(1, 0).unwrap_err(), VmError::MemoryBounds);
        assert_eq!(c.load_array(4, 0).unwrap_err(), VmError::MemoryBounds);
    }

    // --- reset -------------------------------------------------------

    #[test]
    fn reset_reclaims_everything() {
        let mut c = ctx();
        c.store_global(2, 9).unwrap();
        c.create_array(0, 16).unwrap();
        c.store_array(0, 0, 7).unwrap();

        c.reset();

        assert_eq!(c.load_global(2), Some(0));
        assert_eq!(c.global_count(), 0);
        assert_eq!(c.pool_watermark(), 0);
        assert_eq!(c.load_array(0, 0).unwrap_err(), VmError::MemoryBounds);

        // Pool space is reusable and zeroed.
        c.create_array(0, 16).unwrap();
        assert_eq!(c.load_array(0, 0).unwrap(), 0);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut c = ctx();
        c.store_global(0, 5).unwrap();
        c.reset();
        c.reset();
        assert_eq!(c.load_global(0), Some(0));
        assert_eq!(c.pool_watermark(), 0);
    }
}
