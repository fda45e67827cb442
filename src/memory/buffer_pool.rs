//! Suballocating memory pool backing every transient allocation in the engine.
//!
//! Allocations are grouped into power-of-two size classes. Each class carves
//! fixed-size suballocations out of larger blocks pulled from the global
//! allocator, so a take/return pair in the steady state touches no allocator
//! at all. That matters here: the maintenance pass takes and returns a dozen
//! scratch buffers every frame.

use super::buffer::Buffer;
use super::id_pool::IdPool;
use std::alloc::{self, Layout};
use std::mem::size_of;
use std::ptr;

/// Byte alignment of every block allocation. Applies at block granularity
/// only, so a generous value costs almost nothing.
pub const BLOCK_ALIGNMENT: usize = 128;

/// Largest supported suballocation: 2^30 bytes.
const MAXIMUM_POWER: i32 = 30;

/// Bit position where the size-class power is packed into a buffer id.
const ID_POWER_SHIFT: i32 = 26;

/// Smallest power of two with at least `count` bytes, as an exponent.
#[inline(always)]
pub fn containing_power_of_2(count: i32) -> i32 {
    debug_assert!(count >= 0);
    let count = (count.max(1)) as u32;
    (32 - (count - 1).leading_zeros()) as i32
}

/// One power-of-two size class.
struct PowerPool {
    blocks: Vec<*mut u8>,
    slots: IdPool,
    suballocations_per_block_shift: i32,
    suballocations_per_block_mask: i32,
    power: i32,
    suballocation_size: i32,
    block_size: i32,
    block_count: i32,

    #[cfg(debug_assertions)]
    outstanding_ids: std::collections::HashSet<i32>,
}

impl PowerPool {
    fn new(power: i32, minimum_block_size: i32) -> Self {
        let suballocation_size = 1 << power;
        let block_size = suballocation_size.max(minimum_block_size);
        let suballocations_per_block = block_size / suballocation_size;
        let suballocations_per_block_shift = containing_power_of_2(suballocations_per_block);
        Self {
            blocks: Vec::new(),
            slots: IdPool::new(0),
            suballocations_per_block_shift,
            suballocations_per_block_mask: (1 << suballocations_per_block_shift) - 1,
            power,
            suballocation_size,
            block_size,
            block_count: 0,

            #[cfg(debug_assertions)]
            outstanding_ids: std::collections::HashSet::new(),
        }
    }

    unsafe fn allocate_block(&mut self, block_index: i32) {
        debug_assert!(
            self.blocks[block_index as usize].is_null(),
            "Block must not already be allocated."
        );
        let layout = Layout::from_size_align(self.block_size as usize, BLOCK_ALIGNMENT)
            .expect("Invalid block layout");
        let ptr = alloc::alloc(layout);
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        self.blocks[block_index as usize] = ptr;
        self.block_count = self.block_count.max(block_index + 1);
    }

    fn take(&mut self) -> Buffer<u8> {
        let slot = self.slots.take();
        let block_index = slot >> self.suballocations_per_block_shift;
        if block_index as usize >= self.blocks.len() {
            let new_len = ((block_index + 1) as u32).next_power_of_two() as usize;
            self.blocks.resize(new_len, ptr::null_mut());
        }
        if block_index >= self.block_count || self.blocks[block_index as usize].is_null() {
            unsafe {
                self.allocate_block(block_index);
            }
        }
        let index_in_block = slot & self.suballocations_per_block_mask;
        let ptr = unsafe {
            self.blocks[block_index as usize].add((index_in_block * self.suballocation_size) as usize)
        };
        let id = (self.power << ID_POWER_SHIFT) | slot;
        debug_assert!(slot < (1 << ID_POWER_SHIFT), "Slot index overflowed the id encoding.");

        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.outstanding_ids.insert(slot),
                "The same slot must never be handed out twice."
            );
        }

        unsafe { Buffer::new(ptr, self.suballocation_size, id) }
    }

    fn return_slot(&mut self, slot: i32) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.outstanding_ids.remove(&slot),
                "Returned buffer id must have been taken from this pool."
            );
        }
        self.slots.return_id(slot);
    }

    fn clear(&mut self) {
        #[cfg(debug_assertions)]
        self.outstanding_ids.clear();

        for block in &mut self.blocks {
            if !block.is_null() {
                unsafe {
                    let layout = Layout::from_size_align(self.block_size as usize, BLOCK_ALIGNMENT)
                        .expect("Invalid block layout");
                    alloc::dealloc(*block, layout);
                }
                *block = ptr::null_mut();
            }
        }
        self.slots.clear();
        self.block_count = 0;
    }
}

/// Power-of-two suballocating pool.
pub struct BufferPool {
    pools: Vec<PowerPool>,
}

impl BufferPool {
    /// Creates a pool whose blocks are at least `minimum_block_allocation_size`
    /// bytes. Must be a power of two; classes with larger suballocations use
    /// one suballocation per block.
    pub fn new(minimum_block_allocation_size: i32) -> Self {
        debug_assert!(
            minimum_block_allocation_size > 0
                && (minimum_block_allocation_size & (minimum_block_allocation_size - 1)) == 0,
            "Block allocation size must be a power of 2."
        );
        let pools = (0..=MAXIMUM_POWER)
            .map(|power| PowerPool::new(power, minimum_block_allocation_size))
            .collect();
        Self { pools }
    }

    pub fn new_default() -> Self {
        Self::new(131072)
    }

    /// Takes a buffer with capacity for at least `count` elements. The
    /// returned length may exceed the request.
    #[inline(always)]
    pub fn take_at_least<T>(&mut self, count: i32) -> Buffer<T> {
        // Zero-length requests still get a real allocation; a null buffer
        // can't be distinguished from a never-allocated one.
        let count = count.max(1);
        let power = containing_power_of_2(count * size_of::<T>() as i32);
        debug_assert!(power <= MAXIMUM_POWER);
        self.pools[power as usize].take().cast()
    }

    /// Takes a buffer exposing exactly `count` elements.
    #[inline(always)]
    pub fn take<T>(&mut self, count: i32) -> Buffer<T> {
        let mut buffer = self.take_at_least(count);
        buffer.set_length(count);
        buffer
    }

    #[inline(always)]
    fn decompose_id(buffer_id: i32) -> (i32, i32) {
        (buffer_id >> ID_POWER_SHIFT, buffer_id & ((1 << ID_POWER_SHIFT) - 1))
    }

    /// Returns a buffer's memory to the pool by id alone.
    #[inline(always)]
    pub fn return_unsafely(&mut self, id: i32) {
        let (power, slot) = Self::decompose_id(id);
        self.pools[power as usize].return_slot(slot);
    }

    /// Returns a buffer to the pool and clears the reference.
    #[inline(always)]
    pub fn return_buffer<T>(&mut self, buffer: &mut Buffer<T>) {
        debug_assert!(buffer.allocated(), "Can't return an unallocated buffer.");
        self.return_unsafely(buffer.id());
        *buffer = Buffer::default();
    }

    /// Grows a buffer to at least `target_size` elements, preserving the
    /// first `copy_count`. Never shrinks an allocation.
    pub fn resize_to_at_least<T: Copy>(&mut self, buffer: &mut Buffer<T>, target_size: i32, copy_count: i32) {
        debug_assert!(copy_count <= target_size && copy_count <= buffer.len());
        let target_size = Self::get_capacity_for_count::<T>(target_size);
        if !buffer.allocated() {
            *buffer = self.take_at_least(target_size);
        } else {
            let allocated_bytes = 1 << (buffer.id() >> ID_POWER_SHIFT);
            let allocated_size = allocated_bytes / size_of::<T>() as i32;
            if target_size > allocated_size {
                let mut new_buffer: Buffer<T> = self.take_at_least(target_size);
                buffer.copy_to(0, &mut new_buffer, 0, copy_count);
                self.return_unsafely(buffer.id());
                *buffer = new_buffer;
            } else {
                // The existing allocation already covers the target; expose it.
                buffer.set_length(allocated_size);
            }
        }
    }

    /// Element capacity the pool would actually grant for a request of `count`.
    #[inline(always)]
    pub fn get_capacity_for_count<T>(count: i32) -> i32 {
        let count = count.max(1);
        let byte_count = (count as u32 * size_of::<T>() as u32).next_power_of_two();
        (byte_count / size_of::<T>() as u32) as i32
    }

    /// Total bytes held from the global allocator.
    pub fn get_total_allocated_byte_count(&self) -> u64 {
        self.pools
            .iter()
            .map(|p| p.block_count as u64 * p.block_size as u64)
            .sum()
    }

    /// Debug check that every taken buffer has been returned.
    #[cfg(debug_assertions)]
    pub fn assert_empty(&self) {
        for (power, pool) in self.pools.iter().enumerate() {
            assert!(
                pool.outstanding_ids.is_empty(),
                "Power pool {power} still has {} outstanding allocations.",
                pool.outstanding_ids.len()
            );
        }
    }

    /// Releases all blocks back to the global allocator. Outstanding buffers
    /// are silently invalidated; the pool remains usable.
    pub fn clear(&mut self) {
        for pool in &mut self.pools {
            pool.clear();
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.clear();
    }
}

unsafe impl Send for BufferPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_helper() {
        assert_eq!(containing_power_of_2(1), 0);
        assert_eq!(containing_power_of_2(2), 1);
        assert_eq!(containing_power_of_2(3), 2);
        assert_eq!(containing_power_of_2(1024), 10);
        assert_eq!(containing_power_of_2(1025), 11);
    }

    #[test]
    fn take_round_trips() {
        let mut pool = BufferPool::new(4096);
        let mut buffer: Buffer<u64> = pool.take(100);
        assert_eq!(buffer.len(), 100);
        for i in 0..100 {
            *buffer.get_mut(i) = i as u64 * 3;
        }
        assert_eq!(*buffer.get(99), 297);
        pool.return_buffer(&mut buffer);
        assert!(!buffer.allocated());
        #[cfg(debug_assertions)]
        pool.assert_empty();
    }

    #[test]
    fn resize_preserves_contents() {
        let mut pool = BufferPool::new(4096);
        let mut buffer: Buffer<i32> = pool.take(8);
        for i in 0..8 {
            *buffer.get_mut(i) = i;
        }
        pool.resize_to_at_least(&mut buffer, 5000, 8);
        assert!(buffer.len() >= 5000);
        for i in 0..8 {
            assert_eq!(*buffer.get(i), i);
        }
        pool.return_buffer(&mut buffer);
    }

    #[test]
    fn same_class_reuses_slots() {
        let mut pool = BufferPool::new(4096);
        let mut a: Buffer<u8> = pool.take(100);
        let first_ptr = a.as_ptr();
        pool.return_buffer(&mut a);
        let mut b: Buffer<u8> = pool.take(100);
        assert_eq!(first_ptr, b.as_ptr());
        pool.return_buffer(&mut b);
    }
}
