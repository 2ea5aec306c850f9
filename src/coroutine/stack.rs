use std::hint::black_box;
use std::mem::{self, MaybeUninit};
use std::ptr;

use more_asserts::{assert_le, debug_assert_le};

use super::context::Context;
use crate::error::AllocError;

// Sized to allow approximately 200 nested calls with a few words of overhead per call.
const GROW_THRESHOLD: usize = 1024;

const PADDING_WORDS: usize = 64;
const PADDING_BYTES: usize = PADDING_WORDS * mem::size_of::<usize>();

// Distance kept between restored bytes and the frame doing the restoration.
const RESTORE_MARGIN: usize = 4 * PADDING_BYTES;

/// Thresholds to grow and shrink saved stack buffers.
///
/// A buffer holding `size` live bytes is left alone as long as its headroom, that is capacity minus
/// `size`, stays within `[grow, shrink]`. Otherwise it is reallocated to `size + adjustment` bytes.
/// The distinct thresholds keep oscillating call depth from reallocating on every switch.
///
/// It defaults to `1024` bytes to grow, `size_of::<usize>() * 1024` bytes as initial buffer size
/// and adjustment, and twice of initial buffer size to shrink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Thresholds {
    grow: usize,
    shrink: usize,
    default_size: usize,
    adjustment: usize,
}

impl Default for Thresholds {
    fn default() -> Thresholds {
        let default_size = mem::size_of::<usize>() * GROW_THRESHOLD;
        Thresholds { grow: GROW_THRESHOLD, shrink: 2 * default_size, default_size, adjustment: default_size }
    }
}

impl Thresholds {
    pub(crate) fn new(grow: usize, shrink: usize, default_size: usize, adjustment: usize) -> Thresholds {
        assert!(default_size > 0, "default size must not be zero");
        assert!(grow <= adjustment, "adjustment {} is less than grow threshold {}", adjustment, grow);
        assert!(adjustment < shrink, "adjustment {} is no less than shrink threshold {}", adjustment, shrink);
        Thresholds { grow, shrink, default_size, adjustment }
    }

    /// Minimum headroom before growing.
    pub fn grow(&self) -> usize {
        self.grow
    }

    /// Maximum headroom before shrinking.
    pub fn shrink(&self) -> usize {
        self.shrink
    }

    /// Initial capacity of saved stack buffers.
    pub fn default_size(&self) -> usize {
        self.default_size
    }

    /// Headroom given to reallocated buffers.
    pub fn adjustment(&self) -> usize {
        self.adjustment
    }

    /// Returns new capacity if `capacity` is out of comfortable band for `size` live bytes.
    pub fn resize(&self, capacity: usize, size: usize) -> Option<usize> {
        match capacity.checked_sub(size) {
            Some(headroom) if headroom >= self.grow && headroom <= self.shrink => None,
            _ => Some(size + self.adjustment),
        }
    }
}

/// Heap copy of stack bytes of a suspended coroutine.
pub(crate) struct SavedStack {
    bytes: Vec<MaybeUninit<u8>>,
    used: usize,
}

impl SavedStack {
    fn alloc(capacity: usize) -> Result<Vec<MaybeUninit<u8>>, AllocError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).map_err(|err| AllocError::new(capacity, err))?;
        // SAFETY: MaybeUninit requires no initialization.
        unsafe { bytes.set_len(capacity) };
        Ok(bytes)
    }

    pub fn with_capacity(capacity: usize) -> Result<SavedStack, AllocError> {
        Ok(SavedStack { bytes: Self::alloc(capacity)?, used: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Reallocates if capacity is out of comfortable band for `size` bytes.
    ///
    /// Saved bytes are dropped on reallocation. Returns whether reallocation happened.
    pub fn fit(&mut self, thresholds: &Thresholds, size: usize) -> Result<bool, AllocError> {
        let Some(capacity) = thresholds.resize(self.capacity(), size) else {
            return Ok(false);
        };
        self.bytes = Self::alloc(capacity)?;
        self.used = 0;
        Ok(true)
    }

    /// Deep copies saved bytes into a buffer of same capacity.
    pub fn try_clone(&self) -> Result<SavedStack, AllocError> {
        let mut bytes = Self::alloc(self.capacity())?;
        bytes[..self.used].copy_from_slice(&self.bytes[..self.used]);
        Ok(SavedStack { bytes, used: self.used })
    }

    unsafe fn copy_from(&mut self, start: *const u8, size: usize) {
        debug_assert_le!(size, self.capacity());
        ptr::copy_nonoverlapping(start, self.bytes.as_mut_ptr() as *mut u8, size);
        self.used = size;
    }

    unsafe fn copy_to(&self, start: *mut u8) {
        ptr::copy_nonoverlapping(self.bytes.as_ptr() as *const u8, start, self.used);
    }
}

/// Stack anchor of a thread. All coroutines of that thread live between it and stack pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Anchor {
    base: usize,
    grows_up: bool,
}

impl Anchor {
    pub fn new(base: usize, grows_up: bool) -> Anchor {
        Anchor { base, grows_up }
    }

    /// Number of bytes between anchor and `mark`.
    pub fn depth(&self, mark: usize) -> usize {
        if self.grows_up {
            mark.saturating_sub(self.base)
        } else {
            self.base.saturating_sub(mark)
        }
    }

    /// Depth of caller's frame.
    #[inline(never)]
    pub fn depth_here(&self) -> usize {
        let mark = 0u8;
        self.depth(black_box(&mark) as *const u8 as usize)
    }

    /// Lowest address of `size` bytes adjacent to anchor.
    fn start(&self, size: usize) -> usize {
        if self.grows_up {
            self.base
        } else {
            self.base - size
        }
    }

    fn floor(&self, size: usize) -> usize {
        if self.grows_up {
            self.base + size + RESTORE_MARGIN
        } else {
            self.base - size - RESTORE_MARGIN
        }
    }

    fn passed(&self, here: usize, floor: usize) -> bool {
        if self.grows_up {
            here > floor
        } else {
            here < floor
        }
    }

    /// Copies stack bytes between anchor and caller's frame to `stack`, resizing it on demand.
    ///
    /// Returns whether `stack` was reallocated.
    ///
    /// # Safety
    /// Caller must run on stack of this anchor.
    #[inline(never)]
    pub unsafe fn save(&self, stack: &mut SavedStack, thresholds: &Thresholds) -> Result<bool, AllocError> {
        let mark = 0u8;
        let mark = black_box(&mark) as *const u8 as usize;
        let size = self.depth(mark);
        let reallocated = stack.fit(thresholds, size)?;
        stack.copy_from(self.start(size) as *const u8, size);
        Ok(reallocated)
    }

    /// Puts bytes of `stack` back to where they were saved and resumes `context`.
    ///
    /// Restoration runs from frames beyond the restored range, so it never overwrites itself.
    ///
    /// # Safety
    /// `stack` must be saved by this anchor and `context` must be captured inside saved frames.
    pub unsafe fn restore(self, stack: *const SavedStack, context: *const Context) -> ! {
        let here = 0u8;
        let here = black_box(&here) as *const u8 as usize;
        let floor = self.floor((*stack).used());
        let steps = if self.passed(here, floor) { 1 } else { here.abs_diff(floor) / PADDING_BYTES + 2 };
        descend(self, stack, context, floor, steps);
        crate::fatal!("stack restoration returns");
    }
}

// Consumes stack frame by frame until current frame passes `floor`. Frames are at least
// `PADDING_BYTES` large, so `steps` bounds the depth.
#[inline(never)]
unsafe fn descend(anchor: Anchor, stack: *const SavedStack, context: *const Context, floor: usize, steps: usize) {
    let padding = [MaybeUninit::<usize>::uninit(); PADDING_WORDS];
    let here = black_box(padding.as_ptr()) as usize;
    if anchor.passed(here, floor) {
        let stack = &*stack;
        stack.copy_to(anchor.start(stack.used()) as *mut u8);
        (*context).resume();
    }
    if steps == 0 {
        crate::fatal!("stack restoration fails to reach {:#x} from {:#x}", floor, here);
    }
    descend(anchor, stack, context, floor, steps - 1);
    black_box(&padding);
}
