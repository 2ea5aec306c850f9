use std::cell::Cell;
use std::sync::atomic::{compiler_fence, Ordering};
use std::{mem, ptr, slice};

use super::probe::Layout;

#[allow(improper_ctypes)] // suppress "`extern` block uses type `u128`, which is not FFI-safe"
extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn setcontext(ucp: *const libc::ucontext_t) -> libc::c_int;
}

thread_local! {
    // Set right before jumping so the capture site can tell replay from first return. It must live
    // outside of stack as stack bytes are swapped underneath capture site.
    static RESUMING: Cell<bool> = const { Cell::new(false) };
}

/// Machine snapshot sufficient to resume execution at a capture site.
///
/// It holds registers, program counter and stack pointer, but not stack memory.
#[repr(C, align(16))]
pub(crate) struct Context {
    context: libc::ucontext_t,
    // macOS and its siblings embed mcontext inside ucontext while libc crate did not include them.
    // See following links for details.
    //
    // * https://github.com/rust-lang/libc/issues/2812
    // * https://github.com/rust-lang/libc/pull/2817
    // * https://github.com/rust-lang/libc/pull/3312
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
    _mcontext: libc::__darwin_mcontext64,
}

unsafe impl Sync for Context {}

impl Context {
    // Box Context as ucontext could carry pointers to itself, it must not move once captured.
    pub fn empty() -> Box<Context> {
        // SAFETY: Context is plain old data, all zero is a valid "never captured" state.
        unsafe { Box::<Context>::new_zeroed().assume_init() }
    }

    /// Captures current machine state.
    ///
    /// Returns `false` on the capture itself, and `true` each time [Context::resume] brings control
    /// back to this capture site.
    ///
    /// # Safety
    /// Caller's frame must stay intact, either live or restored byte by byte, for resumption.
    #[inline(always)]
    pub unsafe fn capture(&mut self) -> bool {
        RESUMING.with(|resuming| resuming.set(false));
        compiler_fence(Ordering::SeqCst);
        let rc = getcontext(&mut self.context);
        compiler_fence(Ordering::SeqCst);
        if rc != 0 {
            crate::fatal!("getcontext returns {}, got errno {}", rc, errno::errno());
        }
        RESUMING.with(|resuming| resuming.replace(false))
    }

    /// Jumps to capture site of this context, making its [Context::capture] return `true`.
    ///
    /// # Safety
    /// Stack bytes of capture site must be in place.
    pub unsafe fn resume(&self) -> ! {
        RESUMING.with(|resuming| resuming.set(true));
        compiler_fence(Ordering::SeqCst);
        let rc = setcontext(&self.context);
        crate::fatal!("setcontext returns {}, got errno {}", rc, errno::errno());
    }

    pub fn address(&self) -> usize {
        self as *const Context as usize
    }

    pub fn words(&self) -> &[usize] {
        let n = mem::size_of::<Context>() / mem::size_of::<usize>();
        unsafe { slice::from_raw_parts(self as *const Context as *const usize, n) }
    }

    fn words_mut(&mut self) -> &mut [usize] {
        let n = mem::size_of::<Context>() / mem::size_of::<usize>();
        unsafe { slice::from_raw_parts_mut(self as *mut Context as *mut usize, n) }
    }

    fn patch(&mut self, offsets: &[usize], delta: isize) {
        let words = self.words_mut();
        for &i in offsets {
            words[i] = words[i].wrapping_add_signed(delta);
        }
    }

    /// Copies this context to a new place with self pointers patched.
    pub fn duplicate(&self, layout: &Layout) -> Box<Context> {
        let mut copy = Context::empty();
        unsafe { ptr::copy_nonoverlapping(self, copy.as_mut(), 1) };
        let delta = copy.address().wrapping_sub(self.address()) as isize;
        copy.patch(layout.self_offsets(), delta);
        copy
    }

    /// Shifts stack relative words by `delta` after stack bytes moved by the same amount.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn rebase(&mut self, layout: &Layout, delta: isize) {
        self.patch(layout.stack_offsets(), delta);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::probe::{self, Layout};
    use super::Context;

    fn layout() -> Layout {
        Layout::probe(probe::stack_grows_up())
    }

    #[test]
    fn capture_first_time() {
        let mut context = Context::empty();
        assert_eq!(unsafe { context.capture() }, false);
        assert!(context.words().iter().any(|w| *w != 0));
    }

    #[test]
    fn duplicate_patches_self_pointers() {
        let layout = layout();
        let mut context = Context::empty();
        unsafe { context.capture() };
        let copy = context.duplicate(&layout);
        let (start, end) = (copy.address(), copy.address() + std::mem::size_of::<Context>());
        for &i in layout.self_offsets() {
            let word = copy.words()[i];
            assert!(start <= word && word < end, "word {} escapes copied context", i);
            assert_eq!(word - start, context.words()[i] - context.address());
        }
        for (i, (a, b)) in context.words().iter().zip(copy.words()).enumerate() {
            if !layout.self_offsets().contains(&i) {
                assert_eq!(a, b, "word {} differs", i);
            }
        }
    }

    #[test]
    fn rebase_shifts_stack_words() {
        let layout = layout();
        let mut context = Context::empty();
        unsafe { context.capture() };
        let before = context.words().to_vec();
        context.rebase(&layout, -4096);
        context.rebase(&layout, 4096 + 64);
        for (i, (a, b)) in before.iter().zip(context.words()).enumerate() {
            if layout.stack_offsets().contains(&i) {
                assert_eq!(*b, a + 64);
            } else {
                assert_eq!(a, b);
            }
        }
    }
}
