//! Machine facts discovered at runtime: stack direction and layout of captured [Context].

use std::hint::black_box;
use std::mem;

use tracing::debug;

use super::context::Context;

#[inline(never)]
fn nested_grows_up(outer: *const u8) -> bool {
    let inner = 0u8;
    let inner = black_box(&inner) as *const u8;
    inner > outer
}

/// Tells whether stack grows toward higher address by comparing locals from two nested frames.
#[inline(never)]
pub(crate) fn stack_grows_up() -> bool {
    let outer = 0u8;
    nested_grows_up(black_box(&outer))
}

/// Word indices of [Context] that must be adjusted when the context or its stack moves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Layout {
    self_offsets: Vec<usize>,
    stack_offsets: Vec<usize>,
}

struct Probe {
    prior_local: usize,
    probe_local: usize,
    first: bool,
    // Captured by first activation.
    same_pc: Box<Context>,
    // Captured by second activation at the same site as `same_pc`.
    env: Box<Context>,
    // Captured by second activation after `env`.
    same_frame: Box<Context>,
}

#[inline(never)]
fn probe(p: &mut Probe) {
    let local = 0u8;
    p.prior_local = p.probe_local;
    p.probe_local = black_box(&local) as *const u8 as usize;
    let context = if p.first { &mut p.same_pc } else { &mut p.env };
    unsafe { context.capture() };
    p.first = false;
    unsafe { p.same_frame.capture() };
    black_box(&local);
}

#[inline(never)]
fn probe_deeper(p: &mut Probe) {
    let filler = [0usize; 32];
    black_box(&filler);
    probe(p);
    black_box(&filler);
}

fn self_offsets(context: &Context) -> Vec<(usize, usize)> {
    let start = context.address();
    let end = start + mem::size_of::<Context>();
    context
        .words()
        .iter()
        .enumerate()
        .filter(|(_, word)| start <= **word && **word < end)
        .map(|(i, word)| (i, word - start))
        .collect()
}

impl Layout {
    /// Probes current thread for the layout.
    ///
    /// Aborts process on contradictory observations.
    pub fn probe(grows_up: bool) -> Layout {
        let mut a = Context::empty();
        let mut b = Context::empty();
        unsafe {
            a.capture();
            b.capture();
        }
        let b_offsets = self_offsets(&b);
        let self_offsets: Vec<usize> =
            self_offsets(&a).into_iter().filter(|entry| b_offsets.contains(entry)).map(|(i, _)| i).collect();

        let mut p = Probe {
            prior_local: 0,
            probe_local: 0,
            first: true,
            same_pc: Context::empty(),
            env: Context::empty(),
            same_frame: Context::empty(),
        };
        probe_deeper(&mut p);
        probe(&mut p);

        let frame_delta = p.probe_local.wrapping_sub(p.prior_local) as isize;
        if frame_delta == 0 {
            crate::fatal!("stack probe: two activations at different depths share the same frame");
        }
        // Second activation is shallower than first one.
        if (frame_delta < 0) != grows_up {
            crate::fatal!("stack probe: frame delta {} contradicts stack growing up({})", frame_delta, grows_up);
        }

        let env = p.env.words();
        let same_pc = p.same_pc.words();
        let same_frame = p.same_frame.words();
        let stack_offsets: Vec<usize> = (0..env.len())
            .filter(|i| !self_offsets.contains(i))
            .filter(|&i| env[i].wrapping_sub(same_pc[i]) as isize == frame_delta && env[i] == same_frame[i])
            .collect();
        if stack_offsets.is_empty() {
            crate::fatal!("stack probe: no stack pointer found in machine context");
        }

        let layout = Layout { self_offsets, stack_offsets };
        debug!(grows_up, frame_delta, ?layout, "probed machine context layout");
        layout
    }

    pub fn self_offsets(&self) -> &[usize] {
        &self.self_offsets
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn stack_offsets(&self) -> &[usize] {
        &self.stack_offsets
    }
}
