//! Configuration and bootstrap of coroutine engine in current thread.

use std::hint::black_box;

use crate::coroutine::stack::Thresholds;
use crate::coroutine::{Coroutine, Engine};

// Bytes of caller's frames above [Builder::init] that are saved along with coroutine stacks.
const ANCHOR_SLACK: usize = 512;

/// Builder to initialize coroutine engine in current thread.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    grow_threshold: Option<usize>,
    shrink_threshold: Option<usize>,
    default_size: Option<usize>,
    adjustment: Option<usize>,
    anchor_slack: Option<usize>,
}

impl Builder {
    /// Constructs a builder with default configuration.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Specifies minimum headroom of saved stack buffer before growing.
    pub fn grow_threshold(&mut self, n: usize) -> &mut Self {
        self.grow_threshold = Some(n);
        self
    }

    /// Specifies maximum headroom of saved stack buffer before shrinking.
    ///
    /// It defaults to twice of [Builder::default_size].
    pub fn shrink_threshold(&mut self, n: usize) -> &mut Self {
        self.shrink_threshold = Some(n);
        self
    }

    /// Specifies initial capacity of saved stack buffers.
    pub fn default_size(&mut self, n: usize) -> &mut Self {
        assert!(n > 0, "default size must not be zero");
        self.default_size = Some(n);
        self
    }

    /// Specifies headroom given to reallocated buffers.
    ///
    /// It defaults to [Builder::default_size].
    pub fn adjustment(&mut self, n: usize) -> &mut Self {
        self.adjustment = Some(n);
        self
    }

    /// Specifies number of bytes of caller's frames to save along with coroutine stacks in
    /// [Builder::init]. It defaults to `512`.
    pub fn anchor_slack(&mut self, n: usize) -> &mut Self {
        self.anchor_slack = Some(n);
        self
    }

    /// Resolves thresholds from this builder.
    ///
    /// # Panics
    /// Panic if adjustment is less than grow threshold or no less than shrink threshold.
    pub fn thresholds(&self) -> Thresholds {
        let defaults = Thresholds::default();
        let default_size = self.default_size.unwrap_or(defaults.default_size());
        let grow = self.grow_threshold.unwrap_or(defaults.grow());
        let adjustment = self.adjustment.unwrap_or(default_size);
        let shrink = self.shrink_threshold.unwrap_or(2 * default_size);
        Thresholds::new(grow, shrink, default_size, adjustment)
    }

    /// Initializes coroutine engine in current thread and returns root coroutine.
    ///
    /// Stack is anchored at caller's frame with slack. Caller must not return while there are
    /// coroutines to call, and must not hand addresses of its locals to coroutines.
    ///
    /// # Panics
    /// Panic if engine was initialized in current thread.
    #[inline(never)]
    pub fn init(&self) -> Coroutine {
        let thresholds = self.thresholds();
        let anchor = 0u8;
        let slack = self.anchor_slack.unwrap_or(ANCHOR_SLACK);
        Engine::init(thresholds, black_box(&anchor) as *const u8 as usize, slack)
    }

    /// Initializes coroutine engine in current thread and runs `f` as root coroutine.
    ///
    /// Stack is anchored inside this function, so all coroutines live in frames deeper than `f`.
    ///
    /// # Panics
    /// Panic if engine was initialized in current thread.
    #[inline(never)]
    pub fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let thresholds = self.thresholds();
        let anchor = 0u8;
        Engine::init(thresholds, black_box(&anchor) as *const u8 as usize, 0);
        let result = enter(f);
        black_box(&anchor);
        result
    }
}

#[inline(never)]
fn enter<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    f()
}
