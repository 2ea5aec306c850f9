#![allow(clippy::needless_doctest_main)]

//! # Symmetric coroutines copying stacks in and out of one native stack
//! `stackcopy` hosts many independent call stacks on a single kernel thread. Control moves between
//! them only by explicit [call], which hands over a word sized [Value] and returns once some
//! coroutine calls back.
//!
//! ## Usage
//! * Use [init] or [runtime::Builder] to initialize coroutine engine of current thread.
//! * Use [create] to create coroutine from an [Entry] function.
//! * Use [call] to transfer control and value to other coroutine.
//! * Use [clone] to duplicate a suspended coroutine as multi-shot checkpoint.
//! * Use [free] to release a coroutine that is not running.
//! * Use [poll] inside deep call chains to resize saved stack buffer ahead of suspension.
//!
//! A coroutine whose entry function returns transfers its return value to root coroutine.
//!
//! ## Caveats
//! * Stack bytes are copied, so do not hand addresses of stack variables to other coroutines.
//! * Coroutines are bound to the thread they are created in.
//! * Panic must not unwind out of entry function, it aborts process.
//!
//! ## Example
//! ```rust
//! use stackcopy::Value;
//!
//! fn fibonacci(_: Value) -> Value {
//!     let (mut a, mut b) = (0usize, 1usize);
//!     loop {
//!         stackcopy::call(stackcopy::root(), Value::from_usize(a)).unwrap();
//!         (a, b) = (b, a + b);
//!     }
//! }
//!
//! #[stackcopy::main]
//! fn main() {
//!     let generator = stackcopy::create(fibonacci).unwrap();
//!     let numbers: Vec<usize> =
//!         (0..10).map(|_| stackcopy::call(generator, Value::NONE).unwrap().as_usize()).collect();
//!     assert_eq!(numbers, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
//!     stackcopy::free(generator);
//! }
//! ```

macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!("{}", message);
        eprintln!("stackcopy: {}", message);
        std::process::abort()
    }};
}

pub(crate) use fatal;

pub mod coroutine;
mod error;
pub mod runtime;
mod value;

pub use coroutine::stack::Thresholds;
pub use coroutine::{call, clone, create, current, free, poll, root, stats, Coroutine, Entry, State, Stats};
pub use error::AllocError;
#[cfg(not(test))]
pub use stackcopy_macros::main;
pub use stackcopy_macros::test;
pub use value::Value;

/// Initializes coroutine engine in current thread with default configuration.
///
/// See [runtime::Builder::init] for details.
#[inline(always)]
pub fn init() -> Coroutine {
    runtime::Builder::new().init()
}
