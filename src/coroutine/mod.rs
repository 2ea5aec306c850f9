//! Symmetric coroutines sharing one native stack.
//!
//! Every coroutine of a thread runs on the thread's own stack below (or above) an anchor recorded
//! by [crate::init]. On transfer, live bytes between anchor and stack pointer are copied to heap
//! buffer of the suspending coroutine, and bytes of the resuming coroutine are copied back to
//! where they were before jumping to its captured context.

mod context;
pub(crate) mod probe;
pub(crate) mod stack;

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::panic;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use slab::Slab;
use static_assertions::assert_not_impl_any;
use strum::{AsRefStr, Display};
use tracing::{debug, trace};

use self::context::Context;
use self::probe::Layout;
use self::stack::{Anchor, SavedStack, Thresholds};
use crate::error::AllocError;
use crate::value::Value;

/// Entry function of coroutine.
///
/// It receives value of the first [call] to the coroutine. Its return value is handed to root
/// coroutine as if the finished coroutine calls it.
pub type Entry = fn(Value) -> Value;

static SERIAL_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENGINE: UnsafeCell<Option<Engine>> = const { UnsafeCell::new(None) };
}

/// Life stage of coroutine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum State {
    /// Entry function has not run yet.
    Created,
    Running,
    Suspended,
    /// Entry function returned. It can't be called anymore.
    Finished,
}

/// Handle to coroutine of current thread.
///
/// It is a plain copyable reference, [free] releases the coroutine. Operating on a freed handle
/// panics. It could not be sent to other threads as stack layout is bound to thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coroutine {
    key: usize,
    serial: u64,
    _marker: PhantomData<*const ()>,
}

assert_not_impl_any!(Coroutine: Send, Sync);

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coroutine({}#{})", self.key, self.serial)
    }
}

impl Coroutine {
    fn new(key: usize, serial: u64) -> Coroutine {
        Coroutine { key, serial, _marker: PhantomData }
    }

    fn with_record<T>(self, f: impl FnOnce(&Record) -> T) -> T {
        let record = Engine::get().lookup(self);
        f(unsafe { record.as_ref() })
    }

    pub fn state(self) -> State {
        self.with_record(|record| record.state)
    }

    /// Number of stack bytes saved at last suspension.
    pub fn saved_size(self) -> usize {
        self.with_record(|record| record.stack.used())
    }

    /// Capacity of buffer for saved stack bytes.
    pub fn capacity(self) -> usize {
        self.with_record(|record| record.stack.capacity())
    }

    pub fn is_root(self) -> bool {
        Engine::get().root == self
    }
}

/// Counters of coroutine engine in current thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of control transfers between distinct coroutines.
    pub transfers: u64,
    /// Number of saved stack buffers reallocated for growing or shrinking.
    pub reallocations: u64,
    /// Number of live coroutines including root.
    pub live: usize,
}

struct Record {
    serial: u64,
    state: State,
    entry: Option<Entry>,
    context: Box<Context>,
    stack: SavedStack,
}

impl Record {
    fn new(entry: Option<Entry>, state: State, stack: SavedStack) -> Box<Record> {
        let serial = SERIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        Box::new(Record { serial, state, entry, context: Context::empty(), stack })
    }

    fn try_clone(&self, layout: &Layout) -> Result<Box<Record>, AllocError> {
        let stack = self.stack.try_clone()?;
        let mut record = Record::new(self.entry, self.state, stack);
        record.context = self.context.duplicate(layout);
        Ok(record)
    }
}

pub(crate) struct Engine {
    anchor: Anchor,
    layout: Layout,
    thresholds: Thresholds,
    root: Coroutine,
    current: Cell<Coroutine>,
    value: Cell<Value>,
    transfers: Cell<u64>,
    reallocations: Cell<u64>,
    records: UnsafeCell<Slab<Box<Record>>>,
}

impl Engine {
    /// Initializes engine for current thread with stack anchored at `anchor` plus `slack` bytes
    /// toward stack bottom.
    pub fn init(thresholds: Thresholds, anchor: usize, slack: usize) -> Coroutine {
        ENGINE.with(|cell| {
            let engine = unsafe { &mut *cell.get() };
            assert!(engine.is_none(), "stackcopy: engine already initialized in this thread");
            let grows_up = probe::stack_grows_up();
            let layout = Layout::probe(grows_up);
            let base = if grows_up { anchor - slack } else { anchor + slack };
            let stack = SavedStack::with_capacity(thresholds.default_size())
                .unwrap_or_else(|err| crate::fatal!("fail to allocate root coroutine: {}", err));
            let record = Record::new(None, State::Running, stack);
            let serial = record.serial;
            let mut records = Slab::new();
            let root = Coroutine::new(records.insert(record), serial);
            debug!(base, grows_up, ?thresholds, "initialized coroutine engine");
            *engine = Some(Engine {
                anchor: Anchor::new(base, grows_up),
                layout,
                thresholds,
                root,
                current: Cell::new(root),
                value: Cell::new(Value::NONE),
                transfers: Cell::new(0),
                reallocations: Cell::new(0),
                records: UnsafeCell::new(records),
            });
            root
        })
    }

    fn try_get<'a>() -> Option<&'a Engine> {
        ENGINE.with(|cell| unsafe { (*cell.get()).as_ref() })
    }

    pub fn get<'a>() -> &'a Engine {
        Self::try_get().expect("stackcopy: engine not initialized in this thread")
    }

    #[allow(clippy::mut_from_ref)]
    fn records(&self) -> &mut Slab<Box<Record>> {
        unsafe { &mut *self.records.get() }
    }

    fn lookup(&self, co: Coroutine) -> NonNull<Record> {
        match self.records().get_mut(co.key) {
            Some(record) if record.serial == co.serial => NonNull::from(record.as_mut()),
            _ => panic!("stackcopy: {:?} was freed or belongs to other thread", co),
        }
    }

    fn insert(&self, record: Box<Record>) -> Coroutine {
        let serial = record.serial;
        let key = self.records().insert(record);
        Coroutine::new(key, serial)
    }

    fn remove(&self, co: Coroutine) -> Box<Record> {
        self.records().remove(co.key)
    }

    fn reallocated(&self, co: Coroutine, capacity: usize, stack: &SavedStack) {
        self.reallocations.set(self.reallocations.get() + 1);
        debug!(coroutine = ?co, from = capacity, to = stack.capacity(), "reallocated saved stack");
    }

    fn stats(&self) -> Stats {
        Stats { transfers: self.transfers.get(), reallocations: self.reallocations.get(), live: self.records().len() }
    }

    // Saves stack of `from` and switches to `target`. Returns only if saving failed.
    #[inline(never)]
    fn transfer(&self, from: NonNull<Record>, target: Coroutine) -> AllocError {
        let co = self.current.get();
        let from = unsafe { &mut *from.as_ptr() };
        let capacity = from.stack.capacity();
        match unsafe { self.anchor.save(&mut from.stack, &self.thresholds) } {
            Err(err) => return err,
            Ok(true) => self.reallocated(co, capacity, &from.stack),
            Ok(false) => {},
        }
        from.state = State::Suspended;
        self.switch(target)
    }

    fn switch(&self, target: Coroutine) -> ! {
        let to = unsafe { &mut *self.lookup(target).as_ptr() };
        trace!(from = ?self.current.get(), to = ?target, state = to.state.as_ref(), "transfer");
        to.state = State::Running;
        self.current.set(target);
        self.transfers.set(self.transfers.get() + 1);
        unsafe { self.anchor.restore(&to.stack, to.context.as_ref()) }
    }

    // Runs entry function of current coroutine on its first resumption.
    fn start(&self) -> ! {
        let co = self.current.get();
        let Some(entry) = (unsafe { self.lookup(co).as_ref() }).entry else {
            crate::fatal!("{:?} has no entry function", co);
        };
        let value = self.value.get();
        match panic::catch_unwind(move || entry(value)) {
            Ok(value) => self.exit(value),
            Err(_) => crate::fatal!("{:?} panicked, unwinding out of coroutine is not supported", co),
        }
    }

    fn exit(&self, value: Value) -> ! {
        let co = self.current.get();
        let record = unsafe { &mut *self.lookup(co).as_ptr() };
        record.state = State::Finished;
        debug!(coroutine = ?co, "coroutine finished");
        self.value.set(value);
        self.switch(self.root)
    }
}

// Captures context of new coroutine and saves stack up to here, so that the first resumption
// lands here to run entry function.
#[inline(never)]
fn prime(engine: &Engine, record: NonNull<Record>) -> Result<bool, AllocError> {
    let record = record.as_ptr();
    if unsafe { (*record).context.capture() } {
        Engine::get().start();
    }
    unsafe { engine.anchor.save(&mut (*record).stack, &engine.thresholds) }
}

/// Creates a coroutine to run `entry` on first [call] to it.
pub fn create(entry: Entry) -> Result<Coroutine, AllocError> {
    let engine = Engine::get();
    let stack = SavedStack::with_capacity(engine.thresholds.default_size())?;
    let co = engine.insert(Record::new(Some(entry), State::Created, stack));
    let record = engine.lookup(co);
    let capacity = unsafe { record.as_ref() }.stack.capacity();
    match prime(engine, record) {
        Ok(reallocated) => {
            let stack = unsafe { &record.as_ref().stack };
            if reallocated {
                engine.reallocated(co, capacity, stack);
            }
            debug!(coroutine = ?co, size = stack.used(), "created coroutine");
            Ok(co)
        },
        Err(err) => {
            engine.remove(co);
            Err(err)
        },
    }
}

/// Transfers control and `value` to `target`, returns value from whoever transfers back.
///
/// Entry function of `target` receives `value` if this is the first call to it, otherwise the
/// pending [call] of `target` returns `value`.
///
/// Calling current coroutine returns `value` immediately.
///
/// # Errors
/// Returns [AllocError] without any transfer if stack of current coroutine can't be saved.
///
/// # Panics
/// Panic if `target` was freed or finished.
#[inline(never)]
pub fn call(target: Coroutine, value: Value) -> Result<Value, AllocError> {
    let engine = Engine::get();
    let to = engine.lookup(target);
    let current = engine.current.get();
    if target == current {
        return Ok(value);
    }
    let state = unsafe { to.as_ref() }.state;
    assert!(state != State::Finished, "stackcopy: {:?} finished", target);
    let from = engine.lookup(current);
    engine.value.set(value);
    if unsafe { (*from.as_ptr()).context.capture() } {
        return Ok(Engine::get().value.get());
    }
    Err(engine.transfer(from, target))
}

/// Clones a suspended coroutine including its saved stack.
///
/// Both coroutines resume from the same point independently, so a clone serves as multi-shot
/// checkpoint. Stack of coroutine is copied byte by byte, values owning resources on it are
/// duplicated without their owned resources. Keep only plain data on stack of cloned coroutines.
///
/// # Panics
/// Panic if `source` is root, running or freed.
pub fn clone(source: Coroutine) -> Result<Coroutine, AllocError> {
    let engine = Engine::get();
    assert!(source != engine.root, "stackcopy: root coroutine can not be cloned");
    let record = engine.lookup(source);
    assert!(source != engine.current.get(), "stackcopy: running coroutine can not be cloned");
    let copy = unsafe { record.as_ref() }.try_clone(&engine.layout)?;
    let co = engine.insert(copy);
    debug!(source = ?source, coroutine = ?co, "cloned coroutine");
    Ok(co)
}

/// Frees coroutine and its saved stack.
///
/// Values on stack of freed coroutine are not dropped.
///
/// # Panics
/// Panic if `co` is root, running or freed.
pub fn free(co: Coroutine) {
    let engine = Engine::get();
    assert!(co != engine.root, "stackcopy: root coroutine can not be freed");
    engine.lookup(co);
    assert!(co != engine.current.get(), "stackcopy: running coroutine can not be freed");
    drop(engine.remove(co));
    debug!(coroutine = ?co, "freed coroutine");
}

/// Resizes buffer of current coroutine for current stack depth ahead of next suspension.
///
/// It does nothing if buffer headroom is within [Thresholds].
pub fn poll() -> Result<(), AllocError> {
    let engine = Engine::get();
    let depth = engine.anchor.depth_here();
    let co = engine.current.get();
    let record = unsafe { &mut *engine.lookup(co).as_ptr() };
    let capacity = record.stack.capacity();
    if record.stack.fit(&engine.thresholds, depth)? {
        engine.reallocated(co, capacity, &record.stack);
    }
    Ok(())
}

/// Returns the running coroutine.
pub fn current() -> Coroutine {
    Engine::get().current.get()
}

/// Returns the coroutine representing execution context initialized engine in this thread.
pub fn root() -> Coroutine {
    Engine::get().root
}

/// Returns counters of engine in this thread.
pub fn stats() -> Stats {
    Engine::get().stats()
}

/// Returns thresholds of engine in this thread.
pub fn thresholds() -> Thresholds {
    Engine::get().thresholds
}
