use std::cell::Cell;
use std::hint::black_box;
use std::thread;

use more_asserts::assert_gt;
use pretty_assertions::assert_eq;
use scopeguard::defer;
use stackcopy::runtime::Builder;
use stackcopy::{AllocError, Coroutine, State, Value};
use test_case::test_case;

thread_local! {
    static PEER: Cell<Option<Coroutine>> = const { Cell::new(None) };
}

fn peer() -> Coroutine {
    PEER.with(|peer| peer.get()).unwrap()
}

fn double(value: Value) -> Value {
    Value::from_int(value.as_int() * 2)
}

fn triple(value: Value) -> Value {
    Value::from_int(value.as_int() * 3)
}

fn echo(value: Value) -> Value {
    let mut value = value;
    loop {
        value = stackcopy::call(stackcopy::root(), value).unwrap();
    }
}

fn counter(value: Value) -> Value {
    let mut count = value.as_usize();
    loop {
        let delta = stackcopy::call(stackcopy::root(), Value::from_usize(count)).unwrap().as_usize();
        count += delta;
    }
}

#[stackcopy::test]
fn test_doubled_at_root() {
    let co = stackcopy::create(double).unwrap();
    let value = stackcopy::call(co, Value::from_int(21)).unwrap();
    assert_eq!(value.as_int(), 42);
    assert_eq!(co.state(), State::Finished);
    stackcopy::free(co);
    assert_eq!(stackcopy::stats().live, 1);
}

#[test]
fn test_init() {
    let root = stackcopy::init();
    assert_eq!(stackcopy::current(), root);
    let co = stackcopy::create(triple).unwrap();
    assert_eq!(stackcopy::call(co, Value::from_int(-3)).unwrap().as_int(), -9);
    stackcopy::free(co);
}

#[stackcopy::test]
fn test_round_trip_value() {
    let co = stackcopy::create(echo).unwrap();
    defer! {
        stackcopy::free(co);
    }
    let values = [Value::NONE, Value::from_char('λ'), Value::from_int(-1), Value::from_usize(usize::MAX)];
    for value in values {
        assert_eq!(stackcopy::call(co, value).unwrap(), value);
    }
    let boxed = Box::new(17u32);
    let value = stackcopy::call(co, Value::from_ptr(&*boxed as *const u32)).unwrap();
    assert_eq!(unsafe { *value.as_ptr::<u32>() }, 17);
}

thread_local! {
    static CALLER: Cell<Option<Coroutine>> = const { Cell::new(None) };
}

fn ping(value: Value) -> Value {
    let got = stackcopy::call(peer(), Value::from_usize(value.as_usize() + 1)).unwrap();
    Value::from_usize(got.as_usize() * 10)
}

fn pong(value: Value) -> Value {
    let caller = CALLER.with(|caller| caller.get()).unwrap();
    stackcopy::call(caller, Value::from_usize(value.as_usize() + 1)).unwrap();
    unreachable!("pong is resumed")
}

#[stackcopy::test]
fn test_symmetric_return() {
    let a = stackcopy::create(ping).unwrap();
    let b = stackcopy::create(pong).unwrap();
    PEER.with(|peer| peer.set(Some(b)));
    CALLER.with(|caller| caller.set(Some(a)));
    // a calls b with 2, b calls back a with 3, a returns 30 to root.
    let value = stackcopy::call(a, Value::from_usize(1)).unwrap();
    assert_eq!(value.as_usize(), 30);
    assert_eq!(a.state(), State::Finished);
    assert_eq!(b.state(), State::Suspended);
    stackcopy::free(a);
    stackcopy::free(b);
}

#[inline(never)]
fn scribble(depth: usize, seed: usize) -> bool {
    let expected = |i: usize| seed.wrapping_mul(0x9e37_79b9).wrapping_add(depth * 16 + i);
    let mut locals = [0usize; 16];
    for (i, slot) in locals.iter_mut().enumerate() {
        *slot = expected(i);
    }
    black_box(&mut locals);
    let intact = if depth == 0 {
        stackcopy::call(stackcopy::root(), Value::from_usize(seed)).unwrap();
        true
    } else {
        scribble(depth - 1, seed)
    };
    black_box(&mut locals);
    intact && locals.iter().enumerate().all(|(i, slot)| *slot == expected(i))
}

fn isolated(value: Value) -> Value {
    let seed = value.as_usize();
    Value::from_usize(scribble(10 + seed % 7 * 5, seed) as usize)
}

#[stackcopy::test]
fn test_stack_isolation() {
    let a = stackcopy::create(isolated).unwrap();
    let b = stackcopy::create(isolated).unwrap();
    let mut locals = [0xdeadbeefusize; 32];
    black_box(&mut locals);
    assert_eq!(stackcopy::call(a, Value::from_usize(1)).unwrap().as_usize(), 1);
    assert_eq!(stackcopy::call(b, Value::from_usize(4)).unwrap().as_usize(), 4);
    assert_ne!(a.saved_size(), b.saved_size());
    assert_eq!(stackcopy::call(a, Value::NONE).unwrap().as_usize(), 1);
    assert_eq!(stackcopy::call(b, Value::NONE).unwrap().as_usize(), 1);
    black_box(&mut locals);
    assert!(locals.iter().all(|local| *local == 0xdeadbeef));
    stackcopy::free(a);
    stackcopy::free(b);
}

#[inline(never)]
fn poll_at(depth: usize) -> usize {
    let padding = [0u8; 64];
    black_box(&padding);
    let capacity = if depth == 0 {
        stackcopy::poll().unwrap();
        stackcopy::current().capacity()
    } else {
        poll_at(depth - 1)
    };
    black_box(&padding);
    capacity
}

#[inline(never)]
fn poll_deep(depth: usize) -> usize {
    let padding = [0u8; 1024];
    black_box(&padding);
    let capacity = if depth == 0 { poll_at(0) } else { poll_deep(depth - 1) };
    black_box(&padding);
    capacity
}

fn oscillate(_: Value) -> Value {
    poll_at(4);
    let capacity = stackcopy::current().capacity();
    let reallocations = stackcopy::stats().reallocations;
    // Panics abort inside coroutine, so count violations for root to assert.
    let resized = (0..200).filter(|_| poll_at(fastrand::usize(4..=12)) != capacity).count();
    Value::from_usize(resized + (stackcopy::stats().reallocations - reallocations) as usize)
}

#[test_case(Builder::new() ; "default")]
#[test_case(Builder::new().grow_threshold(512).clone() ; "small grow threshold")]
#[test_case(Builder::new().default_size(16384).clone() ; "large default size")]
fn test_buffer_hysteresis(builder: Builder) {
    builder.run(|| {
        let co = stackcopy::create(oscillate).unwrap();
        assert_eq!(stackcopy::call(co, Value::NONE).unwrap().as_usize(), 0);
        stackcopy::free(co);
    });
}

#[stackcopy::test]
fn test_poll_grows_and_shrinks() {
    let thresholds = stackcopy::Thresholds::default();
    let shallow = poll_at(0);
    let reallocations = stackcopy::stats().reallocations;

    let deep = poll_deep(40);
    assert!(deep >= 40 * 1024 + thresholds.grow());
    assert_eq!(stackcopy::stats().reallocations, reallocations + 1);

    let shrunk = poll_at(0);
    assert!(shrunk < deep);
    assert!(shrunk <= shallow.max(thresholds.default_size() + thresholds.shrink()));
    assert_eq!(stackcopy::stats().reallocations, reallocations + 2);
}

#[inline(never)]
fn suspend_deep(depth: usize) -> usize {
    let padding = [depth; 128];
    black_box(&padding);
    let sum = if depth == 0 {
        stackcopy::call(stackcopy::root(), Value::from_usize(stackcopy::current().capacity())).unwrap().as_usize()
    } else {
        suspend_deep(depth - 1)
    };
    black_box(&padding);
    sum + padding.iter().sum::<usize>()
}

fn deep(value: Value) -> Value {
    Value::from_usize(suspend_deep(value.as_usize()))
}

#[stackcopy::test]
fn test_suspend_deep() {
    let co = stackcopy::create(deep).unwrap();
    stackcopy::call(co, Value::from_usize(100)).unwrap();
    assert!(co.saved_size() >= 100 * 128 * std::mem::size_of::<usize>());
    let sum = stackcopy::call(co, Value::from_usize(7)).unwrap().as_usize();
    assert_eq!(sum, 7 + (0..=100).map(|depth| depth * 128).sum::<usize>());
    stackcopy::free(co);
}

#[stackcopy::test]
fn test_clone_independence() {
    let co = stackcopy::create(counter).unwrap();
    assert_eq!(stackcopy::call(co, Value::from_usize(10)).unwrap().as_usize(), 10);
    let cloned = stackcopy::clone(co).unwrap();
    assert_eq!(cloned.state(), State::Suspended);
    assert_eq!(cloned.saved_size(), co.saved_size());

    assert_eq!(stackcopy::call(co, Value::from_usize(5)).unwrap().as_usize(), 15);
    assert_eq!(stackcopy::call(co, Value::from_usize(5)).unwrap().as_usize(), 20);
    assert_eq!(stackcopy::call(cloned, Value::from_usize(1)).unwrap().as_usize(), 11);
    assert_eq!(stackcopy::call(cloned, Value::from_usize(1)).unwrap().as_usize(), 12);
    assert_eq!(stackcopy::call(co, Value::from_usize(1)).unwrap().as_usize(), 21);

    let again = stackcopy::clone(cloned).unwrap();
    assert_eq!(stackcopy::call(again, Value::from_usize(100)).unwrap().as_usize(), 112);
    assert_eq!(stackcopy::call(cloned, Value::from_usize(0)).unwrap().as_usize(), 12);

    stackcopy::free(co);
    assert_eq!(stackcopy::call(again, Value::from_usize(0)).unwrap().as_usize(), 112);
    stackcopy::free(cloned);
    stackcopy::free(again);
}

fn forward(value: Value) -> Value {
    let got = stackcopy::call(peer(), value).unwrap();
    Value::from_usize(got.as_usize() + 1000)
}

#[stackcopy::test]
fn test_implicit_return_routing() {
    let b = stackcopy::create(triple).unwrap();
    PEER.with(|peer| peer.set(Some(b)));
    let a = stackcopy::create(forward).unwrap();

    // b returns to root, not to a which called it.
    assert_eq!(stackcopy::call(a, Value::from_int(7)).unwrap().as_int(), 21);
    assert_eq!(b.state(), State::Finished);
    assert_eq!(a.state(), State::Suspended);

    assert_eq!(stackcopy::call(a, Value::from_usize(5)).unwrap().as_usize(), 1005);
    assert_eq!(a.state(), State::Finished);
    stackcopy::free(a);
    stackcopy::free(b);
}

fn spawner(value: Value) -> Value {
    let inner = stackcopy::create(double).unwrap();
    let doubled = stackcopy::call(inner, value).unwrap();
    // inner finished and routed to root, which resumes us with its result.
    stackcopy::free(inner);
    Value::from_int(doubled.as_int() + 1)
}

#[stackcopy::test]
fn test_create_inside_coroutine() {
    let co = stackcopy::create(spawner).unwrap();
    let doubled = stackcopy::call(co, Value::from_int(4)).unwrap();
    assert_eq!(doubled.as_int(), 8);
    assert_eq!(stackcopy::call(co, doubled).unwrap().as_int(), 9);
    stackcopy::free(co);
}

const HUGE: usize = 1 << 50;

#[test]
fn test_create_alloc_failure() {
    Builder::new().grow_threshold(HUGE).adjustment(HUGE).shrink_threshold(2 * HUGE).default_size(8192).run(|| {
        let err = stackcopy::create(double).unwrap_err();
        assert_gt!(err.requested(), HUGE);
        assert_eq!(stackcopy::stats().live, 1);
        assert_eq!(stackcopy::current(), stackcopy::root());
    });
}

#[inline(never)]
fn call_deep(depth: usize, target: Coroutine) -> Result<Value, AllocError> {
    let padding = [0u8; 1024];
    black_box(&padding);
    let result = if depth == 0 { stackcopy::call(target, Value::from_int(1)) } else { call_deep(depth - 1, target) };
    black_box(&padding);
    result
}

#[test]
fn test_call_alloc_failure() {
    // Shallow frames fit in default buffers, deep ones need a buffer that could not be allocated.
    Builder::new().adjustment(HUGE).shrink_threshold(2 * HUGE).run(|| {
        let co = stackcopy::create(double).unwrap();
        let saved_size = co.saved_size();
        let root_capacity = stackcopy::root().capacity();

        let err = call_deep(40, co).unwrap_err();
        assert_gt!(err.requested(), HUGE);
        assert_eq!(stackcopy::current(), stackcopy::root());
        assert_eq!(stackcopy::stats().transfers, 0);
        assert_eq!(stackcopy::root().capacity(), root_capacity);
        assert_eq!(co.state(), State::Created);
        assert_eq!(co.saved_size(), saved_size);

        // Engine stays usable once stack is shallow again.
        assert_eq!(stackcopy::call(co, Value::from_int(4)).unwrap().as_int(), 8);
        assert_eq!(stackcopy::stats().transfers, 2);
        stackcopy::free(co);
    });
}

#[test]
fn test_threads() {
    let handles: Vec<_> = (0..4usize)
        .map(|i| {
            thread::spawn(move || {
                Builder::new().run(|| {
                    let co = stackcopy::create(counter).unwrap();
                    let mut last = stackcopy::call(co, Value::from_usize(i)).unwrap().as_usize();
                    for _ in 0..1000 {
                        last = stackcopy::call(co, Value::from_usize(1)).unwrap().as_usize();
                        thread::yield_now();
                    }
                    stackcopy::free(co);
                    last
                })
            })
        })
        .collect();
    let results: Vec<usize> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();
    assert_eq!(results, vec![1000, 1001, 1002, 1003]);
}
