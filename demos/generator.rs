use stackcopy::Value;

fn fibonacci(limit: Value) -> Value {
    let (mut a, mut b) = (0usize, 1usize);
    while a <= limit.as_usize() {
        stackcopy::call(stackcopy::root(), Value::from_usize(a)).unwrap();
        (a, b) = (b, a + b);
    }
    Value::NONE
}

#[stackcopy::main]
fn main() {
    let generator = stackcopy::create(fibonacci).unwrap();
    let mut value = stackcopy::call(generator, Value::from_usize(1000)).unwrap();
    while generator.state() != stackcopy::State::Finished {
        println!("fibonacci: {}", value.as_usize());
        value = stackcopy::call(generator, Value::NONE).unwrap();
    }
    println!("stats: {:?}", stackcopy::stats());
    stackcopy::free(generator);
}
