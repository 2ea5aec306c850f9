use stackcopy::Value;

// Walks a path of 8 steps, asking root at each step which way to go.
fn walk(_: Value) -> Value {
    let mut position = 0isize;
    for _ in 0..8 {
        let step = stackcopy::call(stackcopy::root(), Value::from_int(position)).unwrap();
        position += step.as_int();
    }
    Value::from_int(position)
}

#[stackcopy::main]
fn main() {
    let walker = stackcopy::create(walk).unwrap();
    let mut position = stackcopy::call(walker, Value::NONE).unwrap();
    for _ in 0..4 {
        position = stackcopy::call(walker, Value::from_int(1)).unwrap();
    }
    println!("checkpoint at position {}", position.as_int());

    // Every clone resumes from the checkpoint independently.
    for step in [-1isize, 1, 3] {
        let branch = stackcopy::clone(walker).unwrap();
        let mut position = Value::NONE;
        while branch.state() != stackcopy::State::Finished {
            position = stackcopy::call(branch, Value::from_int(step)).unwrap();
        }
        println!("branch stepping {:+} ends at {}", step, position.as_int());
        stackcopy::free(branch);
    }
    stackcopy::free(walker);
}
