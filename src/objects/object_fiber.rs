use std::rc::Rc;

use log::debug;

use crate::call_frame::CallFrame;
use crate::constants::{INITIAL_STACK_SIZE, STACK_GROWTH_FACTOR};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_manager::FiberId;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Started,
}

/// An independently stacked execution context. The root script runs in one,
/// and every `Fiber(fn)` value owns another.
#[derive(Debug)]
pub struct ObjectFiber {
    pub name: Rc<str>,
    pub closure: Rc<ObjectClosure>,
    pub state: FiberState,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub caller: Option<FiberId>,
}

impl ObjectFiber {
    pub fn new(closure: Rc<ObjectClosure>) -> Self {
        ObjectFiber {
            name: Rc::clone(&closure.function.name),
            closure,
            state: FiberState::New,
            stack: Vec::with_capacity(INITIAL_STACK_SIZE),
            frames: Vec::new(),
            caller: None,
        }
    }

    #[inline(always)]
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: Value) {
        if self.stack.len() == self.stack.capacity() {
            let capacity = self.stack.capacity().max(1);
            self.stack.reserve_exact(capacity * (STACK_GROWTH_FACTOR - 1));
            debug!("fiber {} stack grown to {}", self.name, self.stack.capacity());
        }
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|index| self.stack.get(index))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn set_peek(&mut self, distance: usize, value: Value) {
        if let Some(index) = self.stack.len().checked_sub(distance + 1) {
            self.stack[index] = value;
        }
    }

    /// Back to a fresh, never-run state. The stack keeps its capacity.
    pub fn reset(&mut self) {
        self.state = FiberState::New;
        self.stack.clear();
        self.frames.clear();
        self.caller = None;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::ObjectFiber;
    use crate::constants::{INITIAL_STACK_SIZE, STACK_GROWTH_FACTOR};
    use crate::objects::object_closure::ObjectClosure;
    use crate::objects::object_function::ObjectFunction;
    use crate::value::Value;

    #[test]
    fn test_stack_grows_geometrically() {
        let closure = Rc::new(ObjectClosure::new(Rc::new(ObjectFunction::new("f")), vec![]));
        let mut fiber = ObjectFiber::new(closure);
        for i in 0..=INITIAL_STACK_SIZE {
            fiber.push(Value::Int(i as i64));
        }
        assert!(fiber.stack.capacity() >= INITIAL_STACK_SIZE * STACK_GROWTH_FACTOR);
        assert_eq!(fiber.peek(0), Value::Int(INITIAL_STACK_SIZE as i64));

        let capacity = fiber.stack.capacity();
        fiber.reset();
        assert_eq!(fiber.sp(), 0);
        assert_eq!(fiber.stack.capacity(), capacity);
    }
}
