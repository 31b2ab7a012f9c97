use std::rc::Rc;

use crate::objects::object_manager::FiberId;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Reads live through the owning fiber's stack.
    Open { fiber: FiberId, slot: usize },
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ObjectUpvalue {
    pub state: UpvalueState,
    /// Name of the function whose frame owned the captured slot.
    pub fiber_name: Rc<str>,
}

impl ObjectUpvalue {
    pub fn new(fiber: FiberId, slot: usize, fiber_name: Rc<str>) -> Self {
        ObjectUpvalue { state: UpvalueState::Open { fiber, slot }, fiber_name }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }

    pub fn close(&mut self, value: Value) {
        if self.is_open() {
            self.state = UpvalueState::Closed(value);
        }
    }
}
