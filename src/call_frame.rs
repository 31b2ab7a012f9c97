use std::rc::Rc;

use crate::chunk::Chunk;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct CallFrame {
    pub closure: Rc<ObjectClosure>,
    pub ip: usize,
    /// Absolute stack index of slot 0 in the owning fiber.
    pub base: usize,
    /// Receiver to hand back instead of the return value, for cascaded calls.
    pub cascade: Option<Value>,
}

impl CallFrame {
    pub fn new(closure: Rc<ObjectClosure>, base: usize) -> Self {
        CallFrame { closure, ip: 0, base, cascade: None }
    }

    #[inline(always)]
    pub fn function(&self) -> &ObjectFunction {
        &self.closure.function
    }

    #[inline(always)]
    pub fn chunk(&self) -> &Chunk {
        &self.closure.function.chunk
    }

    /// Offset of the instruction currently executing.
    pub fn current_offset(&self) -> usize {
        self.ip.saturating_sub(1)
    }

    pub fn line(&self) -> usize {
        self.chunk().line_at(self.current_offset())
    }

    pub fn file(&self) -> &str {
        self.chunk().file_at(self.current_offset())
    }
}
