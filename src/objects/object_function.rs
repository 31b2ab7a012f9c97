use std::rc::Rc;

use crate::chunk::Chunk;
use crate::debugger::DebugInfo;
use crate::value::Value;

#[derive(Debug)]
pub struct ObjectFunction {
    pub name: Rc<str>,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Index of the first parameter that has a default value.
    pub optional_params_start: Option<usize>,
    pub default_values: Vec<Value>,
    pub debug_info: Option<DebugInfo>,
}

impl ObjectFunction {
    pub fn new(name: &str) -> Self {
        ObjectFunction {
            name: Rc::from(name),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            optional_params_start: None,
            default_values: Vec::new(),
            debug_info: None,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Defaults to push when called with `argc` arguments, or `None` when
    /// the call can't be completed with defaults.
    pub fn missing_defaults(&self, argc: usize) -> Option<&[Value]> {
        missing_defaults(self.arity, self.optional_params_start, &self.default_values, argc)
    }
}

pub(crate) fn missing_defaults(arity: usize, start: Option<usize>, defaults: &[Value], argc: usize) -> Option<&[Value]> {
    let start = start?;
    if argc >= arity || argc < start {
        return None;
    }
    defaults.get(argc - start..)
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use crate::objects::object_function::ObjectFunction;

    impl Drop for ObjectFunction {
        fn drop(&mut self) {
            log::trace!("drop function object: name={}", self.name);
        }
    }
}
