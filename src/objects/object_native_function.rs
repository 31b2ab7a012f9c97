use std::fmt;
use std::rc::Rc;

use crate::objects::object::{NativeFn, NativeFnPtr, NativeObject};
use crate::objects::object_function::missing_defaults;
use crate::value::Value;
use crate::vm::VM;

pub struct ObjectNativeFunction {
    pub name: Rc<str>,
    pub arity: usize,
    pub optional_params_start: Option<usize>,
    pub default_values: Vec<Value>,
    pub native_object: Box<dyn NativeObject>,
}

impl ObjectNativeFunction {
    pub fn new(name: &str, arity: usize, native_object: impl NativeObject + 'static) -> Self {
        ObjectNativeFunction {
            name: Rc::from(name),
            arity,
            optional_params_start: None,
            default_values: Vec::new(),
            native_object: Box::new(native_object),
        }
    }

    pub fn from_fn(name: &str, arity: usize, function: NativeFnPtr) -> Self {
        Self::new(name, arity, NativeFn(function))
    }

    /// Trailing parameters from `start` on are optional and default to `defaults`.
    pub fn with_defaults(mut self, start: usize, defaults: Vec<Value>) -> Self {
        self.optional_params_start = Some(start);
        self.default_values = defaults;
        self
    }

    pub fn missing_defaults(&self, argc: usize) -> Option<&[Value]> {
        missing_defaults(self.arity, self.optional_params_start, &self.default_values, argc)
    }

    /// `args` holds the receiver followed by exactly `arity` arguments.
    pub fn invoke(&self, vm: &mut VM, args: &[Value]) -> Result<Value, String> {
        if args.len() != self.arity + 1 {
            return Err(format!("Expected {} arguments but got {}.", self.arity, args.len().saturating_sub(1)));
        }
        self.native_object.run(vm, args)
    }
}

impl fmt::Debug for ObjectNativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectNativeFunction").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use crate::objects::object_native_function::ObjectNativeFunction;

    impl Drop for ObjectNativeFunction {
        fn drop(&mut self) {
            log::trace!("drop native function object: name={}", self.name);
        }
    }
}
