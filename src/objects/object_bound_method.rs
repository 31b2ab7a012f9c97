use std::rc::Rc;

use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum BoundCallable {
    Closure(Rc<ObjectClosure>),
    Native(Rc<ObjectNativeFunction>),
}

/// A method paired with the receiver it was looked up on.
#[derive(Debug, Clone)]
pub struct ObjectBoundMethod {
    pub receiver: Value,
    pub method: BoundCallable,
}

impl ObjectBoundMethod {
    pub fn new(receiver: Value, method: BoundCallable) -> Self {
        ObjectBoundMethod { receiver, method }
    }

    pub fn name(&self) -> &str {
        match &self.method {
            BoundCallable::Closure(closure) => closure.name(),
            BoundCallable::Native(native) => &native.name,
        }
    }
}
