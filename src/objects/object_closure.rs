use std::rc::Rc;

use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::UpvalueId;

#[derive(Debug)]
pub struct ObjectClosure {
    pub function: Rc<ObjectFunction>,
    pub upvalues: Vec<UpvalueId>,
}

impl ObjectClosure {
    pub fn new(function: Rc<ObjectFunction>, upvalues: Vec<UpvalueId>) -> Self {
        ObjectClosure { function, upvalues }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use crate::objects::object_closure::ObjectClosure;

    impl Drop for ObjectClosure {
        fn drop(&mut self) {
            log::trace!("drop closure object: function={}", self.function.name);
        }
    }
}
