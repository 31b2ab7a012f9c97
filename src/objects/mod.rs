pub mod object;
pub mod object_bound_method;
pub mod object_class;
pub mod object_closure;
pub mod object_fiber;
pub mod object_function;
pub mod object_instance;
pub mod object_manager;
pub mod object_native_function;
pub mod object_upvalue;
