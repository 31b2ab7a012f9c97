use std::fmt;
use std::rc::Rc;

use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::{ClassId, FiberId, InstanceId};
use crate::objects::object_native_function::ObjectNativeFunction;

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Function(Rc<ObjectFunction>),
    Closure(Rc<ObjectClosure>),
    Native(Rc<ObjectNativeFunction>),
    BoundMethod(Rc<ObjectBoundMethod>),
    Class(ClassId),
    Instance(InstanceId),
    Fiber(FiberId),
    /// A soft error travelling as data.
    Thrown(Rc<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::Function(_) => "Function",
            Value::Closure(_) => "Closure",
            Value::Native(_) => "NativeFunction",
            Value::BoundMethod(_) => "BoundMethod",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::Fiber(_) => "Fiber",
            Value::Thrown(_) => "Thrown",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<InstanceId> {
        match self {
            Value::Instance(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }
}

#[inline(always)]
pub fn is_nil(value: &Value) -> bool {
    matches!(value, Value::Nil)
}

/// Only `true` counts as true; every other value, numbers and strings
/// included, is false.
#[inline(always)]
pub fn is_false(value: &Value) -> bool {
    !matches!(value, Value::Bool(true))
}

#[inline(always)]
pub fn is_thrown(value: &Value) -> bool {
    matches!(value, Value::Thrown(_))
}

pub fn make_str_value(value: &str) -> Value {
    Value::Str(Rc::from(value))
}

/// Narrows a float that holds an exact integer back to `Int`.
pub fn int_if_possible(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b) || Rc::ptr_eq(&a.function, &b.function),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::Fiber(a), Value::Fiber(b)) => a == b,
            (Value::Thrown(a), Value::Thrown(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(d) => write!(f, "Float({d})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Function(function) => write!(f, "Function({})", function.name),
            Value::Closure(closure) => write!(f, "Closure({})", closure.name()),
            Value::Native(native) => write!(f, "Native({})", native.name),
            Value::BoundMethod(bound) => write!(f, "BoundMethod({})", bound.name()),
            Value::Class(id) => write!(f, "Class({})", id.0),
            Value::Instance(id) => write!(f, "Instance({})", id.0),
            Value::Fiber(id) => write!(f, "Fiber({})", id.0),
            Value::Thrown(inner) => write!(f, "Thrown({inner:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_if_possible() {
        assert_eq!(int_if_possible(2.0), Value::Int(2));
        assert!(matches!(int_if_possible(2.0), Value::Int(2)));
        assert!(matches!(int_if_possible(2.5), Value::Float(f) if f == 2.5));
        assert!(matches!(int_if_possible(f64::INFINITY), Value::Float(_)));
    }

    #[test]
    fn test_only_true_is_true() {
        assert!(!is_false(&Value::Bool(true)));
        assert!(is_false(&Value::Bool(false)));
        assert!(is_false(&Value::Int(1)));
        assert!(is_false(&make_str_value("yes")));
        assert!(is_false(&Value::Nil));
    }
}
