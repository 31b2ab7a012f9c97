pub mod console;
pub mod core_classes;
pub mod math;
pub mod time;

use std::rc::Rc;

use log::debug;

use crate::objects::object::NativeFnPtr;
use crate::objects::object_fiber::ObjectFiber;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::table::Table;
use crate::value::{make_str_value, Value};
use crate::vm::VM;

pub(crate) fn native(name: &str, arity: usize, function: NativeFnPtr) -> Value {
    Value::Native(Rc::new(ObjectNativeFunction::from_fn(name, arity, function)))
}

pub(crate) fn define_natives(fields: &mut Table, natives: &[(&str, usize, NativeFnPtr)]) {
    for (name, arity, function) in natives {
        fields.insert(Rc::from(*name), native(name, *arity, *function));
    }
}

pub(crate) fn native_fields(natives: &[(&str, usize, NativeFnPtr)]) -> Vec<(Rc<str>, Value)> {
    natives.iter().map(|(name, arity, function)| (Rc::from(*name), native(name, *arity, *function))).collect()
}

pub(crate) fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Nil)
}

pub(crate) fn int_arg(args: &[Value], index: usize, name: &str) -> Result<i64, String> {
    args.get(index).and_then(Value::as_int).ok_or_else(|| format!("{name} expects an Int argument."))
}

pub(crate) fn float_arg(args: &[Value], index: usize, name: &str) -> Result<f64, String> {
    args.get(index).and_then(Value::as_float).ok_or_else(|| format!("{name} expects a number argument."))
}

pub(crate) fn str_arg(args: &[Value], index: usize, name: &str) -> Result<Rc<str>, String> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(Rc::clone(s)),
        _ => Err(format!("{name} expects a Str argument.")),
    }
}

/// Values bound to the leading parameters of every script, in the order of
/// `constants::INITIAL_OBJECTS`.
pub(crate) fn initial_objects(vm: &mut VM) -> Vec<Value> {
    let core = *vm.core();
    let console = vm.new_object(console::fields());
    let math = vm.new_object(native_fields(math::NATIVES));
    let debug = vm.new_object(native_fields(&[("callStack", 0, call_stack)]));
    vec![
        Value::Class(core.bool_class),
        Value::Class(core.int),
        Value::Class(core.float),
        Value::Class(core.str_class),
        Value::Class(core.object),
        Value::Class(core.list),
        Value::Class(core.range),
        console,
        math,
        debug,
        native("Fiber", 1, new_fiber),
    ]
}

fn call_stack(vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(make_str_value(&vm.call_stack().join("\n")))
}

fn new_fiber(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    match arg(args, 1) {
        Value::Closure(closure) if closure.function.arity == 0 => {
            let fiber = ObjectFiber::new(closure);
            debug!("created fiber {}", fiber.name);
            Ok(Value::Fiber(vm.heap_mut().alloc_fiber(fiber)))
        }
        _ => Err("Fiber expects a function without parameters.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use crate::vm::VM;

    #[test]
    fn test_initial_objects_are_bound() {
        let mut vm = VM::new();
        let value = vm.interpret_source("test", "[Bool, Int, Console is Object, Math is Object]").unwrap();
        assert_eq!(vm.stringify(&value), "[Core Bool, Core Int, true, true]");
    }

    #[test]
    fn test_fiber_requires_parameterless_function() {
        let mut vm = VM::new();
        let error = vm.interpret_source("test", "Fiber(fn (a) => a)").unwrap_err();
        assert!(error.to_string().starts_with("Fiber expects a function without parameters."));
        assert_eq!(vm.interpret_source("test", "f = Fiber(fn () => 1)\nf()").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_debug_call_stack() {
        let mut vm = VM::new();
        let value = vm.interpret_source("main", "fn where() => Debug.callStack()\nwhere()").unwrap();
        assert_eq!(vm.stringify(&value), "[main:1] in where\n[main:2] in script");
    }
}
