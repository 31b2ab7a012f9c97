use crate::value::Value;
use crate::vm::VM;

/// Host-implemented callable. `args[0]` is the receiver (or the callee itself
/// for plain calls), followed by the declared parameters.
pub trait NativeObject {
    fn run(&self, vm: &mut VM, args: &[Value]) -> Result<Value, String>;
}

pub type NativeFnPtr = fn(&mut VM, &[Value]) -> Result<Value, String>;

/// Adapts a plain function pointer into a `NativeObject`.
pub struct NativeFn(pub NativeFnPtr);

impl NativeObject for NativeFn {
    fn run(&self, vm: &mut VM, args: &[Value]) -> Result<Value, String> {
        (self.0)(vm, args)
    }
}
