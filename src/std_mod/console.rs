use std::io::{self, BufRead};
use std::rc::Rc;

use log::warn;

use crate::objects::object::NativeFnPtr;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::std_mod::native_fields;
use crate::std_mod::time::ClockTime;
use crate::value::{make_str_value, Value};
use crate::vm::VM;

const NATIVES: &[(&str, usize, NativeFnPtr)] = &[("print", 1, print), ("println", 1, println), ("readln", 0, readln)];

/// Fields of the `Console` object.
pub(crate) fn fields() -> Vec<(Rc<str>, Value)> {
    let mut fields = native_fields(NATIVES);
    let clock = ObjectNativeFunction::new("clock", 0, ClockTime::new());
    fields.push((Rc::from("clock"), Value::Native(Rc::new(clock))));
    fields
}

fn print(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let text = vm.stringify(&args[1]);
    vm.write_output(&text)?;
    Ok(args[0].clone())
}

fn println(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let text = vm.stringify(&args[1]);
    vm.write_output(&format!("{text}\n"))?;
    Ok(args[0].clone())
}

/// Next line from stdin without its terminator, or nil at end of input.
fn readln(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) => Ok(Value::Nil),
        Ok(_) => Ok(make_str_value(line.trim_end_matches(['\n', '\r']))),
        Err(e) => {
            warn!("readln failed: {e}");
            Ok(Value::Nil)
        }
    }
}


#[cfg(test)]
mod tests {
    use crate::value::Value;
    use crate::vm::VM;

    #[test]
    fn test_print_returns_console_for_chaining() {
        let mut vm = VM::new();
        vm.set_output(Box::new(std::io::sink()));
        let value = vm.interpret_source("test", "Console.print(1).println(2) == Console").unwrap();
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn test_clock_advances() {
        let mut vm = VM::new();
        let value = vm.interpret_source("test", "a = Console.clock
b = Console.clock
b >= a").unwrap();
        assert_eq!(value, Value::Bool(true));
    }
}
