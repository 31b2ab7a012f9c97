use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::NativeObject;
use crate::value::Value;
use crate::vm::VM;

/// Wall clock in milliseconds since the Unix epoch.
pub struct ClockTime;

impl NativeObject for ClockTime {
    fn run(&self, _vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
        let duration = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| format!("Clock error: {e}"))?;
        Ok(Value::Int(duration.as_millis() as i64))
    }
}

impl ClockTime {
    pub fn new() -> Self {
        ClockTime {}
    }
}

impl Default for ClockTime {
    fn default() -> Self {
        ClockTime::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ClockTime;
    use crate::objects::object::NativeObject;
    use crate::value::Value;
    use crate::vm::VM;

    #[test]
    fn test_clock_is_after_2020() {
        let mut vm = VM::new();
        match ClockTime::new().run(&mut vm, &[Value::Nil]) {
            Ok(Value::Int(millis)) => assert!(millis > 1_577_836_800_000),
            other => panic!("unexpected clock value {other:?}"),
        }
    }
}
