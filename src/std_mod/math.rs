use std::f64::consts;

use rand::Rng;

use crate::objects::object::NativeFnPtr;
use crate::std_mod::{float_arg, int_arg};
use crate::value::Value;
use crate::vm::VM;

pub(crate) const NATIVES: &[(&str, usize, NativeFnPtr)] = &[
    ("E", 0, e),
    ("PI", 0, pi),
    ("sin", 1, sin),
    ("cos", 1, cos),
    ("tan", 1, tan),
    ("asin", 1, asin),
    ("acos", 1, acos),
    ("atan", 1, atan),
    ("exp", 1, exp),
    ("sqrt", 1, sqrt),
    ("pow", 2, pow),
    ("ln", 1, ln),
    ("log", 2, log),
    ("abs", 1, abs),
    ("min", 2, min),
    ("max", 2, max),
    ("round", 1, round),
    ("ceil", 1, ceil),
    ("floor", 1, floor),
    ("clamp", 3, clamp),
    ("randomInt", 2, random_int),
    ("randomFloat", 0, random_float),
];

fn unary(args: &[Value], name: &str, op: fn(f64) -> f64) -> Result<Value, String> {
    Ok(Value::Float(op(float_arg(args, 1, name)?)))
}

/// Int when every argument is an Int, Float otherwise.
fn narrowed(args: &[Value], result: f64) -> Value {
    if args[1..].iter().all(|arg| matches!(arg, Value::Int(_))) {
        Value::Int(result as i64)
    } else {
        Value::Float(result)
    }
}

fn e(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(consts::E))
}

fn pi(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(consts::PI))
}

fn sin(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "sin", f64::sin)
}

fn cos(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "cos", f64::cos)
}

fn tan(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "tan", f64::tan)
}

fn asin(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "asin", f64::asin)
}

fn acos(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "acos", f64::acos)
}

fn atan(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "atan", f64::atan)
}

fn exp(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "exp", f64::exp)
}

fn sqrt(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "sqrt", f64::sqrt)
}

fn ln(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "ln", f64::ln)
}

fn ceil(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "ceil", f64::ceil)
}

fn floor(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    unary(args, "floor", f64::floor)
}

fn pow(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(float_arg(args, 1, "pow")?.powf(float_arg(args, 2, "pow")?)))
}

fn log(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(float_arg(args, 1, "log")?.log(float_arg(args, 2, "log")?)))
}

fn abs(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    match &args[1] {
        Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
        _ => unary(args, "abs", f64::abs),
    }
}

fn min(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let result = float_arg(args, 1, "min")?.min(float_arg(args, 2, "min")?);
    Ok(narrowed(args, result))
}

fn max(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let result = float_arg(args, 1, "max")?.max(float_arg(args, 2, "max")?);
    Ok(narrowed(args, result))
}

fn round(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Int(float_arg(args, 1, "round")?.round() as i64))
}

fn clamp(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let x = float_arg(args, 1, "clamp")?;
    let lo = float_arg(args, 2, "clamp")?;
    let hi = float_arg(args, 3, "clamp")?;
    if lo > hi {
        return Err(format!("clamp bounds are inverted: {lo} > {hi}"));
    }
    Ok(narrowed(args, x.clamp(lo, hi)))
}

/// Uniform integer in `[lo, hi)`.
fn random_int(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let lo = int_arg(args, 1, "randomInt")?;
    let hi = int_arg(args, 2, "randomInt")?;
    if lo >= hi {
        return Err(format!("randomInt needs lo < hi, got {lo} and {hi}."));
    }
    Ok(Value::Int(rand::thread_rng().gen_range(lo..hi)))
}

fn random_float(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(rand::thread_rng().gen::<f64>()))
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use crate::vm::VM;

    fn eval(source: &str) -> Value {
        VM::new().interpret_source("test", source).unwrap()
    }

    #[test]
    fn test_integer_results_for_integer_args() {
        assert_eq!(eval("Math.min(3, 7)"), Value::Int(3));
        assert!(matches!(eval("Math.max(3, 7.5)"), Value::Float(f) if f == 7.5));
        assert_eq!(eval("Math.clamp(12, 0, 10)"), Value::Int(10));
        assert_eq!(eval("Math.abs(-4)"), Value::Int(4));
        assert_eq!(eval("Math.round(2.6)"), Value::Int(3));
    }

    #[test]
    fn test_float_functions() {
        assert!(matches!(eval("Math.sqrt(16)"), Value::Float(f) if f == 4.0));
        assert!(matches!(eval("Math.floor(2.7)"), Value::Float(f) if f == 2.0));
        assert!(matches!(eval("Math.log(8, 2)"), Value::Float(f) if (f - 3.0).abs() < 1e-9));
        assert!(matches!(eval("Math.PI"), Value::Float(f) if f > 3.14 && f < 3.15));
    }

    #[test]
    fn test_random_ranges() {
        for _ in 0..20 {
            match eval("Math.randomInt(1, 3)") {
                Value::Int(i) => assert!((1..3).contains(&i)),
                other => panic!("expected an Int, got {other:?}"),
            }
        }
        assert!(matches!(eval("Math.randomFloat"), Value::Float(f) if (0.0..1.0).contains(&f)));
    }
}
