use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::objects::object_class::ClassKind;
use crate::objects::object_function::ObjectFunction;
use crate::value::Value;

/// Listing of `function` followed by every function nested in its constants.
pub fn disassemble_function(function: &ObjectFunction) -> String {
    let mut out = String::new();
    disassemble_chunk(&function.chunk, &function.name, &mut out);
    for constant in &function.chunk.constants {
        if let Value::Function(nested) = constant {
            out.push_str(&disassemble_function(nested));
        }
    }
    out
}

pub fn disassemble_chunk(chunk: &Chunk, name: &str, out: &mut String) {
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, out);
    }
}

fn constant_repr(value: &Value) -> String {
    match value {
        Value::Nil => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => format!("\"{s}\""),
        Value::Function(function) => format!("<fn {}>", function.name),
        other => format!("{other:?}"),
    }
}

/// Appends one instruction to `out` and returns the offset of the next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:08} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        out.push_str("       | ");
    } else {
        let _ = write!(out, "{:>8} ", chunk.line_at(offset));
    }

    let instruction = OpCode::from_byte(chunk.read_byte(offset));
    let name = OpCode::byte_to_string(&instruction);
    match instruction {
        Some(OpCode::ConstInt) => {
            let _ = writeln!(out, "{:<16} {}", name, chunk.read_i64(offset + 1));
            offset + 9
        }
        Some(OpCode::ConstFloat) => {
            let _ = writeln!(out, "{:<16} {}", name, chunk.read_f64(offset + 1));
            offset + 9
        }
        Some(OpCode::Const | OpCode::ConstId | OpCode::Method | OpCode::Super) => {
            constant_instruction(&name, chunk, offset, out)
        }
        Some(
            OpCode::PopUnder
            | OpCode::SetLocal
            | OpCode::GetLocal
            | OpCode::SetUpvalue
            | OpCode::GetUpvalue
            | OpCode::Call
            | OpCode::Object
            | OpCode::List,
        ) => int_instruction(&name, chunk, offset, out),
        Some(OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfNil | OpCode::JumpIfThrown) => {
            jump_instruction(&name, chunk, offset, out)
        }
        Some(OpCode::UpdateProp) => {
            let op = OpCode::byte_to_string(&OpCode::from_byte(chunk.read_byte(offset + 1)));
            let _ = writeln!(out, "{:<16} {}", name, op);
            offset + 2
        }
        Some(OpCode::Invoke | OpCode::SuperInvoke) => {
            let constant = chunk.read_i32(offset + 1);
            let argc = chunk.read_i32(offset + 5);
            let null_safe = chunk.read_bool(offset + 9);
            let cascade = chunk.read_bool(offset + 10);
            let _ = writeln!(
                out,
                "{:<16} {:>4} {} ({} args){}{}",
                name,
                constant,
                constant_repr(&chunk.constant(constant as usize)),
                argc,
                if null_safe { " ?." } else { "" },
                if cascade { " .." } else { "" }
            );
            offset + 11
        }
        Some(OpCode::Closure) => {
            let constant = chunk.read_i32(offset + 1);
            let function = chunk.constant(constant as usize);
            let _ = writeln!(out, "{:<16} {:>4} {}", name, constant, constant_repr(&function));
            let mut offset = offset + 5;
            let upvalue_count = match &function {
                Value::Function(function) => function.upvalue_count,
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.read_bool(offset);
                let index = chunk.read_i32(offset + 1);
                let fiber = chunk.constant(chunk.read_i32(offset + 5) as usize);
                let _ = writeln!(
                    out,
                    "{:08}        |   {} {} in {}",
                    offset,
                    if is_local { "local" } else { "upvalue" },
                    index,
                    constant_repr(&fiber)
                );
                offset += 9;
            }
            offset
        }
        Some(OpCode::Return | OpCode::Throw) => {
            let count = chunk.read_i32(offset + 1).max(0) as usize;
            let codes: Vec<String> = (0..count)
                .map(|i| OpCode::byte_to_string(&OpCode::from_byte(chunk.read_byte(offset + 5 + i))))
                .collect();
            let _ = writeln!(out, "{:<16} [{}]", name, codes.join(", "));
            offset + 5 + count
        }
        Some(OpCode::Class) => {
            let kind = ClassKind::from_byte(chunk.read_byte(offset + 1)).unwrap_or(ClassKind::Custom);
            let constant = chunk.read_i32(offset + 2);
            let _ = writeln!(
                out,
                "{:<16} {:>4} {} {}",
                name,
                constant,
                kind,
                constant_repr(&chunk.constant(constant as usize))
            );
            offset + 6
        }
        Some(_) => simple_instruction(&name, offset, out),
        None => {
            let _ = writeln!(out, "Unknown opcode {}", chunk.read_byte(offset));
            offset + 1
        }
    }
}

fn jump_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let target = chunk.read_i32(offset + 1);
    let _ = writeln!(out, "{:<16} {:>4} -> {}", name, offset, target);
    offset + 5
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let constant = chunk.read_i32(offset + 1);
    let _ = writeln!(out, "{:<16} {:>4} '{}'", name, constant, constant_repr(&chunk.constant(constant as usize)));
    offset + 5
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn int_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let operand = chunk.read_i32(offset + 1);
    let _ = writeln!(out, "{:<16} {:>4}", name, operand);
    offset + 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_variable_length_operands() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::ConstInt, 1);
        chunk.write_i64(42, 1);
        chunk.write_op(OpCode::Return, 2);
        chunk.write_i32(2, 2);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::CloseUpvalue, 2);
        chunk.write_op(OpCode::Nil, 3);

        let mut out = String::new();
        let next = disassemble_instruction(&chunk, 0, &mut out);
        assert_eq!(next, 9);
        let next = disassemble_instruction(&chunk, next, &mut out);
        assert_eq!(next, 16);
        assert!(out.contains("ConstInt         42"));
        assert!(out.contains("Return           [Pop, CloseUpvalue]"));
        assert_eq!(disassemble_instruction(&chunk, next, &mut out), 17);
    }

    #[test]
    fn test_disassemble_function_includes_nested() {
        let mut inner = ObjectFunction::new("inner");
        inner.chunk.write_op(OpCode::Nil, 1);
        let mut outer = ObjectFunction::new("outer");
        outer.chunk.add_constant(Value::Function(std::rc::Rc::new(inner)));
        outer.chunk.write_op(OpCode::Nil, 1);

        let listing = disassemble_function(&outer);
        assert!(listing.contains("== outer =="));
        assert!(listing.contains("== inner =="));
    }
}
