use std::collections::HashMap;
use std::rc::Rc;

use strum_macros::{Display, EnumString};

use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
pub enum OpCode {
    True,
    False,
    ConstInt,
    ConstFloat,
    ConstId,
    Const,
    Nil,
    Pop,
    PopUnder,
    SetLocal,
    GetLocal,
    SetUpvalue,
    GetUpvalue,
    SetProp,
    GetProp,
    UpdateProp,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Is,
    Invert,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    DivideInt,
    Mod,
    Has,
    Jump,
    JumpIfFalse,
    JumpIfNil,
    JumpIfThrown,
    Call,
    Invoke,
    Closure,
    CloseUpvalue,
    Return,
    Throw,
    Class,
    Inherit,
    Method,
    ClassDeclrDone,
    Super,
    GetSuper,
    SuperInvoke,
    Object,
    List,
    RangeTo,
    UnboxThrown,
    Yield,
}

const ALL_OPCODES: [OpCode; 53] = [
    OpCode::True,
    OpCode::False,
    OpCode::ConstInt,
    OpCode::ConstFloat,
    OpCode::ConstId,
    OpCode::Const,
    OpCode::Nil,
    OpCode::Pop,
    OpCode::PopUnder,
    OpCode::SetLocal,
    OpCode::GetLocal,
    OpCode::SetUpvalue,
    OpCode::GetUpvalue,
    OpCode::SetProp,
    OpCode::GetProp,
    OpCode::UpdateProp,
    OpCode::Lt,
    OpCode::Le,
    OpCode::Gt,
    OpCode::Ge,
    OpCode::Eq,
    OpCode::Is,
    OpCode::Invert,
    OpCode::Negate,
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Multiply,
    OpCode::Divide,
    OpCode::DivideInt,
    OpCode::Mod,
    OpCode::Has,
    OpCode::Jump,
    OpCode::JumpIfFalse,
    OpCode::JumpIfNil,
    OpCode::JumpIfThrown,
    OpCode::Call,
    OpCode::Invoke,
    OpCode::Closure,
    OpCode::CloseUpvalue,
    OpCode::Return,
    OpCode::Throw,
    OpCode::Class,
    OpCode::Inherit,
    OpCode::Method,
    OpCode::ClassDeclrDone,
    OpCode::Super,
    OpCode::GetSuper,
    OpCode::SuperInvoke,
    OpCode::Object,
    OpCode::List,
    OpCode::RangeTo,
    OpCode::UnboxThrown,
    OpCode::Yield,
];

const OPCODE_ARRAY: [Option<OpCode>; 256] = {
    let mut arr = [None; 256];
    let mut i = 0;
    while i < ALL_OPCODES.len() {
        arr[ALL_OPCODES[i] as u8 as usize] = Some(ALL_OPCODES[i]);
        i += 1;
    }
    arr
};

impl OpCode {
    #[inline(always)]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_ARRAY[byte as usize]
    }

    #[inline(always)]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn byte_to_string(byte: &Option<OpCode>) -> String {
        match byte {
            Some(code) => code.to_string(),
            None => "None".to_string(),
        }
    }
}

/// Key under which literal constants are interned, so repeated literals
/// and names share one pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Bool(bool),
    Str(Rc<str>),
}

impl ConstKey {
    fn of(value: &Value) -> Option<ConstKey> {
        match value {
            Value::Int(i) => Some(ConstKey::Int(*i)),
            Value::Float(f) => Some(ConstKey::Float(f.to_bits())),
            Value::Bool(b) => Some(ConstKey::Bool(*b)),
            Value::Str(s) => Some(ConstKey::Str(Rc::clone(s))),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<usize>,
    pub constants: Vec<Value>,
    /// Source file runs as (first offset, file), in offset order.
    files: Vec<(usize, Rc<str>)>,
    interned: HashMap<ConstKey, usize>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk::default()
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line)
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op.to_byte(), line);
    }

    pub fn write_i32(&mut self, value: i32, line: usize) {
        for byte in value.to_le_bytes() {
            self.write(byte, line);
        }
    }

    pub fn write_i64(&mut self, value: i64, line: usize) {
        for byte in value.to_le_bytes() {
            self.write(byte, line);
        }
    }

    pub fn write_f64(&mut self, value: f64, line: usize) {
        for byte in value.to_le_bytes() {
            self.write(byte, line);
        }
    }

    pub fn write_bool(&mut self, value: bool, line: usize) {
        self.write(value as u8, line);
    }

    /// Overwrites a previously reserved i32 operand.
    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        if let Some(slot) = self.code.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Records that bytes written from now on come from `file`.
    pub fn mark_file(&mut self, file: &Rc<str>) {
        match self.files.last() {
            Some((_, last)) if Rc::ptr_eq(last, file) || last == file => {}
            _ => self.files.push((self.code.len(), Rc::clone(file))),
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.code.truncate(len);
        self.lines.truncate(len);
        while self.files.len() > 1 && self.files.last().map_or(false, |(start, _)| *start > len) {
            self.files.pop();
        }
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.code.get(offset).copied().unwrap_or(0)
    }

    pub fn read_bool(&self, offset: usize) -> bool {
        self.read_byte(offset) != 0
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        self.code
            .get(offset..offset + 4)
            .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
            .map_or(0, i32::from_le_bytes)
    }

    pub fn read_i64(&self, offset: usize) -> i64 {
        self.code
            .get(offset..offset + 8)
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map_or(0, i64::from_le_bytes)
    }

    pub fn read_f64(&self, offset: usize) -> f64 {
        self.code
            .get(offset..offset + 8)
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map_or(0.0, f64::from_le_bytes)
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).or(self.lines.last()).copied().unwrap_or(0)
    }

    pub fn file_at(&self, offset: usize) -> &str {
        self.files
            .iter()
            .rev()
            .find(|(start, _)| *start <= offset)
            .or(self.files.first())
            .map_or("", |(_, file)| file.as_ref())
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        let key = ConstKey::of(&value);
        if let Some(index) = key.as_ref().and_then(|key| self.interned.get(key)) {
            return *index;
        }
        self.constants.push(value);
        let index = self.constants.len() - 1;
        if let Some(key) = key {
            self.interned.insert(key, index);
        }
        index
    }

    pub fn constant(&self, index: usize) -> Value {
        self.constants.get(index).cloned().unwrap_or(Value::Nil)
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunk, OpCode};
    use crate::value::Value;

    #[test]
    fn test_opcode_bytes_round_trip() {
        assert_eq!(OpCode::from_byte(OpCode::Yield.to_byte()), Some(OpCode::Yield));
        assert_eq!(OpCode::from_byte(OpCode::True.to_byte()), Some(OpCode::True));
        assert_eq!(OpCode::from_byte(200), None);
    }

    #[test]
    fn test_constants_are_interned() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Str("name".into()));
        let b = chunk.add_constant(Value::Int(3));
        let c = chunk.add_constant(Value::Str("name".into()));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn test_operand_encoding_is_little_endian() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_i32(0, 1);
        chunk.patch_i32(1, 0x0102_0304);
        assert_eq!(&chunk.code[1..5], &[4, 3, 2, 1]);
        assert_eq!(chunk.read_i32(1), 0x0102_0304);
        chunk.write_i64(-7, 2);
        assert_eq!(chunk.read_i64(5), -7);
    }
}
