use std::rc::Rc;

use strum_macros::Display;

use crate::objects::object_manager::ClassId;
use crate::table::Table;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ClassKind {
    Core,
    Custom,
    Effect,
    Stance,
    Scenario,
    Ai,
}

impl ClassKind {
    pub fn from_byte(byte: u8) -> Option<ClassKind> {
        match byte {
            0 => Some(ClassKind::Core),
            1 => Some(ClassKind::Custom),
            2 => Some(ClassKind::Effect),
            3 => Some(ClassKind::Stance),
            4 => Some(ClassKind::Scenario),
            5 => Some(ClassKind::Ai),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone)]
pub struct ObjectClass {
    pub name: Rc<str>,
    pub kind: ClassKind,
    pub fields: Table,
    /// Direct superclasses in inheritance order.
    pub superclasses: Vec<ClassId>,
}

impl ObjectClass {
    pub fn new(name: &str, kind: ClassKind) -> Self {
        ObjectClass { name: Rc::from(name), kind, fields: Table::new(), superclasses: Vec::new() }
    }
}
