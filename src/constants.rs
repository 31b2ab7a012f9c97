pub const INITIAL_STACK_SIZE: usize = 256;
pub const STACK_GROWTH_FACTOR: usize = 4;
pub const MAX_FRAMES: usize = 1024;

// Lines shown above and below the offending line in compiler errors.
pub const SURROUNDING_LINES_COUNT: usize = 2;

pub const SCRIPT_EXTENSION: &str = "ns";
pub const SCRIPT_FILE: &str = "Script";
pub const SCRIPT_FUNCTION: &str = "script";
pub const BREAKPOINT_LEXEME: &str = "BP";

pub const THIS: &str = "this";
pub const INIT: &str = "init";
pub const HAS: &str = "has";
pub const ITERATE: &str = "iterate";
pub const NEXT: &str = "next";

pub const CLASS_BOOL: &str = "Bool";
pub const CLASS_INT: &str = "Int";
pub const CLASS_FLOAT: &str = "Float";
pub const CLASS_STR: &str = "Str";
pub const CLASS_OBJECT: &str = "Object";
pub const CLASS_LIST: &str = "List";
pub const CLASS_RANGE: &str = "Range";

pub const OBJ_CONSOLE: &str = "Console";
pub const OBJ_MATH: &str = "Math";
pub const OBJ_DEBUG: &str = "Debug";
pub const FN_FIBER: &str = "Fiber";

/// Names bound as const locals of every script, in slot order starting at 1.
pub const INITIAL_OBJECTS: [&str; 11] = [
    CLASS_BOOL,
    CLASS_INT,
    CLASS_FLOAT,
    CLASS_STR,
    CLASS_OBJECT,
    CLASS_LIST,
    CLASS_RANGE,
    OBJ_CONSOLE,
    OBJ_MATH,
    OBJ_DEBUG,
    FN_FIBER,
];

pub const FIELD_ID: &str = "id";
pub const FIELD_MIN: &str = "min";
pub const FIELD_MAX: &str = "max";
pub const FIELD_TRIGGER: &str = "trigger";
pub const FIELD_RUN: &str = "run";
pub const FIELD_CHECK_VICTORY: &str = "checkVictory";
pub const FIELD_UPDATE: &str = "update";
