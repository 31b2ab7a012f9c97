pub mod objects;
pub mod std_mod;

pub mod call_frame;
pub mod chunk;
pub mod compiler;
pub mod constants;
pub mod debug;
pub mod debugger;
pub mod driver;
pub mod error;
pub mod patcher;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

pub use driver::{Driver, DriverOptions};
pub use error::{CompilerError, LexerError, NusaError, RuntimeError};
pub use value::Value;
pub use vm::{InterpretResult, VM};
