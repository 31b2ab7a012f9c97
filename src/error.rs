use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("[\"{file}\" line {line}] Error: {message}")]
pub struct LexerError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

/// Compile failure located at a token, with a caret-annotated window of the
/// surrounding source lines.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[\"{file}\" line {line}] At {token_type}: {message}\n{window}")]
pub struct CompilerError {
    pub file: String,
    pub line: usize,
    pub token_type: String,
    pub message: String,
    pub window: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    /// Innermost frame first, each rendered as `[file:line] in name`.
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.call_stack {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum NusaError {
    #[error(transparent)]
    Lexer(#[from] LexerError),

    #[error(transparent)]
    Compiler(#[from] CompilerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Could not read file \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl NusaError {
    /// Process exit code used by the binary for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            NusaError::Lexer(_) | NusaError::Compiler(_) => 65,
            NusaError::Runtime(_) => 70,
            NusaError::Io { .. } => 74,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_lists_frames() {
        let error = RuntimeError {
            message: "Undefined method: foo".to_string(),
            call_stack: vec!["[main:3] in bar".to_string(), "[main:7] in script".to_string()],
        };
        assert_eq!(error.to_string(), "Undefined method: foo\n[main:3] in bar\n[main:7] in script");
    }

    #[test]
    fn test_lexer_error_format() {
        let error = LexerError { file: "main".to_string(), line: 4, message: "Unterminated string.".to_string() };
        assert_eq!(error.to_string(), "[\"main\" line 4] Error: Unterminated string.");
        assert_eq!(NusaError::from(error).exit_code(), 65);
    }
}
