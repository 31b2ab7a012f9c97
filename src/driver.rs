use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};

use crate::constants::SCRIPT_EXTENSION;
use crate::debug::disassemble_function;
use crate::debugger::ConsoleDebuggerFrontend;
use crate::error::NusaError;
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;
use crate::vm::VM;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverOptions {
    /// Compile breakpoints and step through them with the console debugger.
    pub debug: bool,
    /// Write the bytecode listing before running.
    pub disassemble: bool,
}

/// Loads script files with their imports into one program and runs it on
/// an owned VM, which stays available for host calls afterwards.
pub struct Driver {
    options: DriverOptions,
    vm: VM,
}

impl Driver {
    pub fn new(options: DriverOptions) -> Driver {
        let mut vm = VM::new();
        if options.debug {
            vm.set_debug(true);
            vm.attach_debugger(Box::new(ConsoleDebuggerFrontend));
        }
        Driver { options, vm }
    }

    /// Builds a driver and runs `paths` on it.
    pub fn boot<P: AsRef<Path>>(options: DriverOptions, paths: &[P]) -> Result<(Driver, Value), NusaError> {
        let mut driver = Driver::new(options);
        let result = driver.run(paths)?;
        Ok((driver, result))
    }

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut VM {
        &mut self.vm
    }

    pub fn run<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<Value, NusaError> {
        let tokens = self.load(paths)?;
        let script = self.vm.compile_tokens(tokens)?;
        if self.options.disassemble {
            let listing = disassemble_function(&script);
            self.vm.write_output(&listing).map_err(|message| NusaError::Io {
                path: PathBuf::from("<output>"),
                source: std::io::Error::new(std::io::ErrorKind::Other, message),
            })?;
        }
        Ok(self.vm.run_script(script)?)
    }

    /// Token stream of every entry file, each preceded by its imports.
    pub fn load<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<Token>, NusaError> {
        let mut tokens = Vec::new();
        let mut seen = HashSet::new();
        for path in paths {
            let location = canonical(path.as_ref())?;
            if seen.insert(location.clone()) {
                self.load_file(&location, &mut seen, &mut tokens)?;
            }
        }
        let (line, file) = tokens.last().map_or((1, Rc::from("")), |last: &Token| (last.line, Rc::clone(&last.file)));
        tokens.push(Token::new(TokenType::TokenEof, "", None, line, file));
        Ok(tokens)
    }

    fn load_file(&self, location: &Path, seen: &mut HashSet<PathBuf>, tokens: &mut Vec<Token>) -> Result<(), NusaError> {
        info!("loading {}", location.display());
        let source = fs::read_to_string(location)
            .map_err(|source| NusaError::Io { path: location.to_path_buf(), source })?
            .replace("\r\n", "\n");
        let name = script_name(location);
        let output = Scanner::new(&name, &source, self.options.debug).scan_tokens(false)?;

        let directory = location.parent().unwrap_or_else(|| Path::new("."));
        for import in &output.imports {
            let imported = canonical(&resolve_import(directory, import))?;
            if seen.insert(imported.clone()) {
                debug!("{} imports {}", name, imported.display());
                self.load_file(&imported, seen, tokens)?;
            } else {
                debug!("{} already imported", imported.display());
            }
        }

        let (line, file) = output.tokens.last().map_or((1, Rc::from(name.as_str())), |last| (last.line, Rc::clone(&last.file)));
        tokens.extend(output.tokens);
        tokens.push(Token::new(TokenType::TokenNewline, "\n", None, line, file));
        Ok(())
    }
}

/// `import "a/b"` names `a/b.ns` next to the importing file.
fn resolve_import(directory: &Path, import: &str) -> PathBuf {
    let suffix = format!(".{SCRIPT_EXTENSION}");
    let file = if import.ends_with(&suffix) { import.to_string() } else { format!("{import}{suffix}") };
    directory.join(file)
}

fn canonical(path: &Path) -> Result<PathBuf, NusaError> {
    fs::canonicalize(path).map_err(|source| NusaError::Io { path: path.to_path_buf(), source })
}

fn script_name(location: &Path) -> String {
    location.file_stem().map_or_else(|| location.display().to_string(), |stem| stem.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{resolve_import, script_name};

    #[test]
    fn test_resolve_import_adds_extension() {
        let directory = Path::new("/scripts");
        assert_eq!(resolve_import(directory, "lib/util"), Path::new("/scripts/lib/util.ns"));
        assert_eq!(resolve_import(directory, "util.ns"), Path::new("/scripts/util.ns"));
    }

    #[test]
    fn test_script_name_is_file_stem() {
        assert_eq!(script_name(Path::new("/scripts/main.ns")), "main");
    }
}
