use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use nusa::objects::object_class::ClassKind;
use nusa::{Driver, DriverOptions, NusaError, Value};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, source: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, source).unwrap();
}

#[derive(Clone, Default)]
struct Captured(Rc<RefCell<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_imports_run_before_importer() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "lib/math_ext.ns", "fn square(x) => x * x\n");
    write_script(dir.path(), "main.ns", "import \"lib/math_ext\"\nsquare(7)\n");

    let (_, result) = Driver::boot(DriverOptions::default(), &[dir.path().join("main.ns")]).unwrap();
    assert_eq!(result, Value::Int(49));
}

#[test]
fn test_shared_import_is_loaded_once() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "base.ns", "class Base {\n  fn name() => \"base\"\n}\n");
    write_script(dir.path(), "a.ns", "import \"base\"\nclass A is Base {}\n");
    write_script(dir.path(), "b.ns", "import \"base.ns\"\nclass B is Base {}\n");
    write_script(dir.path(), "main.ns", "import \"a\"\nimport \"b\"\nA().name() + B().name()\n");

    let (_, result) = Driver::boot(DriverOptions::default(), &[dir.path().join("main.ns")]).unwrap();
    assert_eq!(result, Value::Str("basebase".into()));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "main.ns", "import \"nowhere\"\n");

    match Driver::boot(DriverOptions::default(), &[dir.path().join("main.ns")]) {
        Err(error @ NusaError::Io { .. }) => assert_eq!(error.exit_code(), 74),
        Err(other) => panic!("expected an I/O error, got {other}"),
        Ok(_) => panic!("expected an I/O error"),
    }
}

#[test]
fn test_errors_map_to_exit_codes() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "bad_syntax.ns", "x = (1 +\n");
    write_script(dir.path(), "bad_run.ns", "fn boom() {\n  return 1 // 0\n}\nboom()\n");

    let compile = Driver::boot(DriverOptions::default(), &[dir.path().join("bad_syntax.ns")]).err().unwrap();
    assert_eq!(compile.exit_code(), 65);

    let runtime = Driver::boot(DriverOptions::default(), &[dir.path().join("bad_run.ns")]).err().unwrap();
    assert_eq!(runtime.exit_code(), 70);
    assert_eq!(runtime.to_string(), "Division by zero.\n[bad_run:2] in boom\n[bad_run:4] in script");
}

#[test]
fn test_disassemble_writes_listing() {
    let dir = TempDir::new().unwrap();
    write_script(dir.path(), "main.ns", "fn one() => 1\none()\n");

    let captured = Captured::default();
    let mut driver = Driver::new(DriverOptions { debug: false, disassemble: true });
    driver.vm_mut().set_output(Box::new(captured.clone()));
    let result = driver.run(&[dir.path().join("main.ns")]).unwrap();

    assert_eq!(result, Value::Int(1));
    let listing = captured.text();
    assert!(listing.contains("== script =="));
    assert!(listing.contains("== one =="));
}

#[test]
fn test_host_drives_script_classes() {
    let dir = TempDir::new().unwrap();
    let source = "stance Guard {\n  armor = 2\n  fn absorb(hit) => Math.max(hit - armor, 0)\n}\n";
    write_script(dir.path(), "stances.ns", source);

    let (mut driver, _) = Driver::boot(DriverOptions::default(), &[dir.path().join("stances.ns")]).unwrap();
    let vm = driver.vm_mut();
    assert_eq!(vm.classes_of_kind(ClassKind::Stance), vec!["Guard".to_string()]);

    let guard = vm.instantiate("Guard", &[]).unwrap();
    assert_eq!(vm.invoke_from_host(&guard, "absorb", true, &[Value::Int(5)]).unwrap(), Value::Int(3));
    assert_eq!(vm.invoke_from_host(&guard, "absorb", true, &[Value::Int(1)]).unwrap(), Value::Int(0));
    assert_eq!(vm.invoke_from_host(&guard, "armor", true, &[]).unwrap(), Value::Int(2));
}
