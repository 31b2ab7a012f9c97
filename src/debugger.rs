use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use log::{debug, warn};

use crate::call_frame::CallFrame;
use crate::objects::object_function::ObjectFunction;
use crate::patcher::patch;
use crate::scanner::Token;
use crate::value::Value;
use crate::vm::VM;

const MAX_STACK_ITEMS: usize = 5;
const MAX_VALUE_LENGTH: usize = 100;
const PROMPT: &str = "nsdb ('h' for help)> ";
const HELP: &str = "
Commands:
    g index - (g)o to call frame at index.
    p index - (p)rints the value at the stack index.
    i - step (i)nto.
    v - step o(v)er.
    o - step (o)ut.
    l - print all (l)ocals.
    s - print the entire fiber (s)tack.
    a - add a breakpoint for current line.
    r - removes the breakpoint at current line.
";

/// A source position, rendered as `file:line`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodePointer {
    pub file: Rc<str>,
    pub line: usize,
}

impl CodePointer {
    pub fn new(file: Rc<str>, line: usize) -> Self {
        CodePointer { file, line }
    }
}

impl fmt::Display for CodePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A named stack slot and the bytecode range it is alive in.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugLocal {
    pub name: Rc<str>,
    pub slot: usize,
    pub start: usize,
    pub end: Option<usize>,
}

impl DebugLocal {
    fn is_live_at(&self, offset: usize) -> bool {
        self.start <= offset && self.end.map_or(true, |end| offset < end)
    }
}

/// Per-function side tables produced by the compiler in debug mode.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub locals: Vec<DebugLocal>,
    /// Offsets at which a new source line starts.
    pub lines: BTreeMap<usize, CodePointer>,
    /// Offsets carrying a compiled-in breakpoint.
    pub breakpoints: BTreeSet<usize>,
}

impl DebugInfo {
    pub fn open_local(&mut self, name: &str, slot: usize, start: usize) -> usize {
        self.locals.push(DebugLocal { name: Rc::from(name), slot, start, end: None });
        self.locals.len() - 1
    }

    pub fn close_local(&mut self, index: usize, end: usize) {
        if let Some(local) = self.locals.get_mut(index) {
            local.end.get_or_insert(end);
        }
    }

    pub fn close_open_locals(&mut self, end: usize) {
        for local in self.locals.iter_mut().filter(|local| local.end.is_none()) {
            local.end = Some(end);
        }
    }

    pub fn mark_line(&mut self, pointer: CodePointer, offset: usize, has_breakpoint: bool) {
        let repeated = self.lines.range(..=offset).next_back().map_or(false, |(_, last)| *last == pointer);
        if !repeated {
            self.lines.insert(offset, pointer);
        }
        if has_breakpoint {
            self.breakpoints.insert(offset);
        }
    }

    pub fn is_line_start(&self, offset: usize) -> bool {
        self.lines.contains_key(&offset)
    }

    pub fn is_stop_point(&self, offset: usize) -> bool {
        self.is_line_start(offset) || self.breakpoints.contains(&offset)
    }

    pub fn pointer_at(&self, offset: usize) -> Option<&CodePointer> {
        self.lines.range(..=offset).next_back().map(|(_, pointer)| pointer)
    }

    pub fn live_locals(&self, offset: usize) -> impl Iterator<Item = &DebugLocal> {
        self.locals.iter().rev().filter(move |local| !local.name.is_empty() && local.is_live_at(offset))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStack {
    pub frames: Vec<String>,
    pub focus_frame: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameLocal {
    pub name: String,
    pub value_string: String,
    pub value_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerCommand {
    Resume,
    PrintHelp,
    GoToFrame(usize),
    PrintValueOnStack(usize),
    StepInto,
    StepOver,
    StepOut,
    PrintLocals,
    PrintStack,
    AddBreakpoint,
    RemoveBreakpoint,
}

impl DebuggerCommand {
    pub fn parse(line: &str) -> DebuggerCommand {
        let line = line.trim();
        let index = || line.get(1..).and_then(|rest| rest.trim().parse::<usize>().ok());
        match line.chars().next() {
            Some('h') => DebuggerCommand::PrintHelp,
            Some('g') => index().map_or(DebuggerCommand::PrintHelp, DebuggerCommand::GoToFrame),
            Some('p') => index().map_or(DebuggerCommand::PrintHelp, DebuggerCommand::PrintValueOnStack),
            Some('i') => DebuggerCommand::StepInto,
            Some('v') => DebuggerCommand::StepOver,
            Some('o') => DebuggerCommand::StepOut,
            Some('l') => DebuggerCommand::PrintLocals,
            Some('s') => DebuggerCommand::PrintStack,
            Some('a') => DebuggerCommand::AddBreakpoint,
            Some('r') => DebuggerCommand::RemoveBreakpoint,
            _ => DebuggerCommand::Resume,
        }
    }
}

pub trait DebuggerFrontend {
    fn prepare(&mut self);
    fn read(&mut self) -> DebuggerCommand;
    fn write_message(&mut self, message: &str);
    fn write_call_stack(&mut self, call_stack: &CallStack);
    fn write_source_code(&mut self, source: &str);
    fn write_locals(&mut self, locals: &[FrameLocal]);
    fn write_stack(&mut self, stack: &str);
}

/// Interactive frontend on stdin/stdout.
pub struct ConsoleDebuggerFrontend;

impl DebuggerFrontend for ConsoleDebuggerFrontend {
    fn prepare(&mut self) {}

    fn read(&mut self) -> DebuggerCommand {
        print!("{PROMPT}");
        if let Err(e) = io::stdout().flush() {
            warn!("failed to flush debugger prompt: {e}");
        }
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => DebuggerCommand::parse(&line),
            Err(e) => {
                warn!("failed to read debugger command: {e}");
                DebuggerCommand::Resume
            }
        }
    }

    fn write_message(&mut self, message: &str) {
        println!("{message}");
    }

    fn write_call_stack(&mut self, call_stack: &CallStack) {
        println!("CALL STACK:");
        for (i, frame) in call_stack.frames.iter().enumerate() {
            if i == call_stack.focus_frame {
                print!("* ");
            }
            println!("{frame}");
        }
    }

    fn write_source_code(&mut self, source: &str) {
        println!("{source}");
    }

    fn write_locals(&mut self, locals: &[FrameLocal]) {
        println!("LOCALS:");
        for local in locals {
            println!("({}) {} = {}", local.value_type, local.name, local.value_string);
        }
    }

    fn write_stack(&mut self, stack: &str) {
        println!("{stack}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Breakpoint,
    Into,
    Over,
    Out,
}

/// Breakpoint and stepping state, consulted by the VM whenever execution
/// reaches the start of a source line, enters a call, or fails.
pub struct Debugger {
    frontend: Box<dyn DebuggerFrontend>,
    tokens: Vec<Token>,
    added_breakpoints: HashMap<usize, BTreeSet<usize>>,
    ignored_breakpoints: HashMap<usize, BTreeSet<usize>>,
    focus_frame: usize,
    status: StepStatus,
    trigger_points: Vec<CodePointer>,
    trigger_frames: Vec<usize>,
}

fn function_key(function: &ObjectFunction) -> usize {
    function as *const ObjectFunction as usize
}

fn limit_value(value: String) -> String {
    match value.char_indices().nth(MAX_VALUE_LENGTH) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value,
    }
}

fn local_type(value: &Value, vm: &VM) -> &'static str {
    match value {
        Value::Bool(_) => "Bool",
        Value::Int(_) => "Int",
        Value::Float(_) => "Float",
        Value::Str(_) => "Str",
        Value::Instance(id) if vm.heap().instance(*id).is_list() => "List",
        Value::Instance(_) => "Object",
        Value::Nil => "null",
        Value::Closure(_) => "fn",
        _ => "Unknown",
    }
}

/// Bytecode position of a frame: the next instruction for the innermost
/// frame, the pending call for the others.
fn frame_position(frames: &[CallFrame], index: usize) -> usize {
    let frame = &frames[index];
    if index + 1 == frames.len() {
        frame.ip
    } else {
        frame.current_offset()
    }
}

fn frame_pointer(frames: &[CallFrame], index: usize) -> CodePointer {
    let frame = &frames[index];
    let position = frame_position(frames, index);
    match frame.function().debug_info.as_ref().and_then(|info| info.pointer_at(position)) {
        Some(pointer) => pointer.clone(),
        None => CodePointer::new(Rc::from(frame.chunk().file_at(position)), frame.chunk().line_at(position)),
    }
}

impl Debugger {
    pub fn new(frontend: Box<dyn DebuggerFrontend>) -> Self {
        Debugger {
            frontend,
            tokens: Vec::new(),
            added_breakpoints: HashMap::new(),
            ignored_breakpoints: HashMap::new(),
            focus_frame: 0,
            status: StepStatus::Breakpoint,
            trigger_points: Vec::new(),
            trigger_frames: Vec::new(),
        }
    }

    /// Tokens of every loaded file, used to render source windows.
    pub fn set_tokens(&mut self, tokens: Vec<Token>) {
        self.tokens = tokens;
    }

    pub fn trigger_breakpoint(&mut self, vm: &VM, is_call: bool) {
        let frames = vm.frames();
        let top = match frames.len().checked_sub(1) {
            Some(top) => top,
            None => return,
        };
        let function = frames[top].function();
        let position = frame_position(frames, top);
        let pointer = frame_pointer(frames, top);

        match self.status {
            StepStatus::Breakpoint => {
                let key = function_key(function);
                let compiled = function.debug_info.as_ref().map_or(false, |info| info.breakpoints.contains(&position));
                let added = self.added_breakpoints.get(&key).map_or(false, |set| set.contains(&position));
                let ignored = self.ignored_breakpoints.get(&key).map_or(false, |set| set.contains(&position));
                if !(compiled || added) || ignored {
                    return;
                }
            }
            StepStatus::Into => {
                if !is_call {
                    return;
                }
                self.status = StepStatus::Breakpoint;
            }
            StepStatus::Over => {
                match self.trigger_frames.last() {
                    Some(depth) if frames.len() <= *depth => {}
                    _ => return,
                }
                match self.trigger_points.last() {
                    Some(trigger) if *trigger != pointer => {}
                    _ => return,
                }
                self.trigger_points.pop();
                self.trigger_frames.pop();
                self.status = StepStatus::Breakpoint;
            }
            StepStatus::Out => {
                match self.trigger_points.last() {
                    Some(trigger) if *trigger == pointer => {}
                    _ => return,
                }
                self.trigger_points.pop();
                self.status = StepStatus::Breakpoint;
            }
        }
        debug!("debugger stopped at {pointer}");
        self.focus_frame = 0;
        self.frontend.prepare();
        self.print_focus_frame(vm, "BREAKPOINT");
        self.read_input(vm);
    }

    pub fn trigger_error(&mut self, vm: &VM, message: &str) {
        if vm.frames().is_empty() {
            return;
        }
        self.focus_frame = 0;
        self.frontend.prepare();
        self.print_focus_frame(vm, &format!("RUNTIME ERROR: {message}"));
        self.read_input(vm);
    }

    fn focus_index(&self, frames: &[CallFrame]) -> usize {
        frames.len().saturating_sub(1 + self.focus_frame.min(frames.len().saturating_sub(1)))
    }

    fn print_focus_frame(&mut self, vm: &VM, message: &str) {
        let frames = vm.frames();
        if frames.is_empty() {
            return;
        }
        let index = self.focus_index(frames);
        let pointer = frame_pointer(frames, index);

        let call_stack = CallStack {
            frames: frames.iter().rev().map(|frame| vm.describe_frame(frame)).collect(),
            focus_frame: frames.len() - 1 - index,
        };
        self.frontend.write_call_stack(&call_stack);
        self.frontend.write_source_code(&self.source_window(&pointer));
        let locals = self.locals_for_frame(vm, index);
        self.frontend.write_locals(&locals);
        let stack = self.stack_for_frame(vm, index, true);
        self.frontend.write_stack(&stack);
        self.frontend.write_message(message);
    }

    fn source_window(&self, pointer: &CodePointer) -> String {
        let tokens: Vec<Token> = self.tokens.iter().filter(|token| token.file == pointer.file).cloned().collect();
        match tokens.iter().position(|token| token.line == pointer.line) {
            Some(highlighted) => patch(&tokens, highlighted),
            None => String::new(),
        }
    }

    fn locals_for_frame(&self, vm: &VM, index: usize) -> Vec<FrameLocal> {
        let frames = vm.frames();
        let frame = &frames[index];
        let position = frame_position(frames, index);
        let stack = vm.stack();
        let info = match frame.function().debug_info.as_ref() {
            Some(info) => info,
            None => return Vec::new(),
        };
        info.live_locals(position)
            .map_while(|local| stack.get(frame.base + local.slot).map(|value| (local, value)))
            .map(|(local, value)| FrameLocal {
                name: local.name.to_string(),
                value_string: vm.stringify(value),
                value_type: local_type(value, vm).to_string(),
            })
            .collect()
    }

    fn stack_for_frame(&self, vm: &VM, index: usize, capped: bool) -> String {
        let base = vm.frames()[index].base;
        let stack = vm.stack();
        let mut out = String::new();
        for (count, i) in (base..stack.len()).rev().enumerate() {
            if capped && count == MAX_STACK_ITEMS {
                out.push_str(&format!(
                    "...{} more stack items available, use 's' to print them all.\n",
                    stack.len() - base - MAX_STACK_ITEMS
                ));
                break;
            }
            out.push_str(&format!("[{}] {}\n", i, limit_value(vm.stringify(&stack[i]))));
        }
        out
    }

    fn read_input(&mut self, vm: &VM) {
        let frames = vm.frames();
        let top = frames.len() - 1;
        let key = function_key(frames[top].function());
        let position = frame_position(frames, top);
        let pointer = frame_pointer(frames, top);

        loop {
            match self.frontend.read() {
                DebuggerCommand::PrintHelp => self.frontend.write_message(HELP),
                DebuggerCommand::GoToFrame(index) => {
                    self.focus_frame = index;
                    self.print_focus_frame(vm, "");
                }
                DebuggerCommand::PrintValueOnStack(index) => {
                    let message = match vm.stack().get(index) {
                        Some(value) => vm.stringify(value),
                        None => format!("No value at stack index {index}."),
                    };
                    self.frontend.write_message(&message);
                }
                DebuggerCommand::StepInto => {
                    self.status = StepStatus::Into;
                    self.trigger_points.push(pointer);
                    return;
                }
                DebuggerCommand::StepOver => {
                    self.status = StepStatus::Over;
                    self.trigger_frames.push(frames.len());
                    self.trigger_points.push(pointer);
                    return;
                }
                DebuggerCommand::StepOut => {
                    self.status = StepStatus::Out;
                    return;
                }
                DebuggerCommand::PrintLocals => {
                    let locals = self.locals_for_frame(vm, self.focus_index(frames));
                    self.frontend.write_locals(&locals);
                }
                DebuggerCommand::PrintStack => {
                    let stack = self.stack_for_frame(vm, self.focus_index(frames), false);
                    self.frontend.write_stack(&stack);
                }
                DebuggerCommand::AddBreakpoint => {
                    self.added_breakpoints.entry(key).or_default().insert(position);
                    self.frontend.write_message(&format!("Breakpoint added for {pointer}."));
                }
                DebuggerCommand::RemoveBreakpoint => {
                    let removed = self.added_breakpoints.get_mut(&key).map_or(false, |set| set.remove(&position));
                    if removed {
                        self.frontend.write_message(&format!("Breakpoint removed for {pointer}."));
                    } else {
                        self.ignored_breakpoints.entry(key).or_default().insert(position);
                        self.frontend.write_message(&format!("Breakpoint ignored for {pointer}."));
                    }
                }
                DebuggerCommand::Resume => {
                    self.status = StepStatus::Breakpoint;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::vm::VM;

    #[derive(Default)]
    struct Transcript {
        commands: VecDeque<DebuggerCommand>,
        messages: Vec<String>,
        locals: Vec<Vec<FrameLocal>>,
        call_stacks: Vec<CallStack>,
    }

    struct ScriptedFrontend(Rc<RefCell<Transcript>>);

    impl DebuggerFrontend for ScriptedFrontend {
        fn prepare(&mut self) {}

        fn read(&mut self) -> DebuggerCommand {
            self.0.borrow_mut().commands.pop_front().unwrap_or(DebuggerCommand::Resume)
        }

        fn write_message(&mut self, message: &str) {
            self.0.borrow_mut().messages.push(message.to_string());
        }

        fn write_call_stack(&mut self, call_stack: &CallStack) {
            self.0.borrow_mut().call_stacks.push(call_stack.clone());
        }

        fn write_source_code(&mut self, _source: &str) {}

        fn write_locals(&mut self, locals: &[FrameLocal]) {
            self.0.borrow_mut().locals.push(locals.to_vec());
        }

        fn write_stack(&mut self, _stack: &str) {}
    }

    fn debug_run(source: &str, commands: Vec<DebuggerCommand>) -> Rc<RefCell<Transcript>> {
        let transcript = Rc::new(RefCell::new(Transcript { commands: commands.into(), ..Transcript::default() }));
        let mut vm = VM::new();
        vm.set_debug(true);
        vm.attach_debugger(Box::new(ScriptedFrontend(Rc::clone(&transcript))));
        let _ = vm.interpret_source("main", source);
        transcript
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(DebuggerCommand::parse("g 2"), DebuggerCommand::GoToFrame(2));
        assert_eq!(DebuggerCommand::parse("p 10\n"), DebuggerCommand::PrintValueOnStack(10));
        assert_eq!(DebuggerCommand::parse("p x"), DebuggerCommand::PrintHelp);
        assert_eq!(DebuggerCommand::parse("v"), DebuggerCommand::StepOver);
        assert_eq!(DebuggerCommand::parse(""), DebuggerCommand::Resume);
        assert_eq!(DebuggerCommand::parse("zzz"), DebuggerCommand::Resume);
    }

    #[test]
    fn test_debug_info_tracks_lines_and_lifetimes() {
        let mut info = DebugInfo::default();
        let file: Rc<str> = Rc::from("main");
        info.mark_line(CodePointer::new(Rc::clone(&file), 1), 0, false);
        info.mark_line(CodePointer::new(Rc::clone(&file), 1), 4, false);
        info.mark_line(CodePointer::new(Rc::clone(&file), 2), 9, true);
        assert!(info.is_line_start(0));
        assert!(!info.is_line_start(4));
        assert_eq!(info.pointer_at(7).map(|p| p.line), Some(1));
        assert!(info.breakpoints.contains(&9));

        let a = info.open_local("a", 1, 2);
        info.open_local("b", 2, 5);
        info.close_local(a, 6);
        info.close_open_locals(12);
        let live: Vec<&str> = info.live_locals(5).map(|l| l.name.as_ref()).collect();
        assert_eq!(live, vec!["b", "a"]);
        let live: Vec<&str> = info.live_locals(8).map(|l| l.name.as_ref()).collect();
        assert_eq!(live, vec!["b"]);
    }

    #[test]
    fn test_code_pointer_display() {
        assert_eq!(CodePointer::new(Rc::from("lib/util"), 12).to_string(), "lib/util:12");
    }

    #[test]
    fn test_compiled_breakpoint_stops_with_locals() {
        let transcript = debug_run("x = 41\ny = x + 1 # BP\ny", vec![DebuggerCommand::Resume]);
        let transcript = transcript.borrow();
        assert_eq!(transcript.messages, vec!["BREAKPOINT".to_string()]);
        let locals = &transcript.locals[0];
        let x = locals.iter().find(|local| local.name == "x").unwrap();
        assert_eq!(x.value_string, "41");
        assert_eq!(x.value_type, "Int");
        assert_eq!(transcript.call_stacks[0].focus_frame, 0);
    }

    #[test]
    fn test_step_over_stops_on_next_line() {
        let transcript = debug_run("x = 1\nx = 2 # BP\nx = 3\nx", vec![DebuggerCommand::StepOver, DebuggerCommand::Resume]);
        let transcript = transcript.borrow();
        assert_eq!(transcript.messages, vec!["BREAKPOINT".to_string(), "BREAKPOINT".to_string()]);
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let transcript = debug_run("x = 1\nx.missing()", vec![]);
        let transcript = transcript.borrow();
        assert_eq!(transcript.messages, vec!["RUNTIME ERROR: Undefined method: missing".to_string()]);
    }

    #[test]
    fn test_remove_compiled_breakpoint_ignores_it() {
        let source = "fn f() {\n  return 1 # BP\n}\nf()\nf()";
        let transcript = debug_run(source, vec![DebuggerCommand::RemoveBreakpoint, DebuggerCommand::Resume]);
        let transcript = transcript.borrow();
        assert_eq!(transcript.messages.iter().filter(|m| *m == "BREAKPOINT").count(), 1);
        assert!(transcript.messages.iter().any(|m| m.starts_with("Breakpoint ignored for main:")));
    }
}
