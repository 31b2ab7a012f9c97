use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, error};
use parking_lot::ReentrantMutex;

use crate::call_frame::CallFrame;
use crate::chunk::{Chunk, OpCode};
use crate::compiler::compile;
use crate::constants::{FIELD_ID, FIELD_MAX, FIELD_MIN, HAS, INIT, INITIAL_OBJECTS, MAX_FRAMES, SCRIPT_FILE, SCRIPT_FUNCTION};
use crate::debugger::{Debugger, DebuggerFrontend};
use crate::error::{NusaError, RuntimeError};
use crate::objects::object_bound_method::{BoundCallable, ObjectBoundMethod};
use crate::objects::object_class::{ClassKind, ObjectClass};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_fiber::{FiberState, ObjectFiber};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_manager::{ClassId, FiberId, ObjectManager, UpvalueId};
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_upvalue::{ObjectUpvalue, UpvalueState};
use crate::scanner::{Scanner, Token};
use crate::std_mod;
use crate::std_mod::core_classes::CoreClasses;
use crate::value::{int_if_possible, is_false, is_nil, is_thrown, Value};

#[derive(PartialEq, Debug)]
pub enum InterpretResult {
    InterpretOk,
    InterpretCompileError,
    InterpretRuntimeError,
}

/// What a call left behind once dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Called {
    /// A new frame was pushed on the current fiber.
    Frame,
    /// The result already replaced the callee and its arguments.
    Value,
    /// Control moved to another fiber.
    Switched,
}

pub struct VM {
    heap: ObjectManager,
    core: CoreClasses,
    root_fiber: FiberId,
    fiber: FiberId,
    open_upvalues: Vec<UpvalueId>,
    initial_objects: Vec<Value>,
    declared_classes: HashMap<Rc<str>, ClassId>,
    // Fibers that have a native call waiting on a nested run.
    native_boundaries: Vec<FiberId>,
    pending_error: Option<RuntimeError>,
    debugger: Option<Debugger>,
    entered_call: bool,
    is_debug: bool,
    output: Box<dyn Write>,
    host_lock: Arc<ReentrantMutex<()>>,
}

impl Default for VM {
    fn default() -> Self {
        VM::new()
    }
}

impl VM {
    pub fn new() -> VM {
        let mut heap = ObjectManager::new();
        let core = std_mod::core_classes::register(&mut heap);
        let root_closure = Rc::new(ObjectClosure::new(Rc::new(ObjectFunction::new(SCRIPT_FUNCTION)), Vec::new()));
        let mut root = ObjectFiber::new(root_closure);
        root.state = FiberState::Started;
        let root_fiber = heap.alloc_fiber(root);

        let mut vm = VM {
            heap,
            core,
            root_fiber,
            fiber: root_fiber,
            open_upvalues: Vec::new(),
            initial_objects: Vec::new(),
            declared_classes: HashMap::new(),
            native_boundaries: Vec::new(),
            pending_error: None,
            debugger: None,
            entered_call: false,
            is_debug: false,
            output: Box::new(io::stdout()),
            host_lock: Arc::new(ReentrantMutex::new(())),
        };
        vm.initial_objects = std_mod::initial_objects(&mut vm);
        debug_assert_eq!(vm.initial_objects.len(), INITIAL_OBJECTS.len());
        vm
    }

    /// Debug mode compiles breakpoints and local lifetimes into every function.
    pub fn set_debug(&mut self, is_debug: bool) {
        self.is_debug = is_debug;
    }

    pub fn is_debug(&self) -> bool {
        self.is_debug
    }

    pub fn attach_debugger(&mut self, frontend: Box<dyn DebuggerFrontend>) {
        self.debugger = Some(Debugger::new(frontend));
    }

    /// Redirects `Console.print`/`println` output.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub fn host_lock(&self) -> Arc<ReentrantMutex<()>> {
        Arc::clone(&self.host_lock)
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        match self.interpret_source(SCRIPT_FILE, source) {
            Ok(_) => InterpretResult::InterpretOk,
            Err(NusaError::Runtime(_)) => InterpretResult::InterpretRuntimeError,
            Err(e) => {
                error!("{e}");
                InterpretResult::InterpretCompileError
            }
        }
    }

    /// Scans, compiles and runs `source`, returning the value of its last
    /// expression statement.
    pub fn interpret_source(&mut self, file: &str, source: &str) -> Result<Value, NusaError> {
        let output = Scanner::new(file, source, self.is_debug).scan_tokens(true)?;
        self.interpret_tokens(output.tokens)
    }

    pub fn interpret_tokens(&mut self, tokens: Vec<Token>) -> Result<Value, NusaError> {
        let function = self.compile_tokens(tokens)?;
        Ok(self.run_script(function)?)
    }

    /// Compiles a full token stream into the script function, with the
    /// initial objects as its parameters.
    pub fn compile_tokens(&mut self, tokens: Vec<Token>) -> Result<Rc<ObjectFunction>, NusaError> {
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.set_tokens(tokens.clone());
        }
        Ok(compile(tokens, &INITIAL_OBJECTS, self.is_debug)?)
    }

    pub fn run_script(&mut self, function: Rc<ObjectFunction>) -> Result<Value, RuntimeError> {
        let script = Value::Closure(Rc::new(ObjectClosure::new(function, Vec::new())));
        let args = self.initial_objects.clone();
        self.fiber = self.root_fiber;
        self.host_call(|vm| vm.call_function(script, &args))
    }

    /// Calls `name` on `receiver` from host code. A missing method is an
    /// error only when `must_exist`, otherwise the call yields nil.
    pub fn invoke_from_host(
        &mut self,
        receiver: &Value,
        name: &str,
        must_exist: bool,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.host_call(|vm| match vm.find_property(receiver, name) {
            Some(property) => {
                let callee = vm.bind(receiver, property);
                if is_callable(&callee) {
                    vm.call_function(callee, args)
                } else {
                    Ok(callee)
                }
            }
            None if must_exist => Err(format!("Undefined method: {name}")),
            None => Ok(Value::Nil),
        })
    }

    /// Creates an instance of a script-declared class from host code.
    pub fn instantiate(&mut self, class_name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        self.host_call(|vm| match vm.declared_classes.get(class_name) {
            Some(class) => vm.call_function(Value::Class(*class), args),
            None => Err(format!("Can't find a class named {class_name}.")),
        })
    }

    pub fn has_class(&self, name: &str, kind: ClassKind) -> bool {
        self.declared_classes.get(name).map_or(false, |class| self.heap.class(*class).kind == kind)
    }

    pub fn classes_of_kind(&self, kind: ClassKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .declared_classes
            .iter()
            .filter(|(_, class)| self.heap.class(**class).kind == kind)
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        names
    }

    fn host_call<F>(&mut self, call: F) -> Result<Value, RuntimeError>
    where
        F: FnOnce(&mut VM) -> Result<Value, String>,
    {
        let lock = Arc::clone(&self.host_lock);
        let _guard = lock.lock();
        match call(self) {
            Ok(value) => Ok(value),
            Err(message) => Err(self.recover(message)),
        }
    }

    fn recover(&mut self, message: String) -> RuntimeError {
        let error = match self.pending_error.take() {
            Some(error) => error,
            None => RuntimeError { message, call_stack: self.call_stack() },
        };
        if self.native_boundaries.is_empty() {
            for id in std::mem::take(&mut self.open_upvalues) {
                let value = self.read_upvalue(id).unwrap_or(Value::Nil);
                self.heap.upvalue_mut(id).close(value);
            }
            let mut fiber = Some(self.fiber);
            while let Some(id) = fiber {
                fiber = self.heap.fiber(id).caller;
                if id != self.root_fiber {
                    self.heap.fiber_mut(id).reset();
                }
            }
            let root = self.heap.fiber_mut(self.root_fiber);
            root.stack.clear();
            root.frames.clear();
            self.fiber = self.root_fiber;
        }
        error
    }

    pub fn heap(&self) -> &ObjectManager {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ObjectManager {
        &mut self.heap
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    /// Frames of the running fiber, outermost first.
    pub fn frames(&self) -> &[CallFrame] {
        &self.heap.fiber(self.fiber).frames
    }

    /// Value stack of the running fiber.
    pub fn stack(&self) -> &[Value] {
        &self.heap.fiber(self.fiber).stack
    }

    pub fn describe_frame(&self, frame: &CallFrame) -> String {
        format!("[{}:{}] in {}", frame.file(), frame.line(), frame.function().name)
    }

    /// Innermost frame first, following the chain of resuming fibers.
    pub fn call_stack(&self) -> Vec<String> {
        let mut frames = Vec::new();
        let mut fiber = Some(self.fiber);
        while let Some(id) = fiber {
            let current = self.heap.fiber(id);
            frames.extend(current.frames.iter().rev().map(|frame| self.describe_frame(frame)));
            fiber = current.caller;
        }
        frames
    }

    pub fn write_output(&mut self, text: &str) -> Result<(), String> {
        self.output
            .write_all(text.as_bytes())
            .and_then(|_| self.output.flush())
            .map_err(|e| format!("Unable to write output: {e}"))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        Value::Instance(self.heap.alloc_instance(ObjectInstance::new_list(self.core.list, items)))
    }

    pub fn new_object(&mut self, fields: Vec<(Rc<str>, Value)>) -> Value {
        let mut instance = ObjectInstance::new(self.core.object);
        for (key, value) in fields {
            instance.fields.insert(key, value);
        }
        Value::Instance(self.heap.alloc_instance(instance))
    }

    pub fn new_range(&mut self, min: i64, max: i64) -> Value {
        let mut instance = ObjectInstance::new(self.core.range);
        instance.fields.insert(Rc::from(FIELD_MIN), Value::Int(min));
        instance.fields.insert(Rc::from(FIELD_MAX), Value::Int(max));
        Value::Instance(self.heap.alloc_instance(instance))
    }

    pub fn list_items(&self, value: &Value) -> Option<&Vec<Value>> {
        match value {
            Value::Instance(id) => self.heap.instance(*id).items.as_ref(),
            _ => None,
        }
    }

    pub fn list_items_mut(&mut self, value: &Value) -> Option<&mut Vec<Value>> {
        match value {
            Value::Instance(id) => self.heap.instance_mut(*id).items.as_mut(),
            _ => None,
        }
    }

    pub fn instance_field(&self, value: &Value, name: &str) -> Option<Value> {
        match value {
            Value::Instance(id) => self.heap.instance(*id).fields.find(name),
            _ => None,
        }
    }

    /// The class whose fields a value's properties are looked up in.
    pub fn class_of(&self, value: &Value) -> Option<ClassId> {
        match value {
            Value::Bool(_) => Some(self.core.bool_class),
            Value::Int(_) => Some(self.core.int),
            Value::Float(_) => Some(self.core.float),
            Value::Str(_) => Some(self.core.str_class),
            Value::Instance(id) => Some(self.heap.instance(*id).class),
            _ => None,
        }
    }

    pub fn stringify(&self, value: &Value) -> String {
        self.stringify_value(value, false)
    }

    fn stringify_value(&self, value: &Value, quoted: bool) -> String {
        match value {
            Value::Nil => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) if quoted => format!("\"{s}\""),
            Value::Str(s) => s.to_string(),
            Value::Function(function) => format!("fn {}", function.name),
            Value::Closure(closure) => format!("fn {}", closure.name()),
            Value::Native(native) => format!("fn {}", native.name),
            Value::BoundMethod(bound) => format!("fn {}", bound.name()),
            Value::Class(id) => {
                let class = self.heap.class(*id);
                format!("{} {}", class.kind, class.name)
            }
            Value::Instance(id) => {
                let instance = self.heap.instance(*id);
                match &instance.items {
                    Some(items) => {
                        let items: Vec<String> = items.iter().map(|item| self.stringify_value(item, true)).collect();
                        format!("[{}]", items.join(", "))
                    }
                    None if instance.fields.is_empty() => "[:]".to_string(),
                    None => {
                        let fields: Vec<String> = instance
                            .fields
                            .iter()
                            .map(|(key, value)| format!("{}: {}", key, self.stringify_value(value, true)))
                            .collect();
                        format!("[{}]", fields.join(", "))
                    }
                }
            }
            Value::Fiber(id) => format!("Fiber {}", self.heap.fiber(*id).name),
            Value::Thrown(inner) => format!("!thrown! {}", self.stringify_value(inner, quoted)),
        }
    }

    /// Identity or structural equality. Instances carrying the same string
    /// `id` field compare equal.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        if a == b {
            return true;
        }
        match (a, b) {
            (Value::Closure(closure), Value::Function(function)) | (Value::Function(function), Value::Closure(closure)) => {
                Rc::ptr_eq(&closure.function, function)
            }
            (Value::Instance(x), Value::Instance(y)) => {
                match (self.heap.instance(*x).fields.find(FIELD_ID), self.heap.instance(*y).fields.find(FIELD_ID)) {
                    (Some(Value::Str(x)), Some(Value::Str(y))) => x == y,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Calls `callee` with `args` from native code, running the VM until it
    /// returns.
    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> Result<Value, String> {
        let fiber = self.fiber;
        let depth = self.heap.fiber(fiber).frames.len();
        self.push(callee.clone());
        for arg in args {
            self.push(arg.clone());
        }
        self.native_boundaries.push(fiber);
        let result = self.call_value(callee, args.len()).and_then(|_| self.run(fiber, depth));
        self.native_boundaries.pop();
        result?;
        Ok(self.pop())
    }

    /// Looks up and calls `name` on `receiver`.
    pub fn call_method(&mut self, receiver: &Value, name: &str, args: &[Value]) -> Result<Value, String> {
        let property = self.find_property(receiver, name).ok_or_else(|| format!("Undefined method: {name}"))?;
        let callee = self.bind(receiver, property);
        self.call_function(callee, args)
    }

    fn run(&mut self, stop_fiber: FiberId, stop_depth: usize) -> Result<(), String> {
        loop {
            if self.fiber == stop_fiber && self.heap.fiber(stop_fiber).frames.len() <= stop_depth {
                return Ok(());
            }
            if self.debugger.is_some() {
                self.debug_hook();
            }
            debug_feature::trace_instruction(self);
            if let Err(message) = self.step() {
                return Err(self.fault(message));
            }
        }
    }

    fn fault(&mut self, message: String) -> String {
        if self.pending_error.is_none() {
            let error = RuntimeError { message: message.clone(), call_stack: self.call_stack() };
            error!("runtime error: {}", error);
            if let Some(mut debugger) = self.debugger.take() {
                debugger.trigger_error(self, &message);
                self.debugger = Some(debugger);
            }
            self.pending_error = Some(error);
        }
        message
    }

    fn debug_hook(&mut self) {
        let is_call = std::mem::take(&mut self.entered_call);
        let at_stop_point = self.frames().last().map_or(false, |frame| {
            frame.function().debug_info.as_ref().map_or(false, |info| info.is_stop_point(frame.ip))
        });
        if !(is_call || at_stop_point) {
            return;
        }
        if let Some(mut debugger) = self.debugger.take() {
            debugger.trigger_breakpoint(self, is_call);
            self.debugger = Some(debugger);
        }
    }

    fn step(&mut self) -> Result<(), String> {
        let byte = self.read_byte();
        let op = OpCode::from_byte(byte).ok_or_else(|| format!("Unknown opcode {byte}."))?;
        match op {
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Nil => self.push(Value::Nil),
            OpCode::ConstInt => {
                let value = self.read_with(8, Chunk::read_i64);
                self.push(Value::Int(value));
            }
            OpCode::ConstFloat => {
                let value = self.read_with(8, Chunk::read_f64);
                self.push(Value::Float(value));
            }
            OpCode::Const | OpCode::ConstId => {
                let value = self.read_constant();
                self.push(value);
            }
            OpCode::Pop => {
                self.pop();
            }
            OpCode::PopUnder => {
                let count = self.read_index();
                let value = self.pop();
                let last = self.sp().saturating_sub(count);
                self.close_upvalues(last);
                self.truncate(last);
                self.push(value);
            }
            OpCode::SetLocal => {
                let slot = self.frame_base() + self.read_index();
                let value = self.pop();
                self.set_slot(slot, value);
            }
            OpCode::GetLocal => {
                let slot = self.frame_base() + self.read_index();
                let value = self.slot(slot);
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let index = self.read_index();
                let upvalue = self.frame_upvalue(index)?;
                let value = self.pop();
                self.write_upvalue(upvalue, value)?;
            }
            OpCode::GetUpvalue => {
                let index = self.read_index();
                let upvalue = self.frame_upvalue(index)?;
                let value = self.read_upvalue(upvalue)?;
                self.push(value);
            }
            OpCode::SetProp => {
                let value = self.pop();
                let key = self.pop();
                let object = self.pop();
                self.set_property(&object, &key, value)?;
            }
            OpCode::GetProp => {
                let key = self.pop();
                let object = self.pop();
                let value = self.get_property(&object, &key, true)?;
                self.push(value);
            }
            OpCode::UpdateProp => {
                let operator = self.read_byte();
                let operator = OpCode::from_byte(operator).ok_or_else(|| format!("Unknown opcode {operator}."))?;
                let value = self.pop();
                let key = self.pop();
                let object = self.pop();
                let current = self.get_property(&object, &key, false)?;
                let updated = self.binary_op(operator, current, value)?;
                self.set_property(&object, &key, updated)?;
            }
            OpCode::Lt
            | OpCode::Le
            | OpCode::Gt
            | OpCode::Ge
            | OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::DivideInt
            | OpCode::Mod => {
                let b = self.pop();
                let a = self.pop();
                let result = self.binary_op(op, a, b)?;
                self.push(result);
            }
            OpCode::Eq => {
                let b = self.pop();
                let a = self.pop();
                let equal = self.values_equal(&a, &b);
                self.push(Value::Bool(equal));
            }
            OpCode::Is => {
                let class = self.pop();
                let value = self.pop();
                let is = self.is_instance_of(&value, &class)?;
                self.push(Value::Bool(is));
            }
            OpCode::Invert => {
                let value = self.pop();
                self.push(Value::Bool(is_false(&value)));
            }
            OpCode::Negate => {
                let value = match self.pop() {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => return Err(format!("Trying to negate a non-number: {}", self.stringify(&other))),
                };
                self.push(value);
            }
            OpCode::Has => {
                let container = self.pop();
                let item = self.pop();
                let result = self.call_method(&container, HAS, &[item])?;
                self.push(Value::Bool(!is_false(&result)));
            }
            OpCode::Jump => {
                let target = self.read_index();
                self.set_ip(target);
            }
            OpCode::JumpIfFalse | OpCode::JumpIfNil | OpCode::JumpIfThrown => {
                let target = self.read_index();
                let top = self.peek(0);
                let taken = match op {
                    OpCode::JumpIfFalse => is_false(&top),
                    OpCode::JumpIfNil => is_nil(&top),
                    _ => is_thrown(&top),
                };
                if taken {
                    self.set_ip(target);
                }
            }
            OpCode::Call => {
                let argc = self.read_index();
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                let name = self.read_name();
                let argc = self.read_index();
                let null_safe = self.read_bool();
                let cascade = self.read_bool();
                if op == OpCode::Invoke {
                    self.invoke(&name, argc, null_safe, cascade)?;
                } else {
                    self.super_invoke(&name, argc, null_safe, cascade)?;
                }
            }
            OpCode::Closure => self.make_closure()?,
            OpCode::CloseUpvalue => {
                let last = self.sp().saturating_sub(1);
                self.close_upvalues(last);
                self.pop();
            }
            OpCode::Return | OpCode::Throw => {
                // The frame is discarded whole, so the scope exit codes are skipped.
                let count = self.read_index();
                self.read_with(count, |_, _| ());
                let result = self.pop();
                self.return_from_frame(result, op == OpCode::Throw)?;
            }
            OpCode::Class => {
                let kind = ClassKind::from_byte(self.read_byte()).unwrap_or(ClassKind::Custom);
                let name = self.read_name();
                let class = self.heap.alloc_class(ObjectClass::new(&name, kind));
                if kind != ClassKind::Core {
                    self.declared_classes.insert(name, class);
                }
                self.push(Value::Class(class));
            }
            OpCode::Inherit => {
                let superclass = self.pop();
                match (superclass, self.peek(0)) {
                    (Value::Class(superclass), Value::Class(class)) => {
                        let fields = self.heap.class(superclass).fields.clone();
                        let class = self.heap.class_mut(class);
                        class.fields.extend_from(&fields);
                        class.superclasses.push(superclass);
                    }
                    _ => return Err("Superclass must be a class.".to_string()),
                }
            }
            OpCode::Method => {
                let name = self.read_name();
                let method = self.pop();
                match self.peek(0) {
                    Value::Class(class) => {
                        self.heap.class_mut(class).fields.insert(name, method);
                    }
                    _ => return Err("Methods can only be declared on classes.".to_string()),
                }
            }
            OpCode::ClassDeclrDone => {}
            OpCode::Super => {
                let name = self.read_name();
                let class = self.receiver_class()?;
                match self.heap.find_superclass(class, &name) {
                    Some(superclass) => self.push(Value::Class(superclass)),
                    None => {
                        return Err(format!("Class {} doesn't inherit from {}!", self.heap.class(class).name, name));
                    }
                }
            }
            OpCode::GetSuper => {
                let name = self.pop();
                let superclass = self.pop();
                let name = self.key_name(&name);
                let property = match superclass {
                    Value::Class(superclass) => self.heap.class(superclass).fields.find(&name),
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                let this = self.frame_this();
                let value = property.map_or(Value::Nil, |property| self.bind(&this, property));
                self.push(value);
            }
            OpCode::Object => {
                let count = self.read_index();
                let values = self.pop_many(count * 2);
                let fields: Vec<(Rc<str>, Value)> =
                    values.chunks(2).map(|pair| (self.key_name(&pair[0]), pair[1].clone())).collect();
                let object = self.new_object(fields);
                self.push(object);
            }
            OpCode::List => {
                let count = self.read_index();
                let items = self.pop_many(count);
                let list = self.new_list(items);
                self.push(list);
            }
            OpCode::RangeTo => {
                let max = self.pop();
                let min = self.pop();
                match (min, max) {
                    (Value::Int(min), Value::Int(max)) => {
                        let range = self.new_range(min, max);
                        self.push(range);
                    }
                    _ => return Err("Range limits must be integers!".to_string()),
                }
            }
            OpCode::UnboxThrown => {
                let value = match self.pop() {
                    Value::Thrown(inner) => inner.as_ref().clone(),
                    _ => Value::Nil,
                };
                self.push(value);
            }
            OpCode::Yield => self.yield_fiber()?,
        }
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<Called, String> {
        match callee {
            Value::Closure(closure) => {
                let this = self.frame_this();
                self.set_peek(argc, this);
                self.call_closure(closure, argc)
            }
            Value::BoundMethod(bound) => {
                self.set_peek(argc, bound.receiver.clone());
                match &bound.method {
                    BoundCallable::Closure(closure) => self.call_closure(Rc::clone(closure), argc),
                    BoundCallable::Native(native) => self.call_native(Rc::clone(native), argc),
                }
            }
            Value::Native(native) => self.call_native(native, argc),
            Value::Class(class) => self.instantiate_class(class, argc),
            Value::Fiber(fiber) => self.resume_fiber(fiber, argc),
            other => Err(format!("Can only call functions and classes, got {}.", other.type_name())),
        }
    }

    fn call_closure(&mut self, closure: Rc<ObjectClosure>, argc: usize) -> Result<Called, String> {
        let function = Rc::clone(&closure.function);
        if argc != function.arity {
            match function.missing_defaults(argc) {
                Some(defaults) => {
                    for value in defaults {
                        self.push(value.clone());
                    }
                }
                None => return Err(format!("Expected {} arguments but got {}.", function.arity, argc)),
            }
        }
        if self.frames().len() >= MAX_FRAMES {
            return Err("Stack overflow.".to_string());
        }
        let base = self.sp().saturating_sub(function.arity + 1);
        self.current_fiber_mut().frames.push(CallFrame::new(closure, base));
        self.entered_call = true;
        Ok(Called::Frame)
    }

    fn call_native(&mut self, native: Rc<ObjectNativeFunction>, argc: usize) -> Result<Called, String> {
        if argc != native.arity {
            match native.missing_defaults(argc) {
                Some(defaults) => {
                    for value in defaults {
                        self.push(value.clone());
                    }
                }
                None => return Err(format!("Expected {} arguments but got {}.", native.arity, argc)),
            }
        }
        let fiber = self.fiber;
        let start = self.sp().saturating_sub(native.arity + 1);
        let args = self.heap.fiber(fiber).stack[start..].to_vec();
        let result = native.invoke(self, &args)?;
        let caller = self.heap.fiber_mut(fiber);
        caller.stack.truncate(start);
        caller.push(result);
        Ok(Called::Value)
    }

    fn instantiate_class(&mut self, class: ClassId, argc: usize) -> Result<Called, String> {
        let instance = if class == self.core.list {
            ObjectInstance::new_list(class, Vec::new())
        } else {
            ObjectInstance::new(class)
        };
        let instance = Value::Instance(self.heap.alloc_instance(instance));
        self.set_peek(argc, instance);
        match self.heap.class(class).fields.find(INIT) {
            Some(Value::Closure(init)) => self.call_closure(init, argc),
            Some(Value::Native(init)) => self.call_native(init, argc),
            _ if argc == 0 => Ok(Called::Value),
            _ => Err(format!("Expected 0 arguments but got {argc}.")),
        }
    }

    fn resume_fiber(&mut self, target: FiberId, argc: usize) -> Result<Called, String> {
        if target == self.fiber || target == self.root_fiber || self.heap.fiber(target).caller.is_some() {
            return Err("Fiber is already running.".to_string());
        }
        let this = self.frame_this();
        let args = self.pop_many(argc);
        self.pop();

        let current = self.fiber;
        let state = {
            let fiber = self.heap.fiber_mut(target);
            fiber.caller = Some(current);
            fiber.state
        };
        debug!("switching to fiber {}", self.heap.fiber(target).name);
        match state {
            FiberState::New => {
                let closure = {
                    let fiber = self.heap.fiber_mut(target);
                    fiber.state = FiberState::Started;
                    Rc::clone(&fiber.closure)
                };
                self.fiber = target;
                self.push(this);
                for arg in args {
                    self.push(arg);
                }
                self.call_closure(closure, argc)?;
            }
            FiberState::Started => {
                self.fiber = target;
                self.push(args.into_iter().next().unwrap_or(Value::Nil));
            }
        }
        Ok(Called::Switched)
    }

    fn yield_fiber(&mut self) -> Result<(), String> {
        let fiber = self.fiber;
        let caller = self.heap.fiber(fiber).caller.ok_or("Cannot yield from the root fiber.")?;
        if self.native_boundaries.contains(&fiber) {
            return Err("Cannot yield across a native callback.".to_string());
        }
        let value = self.pop();
        self.heap.fiber_mut(fiber).caller = None;
        self.fiber = caller;
        self.push(value);
        Ok(())
    }

    fn return_from_frame(&mut self, result: Value, is_throw: bool) -> Result<(), String> {
        let result = if is_throw && !is_thrown(&result) { Value::Thrown(Rc::new(result)) } else { result };
        let fiber = self.fiber;
        let frame = self.heap.fiber_mut(fiber).frames.pop().ok_or("Return outside of a call frame.")?;
        self.close_upvalues(frame.base);
        self.truncate(frame.base);
        let result = frame.cascade.unwrap_or(result);

        let finished = self.heap.fiber(fiber);
        if finished.frames.is_empty() {
            if let Some(caller) = finished.caller {
                debug!("fiber {} finished", finished.name);
                self.heap.fiber_mut(fiber).reset();
                self.fiber = caller;
            }
        }
        self.push(result);
        Ok(())
    }

    fn invoke(&mut self, name: &str, argc: usize, null_safe: bool, cascade: bool) -> Result<(), String> {
        let receiver = self.peek(argc);
        if is_nil(&receiver) && !null_safe {
            return Err(format!("Can't invoke {name} on null."));
        }
        match self.find_property(&receiver, name) {
            Some(property) => self.call_property(receiver, property, argc, cascade),
            None if null_safe => {
                self.pop_many(argc + 1);
                self.push(if cascade { receiver } else { Value::Nil });
                Ok(())
            }
            None => Err(format!("Undefined method: {name}")),
        }
    }

    fn super_invoke(&mut self, name: &str, argc: usize, null_safe: bool, cascade: bool) -> Result<(), String> {
        let superclass = match self.peek(argc) {
            Value::Class(superclass) => superclass,
            _ => return Err("Superclass must be a class.".to_string()),
        };
        let this = self.frame_this();
        self.set_peek(argc, this.clone());
        match self.heap.class(superclass).fields.find(name) {
            Some(property) => self.call_property(this, property, argc, cascade),
            None if null_safe => {
                self.pop_many(argc + 1);
                self.push(if cascade { this } else { Value::Nil });
                Ok(())
            }
            None => Err(format!("Undefined method: {name}")),
        }
    }

    fn call_property(&mut self, receiver: Value, property: Value, argc: usize, cascade: bool) -> Result<(), String> {
        let callee = self.bind(&receiver, property);
        if !is_callable(&callee) {
            if argc > 0 {
                return Err(format!("Can only call functions and classes, got {}.", callee.type_name()));
            }
            self.set_peek(0, if cascade { receiver } else { callee });
            return Ok(());
        }
        self.set_peek(argc, callee.clone());
        match self.call_value(callee, argc)? {
            Called::Frame if cascade => {
                if let Some(frame) = self.current_fiber_mut().frames.last_mut() {
                    frame.cascade = Some(receiver);
                }
            }
            Called::Value if cascade => self.set_peek(0, receiver),
            _ => {}
        }
        Ok(())
    }

    /// Field lookup: instance fields first, then the class (or the boxing
    /// class of a primitive).
    pub fn find_property(&self, receiver: &Value, name: &str) -> Option<Value> {
        match receiver {
            Value::Instance(id) => {
                let instance = self.heap.instance(*id);
                instance.fields.find(name).or_else(|| self.heap.class(instance.class).fields.find(name))
            }
            Value::Class(id) => self.heap.class(*id).fields.find(name),
            other => self.class_of(other).and_then(|class| self.heap.class(class).fields.find(name)),
        }
    }

    fn bind(&self, receiver: &Value, property: Value) -> Value {
        let method = match property {
            Value::Closure(closure) => BoundCallable::Closure(closure),
            Value::Native(native) => BoundCallable::Native(native),
            other => return other,
        };
        Value::BoundMethod(Rc::new(ObjectBoundMethod::new(receiver.clone(), method)))
    }

    fn get_property(&self, object: &Value, key: &Value, bind: bool) -> Result<Value, String> {
        if let Value::Int(index) = key {
            let items = self.list_items(object).ok_or("Attempting to use index on a non-List object!")?;
            let index = list_index(*index, items.len())?;
            return Ok(items[index].clone());
        }
        let name = self.key_name(key);
        match object {
            Value::Nil => Ok(Value::Nil),
            Value::Instance(_) | Value::Class(_) | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {
                Ok(match self.find_property(object, &name) {
                    Some(property) if bind => self.bind(object, property),
                    Some(property) => property,
                    None => Value::Nil,
                })
            }
            _ => Err("Only instances can have fields!".to_string()),
        }
    }

    fn set_property(&mut self, object: &Value, key: &Value, value: Value) -> Result<(), String> {
        match (object, key) {
            (Value::Class(_), _) => Err("Can't set property of a class!".to_string()),
            (Value::Instance(id), Value::Int(index)) => {
                let items =
                    self.heap.instance_mut(*id).items.as_mut().ok_or("Attempting to use index on a non-List object!")?;
                let index = list_index(*index, items.len())?;
                items[index] = value;
                Ok(())
            }
            (Value::Instance(id), key) => {
                let name = self.key_name(key);
                self.heap.instance_mut(*id).fields.insert(name, value);
                Ok(())
            }
            _ => Err("Only instances have fields!".to_string()),
        }
    }

    fn key_name(&self, key: &Value) -> Rc<str> {
        match key {
            Value::Str(name) => Rc::clone(name),
            other => Rc::from(self.stringify(other)),
        }
    }

    fn is_instance_of(&self, value: &Value, class: &Value) -> Result<bool, String> {
        let class = match class {
            Value::Class(class) => *class,
            other => return Err(format!("Right side of 'is' must be a class, got {}.", other.type_name())),
        };
        Ok(match value {
            Value::Nil => false,
            Value::Class(id) => *id == class,
            other => self.class_of(other).map_or(false, |own| self.heap.check_is(own, class)),
        })
    }

    fn binary_op(&self, op: OpCode, a: Value, b: Value) -> Result<Value, String> {
        if op == OpCode::Add && (matches!(a, Value::Str(_)) || matches!(b, Value::Str(_))) {
            return Ok(Value::Str(Rc::from(format!("{}{}", self.stringify(&a), self.stringify(&b)))));
        }
        if is_nil(&a) || is_nil(&b) {
            return Ok(Value::Nil);
        }
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => int_op(op, *x, *y),
            _ => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => float_op(op, x, y),
                _ => Err("Operands must be numbers.".to_string()),
            },
        }
    }

    fn receiver_class(&self) -> Result<ClassId, String> {
        match self.frame_this() {
            Value::Class(class) => Ok(class),
            Value::Instance(id) => Ok(self.heap.instance(id).class),
            _ => Err("Can't use 'super' without an instance.".to_string()),
        }
    }

    fn make_closure(&mut self) -> Result<(), String> {
        let function = match self.read_constant() {
            Value::Function(function) => function,
            other => return Err(format!("Expected a function constant, got {}.", other.type_name())),
        };
        let mut upvalues = Vec::with_capacity(function.upvalue_count);
        for _ in 0..function.upvalue_count {
            let is_local = self.read_bool();
            let index = self.read_index();
            // Name of the owning frame's function, kept for listings only.
            self.read_index();
            let upvalue = if is_local {
                let slot = self.frame_base() + index;
                self.capture_upvalue(slot)
            } else {
                self.frame_upvalue(index)?
            };
            upvalues.push(upvalue);
        }
        self.push(Value::Closure(Rc::new(ObjectClosure::new(function, upvalues))));
        Ok(())
    }

    fn capture_upvalue(&mut self, slot: usize) -> UpvalueId {
        let fiber = self.fiber;
        let existing = self.open_upvalues.iter().copied().find(|id| {
            matches!(self.heap.upvalue(*id).state, UpvalueState::Open { fiber: f, slot: s } if f == fiber && s == slot)
        });
        if let Some(id) = existing {
            return id;
        }
        let owner = self.frames().last().map_or_else(|| Rc::from(SCRIPT_FUNCTION), |frame| Rc::clone(&frame.function().name));
        let id = self.heap.alloc_upvalue(ObjectUpvalue::new(fiber, slot, owner));
        self.open_upvalues.push(id);
        id
    }

    /// Closes every open upvalue of the running fiber at or above `last`.
    fn close_upvalues(&mut self, last: usize) {
        let fiber = self.fiber;
        let mut still_open = Vec::with_capacity(self.open_upvalues.len());
        for id in std::mem::take(&mut self.open_upvalues) {
            match self.heap.upvalue(id).state.clone() {
                UpvalueState::Open { fiber: f, slot } if f == fiber && slot >= last => {
                    let value = self.heap.fiber(f).stack.get(slot).cloned().unwrap_or(Value::Nil);
                    self.heap.upvalue_mut(id).close(value);
                }
                _ => still_open.push(id),
            }
        }
        self.open_upvalues = still_open;
    }

    fn read_upvalue(&self, id: UpvalueId) -> Result<Value, String> {
        match &self.heap.upvalue(id).state {
            UpvalueState::Open { fiber, slot } => self
                .heap
                .fiber(*fiber)
                .stack
                .get(*slot)
                .cloned()
                .ok_or_else(|| "Unable to read upvalue from stack.".to_string()),
            UpvalueState::Closed(value) => Ok(value.clone()),
        }
    }

    fn write_upvalue(&mut self, id: UpvalueId, value: Value) -> Result<(), String> {
        match self.heap.upvalue(id).state.clone() {
            UpvalueState::Open { fiber, slot } => {
                let target = self
                    .heap
                    .fiber_mut(fiber)
                    .stack
                    .get_mut(slot)
                    .ok_or("Unable to write upvalue to stack.")?;
                *target = value;
            }
            UpvalueState::Closed(_) => self.heap.upvalue_mut(id).state = UpvalueState::Closed(value),
        }
        Ok(())
    }

    fn frame_upvalue(&self, index: usize) -> Result<UpvalueId, String> {
        self.frames()
            .last()
            .and_then(|frame| frame.closure.upvalues.get(index).copied())
            .ok_or_else(|| format!("Invalid upvalue index {index}."))
    }

    #[inline(always)]
    fn current_fiber_mut(&mut self) -> &mut ObjectFiber {
        self.heap.fiber_mut(self.fiber)
    }

    // The loop never steps a fiber without frames, so the defaults below
    // are not observed.
    #[inline(always)]
    fn read_with<T: Default>(&mut self, width: usize, read: fn(&Chunk, usize) -> T) -> T {
        match self.current_fiber_mut().frames.last_mut() {
            Some(frame) => {
                let value = read(frame.chunk(), frame.ip);
                frame.ip += width;
                value
            }
            None => T::default(),
        }
    }

    fn read_byte(&mut self) -> u8 {
        self.read_with(1, Chunk::read_byte)
    }

    fn read_bool(&mut self) -> bool {
        self.read_with(1, Chunk::read_bool)
    }

    fn read_index(&mut self) -> usize {
        self.read_with(4, Chunk::read_i32).max(0) as usize
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_index();
        self.frames().last().map_or(Value::Nil, |frame| frame.chunk().constant(index))
    }

    fn read_name(&mut self) -> Rc<str> {
        let constant = self.read_constant();
        self.key_name(&constant)
    }

    fn set_ip(&mut self, target: usize) {
        if let Some(frame) = self.current_fiber_mut().frames.last_mut() {
            frame.ip = target;
        }
    }

    fn frame_base(&self) -> usize {
        self.frames().last().map_or(0, |frame| frame.base)
    }

    fn frame_this(&self) -> Value {
        match self.frames().last() {
            Some(frame) => self.slot(frame.base),
            None => Value::Nil,
        }
    }

    #[inline(always)]
    fn sp(&self) -> usize {
        self.heap.fiber(self.fiber).sp()
    }

    #[inline(always)]
    fn push(&mut self, value: Value) {
        self.current_fiber_mut().push(value);
    }

    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.current_fiber_mut().pop()
    }

    #[inline(always)]
    fn peek(&self, distance: usize) -> Value {
        self.heap.fiber(self.fiber).peek(distance)
    }

    fn set_peek(&mut self, distance: usize, value: Value) {
        self.current_fiber_mut().set_peek(distance, value);
    }

    fn pop_many(&mut self, count: usize) -> Vec<Value> {
        let stack = &mut self.current_fiber_mut().stack;
        let start = stack.len().saturating_sub(count);
        stack.split_off(start)
    }

    fn truncate(&mut self, len: usize) {
        self.current_fiber_mut().stack.truncate(len);
    }

    fn slot(&self, index: usize) -> Value {
        self.stack().get(index).cloned().unwrap_or(Value::Nil)
    }

    fn set_slot(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.current_fiber_mut().stack.get_mut(index) {
            *slot = value;
        }
    }
}

fn is_callable(value: &Value) -> bool {
    matches!(
        value,
        Value::Closure(_) | Value::Native(_) | Value::BoundMethod(_) | Value::Class(_) | Value::Fiber(_)
    )
}

/// Resolves a possibly negative list index against `len`.
pub(crate) fn list_index(index: i64, len: usize) -> Result<usize, String> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved >= 0 && (resolved as usize) < len {
        Ok(resolved as usize)
    } else {
        Err(format!("Illegal argument error, index: {index}, size: {len}"))
    }
}

fn int_op(op: OpCode, a: i64, b: i64) -> Result<Value, String> {
    Ok(match op {
        OpCode::Add => Value::Int(a.wrapping_add(b)),
        OpCode::Subtract => Value::Int(a.wrapping_sub(b)),
        OpCode::Multiply => Value::Int(a.wrapping_mul(b)),
        OpCode::Divide => int_if_possible(a as f64 / b as f64),
        OpCode::DivideInt | OpCode::Mod if b == 0 => return Err("Division by zero.".to_string()),
        OpCode::DivideInt => Value::Int(a.wrapping_div(b)),
        OpCode::Mod => Value::Int(a.wrapping_rem(b)),
        OpCode::Lt => Value::Bool(a < b),
        OpCode::Le => Value::Bool(a <= b),
        OpCode::Gt => Value::Bool(a > b),
        OpCode::Ge => Value::Bool(a >= b),
        _ => return Err(format!("Invalid binary operator {op}.")),
    })
}

fn float_op(op: OpCode, a: f64, b: f64) -> Result<Value, String> {
    Ok(match op {
        OpCode::Add => int_if_possible(a + b),
        OpCode::Subtract => int_if_possible(a - b),
        OpCode::Multiply => int_if_possible(a * b),
        OpCode::Divide | OpCode::DivideInt => int_if_possible(a / b),
        OpCode::Mod => int_if_possible(a % b),
        OpCode::Lt => Value::Bool(a < b),
        OpCode::Le => Value::Bool(a <= b),
        OpCode::Gt => Value::Bool(a > b),
        OpCode::Ge => Value::Bool(a >= b),
        _ => return Err(format!("Invalid binary operator {op}.")),
    })
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn trace_instruction(vm: &VM) {
        let frame = match vm.frames().last() {
            Some(frame) => frame,
            None => return,
        };
        let stack: Vec<String> = vm.stack().iter().map(|value| format!("[ {} ]", vm.stringify(value))).collect();
        let mut instruction = String::new();
        debug::disassemble_instruction(frame.chunk(), frame.ip, &mut instruction);
        log::trace!("{:>17} {}", "", stack.join(" "));
        log::trace!("{}", instruction.trim_end());
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::*;

    pub fn trace_instruction(_vm: &VM) {}
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    use super::{InterpretResult, VM};
    use crate::error::NusaError;
    use crate::objects::object_class::ClassKind;
    use crate::objects::object_upvalue::ObjectUpvalue;
    use crate::value::Value;

    fn eval(source: &str) -> Value {
        let mut vm = VM::new();
        match vm.interpret_source("test", source) {
            Ok(value) => value,
            Err(e) => panic!("{e}"),
        }
    }

    fn eval_string(source: &str) -> String {
        let mut vm = VM::new();
        let value = vm.interpret_source("test", source).unwrap();
        vm.stringify(&value)
    }

    fn runtime_error(source: &str) -> String {
        let mut vm = VM::new();
        match vm.interpret_source("test", source) {
            Err(NusaError::Runtime(e)) => e.message,
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[derive(Clone, Default)]
    struct SharedOutput(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_interpret_results() {
        let mut vm = VM::new();
        assert_eq!(vm.interpret("x = 1 + 2"), InterpretResult::InterpretOk);
        assert_eq!(vm.interpret("x = "), InterpretResult::InterpretCompileError);
        assert_eq!(vm.interpret("x = 1\nx.nothing()"), InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.interpret("y = 2 * 3"), InterpretResult::InterpretOk);
    }

    #[test]
    fn test_division_narrows_to_int() {
        assert!(matches!(eval("4 / 2"), Value::Int(2)));
        assert!(matches!(eval("5 / 2"), Value::Float(f) if f == 2.5));
        assert!(matches!(eval("7 // 2"), Value::Int(3)));
        assert!(matches!(eval("7 % 4"), Value::Int(3)));
        assert!(matches!(eval("0.5 + 0.5"), Value::Int(1)));
        assert!(matches!(eval("7.0 // 2"), Value::Float(f) if f == 3.5));
        assert!(matches!(eval("7.0 // 3.5"), Value::Int(2)));
        assert_eq!(runtime_error("1 // 0"), "Division by zero.");
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval("(1 + 2) * 3 - 4"), Value::Int(5));
        assert_eq!(eval("-(2.5)"), Value::Float(-2.5));
        assert_eq!(eval("1 < 2"), Value::Bool(true));
        assert_eq!(eval("2 == 2.0"), Value::Bool(true));
        assert_eq!(eval("null + 1"), Value::Nil);
        assert_eq!(runtime_error("true - 1"), "Operands must be numbers.");
        assert_eq!(runtime_error("x = \"a\"\n-x"), "Trying to negate a non-number: a");
    }

    #[test]
    fn test_string_concatenation_stringifies() {
        assert_eq!(eval_string("\"a\" + 1 + true"), "a1true");
        assert_eq!(eval_string("x = 3\n\"x is $(x)\""), "x is 3");
    }

    #[test]
    fn test_while_loop() {
        assert_eq!(eval("x = 1\nwhile x < 3 {\n  x = x + 1\n}\nx"), Value::Int(3));
    }

    #[test]
    fn test_functions_and_defaults() {
        let source = "fn add(a, b = 10) {\n  return a + b\n}\nadd(1) + add(1, 2)";
        assert_eq!(eval(source), Value::Int(14));
        assert_eq!(runtime_error("fn f(a) => a\nf()"), "Expected 1 arguments but got 0.");
    }

    #[test]
    fn test_closures_share_captured_variable() {
        let source = "fn counter() {\n  count = 0\n  inc = fn () { count += 1 }\n  get = fn () => count\n  inc()\n  inc()\n  return get()\n}\ncounter()";
        assert_eq!(eval(source), Value::Int(2));
    }

    #[test]
    fn test_closure_outlives_its_frame() {
        let source = "fn make() {\n  n = 40\n  return fn () => n + 2\n}\nf = make()\nf()";
        assert_eq!(eval(source), Value::Int(42));
    }

    #[test]
    fn test_class_method() {
        assert_eq!(eval_string("class A {\n  fn greet() => \"hi\"\n}\nA().greet()"), "hi");
    }

    #[test]
    fn test_class_fields_and_init() {
        let source = "class Point {\n  x = 0\n  y = 0\n  init(a, b) {\n    x = a\n    y = b\n  }\n  fn sum() => x + y\n}\np = Point(3, 4)\np.sum()";
        assert_eq!(eval(source), Value::Int(7));
    }

    #[test]
    fn test_inheritance_and_is() {
        let source = "class A {\n  fn name() => \"a\"\n}\nclass B is A {\n  fn name() => \"b\" + super.name()\n}\nb = B()\n[b.name(), b is A, b is B, A() is B, 1 is Int, null is A]";
        assert_eq!(eval_string(source), "[\"ba\", true, true, false, true, false]");
    }

    #[test]
    fn test_later_superclass_wins_name_clash() {
        let source = "class A {\n  fn name() => \"a\"\n  fn onlyA() => 1\n}\nclass B {\n  fn name() => \"b\"\n}\nclass C is A, B {}\nc = C()\n[c.name(), c.onlyA(), c is A, c is B, c is C, A() is B]";
        assert_eq!(eval_string(source), "[\"b\", 1, true, true, true, false]");
    }

    #[test]
    fn test_list_where_keeps_original() {
        let source = "xs = [1, 2, 3]\nys = xs.where(fn (x) => x > 1)\n[xs, ys]";
        assert_eq!(eval_string(source), "[[1, 2, 3], [2, 3]]");
    }

    #[test]
    fn test_list_indexing() {
        assert_eq!(eval("xs = [1, 2, 3]\nxs.(-1)"), Value::Int(3));
        assert_eq!(eval("xs = [1, 2, 3]\nxs.(0) = 5\nxs.(0)"), Value::Int(5));
        assert_eq!(runtime_error("xs = [1]\nxs.(3)"), "Illegal argument error, index: 3, size: 1");
        assert_eq!(runtime_error("o = [a: 1]\no.(0)"), "Attempting to use index on a non-List object!");
    }

    #[test]
    fn test_object_literal_and_stringify() {
        assert_eq!(eval_string("[a: 1, b: \"two\"]"), "[a: 1, b: \"two\"]");
        assert_eq!(eval_string("[:]"), "[:]");
        assert_eq!(eval_string("null"), "null");
    }

    #[test]
    fn test_fiber_yields_in_order() {
        let source = "counter = Fiber(fn () {\n  i = 1\n  while true {\n    yield i\n    i += 1\n  }\n})\na = counter()\nb = counter()\nc = counter()\n[a, b, c]";
        assert_eq!(eval_string(source), "[1, 2, 3]");
    }

    #[test]
    fn test_fiber_receives_resume_value() {
        let source = "echo = Fiber(fn () {\n  got = yield 0\n  return got * 2\n})\necho()\necho(21)";
        assert_eq!(eval(source), Value::Int(42));
    }

    #[test]
    fn test_yield_from_root_fails() {
        assert_eq!(runtime_error("yield 1"), "Cannot yield from the root fiber.");
    }

    #[test]
    fn test_thrown_values() {
        let source = "fn fail() {\n  throw \"bad\"\n}\nx = fail()\n[catch x, fail() ?! 5]";
        assert_eq!(eval_string(source), "[\"bad\", 5]");
        assert_eq!(eval_string("fn fail() {\n  throw 1\n}\nfail()"), "!thrown! 1");
        assert_eq!(eval("catch 3"), Value::Nil);
    }

    #[test]
    fn test_null_safe_and_cascade() {
        assert_eq!(eval("x = null\nx?.foo()"), Value::Nil);
        assert_eq!(runtime_error("x = null\nx.foo()"), "Can't invoke foo on null.");
        assert_eq!(eval_string("xs = []\nxs.,add(1).,add(2)\nxs"), "[1, 2]");
    }

    #[test]
    fn test_ranges_and_for_in() {
        let source = "total = 0\nfor i in 1...4 {\n  total += i\n}\ntotal";
        assert_eq!(eval(source), Value::Int(10));
        assert_eq!(eval("total = 0\nfor i in 0..3 {\n  total += i\n}\ntotal"), Value::Int(3));
        assert_eq!(eval("r = 1...5\n3 in r"), Value::Bool(true));
        assert_eq!(runtime_error("1...\"a\""), "Range limits must be integers!");
    }

    #[test]
    fn test_property_errors() {
        assert_eq!(runtime_error("class A {}\nA.x = 1"), "Can't set property of a class!");
        assert_eq!(runtime_error("x = 1\nx.y = 2"), "Only instances have fields!");
    }

    #[test]
    fn test_update_property() {
        let source = "o = [count: 1]\no.count += 4\no.count *= 2\no.count";
        assert_eq!(eval(source), Value::Int(10));
    }

    #[test]
    fn test_instances_with_same_id_are_equal() {
        assert_eq!(eval("[id: \"a\", x: 1] == [id: \"a\", x: 2]"), Value::Bool(true));
        assert_eq!(eval("[id: \"a\"] == [id: \"b\"]"), Value::Bool(false));
        assert_eq!(eval("[id: 1] == [id: 1]"), Value::Bool(false));
        assert_eq!(eval("o = [id: 1]\no == o"), Value::Bool(true));
    }

    #[test]
    fn test_console_output() {
        let output = SharedOutput::default();
        let mut vm = VM::new();
        vm.set_output(Box::new(output.clone()));
        vm.interpret_source("test", "Console.print(\"a\")\nConsole.println(1 + 1)").unwrap();
        assert_eq!(String::from_utf8(output.0.borrow().clone()).unwrap(), "a2\n");
    }

    #[test]
    fn test_runtime_error_call_stack() {
        let mut vm = VM::new();
        let error = match vm.interpret_source("main", "fn f() {\n  return [].nope()\n}\nf()") {
            Err(NusaError::Runtime(e)) => e,
            other => panic!("expected a runtime error, got {other:?}"),
        };
        assert_eq!(error.message, "Undefined method: nope");
        assert_eq!(error.call_stack, vec!["[main:2] in f".to_string(), "[main:4] in script".to_string()]);
    }

    #[test]
    fn test_upvalue_outside_stack_faults() {
        let mut vm = VM::new();
        let fiber = vm.root_fiber;
        let upvalue = vm.heap_mut().alloc_upvalue(ObjectUpvalue::new(fiber, 999, Rc::from("script")));
        assert_eq!(vm.read_upvalue(upvalue), Err("Unable to read upvalue from stack.".to_string()));
        assert_eq!(vm.write_upvalue(upvalue, Value::Int(1)), Err("Unable to write upvalue to stack.".to_string()));
        vm.heap_mut().upvalue_mut(upvalue).close(Value::Int(7));
        assert_eq!(vm.read_upvalue(upvalue), Ok(Value::Int(7)));
    }

    #[test]
    fn test_stack_overflow() {
        assert_eq!(runtime_error("fn f() => f()\nf()"), "Stack overflow.");
    }

    #[test]
    fn test_host_invoke_and_instantiate() {
        let mut vm = VM::new();
        let source = "effect Burn {\n  trigger = 1\n  damage = 3\n  fn run() {}\n  fn tick(n) => damage * n\n}";
        vm.interpret_source("test", source).unwrap();
        assert!(vm.has_class("Burn", ClassKind::Effect));
        assert!(!vm.has_class("Burn", ClassKind::Custom));
        assert_eq!(vm.classes_of_kind(ClassKind::Effect), vec!["Burn".to_string()]);

        let burn = vm.instantiate("Burn", &[]).unwrap();
        assert_eq!(vm.invoke_from_host(&burn, "tick", true, &[Value::Int(2)]).unwrap(), Value::Int(6));
        assert_eq!(vm.invoke_from_host(&burn, "missing", false, &[]).unwrap(), Value::Nil);
        let error = vm.invoke_from_host(&burn, "missing", true, &[]).unwrap_err();
        assert_eq!(error.message, "Undefined method: missing");
    }
}
