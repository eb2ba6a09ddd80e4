use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, debug, log_enabled, trace};

use crate::chunk::OpCode;
use crate::compiler::{self, CompileError};
use crate::heap::Heap;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, Handle, InstanceObj, NativeFn, NativeObj, Obj,
    UpvalueObj, Value,
};
use crate::table::Table;

pub const FRAMES_MAX: usize = 128;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A runtime failure: the message plus the logical call-stack trace,
/// innermost frame first. The VM resets itself before returning one, so
/// the next `interpret` call starts clean (REPL semantics).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    /// Source line of the failing instruction.
    pub line: u32,
    /// `[line N] in f()` entries, innermost first.
    pub trace: Vec<String>,
}

/// One logical invocation: which closure is running, where its next
/// instruction is, and where its slot window starts on the value stack.
struct CallFrame {
    closure: Handle,
    ip: usize,
    base: usize,
}

enum Callee {
    Closure(Handle),
    Native(u8, NativeFn),
    Class(Handle),
    Bound(Value, Handle),
    NotCallable,
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) globals: Table,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// At most one open upvalue per stack slot; every closure capturing
    /// that slot shares the cell through this registry.
    open_upvalues: BTreeMap<usize, Handle>,
    init_string: Handle,
    output: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose `print` statement writes to `output`; tests
    /// capture program output this way.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            globals: Table::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: BTreeMap::new(),
            init_string,
            output,
        };
        vm.define_native("clock", 0, native_clock);
        vm.define_native("input", 0, native_input);
        vm.define_native("number", 1, native_number);
        vm.define_native("rand", 0, native_rand);
        vm
    }

    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(NativeObj { name, arity, function }));
        let hash = self.heap.string_hash(name);
        self.globals.set(name, hash, Value::Obj(native));
    }

    // ---- Entry point ----

    /// Compiles and runs `source`. Compile errors prevent execution; a
    /// runtime error unwinds every frame but leaves the VM reusable.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(source, self).map_err(InterpretError::Compile)?;

        // Root the script function before the closure allocation can
        // trigger a collection.
        self.stack.push(Value::Obj(function));
        let closure = self.alloc_object(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()?;
        Ok(())
    }

    /// Compiles `source` and returns the disassembly listing of every
    /// function in it instead of executing.
    pub fn compile_to_listing(&mut self, source: &str) -> Result<String, InterpretError> {
        let function = compiler::compile(source, self).map_err(InterpretError::Compile)?;
        Ok(crate::debug::disassemble_program(&self.heap, function))
    }

    // ---- Allocation discipline ----

    /// Every VM-side allocation funnels through here: collect at this
    /// safe point if the threshold (or stress mode) demands it, then
    /// allocate. Anything that must survive is already reachable from
    /// the stack, globals, or frames when the check runs.
    fn alloc_object(&mut self, obj: Obj) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage_with(&[]);
        }
        self.heap.alloc(obj)
    }

    fn intern_string(&mut self, text: &str) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage_with(&[]);
        }
        self.heap.intern(text)
    }

    /// Marks the VM root set (stack, globals, frame closures, open
    /// upvalues, the `init` name) plus any extra roots the compiler
    /// holds mid-compilation, then runs the collection phases.
    pub(crate) fn collect_garbage_with(&mut self, extra_roots: &[Value]) {
        debug!("gc begin: {} bytes allocated", self.heap.bytes_allocated());
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        self.heap.mark_table(&self.globals);
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in self.open_upvalues.values() {
            self.heap.mark_object(upvalue);
        }
        self.heap.mark_object(self.init_string);
        for &value in extra_roots {
            self.heap.mark_value(value);
        }
        self.heap.finish_collect();
    }

    // ---- Stack ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- Bytecode access ----

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        let closure = frame.closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[idx]
    }

    fn read_string(&mut self) -> Handle {
        match self.read_constant() {
            Value::Obj(h) => h,
            _ => unreachable!("name operand must be a string constant"),
        }
    }

    // ---- Errors ----

    /// Builds the stack trace, resets the VM, and returns the error.
    fn runtime_error(&mut self, message: &str) -> RuntimeError {
        let mut line = 0;
        let mut stack_trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let at = function.chunk.line_of(frame.ip.saturating_sub(1));
            if stack_trace.is_empty() {
                line = at;
            }
            let name = match function.name {
                Some(n) => format!("{}()", self.heap.string(n).text),
                None => "script".to_string(),
            };
            stack_trace.push(format!("[line {at}] in {name}"));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError {
            message: message.to_string(),
            line,
            trace: stack_trace,
        }
    }

    // ---- Calls ----

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let action = match callee.as_handle() {
            Some(h) => match self.heap.get(h) {
                Obj::Closure(_) => Callee::Closure(h),
                Obj::Native(n) => Callee::Native(n.arity, n.function),
                Obj::Class(_) => Callee::Class(h),
                Obj::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match action {
            Callee::Closure(closure) => self.call_closure(closure, arg_count),
            Callee::Native(arity, function) => {
                if arg_count != arity as usize {
                    let message = format!("Expected {arity} arguments but got {arg_count}.");
                    return Err(self.runtime_error(&message));
                }
                // The argument window stays on the stack (rooted) for the
                // whole native call; exactly one result replaces it.
                let start = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[start..].to_vec();
                match function(&mut self.heap, &args) {
                    Ok(result) => {
                        self.stack.truncate(start - 1);
                        self.push(result);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(&message)),
                }
            }
            Callee::Class(class) => {
                // Calling a class synthesizes an instance in the callee
                // slot, then runs `init` if the class has one.
                let instance = self.alloc_object(Obj::Instance(InstanceObj {
                    class,
                    fields: Table::new(),
                }));
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack[callee_slot] = Value::Obj(instance);

                let init_hash = self.heap.string_hash(self.init_string);
                match self.heap.class(class).methods.get(self.init_string, init_hash) {
                    Some(Value::Obj(init)) => self.call_closure(init, arg_count),
                    _ if arg_count != 0 => {
                        let message = format!("Expected 0 arguments but got {arg_count}.");
                        Err(self.runtime_error(&message))
                    }
                    _ => Ok(()),
                }
            }
            Callee::Bound(receiver, method) => {
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack[callee_slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::NotCallable => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if arg_count != arity {
            let message = format!("Expected {arity} arguments but got {arg_count}.");
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let instance = match receiver.as_handle() {
            Some(h) if matches!(self.heap.get(h), Obj::Instance(_)) => h,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        // A field shadowing the method name wins; it may hold any
        // callable.
        let hash = self.heap.string_hash(name);
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let callee_slot = self.stack.len() - arg_count - 1;
            self.stack[callee_slot] = field;
            return self.call_value(field, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Handle,
        name: Handle,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => {
                let message = format!("Undefined property '{}'.", self.heap.string(name).text);
                Err(self.runtime_error(&message))
            }
        }
    }

    /// Resolves `name` on `class` and replaces the receiver on top of
    /// the stack with a bound method.
    fn bind_method(&mut self, class: Handle, name: Handle) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => method,
            _ => {
                let message = format!("Undefined property '{}'.", self.heap.string(name).text);
                return Err(self.runtime_error(&message));
            }
        };
        let receiver = self.peek(0);
        let bound = self.alloc_object(Obj::BoundMethod(BoundMethodObj { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ---- Upvalues ----

    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        if let Some(&existing) = self.open_upvalues.get(&slot) {
            return existing;
        }
        let upvalue = self.alloc_object(Obj::Upvalue(UpvalueObj::Open(slot)));
        self.open_upvalues.insert(slot, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from`: the value migrates
    /// out of its stack slot into the cell itself.
    fn close_upvalues(&mut self, from: usize) {
        let closed = self.open_upvalues.split_off(&from);
        for (slot, upvalue) in closed {
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = UpvalueObj::Closed(value);
        }
    }

    // ---- Interpreter loop ----

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if log_enabled!(Level::Trace) {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => {
                    let message = format!("unknown opcode {byte}");
                    return Err(self.runtime_error(&message));
                }
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.string(name).text);
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment never implicitly declares.
                        self.globals.delete(name, hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string(name).text);
                        return Err(self.runtime_error(&message));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        UpvalueObj::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueObj::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        UpvalueObj::Open(stack_slot) => self.stack[stack_slot] = value,
                        UpvalueObj::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = UpvalueObj::Closed(value);
                        }
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(0).as_handle() {
                        Some(h) if matches!(self.heap.get(h), Obj::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let hash = self.heap.string_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(1).as_handle() {
                        Some(h) if matches!(self.heap.get(h), Obj::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop().as_handle() {
                        Some(h) => h,
                        None => unreachable!("super slot holds a class"),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater | OpCode::Less => self.binary_compare(op)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide => {
                    self.binary_arithmetic(op)?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let _ = writeln!(self.output, "{text}");
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop().as_handle() {
                        Some(h) => h,
                        None => unreachable!("super slot holds a class"),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(h) => h,
                        _ => unreachable!("closure operand must be a function constant"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc_object(Obj::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Root the closure before the captures allocate.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().unwrap().base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // The script closure itself is the last slot.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc_object(Obj::Class(ClassObj {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1).as_handle() {
                        Some(h) if matches!(self.heap.get(h), Obj::Class(_)) => h,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass = match self.peek(0).as_handle() {
                        Some(h) => h,
                        None => unreachable!("inherit operand is the subclass"),
                    };
                    self.heap.inherit_methods(superclass, subclass);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = match self.peek(1).as_handle() {
                        Some(h) => h,
                        None => unreachable!("method target is a class"),
                    };
                    let hash = self.heap.string_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    fn binary_arithmetic(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Subtract => a - b,
            OpCode::Multiply => a * b,
            OpCode::Divide => a / b,
            _ => unreachable!(),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn binary_compare(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => a > b,
            OpCode::Less => a < b,
            _ => unreachable!(),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    /// `+` is the one polymorphic operator: numbers add, strings
    /// concatenate into a newly interned string.
    fn add(&mut self) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b))
                if matches!(self.heap.get(a), Obj::Str(_))
                    && matches!(self.heap.get(b), Obj::Str(_)) =>
            {
                let combined =
                    format!("{}{}", self.heap.string(a).text, self.heap.string(b).text);
                // Operands stay rooted on the stack across the
                // allocation the intern may perform.
                let result = self.intern_string(&combined);
                self.pop();
                self.pop();
                self.push(Value::Obj(result));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn trace_instruction(&self) {
        let frame = match self.frames.last() {
            Some(frame) => frame,
            None => return,
        };
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let (text, _) = crate::debug::disassemble_instruction(&self.heap, chunk, frame.ip);
        let stack: Vec<String> = self
            .stack
            .iter()
            .map(|&v| self.heap.format_value(v))
            .collect();
        trace!("[{}] {}", stack.join(" "), text);
    }
}

// ── Natives ──────────────────────────────────────────────────────────

fn native_clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

/// Reads one line from stdin; nil on end of input.
fn native_input(heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) => Ok(Value::Nil),
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            Ok(Value::Obj(heap.intern(trimmed)))
        }
        Err(e) => Err(e.to_string()),
    }
}

/// String-to-number conversion; nil when the text does not parse.
fn native_number(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n)),
        Value::Obj(h) => match heap.get(h) {
            Obj::Str(s) => Ok(s
                .text
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or(Value::Nil)),
            _ => Err("Argument must be a string or number.".to_string()),
        },
        _ => Err("Argument must be a string or number.".to_string()),
    }
}

fn native_rand(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(fastrand::f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_vm() -> (Vm, SharedBuf) {
        let buf = SharedBuf::default();
        (Vm::with_output(Box::new(buf.clone())), buf)
    }

    fn run(source: &str) -> (String, Result<(), InterpretError>) {
        let (mut vm, buf) = capture_vm();
        let result = vm.interpret(source);
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        (output, result)
    }

    fn run_ok(source: &str) -> String {
        let (output, result) = run(source);
        assert!(result.is_ok(), "unexpected failure: {result:?}\n{output}");
        output
    }

    fn runtime_message(source: &str) -> String {
        let (_, result) = run(source);
        match result {
            Err(InterpretError::Runtime(e)) => e.message,
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_round_trip() {
        assert_eq!(run_ok("print 1 + 2;"), "3\n");
        assert_eq!(run_ok("print (5 - 3) * 4 / 2;"), "4\n");
        assert_eq!(run_ok("print -(2 + 2);"), "-4\n");
        assert_eq!(run_ok("print 1.5 + 1;"), "2.5\n");
    }

    #[test]
    fn string_concat_round_trip() {
        assert_eq!(run_ok(r#"print "a" + "b";"#), "ab\n");
    }

    #[test]
    fn comparison_and_logic() {
        assert_eq!(run_ok("print 1 < 2;"), "true\n");
        assert_eq!(run_ok("print 2 <= 1;"), "false\n");
        assert_eq!(run_ok("print !nil;"), "true\n");
        assert_eq!(run_ok("print 1 == 1;"), "true\n");
        assert_eq!(run_ok(r#"print "x" != "y";"#), "true\n");
    }

    #[test]
    fn zero_is_truthy() {
        assert_eq!(run_ok("if (0) print \"yes\"; else print \"no\";"), "yes\n");
        assert_eq!(run_ok("if (\"\") print \"yes\"; else print \"no\";"), "yes\n");
        assert_eq!(run_ok("if (nil) print \"yes\"; else print \"no\";"), "no\n");
    }

    #[test]
    fn and_or_short_circuit() {
        assert_eq!(run_ok("print nil and 1;"), "nil\n");
        assert_eq!(run_ok("print 1 and 2;"), "2\n");
        assert_eq!(run_ok("print nil or 3;"), "3\n");
        assert_eq!(run_ok("print 1 or 2;"), "1\n");
    }

    #[test]
    fn block_scoping_resolves_slots() {
        let source = "{ var a = 1; { var a = 2; print a; } print a; }";
        assert_eq!(run_ok(source), "2\n1\n");
    }

    #[test]
    fn while_loop_runs() {
        let source = "var i = 0; while (i < 3) { print i; i = i + 1; }";
        assert_eq!(run_ok(source), "0\n1\n2\n");
    }

    #[test]
    fn for_loop_with_all_clauses() {
        let source = "for (var i = 0; i < 3; i = i + 1) print i;";
        assert_eq!(run_ok(source), "0\n1\n2\n");
    }

    #[test]
    fn functions_call_and_return() {
        let source = "fun add(a, b) { return a + b; } print add(1, 2);";
        assert_eq!(run_ok(source), "3\n");
        assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
    }

    #[test]
    fn recursion_uses_frame_stack() {
        let source =
            "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";
        assert_eq!(run_ok(source), "55\n");
    }

    #[test]
    fn closure_counter_is_shared_state() {
        let source = r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = makeCounter();
            print counter();
            print counter();
            print counter();
        "#;
        assert_eq!(run_ok(source), "1\n2\n3\n");
    }

    #[test]
    fn two_closures_share_one_upvalue_cell() {
        let source = r#"
            var get; var set;
            fun make() {
                var value = 1;
                fun getter() { return value; }
                fun setter(v) { value = v; }
                get = getter; set = setter;
            }
            make();
            set(42);
            print get();
        "#;
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn upvalue_closes_when_scope_ends() {
        let source = r#"
            var hold;
            {
                var local = "captured";
                fun keep() { return local; }
                hold = keep;
            }
            print hold();
        "#;
        assert_eq!(run_ok(source), "captured\n");
    }

    #[test]
    fn interned_strings_compare_by_identity() {
        assert_eq!(run_ok(r#"print "he" + "llo" == "hello";"#), "true\n");
    }

    #[test]
    fn distinct_closures_compare_unequal() {
        let source = r#"
            fun make() { fun inner() {} return inner; }
            print make() == make();
        "#;
        assert_eq!(run_ok(source), "false\n");
    }

    #[test]
    fn arity_mismatch_is_a_runtime_error() {
        let msg = runtime_message("fun f(a, b) {} f(1);");
        assert_eq!(msg, "Expected 2 arguments but got 1.");
    }

    #[test]
    fn add_type_error_message() {
        let msg = runtime_message(r#"print 1 + "a";"#);
        assert_eq!(msg, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn arithmetic_type_error_message() {
        let msg = runtime_message(r#"print "a" * 2;"#);
        assert_eq!(msg, "Operands must be numbers.");
        assert_eq!(runtime_message("print -nil;"), "Operand must be a number.");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        assert_eq!(runtime_message("print missing;"), "Undefined variable 'missing'.");
        assert_eq!(runtime_message("missing = 1;"), "Undefined variable 'missing'.");
    }

    #[test]
    fn calling_non_callable_is_a_runtime_error() {
        let msg = runtime_message("var x = 1; x();");
        assert_eq!(msg, "Can only call functions and classes.");
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let msg = runtime_message("fun f() { f(); } f();");
        assert_eq!(msg, "Stack overflow.");
    }

    #[test]
    fn runtime_error_carries_stack_trace() {
        let (_, result) =
            run("fun inner() { return 1 + nil; }\nfun outer() { inner(); }\nouter();");
        let err = match result {
            Err(InterpretError::Runtime(e)) => e,
            other => panic!("expected runtime error, got {other:?}"),
        };
        assert_eq!(err.trace.len(), 3);
        assert!(err.trace[0].contains("inner()"), "{:?}", err.trace);
        assert!(err.trace[1].contains("outer()"), "{:?}", err.trace);
        assert!(err.trace[2].contains("script"), "{:?}", err.trace);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn vm_is_reusable_after_runtime_error() {
        let (mut vm, buf) = capture_vm();
        assert!(vm.interpret("print undefined_thing;").is_err());
        assert!(vm.interpret("print 7;").is_ok());
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(output, "7\n");
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let (mut vm, buf) = capture_vm();
        vm.interpret("var x = 10;").unwrap();
        vm.interpret("print x + 1;").unwrap();
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(output, "11\n");
    }

    #[test]
    fn class_instantiation_and_fields() {
        let source = r#"
            class Point {}
            var p = Point();
            p.x = 3;
            p.y = 4;
            print p.x + p.y;
        "#;
        assert_eq!(run_ok(source), "7\n");
    }

    #[test]
    fn methods_bind_this() {
        let source = r#"
            class Greeter {
                greet() { return "hi " + this.name; }
            }
            var g = Greeter();
            g.name = "ada";
            print g.greet();
        "#;
        assert_eq!(run_ok(source), "hi ada\n");
    }

    #[test]
    fn bound_method_keeps_receiver() {
        let source = r#"
            class Cake {
                flavor() { return this.kind; }
            }
            var cake = Cake();
            cake.kind = "chocolate";
            var m = cake.flavor;
            print m();
        "#;
        assert_eq!(run_ok(source), "chocolate\n");
    }

    #[test]
    fn init_returns_the_instance() {
        let source = r#"
            class Point {
                init(x) { this.x = x; }
            }
            var p = Point(9);
            print p.x;
            print Point(1) == Point(1);
        "#;
        assert_eq!(run_ok(source), "9\nfalse\n");
    }

    #[test]
    fn init_arity_is_checked() {
        let msg = runtime_message("class A { init(x) {} } A();");
        assert_eq!(msg, "Expected 1 arguments but got 0.");
    }

    #[test]
    fn argless_class_rejects_arguments() {
        let msg = runtime_message("class A {} A(1);");
        assert_eq!(msg, "Expected 0 arguments but got 1.");
    }

    #[test]
    fn subclass_inherits_methods() {
        let source = r#"
            class Animal {
                speak() { return "..."; }
            }
            class Dog < Animal {}
            print Dog().speak();
        "#;
        assert_eq!(run_ok(source), "...\n");
    }

    #[test]
    fn super_calls_overridden_method() {
        let source = r#"
            class A {
                describe() { return "A"; }
            }
            class B < A {
                describe() { return super.describe() + "B"; }
            }
            print B().describe();
        "#;
        assert_eq!(run_ok(source), "AB\n");
    }

    #[test]
    fn inherit_from_non_class_is_a_runtime_error() {
        let msg = runtime_message("var NotAClass = 1; class A < NotAClass {}");
        assert_eq!(msg, "Superclass must be a class.");
    }

    #[test]
    fn undefined_property_is_a_runtime_error() {
        let msg = runtime_message("class A {} var a = A(); a.missing;");
        assert_eq!(msg, "Undefined property 'missing'.");
    }

    #[test]
    fn property_access_on_non_instance_errors() {
        assert_eq!(
            runtime_message("var x = 1; print x.field;"),
            "Only instances have properties."
        );
        assert_eq!(runtime_message("var x = 1; x.field = 2;"), "Only instances have fields.");
        assert_eq!(runtime_message("var x = 1; x.method();"), "Only instances have methods.");
    }

    #[test]
    fn invoke_fast_path_matches_bound_call() {
        let source = r#"
            class Counter {
                init() { this.n = 0; }
                bump() { this.n = this.n + 1; return this.n; }
            }
            var c = Counter();
            c.bump();
            print c.bump();
        "#;
        assert_eq!(run_ok(source), "2\n");
    }

    #[test]
    fn field_shadowing_a_method_wins_on_invoke() {
        let source = r#"
            class Box {
                poke() { return "method"; }
            }
            fun replacement() { return "field"; }
            var b = Box();
            b.poke = replacement;
            print b.poke();
        "#;
        assert_eq!(run_ok(source), "field\n");
    }

    #[test]
    fn native_clock_returns_number() {
        assert_eq!(run_ok("print clock() > 0;"), "true\n");
    }

    #[test]
    fn native_number_parses_strings() {
        assert_eq!(run_ok(r#"print number("42") + 1;"#), "43\n");
        assert_eq!(run_ok(r#"print number("nope");"#), "nil\n");
    }

    #[test]
    fn native_rand_is_in_unit_interval() {
        assert_eq!(run_ok("var r = rand(); print r >= 0 and r < 1;"), "true\n");
    }

    #[test]
    fn native_arity_is_checked() {
        assert_eq!(runtime_message("number();"), "Expected 1 arguments but got 0.");
    }

    #[test]
    fn native_error_becomes_runtime_error() {
        assert_eq!(runtime_message("number(true);"), "Argument must be a string or number.");
    }

    #[test]
    fn gc_reclaims_unreachable_objects() {
        let (mut vm, _) = capture_vm();
        vm.interpret(
            r#"
            var keep = "ke" + "pt";
            {
                var a = "dead " + "one";
                var b = "dead " + "two";
            }
            "#,
        )
        .unwrap();
        let before = vm.heap().object_count();
        vm.collect_garbage_with(&[]);
        let after = vm.heap().object_count();
        assert!(after < before, "expected a sweep: {before} -> {after}");
    }

    #[test]
    fn reachable_globals_survive_collection() {
        let (mut vm, buf) = capture_vm();
        vm.interpret(r#"var keep = "al" + "ive";"#).unwrap();
        vm.collect_garbage_with(&[]);
        vm.interpret("print keep;").unwrap();
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(output, "alive\n");
    }

    #[test]
    fn stress_mode_runs_full_program() {
        let (mut vm, buf) = capture_vm();
        vm.set_gc_stress(true);
        vm.interpret(
            r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var c = makeCounter();
            c(); c();
            print c();

            class Node {
                init(value) { this.value = value; }
                label() { return "node " + this.value; }
            }
            print Node("x").label();
            print "a" + "b" + "c";
            "#,
        )
        .unwrap();
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(output, "3\nnode x\nabc\n");
        assert!(vm.heap().collection_count() > 0);
    }

    #[test]
    fn stress_mode_survives_mid_construction_collections() {
        // Closure construction allocates the closure, then one upvalue
        // per capture; with stress on, a collection runs between those
        // allocations and must keep the half-built closure alive.
        let (mut vm, buf) = capture_vm();
        vm.set_gc_stress(true);
        vm.interpret(
            r#"
            fun outer() {
                var a = 1; var b = 2; var c = 3;
                fun inner() { return a + b + c; }
                return inner;
            }
            print outer()();
            "#,
        )
        .unwrap();
        let output = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(output, "6\n");
    }
}
