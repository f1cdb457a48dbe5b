use std::io::Write;
use std::rc::Rc;

use hashbrown::HashMap;

use glim_core::error::{StackTrace, TraceFrame};
use glim_core::value::{BoundMethod, Class, Closure, Instance, NativeFn, Upvalue, Value};
use glim_core::{Function, GlimError};

use crate::disasm;
use crate::opcodes::op;

/// Maximum call depth; exceeding it is a reported runtime error.
pub const FRAMES_MAX: usize = 64;
/// Value-stack capacity reserved up front: one full window of slots per frame.
pub const VSTACK_MAX: usize = FRAMES_MAX * 256;

/// One active function invocation: the executing closure, an instruction
/// pointer into its chunk, and the stack index where its slots begin
/// (slot 0 holds the callee or `this`).
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    slots_base: usize,
}

/// The bytecode virtual machine. Not re-entrant: one VM runs one program
/// at a time, though globals survive across `interpret` calls (the REPL
/// relies on this).
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Rc<str>, Value>,
    /// Open upvalues ordered by ascending stack slot; at most one per slot.
    /// Scans walk from the back (highest slot) down.
    open_upvalues: Vec<Rc<Upvalue>>,
    trace: bool,
}

impl VM {
    pub fn new() -> Self {
        VM {
            stack: Vec::with_capacity(VSTACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            trace: false,
        }
    }

    /// Echo every executed instruction (with the stack) to stderr.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Install a native function into the globals table.
    pub fn define_native(&mut self, native: NativeFn) {
        let name: Rc<str> = Rc::from(native.name.as_str());
        self.globals.insert(name, Value::Native(Rc::new(native)));
    }

    /// Execute a compiled script function. PRINT output goes to `out`;
    /// diagnostics go to stderr. On a runtime error the stacks are reset so
    /// the VM can be reused.
    pub fn interpret(&mut self, function: Function, out: &mut impl Write) -> Result<(), GlimError> {
        let closure = Rc::new(Closure::new(Rc::new(function), Vec::new()));
        self.stack.push(Value::Closure(closure.clone()));
        self.call(closure, 0)?;
        self.run(out)
    }

    // ── Stack primitives ──────────────────────────────────────────

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ── Bytecode reading ──────────────────────────────────────────

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().closure.function.chunk.constants[index].clone()
    }

    fn read_string(&mut self) -> Rc<str> {
        match self.read_constant() {
            Value::String(s) => s,
            other => unreachable!("compiler emitted a non-string name constant: {other:?}"),
        }
    }

    // ── Error handling ────────────────────────────────────────────

    /// Build a runtime error with a traceback walked innermost-out, then
    /// reset the VM so it is reusable.
    fn runtime_error(&mut self, message: String) -> GlimError {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            frames.push(TraceFrame {
                line,
                name: function.name.clone(),
            });
        }
        self.reset_stack();
        GlimError::Runtime {
            message,
            trace: StackTrace(frames),
        }
    }

    // ── Calls ─────────────────────────────────────────────────────

    fn call(&mut self, closure: Rc<Closure>, arg_count: usize) -> Result<(), GlimError> {
        let arity = closure.function.arity as usize;
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slots_base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn call_value(&mut self, arg_count: usize) -> Result<(), GlimError> {
        let callee = self.peek(arg_count).clone();
        match callee {
            Value::Closure(closure) => self.call(closure, arg_count),
            Value::Class(class) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Instance(Rc::new(Instance::new(class)));
                Ok(())
            }
            Value::BoundMethod(bound) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = bound.receiver.clone();
                self.call(bound.method.clone(), arg_count)
            }
            Value::Native(native) => {
                let args_start = self.stack.len() - arg_count;
                let result = (native.func)(&self.stack[args_start..]);
                match result {
                    Ok(value) => {
                        self.stack.truncate(args_start - 1);
                        self.push(value);
                        Ok(())
                    }
                    Err(err) => Err(self.runtime_error(err.message())),
                }
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    // ── Upvalues ──────────────────────────────────────────────────

    /// Find or create the open upvalue for an absolute stack slot. Two
    /// closures capturing the same variable must share one cell.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<Upvalue> {
        let mut insert_at = self.open_upvalues.len();
        while insert_at > 0 {
            match self.open_upvalues[insert_at - 1].slot() {
                Some(open_slot) if open_slot > slot => insert_at -= 1,
                Some(open_slot) if open_slot == slot => {
                    return self.open_upvalues[insert_at - 1].clone();
                }
                _ => break,
            }
        }
        let upvalue = Rc::new(Upvalue::open(slot));
        self.open_upvalues.insert(insert_at, upvalue.clone());
        upvalue
    }

    /// Close every open upvalue whose slot is at or above `threshold`,
    /// migrating the stack value into the shared cell.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(upvalue) = self.open_upvalues.last() {
            match upvalue.slot() {
                Some(slot) if slot >= threshold => {
                    let upvalue = self.open_upvalues.pop().expect("checked above");
                    upvalue.close(self.stack[slot].clone());
                }
                _ => break,
            }
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────

    fn run(&mut self, out: &mut impl Write) -> Result<(), GlimError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }

            let instruction = self.read_byte();
            match instruction {
                op::CONSTANT => {
                    let value = self.read_constant();
                    self.push(value);
                }
                op::NIL => self.push(Value::Nil),
                op::TRUE => self.push(Value::Bool(true)),
                op::FALSE => self.push(Value::Bool(false)),
                op::POP => {
                    self.pop();
                }

                op::NOT => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                op::NEGATE => {
                    let value = self.pop();
                    match value {
                        Value::Number(n) => self.push(Value::Number(-n)),
                        _ => {
                            return Err(
                                self.runtime_error("Operand must be a number.".to_string())
                            );
                        }
                    }
                }

                op::EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                op::GREATER => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Bool(a > b));
                }
                op::LESS => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Bool(a < b));
                }
                op::ADD => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a + b)),
                        (Value::String(a), Value::String(b)) => {
                            self.push(Value::String(Rc::from(format!("{a}{b}"))));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ));
                        }
                    }
                }
                op::SUBTRACT => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a - b));
                }
                op::MULTIPLY => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a * b));
                }
                op::DIVIDE => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a / b));
                }

                op::PRINT => {
                    let value = self.pop();
                    writeln!(out, "{value}").map_err(|e| GlimError::Io(e.to_string()))?;
                }

                op::DEFINE_GLOBAL => {
                    let name = self.read_string();
                    let value = self.peek(0).clone();
                    self.globals.insert(name, value);
                    self.pop();
                }
                op::GET_GLOBAL => {
                    let name = self.read_string();
                    let value = self.globals.get(&name).cloned();
                    match value {
                        Some(value) => self.push(value),
                        None => {
                            return Err(
                                self.runtime_error(format!("Undefined variable '{name}'."))
                            );
                        }
                    }
                }
                op::SET_GLOBAL => {
                    // Assignment never creates a global.
                    let name = self.read_string();
                    let value = self.peek(0).clone();
                    match self.globals.get_mut(&name) {
                        Some(slot) => *slot = value,
                        None => {
                            return Err(
                                self.runtime_error(format!("Undefined variable '{name}'."))
                            );
                        }
                    }
                }

                op::GET_LOCAL => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots_base + slot].clone();
                    self.push(value);
                }
                op::SET_LOCAL => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let base = self.frame().slots_base;
                    self.stack[base + slot] = value;
                }

                op::GET_UPVALUE => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalues[index].clone();
                    let value = upvalue.read(&self.stack);
                    self.push(value);
                }
                op::SET_UPVALUE => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let upvalue = self.frame().closure.upvalues[index].clone();
                    upvalue.write(&mut self.stack, value);
                }
                op::CLOSE_UPVALUE => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                op::JUMP => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                op::JUMP_IF_FALSE => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                op::LOOP => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }

                op::CALL => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(arg_count)?;
                }
                op::CLOSURE => {
                    let Value::Function(function) = self.read_constant() else {
                        unreachable!("CLOSURE operand is always a function constant")
                    };
                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame().slots_base + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            upvalues.push(self.frame().closure.upvalues[index].clone());
                        }
                    }
                    self.push(Value::Closure(Rc::new(Closure::new(function, upvalues))));
                }

                op::CLASS => {
                    let name = self.read_string();
                    self.push(Value::Class(Rc::new(Class::new(name))));
                }
                op::GET_PROPERTY => {
                    let name = self.read_string();
                    let Value::Instance(instance) = self.peek(0).clone() else {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    };
                    let field = instance.fields.borrow().get(&name).cloned();
                    if let Some(value) = field {
                        self.pop();
                        self.push(value);
                        continue;
                    }
                    let method = instance.class.methods.borrow().get(&name).cloned();
                    if let Some(method) = method {
                        let receiver = self.pop();
                        self.push(Value::BoundMethod(Rc::new(BoundMethod {
                            receiver,
                            method,
                        })));
                        continue;
                    }
                    return Err(self.runtime_error(format!("Undefined property '{name}'.")));
                }
                op::SET_PROPERTY => {
                    let name = self.read_string();
                    let Value::Instance(instance) = self.peek(1).clone() else {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    };
                    instance
                        .fields
                        .borrow_mut()
                        .insert(name, self.peek(0).clone());
                    // Leave only the assigned value on the stack.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                op::METHOD => {
                    let name = self.read_string();
                    let Value::Class(class) = self.peek(1).clone() else {
                        unreachable!("METHOD always executes with the class below the method")
                    };
                    let Value::Closure(method) = self.peek(0).clone() else {
                        unreachable!("METHOD always executes with a closure on top")
                    };
                    class.methods.borrow_mut().insert(name, method);
                    self.pop();
                }

                op::RETURN => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        // Pop the script closure; the program is done.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_base);
                    self.push(result);
                }

                other => {
                    return Err(self.runtime_error(format!("Unknown opcode {other}.")));
                }
            }
        }
    }

    fn pop_number_operands(&mut self) -> Result<(f64, f64), GlimError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => Ok((a, b)),
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {value} ]"));
        }
        eprintln!("{line}");
        let frame = self.frame();
        let (text, _) = disasm::disassemble_instruction(&frame.closure.function.chunk, frame.ip);
        eprintln!("{text}");
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}
