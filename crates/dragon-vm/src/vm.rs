//! The dispatch loop (`spec.md` §4; `vm.c`'s `run()`/`callValue()`/`invoke()`).
//!
//! Bytecode decoding here must match `dragon-compiler`'s emission byte for
//! byte: `Constant`/`Class`/`Method`/`Invoke`/`SuperInvoke`/globals encode a
//! ULEB128 constant-pool index; `GetLocal`/`SetLocal`/`GetUpvalue`/
//! `SetUpvalue`/`Call`/`List` take one raw operand byte; `Jump`/`Loop`/
//! `JumpIfFalse`/`JumpIfFalseSc` take a big-endian `u16`; `Closure` is
//! followed by a constant index and then one `(is_local, index)` byte pair
//! per upvalue.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use dragon_core::{
    BoundMethod, Chunk, Class, Closure, GcConfig, Heap, HeapObject, Instance, List, Native,
    NativeId, ObjRef, OpCode, Table, Upvalue, Value, ValueKind,
};

use crate::config::{VmConfig, FRAMES_MAX};
use crate::error::RunError;
use crate::frame::CallFrame;
use crate::module::{Module, ModuleCache, ModuleId};

/// Signature every Dragon native function implements (`spec.md` §4.5's
/// native ABI): the VM, an optional bound receiver, and the argument slice.
/// `Err` carries an already-constructed exception instance to unwind with.
pub type NativeFn = fn(&mut Vm, Option<Value>, &[Value]) -> VmResult<Value>;

/// A thrown value moving through the Rust call stack. `Throw` is fresh and
/// has not yet been matched against a try frame; `Unwound` means some inner
/// frame (possibly several Rust call levels down, through a native's
/// re-entrant call back into Dragon) already resolved it against a try
/// frame or gave up — propagate without touching it again.
pub(crate) enum Trap {
    Throw(ObjRef),
    Unwound,
}

pub(crate) type VmResult<T> = Result<T, Trap>;

enum CallOutcome {
    Native(Value),
    FramePushed,
}

enum StepOutcome {
    Continue,
    Returned(Value),
}

#[derive(Clone, Copy)]
enum BuiltinTable {
    List,
    String,
}

/// Strings looked up often enough in the dispatch loop that they are
/// interned once at VM startup rather than every time they're needed.
pub(crate) struct WellKnownStrings {
    pub constructor: ObjRef,
    pub message: ObjRef,
    pub stack_trace: ObjRef,
    pub index: ObjRef,
    pub data: ObjRef,
    pub to_string: ObjRef,
    pub ty_boolean: ObjRef,
    pub ty_number: ObjRef,
    pub ty_null: ObjRef,
    pub ty_function: ObjRef,
    pub ty_class: ObjRef,
    pub ty_instance: ObjRef,
    pub ty_string: ObjRef,
    pub ty_list: ObjRef,
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) modules: Vec<Module>,
    pub(crate) module_cache: ModuleCache,
    /// Open upvalues ordered by descending stack location: index 0 always
    /// points at the highest (most recently pushed) open slot.
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) natives: Vec<(NativeFn, &'static str, u8, bool)>,
    pub(crate) list_methods: Table,
    pub(crate) string_methods: Table,
    pub(crate) strings: WellKnownStrings,
    pub(crate) start: Instant,
    pub(crate) config: VmConfig,
    /// Set by `raise` when no try frame anywhere catches an exception;
    /// `run_source` at the outermost call drains this into the final error.
    pub(crate) pending_uncaught: Option<String>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new(GcConfig {
            initial_threshold: config.initial_gc_threshold,
            growth_factor: config.gc_growth_factor,
        });
        let strings = WellKnownStrings {
            constructor: heap.intern_copy("constructor"),
            message: heap.intern_copy("message"),
            stack_trace: heap.intern_copy("stackTrace"),
            index: heap.intern_copy("index"),
            data: heap.intern_copy("data"),
            to_string: heap.intern_copy("toString"),
            ty_boolean: heap.intern_copy("boolean"),
            ty_number: heap.intern_copy("number"),
            ty_null: heap.intern_copy("null"),
            ty_function: heap.intern_copy("function"),
            ty_class: heap.intern_copy("class"),
            ty_instance: heap.intern_copy("instance"),
            ty_string: heap.intern_copy("string"),
            ty_list: heap.intern_copy("list"),
        };
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(config.initial_frames * config.stack_slots_per_frame),
            frames: Vec::with_capacity(config.initial_frames),
            modules: Vec::new(),
            module_cache: ModuleCache::default(),
            open_upvalues: Vec::new(),
            natives: Vec::new(),
            list_methods: Table::new(),
            string_methods: Table::new(),
            strings,
            start: Instant::now(),
            config,
            pending_uncaught: None,
        };
        crate::natives::install_globals(&mut vm);
        crate::list_ops::install(&mut vm);
        crate::string_ops::install(&mut vm);
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn hash_of(&self, r: ObjRef) -> u32 {
        self.heap.hash_of(r)
    }

    /// Registers a native and returns the id bytecode/tables reference it by.
    pub(crate) fn register_native(
        &mut self,
        f: NativeFn,
        name: &'static str,
        arity: u8,
        is_varargs: bool,
    ) -> NativeId {
        self.natives.push((f, name, arity, is_varargs));
        NativeId((self.natives.len() - 1) as u32)
    }

    pub(crate) fn alloc_native(&mut self, id: NativeId, bound: Option<Value>) -> ObjRef {
        let (_, name, arity, is_varargs) = self.natives[id.0 as usize];
        self.heap.alloc_native(Native {
            id,
            arity,
            is_varargs,
            bound_receiver: bound,
            name,
        })
    }

    /// Creates a fresh module rooted at `directory`, bootstrapping `Object`,
    /// `Iterator`, `Import`, `Exception`, the exception taxonomy, and the
    /// global natives into its globals table (`spec.md` §4.7, `module.c`'s
    /// per-module `initModule`).
    pub fn create_module(&mut self, directory: PathBuf) -> ModuleId {
        let id = self.modules.len();
        tracing::debug!(id, directory = %directory.display(), "bootstrapping module");
        let module = crate::exception::bootstrap_module(self, directory);
        self.modules.push(module);
        crate::natives::install_module_globals(self, id);
        id
    }

    /// Compiles `source` against `module` and runs it to completion, as one
    /// top-level call frame (`spec.md` §4.1's script-function convention).
    pub fn run_source(&mut self, module: ModuleId, source: &str) -> Result<(), RunError> {
        let function_ref = dragon_compiler::compile(source, &mut self.heap).map_err(|errors| {
            RunError::Compile(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })?;
        let closure_ref = self.heap.alloc_closure(Closure {
            function: function_ref,
            upvalues: Vec::new(),
            module,
        });
        match self.run_closure_as_frame(closure_ref) {
            Ok(_) => Ok(()),
            Err(Trap::Unwound) => self.drain_uncaught(),
            Err(Trap::Throw(_)) => unreachable!("run() never returns a fresh throw"),
        }
    }

    /// Reads a global by name out of `module` and renders it with the same
    /// rules as `print` (`spec.md` §4.5's `toString` convention). Host-side
    /// introspection only, not a language feature: embedders and tests use
    /// this to observe the result of a script that assigns to a global
    /// rather than scraping `print` output.
    pub fn read_global(&mut self, module: ModuleId, name: &str) -> Option<String> {
        let key = self.heap.intern_copy(name);
        let hash = self.heap.hash_of(key);
        let value = self.modules[module].globals.get(key, hash)?;
        self.display_string(value).ok()
    }

    /// Runs `closure_ref` as a new call frame to completion, relative to
    /// however deep the frame stack already is (`floor`-based, like
    /// `call_from_native`) rather than assuming an empty stack. Shared by
    /// `run_source`'s top-level entry and `OpCode::Import`'s nested module
    /// execution, both of which need a script body to run under whatever
    /// frames are already active.
    pub(crate) fn run_closure_as_frame(&mut self, closure_ref: ObjRef) -> VmResult<Value> {
        let floor = self.frames.len();
        self.push(Value::Object(closure_ref));
        match self.call_value(Value::Object(closure_ref), 0) {
            Ok(CallOutcome::FramePushed) => self.run(floor),
            Ok(CallOutcome::Native(_)) => unreachable!("script entry is always a closure"),
            Err(trap) => Err(self.propagate(trap)),
        }
    }

    fn drain_uncaught(&mut self) -> Result<(), RunError> {
        match self.pending_uncaught.take() {
            Some(trace) => {
                tracing::debug!(%trace, "uncaught exception reached top frame");
                Err(RunError::Runtime(trace))
            }
            None => Ok(()),
        }
    }

    // ---- GC -----------------------------------------------------------

    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let Vm {
            heap,
            stack,
            frames,
            modules,
            module_cache,
            open_upvalues,
            list_methods,
            string_methods,
            strings,
            ..
        } = self;
        heap.collect(|h| {
            for v in stack.iter() {
                h.mark_value(*v);
            }
            for f in frames.iter() {
                h.mark(f.closure);
            }
            for u in open_upvalues.iter() {
                h.mark(*u);
            }
            for r in module_cache.values() {
                h.mark(r);
            }
            for m in modules.iter() {
                h.mark_table(&m.globals);
                h.mark_table(&m.exports);
                h.mark(m.object_class);
                h.mark(m.iterator_class);
                h.mark(m.import_class);
                h.mark(m.exception_class);
            }
            h.mark_table(list_methods);
            h.mark_table(string_methods);
            h.mark(strings.constructor);
            h.mark(strings.message);
            h.mark(strings.stack_trace);
            h.mark(strings.index);
            h.mark(strings.data);
            h.mark(strings.to_string);
            h.mark(strings.ty_boolean);
            h.mark(strings.ty_number);
            h.mark(strings.ty_null);
            h.mark(strings.ty_function);
            h.mark(strings.ty_class);
            h.mark(strings.ty_instance);
            h.mark(strings.ty_string);
            h.mark(strings.ty_list);
        });
    }

    // ---- error plumbing -------------------------------------------------

    /// Converts a fresh throw into a resolved `Unwound`, or passes an
    /// already-resolved one through untouched. Safe to call at every layer
    /// that might see either variant.
    pub(crate) fn propagate(&mut self, trap: Trap) -> Trap {
        if let Trap::Throw(instance) = trap {
            self.raise(instance);
        }
        Trap::Unwound
    }

    pub(crate) fn throw_new(&mut self, class_name: &str, message: String) -> Trap {
        let module = self.current_module();
        let instance = crate::exception::make_exception(self, module, class_name, message);
        Trap::Throw(instance)
    }

    pub(crate) fn current_module(&self) -> ModuleId {
        let closure_ref = self.frames.last().expect("at least one frame").closure;
        self.heap.get(closure_ref).as_closure().unwrap().module
    }

    // ---- stack helpers ---------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- bytecode decode ---------------------------------------------------

    fn current_chunk_ptr(&self) -> *const Chunk {
        let frame = *self.frames.last().unwrap();
        let closure = self.heap.get(frame.closure).as_closure().unwrap();
        let function = self.heap.get(closure.function).as_function().unwrap();
        &function.chunk as *const Chunk
    }

    fn read_u8(&mut self) -> u8 {
        // SAFETY: the chunk outlives the single-instruction read and is not
        // mutated while bytecode for the same closure executes.
        let chunk = unsafe { &*self.current_chunk_ptr() };
        let frame = self.frames.last_mut().unwrap();
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let chunk = unsafe { &*self.current_chunk_ptr() };
        let frame = self.frames.last_mut().unwrap();
        let v = chunk.read_u16(frame.ip);
        frame.ip += 2;
        v
    }

    fn read_uleb(&mut self) -> usize {
        let chunk = unsafe { &*self.current_chunk_ptr() };
        let frame = self.frames.last_mut().unwrap();
        let (v, len) = chunk.read_uleb(frame.ip);
        frame.ip += len;
        v
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_uleb();
        let chunk = unsafe { &*self.current_chunk_ptr() };
        chunk.constants[idx]
    }

    pub(crate) fn current_line(&self) -> u32 {
        let chunk = unsafe { &*self.current_chunk_ptr() };
        let frame = self.frames.last().unwrap();
        chunk.line_for(frame.ip)
    }

    pub(crate) fn current_function_name(&self) -> String {
        let frame = *self.frames.last().unwrap();
        let closure = self.heap.get(frame.closure).as_closure().unwrap();
        let function = self.heap.get(closure.function).as_function().unwrap();
        match function.name {
            Some(r) => self.heap.get(r).as_string().unwrap().bytes.clone(),
            None => "<script>".to_string(),
        }
    }

    // ---- upvalues ----------------------------------------------------------

    pub(crate) fn capture_upvalue(&mut self, location: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            let loc = match self.heap.get(r).as_upvalue().unwrap() {
                Upvalue::Open(l) => *l,
                Upvalue::Closed(_) => unreachable!("open list holds only open upvalues"),
            };
            if loc == location {
                return r;
            }
            if loc < location {
                insert_at = i;
                break;
            }
        }
        let r = self.heap.alloc_upvalue(Upvalue::Open(location));
        self.open_upvalues.insert(insert_at, r);
        r
    }

    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let loc = match self.heap.get(r).as_upvalue().unwrap() {
                Upvalue::Open(l) => *l,
                Upvalue::Closed(_) => unreachable!(),
            };
            if loc < from {
                break;
            }
            let value = self.stack[loc];
            *self.heap.get_mut(r).as_upvalue_mut().unwrap() = Upvalue::Closed(value);
            i += 1;
        }
        self.open_upvalues.drain(0..i);
        self.stack.truncate(from);
    }

    // ---- running ------------------------------------------------------

    /// Drives the dispatch loop until the frame count returns to `floor`.
    /// Used both for the whole program (`floor == 0`) and for re-entrant
    /// calls a native makes back into Dragon (`floor` = depth at the time
    /// of the call).
    pub(crate) fn run(&mut self, floor: usize) -> VmResult<Value> {
        loop {
            self.maybe_collect();
            match self.step(floor) {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::Returned(v)) => return Ok(v),
                Err(Trap::Unwound) => {
                    if self.frames.len() > floor {
                        continue;
                    }
                    return Err(Trap::Unwound);
                }
                Err(Trap::Throw(_)) => unreachable!("step() always resolves fresh throws"),
            }
        }
    }

    /// Re-entrant call from a native back into Dragon (`spec.md` §5): runs
    /// `callee(args)` to completion and returns its value, or an already
    /// resolved/unresolved trap for the native to propagate with `?`.
    pub(crate) fn call_from_native(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        let floor = self.frames.len();
        self.push(callee);
        for &a in args {
            self.push(a);
        }
        match self.call_value(callee, args.len() as u8) {
            Ok(CallOutcome::Native(v)) => Ok(v),
            Ok(CallOutcome::FramePushed) => self.run(floor),
            Err(trap) => Err(self.propagate(trap)),
        }
    }

    fn step(&mut self, floor: usize) -> VmResult<StepOutcome> {
        let op = OpCode::from_byte(self.read_u8()).expect("corrupt bytecode: bad opcode");
        match op {
            OpCode::Constant => {
                let v = self.read_constant();
                self.push(v);
            }
            OpCode::Null => self.push(Value::Null),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Object => {
                let module = self.current_module();
                self.push(Value::Object(self.modules[module].object_class));
            }
            OpCode::List => {
                let n = self.read_u8() as usize;
                let items = self.stack.split_off(self.stack.len() - n);
                let r = self.heap.alloc_list(List { items });
                self.push(Value::Object(r));
            }
            OpCode::Range => {
                let end = self.pop();
                let start = self.pop();
                let (Some(s), Some(e)) = (start.as_number(), end.as_number()) else {
                    return Err(self.throw_new("TypeException", "Range bounds must be numbers.".into()));
                };
                let items: Vec<Value> = ((s as i64)..(e as i64)).map(|n| Value::Number(n as f64)).collect();
                let r = self.heap.alloc_list(List { items });
                self.push(Value::Object(r));
            }
            OpCode::GetGlobal => {
                let name = self.read_constant();
                let module = self.current_module();
                match self.lookup_global(module, name) {
                    Some(v) => self.push(v),
                    None => {
                        let n = self.value_name(name);
                        return Err(self.throw_new("UndefinedVariableException", format!("Undefined variable '{n}'.")));
                    }
                }
            }
            OpCode::DefineGlobal => {
                let name = self.read_constant();
                let v = self.pop();
                let module = self.current_module();
                self.define_global(module, name, v);
            }
            OpCode::SetGlobal => {
                let name = self.read_constant();
                let v = self.peek(0);
                let module = self.current_module();
                if !self.set_global_if_present(module, name, v) {
                    let n = self.value_name(name);
                    return Err(self.throw_new("UndefinedVariableException", format!("Undefined variable '{n}'.")));
                }
            }
            OpCode::Import => self.do_import()?,
            OpCode::Export => {
                let name = self.read_constant();
                let v = self.pop();
                let module = self.current_module();
                self.define_global(module, name, v);
                let Value::Object(name_ref) = name else {
                    unreachable!("export names are always interned strings");
                };
                let hash = self.heap.get(name_ref).as_string().unwrap().hash;
                self.modules[module].exports.set(name_ref, hash, v, |k| self.heap.hash_of(k));
            }
            OpCode::GetLocal => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.push(self.stack[base + slot]);
            }
            OpCode::SetLocal => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::GetUpvalue => {
                let idx = self.read_u8() as usize;
                let v = self.read_upvalue(idx);
                self.push(v);
            }
            OpCode::SetUpvalue => {
                let idx = self.read_u8() as usize;
                let v = self.peek(0);
                self.write_upvalue(idx, v);
            }
            OpCode::CloseUpvalue => {
                let loc = self.stack.len() - 1;
                self.close_and_pop_one(loc);
            }
            OpCode::GetProperty => {
                let name = self.read_constant();
                let receiver = self.pop();
                let v = self.get_property(receiver, name)?;
                self.push(v);
            }
            OpCode::SetProperty => {
                let name = self.read_constant();
                let value = self.pop();
                let receiver = self.pop();
                self.set_property(receiver, name, value)?;
                self.push(value);
            }
            OpCode::SetPropertyKv => {
                let name = self.read_constant();
                let value = self.pop();
                let receiver = self.peek(0);
                self.set_property(receiver, name, value)?;
            }
            OpCode::GetIndex => {
                let index = self.pop();
                let receiver = self.pop();
                let v = self.get_index(receiver, index)?;
                self.push(v);
            }
            OpCode::SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let receiver = self.pop();
                self.set_index(receiver, index, value)?;
                self.push(value);
            }
            OpCode::GetSuper => {
                let name = self.read_constant();
                let superclass = self.pop();
                let receiver = self.pop();
                let v = self.bind_method(superclass, receiver, name)?;
                self.push(v);
            }
            OpCode::Dup => {
                let v = self.peek(0);
                self.push(v);
            }
            OpCode::DupX2 => {
                let a = self.peek(1);
                let b = self.peek(0);
                self.push(a);
                self.push(b);
            }
            OpCode::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsey()));
            }
            OpCode::Negate => {
                let v = self.pop();
                match v.as_number() {
                    Some(n) => self.push(Value::Number(-n)),
                    None => return Err(self.throw_new("TypeException", "Operand must be a number.".into())),
                }
            }
            OpCode::Add => self.op_add()?,
            OpCode::Sub => self.numeric_binary(|a, b| a - b)?,
            OpCode::Mul => self.numeric_binary(|a, b| a * b)?,
            OpCode::Div => self.numeric_binary(|a, b| a / b)?,
            OpCode::Mod => self.numeric_binary(|a, b| a - b * (a / b).floor())?,
            OpCode::BitNot => self.integer_unary(|a| !a)?,
            OpCode::BitAnd => self.integer_binary(|a, b| a & b)?,
            OpCode::BitOr => self.integer_binary(|a, b| a | b)?,
            OpCode::BitXor => self.integer_binary(|a, b| a ^ b)?,
            OpCode::Lsh => self.integer_binary(|a, b| a.wrapping_shl(b as u32))?,
            OpCode::Ash => self.integer_binary(|a, b| a.wrapping_shr(b as u32))?,
            OpCode::Rsh => self.integer_binary(|a, b| (a as u64).wrapping_shr(b as u32) as i64)?,
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(self.heap.values_equal(a, b)));
            }
            OpCode::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(!self.heap.values_equal(a, b)));
            }
            OpCode::Is => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.is_same_as(b)));
            }
            OpCode::Greater => self.compare_binary(|a, b| a > b)?,
            OpCode::GreaterEq => self.compare_binary(|a, b| a >= b)?,
            OpCode::Less => self.compare_binary(|a, b| a < b)?,
            OpCode::LessEq => self.compare_binary(|a, b| a <= b)?,
            OpCode::In => {
                let container = self.pop();
                let needle = self.pop();
                let v = self.op_in(needle, container)?;
                self.push(Value::Bool(v));
            }
            OpCode::InstanceOf => {
                let class = self.pop();
                let v = self.pop();
                self.push(Value::Bool(self.is_instance_of(v, class)));
            }
            OpCode::TypeOf => {
                let v = self.pop();
                self.push(Value::Object(self.type_name_ref(v)));
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                let cond = self.pop();
                if cond.is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::JumpIfFalseSc => {
                let offset = self.read_u16() as usize;
                let cond = self.peek(0);
                if cond.is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
            }
            OpCode::Call => {
                let argc = self.read_u8();
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            OpCode::Closure => self.do_closure(),
            OpCode::Class => {
                let name = self.read_constant();
                let class = Class::new(name.as_object().unwrap());
                let r = self.heap.alloc_class(class);
                self.push(Value::Object(r));
            }
            OpCode::Inherit => self.do_inherit()?,
            OpCode::Method => {
                let name = self.read_constant();
                self.do_method(name);
            }
            OpCode::Invoke => {
                let name = self.read_constant();
                let argc = self.read_u8();
                self.do_invoke(name, argc)?;
            }
            OpCode::SuperInvoke => {
                let name = self.read_constant();
                let argc = self.read_u8();
                self.do_super_invoke(name, argc)?;
            }
            OpCode::Throw => {
                let v = self.pop();
                let Value::Object(r) = v else {
                    return Err(self.throw_new("TypeException", "Can only throw instances.".into()));
                };
                if !matches!(self.heap.get(r), HeapObject::Instance(_)) {
                    return Err(self.throw_new("TypeException", "Can only throw instances.".into()));
                }
                return Err(self.propagate(Trap::Throw(r)));
            }
            OpCode::TryBegin => {
                let offset = self.read_u16() as usize;
                let height = self.stack.len();
                let frame = self.frames.last_mut().unwrap();
                let catch = frame.ip + offset;
                frame.is_try = true;
                frame.catch_jump = catch;
                frame.try_stack_height = height;
            }
            OpCode::TryEnd => {
                self.frames.last_mut().unwrap().is_try = false;
            }
            OpCode::Return => {
                let value = self.pop();
                let frame = self.frames.pop().unwrap();
                self.close_upvalues(frame.base);
                if self.frames.len() == floor {
                    return Ok(StepOutcome::Returned(value));
                }
                self.push(value);
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn close_and_pop_one(&mut self, loc: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let l = match self.heap.get(r).as_upvalue().unwrap() {
                Upvalue::Open(l) => *l,
                Upvalue::Closed(_) => unreachable!(),
            };
            if l == loc {
                let value = self.stack[l];
                *self.heap.get_mut(r).as_upvalue_mut().unwrap() = Upvalue::Closed(value);
                self.open_upvalues.remove(i);
                break;
            }
            i += 1;
        }
        self.stack.pop();
    }

    // ---- arithmetic helpers ------------------------------------------------

    fn numeric_binary(&mut self, f: impl Fn(f64, f64) -> f64) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => Err(self.throw_new("TypeException", "Operands must be numbers.".into())),
        }
    }

    fn compare_binary(&mut self, f: impl Fn(f64, f64) -> bool) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => Err(self.throw_new("TypeException", "Operands must be numbers.".into())),
        }
    }

    fn as_integer(v: Value) -> Option<i64> {
        let n = v.as_number()?;
        if n.is_finite() && n.floor() == n {
            Some(n as i64)
        } else {
            None
        }
    }

    fn integer_binary(&mut self, f: impl Fn(i64, i64) -> i64) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (Self::as_integer(a), Self::as_integer(b)) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(f(x, y) as f64));
                Ok(())
            }
            _ => Err(self.throw_new("TypeException", "Bitwise operands must be integers.".into())),
        }
    }

    fn integer_unary(&mut self, f: impl Fn(i64) -> i64) -> VmResult<()> {
        let a = self.pop();
        match Self::as_integer(a) {
            Some(x) => {
                self.push(Value::Number(f(x) as f64));
                Ok(())
            }
            None => Err(self.throw_new("TypeException", "Bitwise operand must be an integer.".into())),
        }
    }

    fn op_add(&mut self) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(x + y));
                Ok(())
            }
            (Value::Object(ra), _) if matches!(self.heap.get(ra), HeapObject::List(_)) => {
                let mut items = self.heap.get(ra).as_list().unwrap().items.clone();
                items.push(b);
                let r = self.heap.alloc_list(List { items });
                self.push(Value::Object(r));
                Ok(())
            }
            (Value::Object(ra), _) if matches!(self.heap.get(ra), HeapObject::String(_)) => {
                let left = self.heap.get(ra).as_string().unwrap().bytes.clone();
                let right = self.display_string(b)?;
                let r = self.heap.intern_take(left + &right);
                self.push(Value::Object(r));
                Ok(())
            }
            (_, Value::Object(rb)) if matches!(self.heap.get(rb), HeapObject::String(_)) => {
                let left = self.display_string(a)?;
                let right = self.heap.get(rb).as_string().unwrap().bytes.clone();
                let r = self.heap.intern_take(left + &right);
                self.push(Value::Object(r));
                Ok(())
            }
            _ => Err(self.throw_new("TypeException", "Operands must be numbers, a string, or a list.".into())),
        }
    }

    fn op_in(&mut self, needle: Value, container: Value) -> VmResult<bool> {
        match container {
            Value::Object(r) => match self.heap.get(r) {
                HeapObject::List(l) => {
                    let items = l.items.clone();
                    Ok(items.iter().any(|v| self.heap.values_equal(*v, needle)))
                }
                HeapObject::String(s) => {
                    let Value::Object(nr) = needle else {
                        return Err(self.throw_new("TypeException", "Expected a string on the left of 'in'.".into()));
                    };
                    let Some(needle_str) = self.heap.get(nr).as_string() else {
                        return Err(self.throw_new("TypeException", "Expected a string on the left of 'in'.".into()));
                    };
                    Ok(s.bytes.contains(needle_str.bytes.as_str()))
                }
                HeapObject::Instance(inst) => {
                    let Value::Object(nr) = needle else {
                        return Err(self.throw_new("TypeException", "Expected a string field name on the left of 'in'.".into()));
                    };
                    if !matches!(self.heap.get(nr), HeapObject::String(_)) {
                        return Err(self.throw_new("TypeException", "Expected a string field name on the left of 'in'.".into()));
                    }
                    let hash = self.heap.get(nr).as_string().unwrap().hash;
                    Ok(inst.fields.get(nr, hash).is_some())
                }
                _ => Err(self.throw_new("TypeException", "'in' expects a list, string, or instance on the right.".into())),
            },
            _ => Err(self.throw_new("TypeException", "'in' expects a list, string, or instance on the right.".into())),
        }
    }

    fn is_instance_of(&self, v: Value, class: Value) -> bool {
        let (Value::Object(ir), Value::Object(cr)) = (v, class) else {
            return false;
        };
        let Some(inst) = self.heap.get(ir).as_instance() else {
            return false;
        };
        let mut cur = Some(inst.class);
        while let Some(c) = cur {
            if c == cr {
                return true;
            }
            cur = self.heap.get(c).as_class().unwrap().superclass;
        }
        false
    }

    fn type_name_ref(&self, v: Value) -> ObjRef {
        match self.kind_of(v) {
            ValueKind::Boolean => self.strings.ty_boolean,
            ValueKind::Number => self.strings.ty_number,
            ValueKind::Null => self.strings.ty_null,
            ValueKind::Function => self.strings.ty_function,
            ValueKind::Class => self.strings.ty_class,
            ValueKind::Instance => self.strings.ty_instance,
            ValueKind::String => self.strings.ty_string,
            ValueKind::List => self.strings.ty_list,
        }
    }

    fn kind_of(&self, v: Value) -> ValueKind {
        match v {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::Object(r) => match self.heap.get(r) {
                HeapObject::String(_) => ValueKind::String,
                HeapObject::List(_) => ValueKind::List,
                HeapObject::Class(_) => ValueKind::Class,
                HeapObject::Instance(_) => ValueKind::Instance,
                HeapObject::Function(_)
                | HeapObject::Native(_)
                | HeapObject::Closure(_)
                | HeapObject::BoundMethod(_) => ValueKind::Function,
                HeapObject::Upvalue(_) => unreachable!("upvalues are never directly observable values"),
            },
        }
    }

    fn value_name(&self, v: Value) -> String {
        match v {
            Value::Object(r) => match self.heap.get(r).as_string() {
                Some(s) => s.bytes.clone(),
                None => "?".to_string(),
            },
            _ => "?".to_string(),
        }
    }

    // ---- globals ------------------------------------------------------

    fn lookup_global(&self, module: ModuleId, name: Value) -> Option<Value> {
        let Value::Object(r) = name else { return None };
        let hash = self.heap.get(r).as_string()?.hash;
        self.modules[module].globals.get(r, hash)
    }

    fn define_global(&mut self, module: ModuleId, name: Value, v: Value) {
        let Value::Object(r) = name else { return };
        let hash = self.heap.get(r).as_string().unwrap().hash;
        self.modules[module].globals.set(r, hash, v, |k| self.heap.hash_of(k));
    }

    fn set_global_if_present(&mut self, module: ModuleId, name: Value, v: Value) -> bool {
        let Value::Object(r) = name else { return false };
        let hash = self.heap.get(r).as_string().unwrap().hash;
        if self.modules[module].globals.get(r, hash).is_none() {
            return false;
        }
        self.modules[module].globals.set(r, hash, v, |k| self.heap.hash_of(k));
        true
    }

    // ---- upvalue read/write -------------------------------------------

    fn read_upvalue(&self, idx: usize) -> Value {
        let frame = self.frames.last().unwrap();
        let closure = self.heap.get(frame.closure).as_closure().unwrap();
        let upvalue_ref = closure.upvalues[idx];
        match self.heap.get(upvalue_ref).as_upvalue().unwrap() {
            Upvalue::Open(loc) => self.stack[*loc],
            Upvalue::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, idx: usize, v: Value) {
        let frame = self.frames.last().unwrap();
        let closure = self.heap.get(frame.closure).as_closure().unwrap();
        let upvalue_ref = closure.upvalues[idx];
        let is_open_loc = match self.heap.get(upvalue_ref).as_upvalue().unwrap() {
            Upvalue::Open(loc) => Some(*loc),
            Upvalue::Closed(_) => None,
        };
        match is_open_loc {
            Some(loc) => self.stack[loc] = v,
            None => *self.heap.get_mut(upvalue_ref).as_upvalue_mut().unwrap() = Upvalue::Closed(v),
        }
    }

    fn do_closure(&mut self) {
        let function_value = self.read_constant();
        let function_ref = function_value.as_object().unwrap();
        let upvalue_count = self.heap.get(function_ref).as_function().unwrap().upvalue_count;
        let enclosing_closure = self.frames.last().unwrap().closure;
        let module = self.heap.get(enclosing_closure).as_closure().unwrap().module;
        let base = self.frames.last().unwrap().base;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8() != 0;
            let index = self.read_u8() as usize;
            let r = if is_local {
                self.capture_upvalue(base + index)
            } else {
                let closure = self.heap.get(self.frames.last().unwrap().closure).as_closure().unwrap();
                closure.upvalues[index]
            };
            upvalues.push(r);
        }
        let closure_ref = self.heap.alloc_closure(Closure {
            function: function_ref,
            upvalues,
            module,
        });
        self.push(Value::Object(closure_ref));
    }

    /// Resolves, runs, and caches an `import` expression (`spec.md` §4.7):
    /// a second import of the same resolved path returns the same `Import`
    /// instance rather than re-running the module body.
    fn do_import(&mut self) -> VmResult<()> {
        let path_val = self.read_constant();
        let Value::Object(path_ref) = path_val else {
            unreachable!("import paths are always interned strings");
        };
        let path_str = self.heap.get(path_ref).as_string().unwrap().bytes.clone();
        let module = self.current_module();
        let full_path = self.modules[module].resolve(&path_str);

        if let Some(cached) = self.module_cache.get(&full_path) {
            self.push(Value::Object(cached));
            return Ok(());
        }

        let source = match fs::read_to_string(&full_path) {
            Ok(s) => s,
            Err(e) => {
                return Err(self.throw_new("ImportException", format!("Could not import '{path_str}': {e}.")));
            }
        };
        let new_directory = full_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let new_module = self.create_module(new_directory);
        let function_ref = match dragon_compiler::compile(&source, &mut self.heap) {
            Ok(f) => f,
            Err(errors) => {
                let msg = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n");
                return Err(self.throw_new("ImportException", format!("Error importing '{path_str}': {msg}")));
            }
        };
        let closure_ref = self.heap.alloc_closure(Closure {
            function: function_ref,
            upvalues: Vec::new(),
            module: new_module,
        });
        self.run_closure_as_frame(closure_ref)?;

        let import_class = self.modules[module].import_class;
        let inst_ref = self.heap.alloc_instance(Instance::new(import_class));
        let exports = self.modules[new_module].exports.clone();
        let hashes: HashMap<u32, u32> = exports.iter().map(|(k, _)| (k.raw(), self.heap.hash_of(k))).collect();
        let mut fields = std::mem::take(&mut self.heap.get_mut(inst_ref).as_instance_mut().unwrap().fields);
        fields.add_all(&exports, move |k| *hashes.get(&k.raw()).unwrap());
        self.heap.get_mut(inst_ref).as_instance_mut().unwrap().fields = fields;

        self.module_cache.insert(full_path, inst_ref);
        self.push(Value::Object(inst_ref));
        Ok(())
    }

    fn do_inherit(&mut self) -> VmResult<()> {
        let subclass_v = self.pop();
        let superclass_v = self.peek(0);
        let Value::Object(super_ref) = superclass_v else {
            return Err(self.throw_new("TypeException", "Superclass must be a class.".into()));
        };
        if !matches!(self.heap.get(super_ref), HeapObject::Class(_)) {
            return Err(self.throw_new("TypeException", "Superclass must be a class.".into()));
        }
        let Value::Object(sub_ref) = subclass_v else {
            unreachable!("class declarations always push a Class value");
        };
        let methods = self.heap.get(super_ref).as_class().unwrap().methods.clone();
        let hashes: std::collections::HashMap<u32, u32> = methods
            .iter()
            .map(|(k, _)| (k.raw(), self.heap.hash_of(k)))
            .collect();
        let mut sub_methods = std::mem::take(&mut self.heap.get_mut(sub_ref).as_class_mut().unwrap().methods);
        sub_methods.add_all(&methods, move |k| *hashes.get(&k.raw()).unwrap());
        let sub = self.heap.get_mut(sub_ref).as_class_mut().unwrap();
        sub.superclass = Some(super_ref);
        sub.methods = sub_methods;
        Ok(())
    }

    fn do_method(&mut self, name: Value) {
        let method = self.pop();
        let class_v = self.peek(0);
        let Value::Object(class_ref) = class_v else {
            unreachable!("METHOD always runs with a class on the stack");
        };
        let Value::Object(name_ref) = name else {
            unreachable!("method names are always interned strings");
        };
        let hash = self.heap.get(name_ref).as_string().unwrap().hash;
        let mut methods = std::mem::take(&mut self.heap.get_mut(class_ref).as_class_mut().unwrap().methods);
        methods.set(name_ref, hash, method, |k| self.heap.hash_of(k));
        self.heap.get_mut(class_ref).as_class_mut().unwrap().methods = methods;
    }

    // ---- property / index access ---------------------------------------

    fn get_property(&mut self, receiver: Value, name: Value) -> VmResult<Value> {
        let Value::Object(name_ref) = name else {
            unreachable!("property names are always interned strings");
        };
        let hash = self.heap.get(name_ref).as_string().unwrap().hash;
        let Value::Object(r) = receiver else {
            return Err(self.throw_new("PropertyException", format!("Undefined property '{}'.", self.value_name(name))));
        };
        match self.heap.get(r) {
            HeapObject::Instance(inst) => {
                if let Some(v) = inst.fields.get(name_ref, hash) {
                    return Ok(v);
                }
                let class_ref = inst.class;
                match self.find_method(class_ref, name_ref, hash) {
                    Some(method) => {
                        let bound = self.heap.alloc_bound_method(BoundMethod { receiver, method });
                        Ok(Value::Object(bound))
                    }
                    None => Err(self.throw_new("PropertyException", format!("Undefined property '{}'.", self.value_name(name)))),
                }
            }
            HeapObject::List(_) => self.bind_builtin(receiver, name_ref, hash, BuiltinTable::List),
            HeapObject::String(_) => self.bind_builtin(receiver, name_ref, hash, BuiltinTable::String),
            _ => Err(self.throw_new("PropertyException", format!("Undefined property '{}'.", self.value_name(name)))),
        }
    }

    fn bind_builtin(&mut self, receiver: Value, name_ref: ObjRef, hash: u32, which: BuiltinTable) -> VmResult<Value> {
        let table = match which {
            BuiltinTable::List => &self.list_methods,
            BuiltinTable::String => &self.string_methods,
        };
        match table.get(name_ref, hash) {
            Some(Value::Object(method_ref)) => {
                let bound = self.heap.alloc_bound_method(BoundMethod {
                    receiver,
                    method: method_ref,
                });
                Ok(Value::Object(bound))
            }
            _ => Err(self.throw_new("PropertyException", "Undefined property.".to_string())),
        }
    }

    fn find_method(&self, class_ref: ObjRef, name_ref: ObjRef, hash: u32) -> Option<Value> {
        self.heap.get(class_ref).as_class().unwrap().methods.get(name_ref, hash)
    }

    /// Sets an instance field directly, bypassing `OpCode::SetProperty`'s
    /// type checks. Used by the exception unwind path and the builtin
    /// constructors (`Iterator`, exception instances) to seed fields without
    /// going through a full dispatch round-trip.
    pub(crate) fn set_field(&mut self, instance: ObjRef, key: ObjRef, value: Value) {
        let hash = self.heap.hash_of(key);
        let mut fields = std::mem::take(&mut self.heap.get_mut(instance).as_instance_mut().unwrap().fields);
        fields.set(key, hash, value, |k| self.heap.hash_of(k));
        self.heap.get_mut(instance).as_instance_mut().unwrap().fields = fields;
    }

    fn set_property(&mut self, receiver: Value, name: Value, value: Value) -> VmResult<()> {
        let Value::Object(name_ref) = name else {
            unreachable!("property names are always interned strings");
        };
        let Value::Object(r) = receiver else {
            return Err(self.throw_new("TypeException", "Only instances have settable properties.".into()));
        };
        if !matches!(self.heap.get(r), HeapObject::Instance(_)) {
            return Err(self.throw_new("TypeException", "Only instances have settable properties.".into()));
        }
        let hash = self.heap.get(name_ref).as_string().unwrap().hash;
        let mut fields = std::mem::take(&mut self.heap.get_mut(r).as_instance_mut().unwrap().fields);
        fields.set(name_ref, hash, value, |k| self.heap.hash_of(k));
        self.heap.get_mut(r).as_instance_mut().unwrap().fields = fields;
        Ok(())
    }

    fn get_index(&mut self, receiver: Value, index: Value) -> VmResult<Value> {
        match receiver {
            Value::Object(r) => match self.heap.get(r) {
                HeapObject::List(l) => {
                    let len = l.items.len() as i64;
                    let idx = self.resolve_index(index, len)?;
                    Ok(self.heap.get(r).as_list().unwrap().items[idx as usize])
                }
                HeapObject::String(s) => {
                    let len = s.bytes.as_bytes().len() as i64;
                    let idx = self.resolve_index(index, len)?;
                    let byte = self.heap.get(r).as_string().unwrap().bytes.as_bytes()[idx as usize];
                    let out = self.heap.intern_copy(&(byte as char).to_string());
                    Ok(Value::Object(out))
                }
                _ => Err(self.throw_new("TypeException", "Only lists and strings can be indexed.".into())),
            },
            _ => Err(self.throw_new("TypeException", "Only lists and strings can be indexed.".into())),
        }
    }

    fn set_index(&mut self, receiver: Value, index: Value, value: Value) -> VmResult<()> {
        match receiver {
            Value::Object(r) if matches!(self.heap.get(r), HeapObject::List(_)) => {
                let len = self.heap.get(r).as_list().unwrap().items.len() as i64;
                let idx = self.resolve_index(index, len)?;
                self.heap.get_mut(r).as_list_mut().unwrap().items[idx as usize] = value;
                Ok(())
            }
            _ => Err(self.throw_new("TypeException", "Only lists support index assignment.".into())),
        }
    }

    fn resolve_index(&mut self, index: Value, len: i64) -> VmResult<i64> {
        let Some(i) = Self::as_integer(index) else {
            return Err(self.throw_new("TypeException", "Index must be an integer.".into()));
        };
        let resolved = if i < 0 { len + i } else { i };
        if resolved < 0 || resolved >= len {
            return Err(self.throw_new("IndexException", format!("Index {i} out of range.")));
        }
        Ok(resolved)
    }

    // ---- calling convention --------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> VmResult<CallOutcome> {
        self.call_value_with_bound(callee, arg_count, None)
    }

    fn call_value_with_bound(
        &mut self,
        callee: Value,
        arg_count: u8,
        explicit_bound: Option<Value>,
    ) -> VmResult<CallOutcome> {
        let Value::Object(r) = callee else {
            return Err(self.throw_new("TypeException", "Can only call functions, classes, and methods.".into()));
        };
        match self.heap.get(r) {
            HeapObject::BoundMethod(bm) => {
                let receiver = bm.receiver;
                let method = bm.method;
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call_value_with_bound(Value::Object(method), arg_count, Some(receiver))
            }
            HeapObject::Class(_) => self.call_class(r, arg_count),
            HeapObject::Closure(_) => self.call_closure(r, arg_count),
            HeapObject::Native(_) => self.call_native(r, arg_count, explicit_bound),
            _ => Err(self.throw_new("TypeException", "Can only call functions, classes, and methods.".into())),
        }
    }

    fn call_class(&mut self, class_ref: ObjRef, arg_count: u8) -> VmResult<CallOutcome> {
        let instance = Instance::new(class_ref);
        let inst_ref = self.heap.alloc_instance(instance);
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Object(inst_ref);
        let ctor_name = self.strings.constructor;
        let hash = self.heap.get(ctor_name).as_string().unwrap().hash;
        match self.find_method(class_ref, ctor_name, hash) {
            Some(ctor) => self.call_value_with_bound(ctor, arg_count, Some(Value::Object(inst_ref))),
            None => {
                if arg_count != 0 {
                    return Err(self.throw_new("ArityException", format!("Expected 0 arguments but got {arg_count}.")));
                }
                self.stack.truncate(slot + 1);
                Ok(CallOutcome::Native(Value::Object(inst_ref)))
            }
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, arg_count: u8) -> VmResult<CallOutcome> {
        let closure = self.heap.get(closure_ref).as_closure().unwrap();
        let function_ref = closure.function;
        let function = self.heap.get(function_ref).as_function().unwrap();
        let arity = function.arity;
        let is_lambda = function.is_lambda;
        let is_varargs = function.is_varargs;
        let slot = self.stack.len() - arg_count as usize - 1;

        if is_varargs {
            if arg_count < arity {
                return Err(self.throw_new("ArityException", format!("Expected at least {arity} arguments but got {arg_count}.")));
            }
            let fixed_end = slot + 1 + arity as usize;
            let rest: Vec<Value> = self.stack.split_off(fixed_end);
            let rest_ref = self.heap.alloc_list(List { items: rest });
            self.stack.push(Value::Object(rest_ref));
        } else if arg_count != arity {
            if is_lambda {
                if arg_count < arity {
                    for _ in arg_count..arity {
                        self.stack.push(Value::Null);
                    }
                } else {
                    self.stack.truncate(slot + 1 + arity as usize);
                }
            } else {
                return Err(self.throw_new("ArityException", format!("Expected {arity} arguments but got {arg_count}.")));
            }
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(self.throw_new("StackOverflowException", "Stack overflow.".into()));
        }
        self.frames.push(CallFrame::new(closure_ref, slot));
        Ok(CallOutcome::FramePushed)
    }

    fn call_native(&mut self, native_ref: ObjRef, arg_count: u8, explicit_bound: Option<Value>) -> VmResult<CallOutcome> {
        let native = *self.heap.get(native_ref).as_native().unwrap();
        let id = native.id;
        let arity = native.arity;
        let is_varargs = native.is_varargs;
        let bound = native.bound_receiver.or(explicit_bound);
        if !is_varargs && arg_count != arity {
            return Err(self.throw_new("ArityException", format!("Expected {arity} arguments but got {arg_count}.")));
        }
        let args_start = self.stack.len() - arg_count as usize;
        let args = self.stack[args_start..].to_vec();
        let f = self.natives[id.0 as usize].0;
        let result = match f(self, bound, &args) {
            Ok(v) => v,
            Err(trap) => return Err(trap),
        };
        self.stack.truncate(args_start - 1);
        self.stack.push(result);
        Ok(CallOutcome::Native(result))
    }

    fn do_invoke(&mut self, name: Value, argc: u8) -> VmResult<()> {
        let Value::Object(name_ref) = name else {
            unreachable!("invoke names are always interned strings");
        };
        let hash = self.heap.get(name_ref).as_string().unwrap().hash;
        let receiver = self.peek(argc as usize);
        let Value::Object(r) = receiver else {
            return Err(self.throw_new("TypeException", "Can only invoke methods on instances, lists, and strings.".into()));
        };
        match self.heap.get(r) {
            HeapObject::Instance(inst) => {
                if let Some(field) = inst.fields.get(name_ref, hash) {
                    self.call_value(field, argc)?;
                    return Ok(());
                }
                let class_ref = inst.class;
                match self.find_method(class_ref, name_ref, hash) {
                    Some(method) => {
                        self.call_value_with_bound(method, argc, Some(receiver))?;
                        Ok(())
                    }
                    None => Err(self.throw_new("PropertyException", format!("Undefined property '{}'.", self.value_name(name)))),
                }
            }
            HeapObject::List(_) => self.invoke_builtin(receiver, name_ref, hash, argc, BuiltinTable::List),
            HeapObject::String(_) => self.invoke_builtin(receiver, name_ref, hash, argc, BuiltinTable::String),
            _ => Err(self.throw_new("TypeException", "Can only invoke methods on instances, lists, and strings.".into())),
        }
    }

    fn invoke_builtin(
        &mut self,
        receiver: Value,
        name_ref: ObjRef,
        hash: u32,
        argc: u8,
        which: BuiltinTable,
    ) -> VmResult<()> {
        let table = match which {
            BuiltinTable::List => &self.list_methods,
            BuiltinTable::String => &self.string_methods,
        };
        match table.get(name_ref, hash) {
            Some(method) => {
                self.call_value_with_bound(method, argc, Some(receiver))?;
                Ok(())
            }
            None => Err(self.throw_new("PropertyException", "Undefined property.".to_string())),
        }
    }

    fn do_super_invoke(&mut self, name: Value, argc: u8) -> VmResult<()> {
        let Value::Object(name_ref) = name else {
            unreachable!("invoke names are always interned strings");
        };
        let hash = self.heap.get(name_ref).as_string().unwrap().hash;
        let superclass = self.pop();
        let receiver = self.peek(argc as usize);
        let Value::Object(super_ref) = superclass else {
            unreachable!("super is always resolved to a class value");
        };
        match self.find_method(super_ref, name_ref, hash) {
            Some(method) => {
                self.call_value_with_bound(method, argc, Some(receiver))?;
                Ok(())
            }
            None => Err(self.throw_new("PropertyException", format!("Undefined property '{}'.", self.value_name(name)))),
        }
    }

    fn bind_method(&mut self, class: Value, receiver: Value, name: Value) -> VmResult<Value> {
        let Value::Object(class_ref) = class else {
            unreachable!("super is always resolved to a class value");
        };
        let Value::Object(name_ref) = name else {
            unreachable!("method names are always interned strings");
        };
        let hash = self.heap.get(name_ref).as_string().unwrap().hash;
        match self.find_method(class_ref, name_ref, hash) {
            Some(method) => {
                let bound = self.heap.alloc_bound_method(BoundMethod { receiver, method });
                Ok(Value::Object(bound))
            }
            None => Err(self.throw_new("PropertyException", format!("Undefined property '{}'.", self.value_name(name)))),
        }
    }

    // ---- string coercion -------------------------------------------------

    /// `toString` coercion (`spec.md` §4.5): used by `+`, `print`, and the
    /// global `toString` native. Re-enters the dispatch loop when an
    /// instance defines its own `toString` method.
    pub(crate) fn display_string(&mut self, v: Value) -> VmResult<String> {
        match v {
            Value::Null => Ok("null".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(dragon_core::format_number(n)),
            Value::Object(r) => match self.heap.get(r).clone() {
                HeapObject::String(s) => Ok(s.bytes),
                HeapObject::List(l) => {
                    let mut parts = Vec::with_capacity(l.items.len());
                    for item in l.items {
                        parts.push(self.repr_string(item)?);
                    }
                    Ok(format!("[{}]", parts.join(", ")))
                }
                HeapObject::Function(f) => Ok(match f.name {
                    Some(n) => format!("<function {}>", self.heap.get(n).as_string().unwrap().bytes),
                    None => "<script>".to_string(),
                }),
                HeapObject::Native(n) => Ok(format!("<native function {}>", n.name)),
                HeapObject::Closure(c) => self.display_string(Value::Object(c.function)),
                HeapObject::Class(c) => Ok(format!("<class {}>", self.heap.get(c.name).as_string().unwrap().bytes)),
                HeapObject::BoundMethod(bm) => self.display_string(Value::Object(bm.method)),
                HeapObject::Instance(inst) => {
                    let class_ref = inst.class;
                    let to_string_key = self.strings.to_string;
                    let hash = self.heap.get(to_string_key).as_string().unwrap().hash;
                    match self.find_method(class_ref, to_string_key, hash) {
                        Some(method) => {
                            let result = self.call_from_native(method, &[])?;
                            self.display_string(result)
                        }
                        None => {
                            let class_name_ref = self.heap.get(class_ref).as_class().unwrap().name;
                            let name = self.heap.get(class_name_ref).as_string().unwrap().bytes.clone();
                            Ok(format!("<instance {name}>"))
                        }
                    }
                }
                HeapObject::Upvalue(_) => unreachable!(),
            },
        }
    }

    pub(crate) fn repr_string(&mut self, v: Value) -> VmResult<String> {
        if let Value::Object(r) = v {
            if let HeapObject::String(s) = self.heap.get(r) {
                let bytes = s.bytes.clone();
                return Ok(format!("\"{}\"", escape_for_repr(&bytes)));
            }
        }
        self.display_string(v)
    }
}

fn escape_for_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}
