//! Exception class bootstrap and the throw/unwind algorithm (`spec.md`
//! §4.6, §4.7; `exception.c`'s `defineExceptionClasses`, `module.c`'s
//! `initModule`).
//!
//! Every module gets its own `Object`/`Iterator`/`Import`/`Exception`
//! classes and exception taxonomy rather than sharing one VM-wide set,
//! matching `Module::globals` being per-module (`spec.md` §4.7).

use std::collections::HashMap;
use std::path::PathBuf;

use dragon_core::{Class, Instance, ObjRef, Table, Value};

use crate::frame::CallFrame;
use crate::module::{Module, ModuleId};
use crate::vm::Vm;

const TAXONOMY: &[&str] = &[
    "TypeException",
    "ArityException",
    "PropertyException",
    "IndexException",
    "UndefinedVariableException",
    "StackOverflowException",
    "ImportException",
];

/// Builds the per-module class registry and seeds `globals` with it
/// (`module.c`'s `initModule`, extended with the full exception taxonomy
/// `exception.c`'s retrieved revision only sketches a single subclass of).
pub(crate) fn bootstrap_module(vm: &mut Vm, directory: PathBuf) -> Module {
    let object_name = vm.heap.intern_copy("Object");
    let object_class = vm.heap.alloc_class(Class::new(object_name));

    let iterator_name = vm.heap.intern_copy("Iterator");
    let iterator_class = vm.heap.alloc_class(Class::new(iterator_name));
    crate::iterator::install_methods(vm, iterator_class);

    let import_name = vm.heap.intern_copy("Import");
    let import_class = vm.heap.alloc_class(Class::new(import_name));

    let exception_name = vm.heap.intern_copy("Exception");
    let exception_class = vm.heap.alloc_class(Class::new(exception_name));

    let mut globals = Table::new();
    for (name, value) in [
        ("Object", Value::Object(object_class)),
        ("Iterator", Value::Object(iterator_class)),
        ("Import", Value::Object(import_class)),
        ("Exception", Value::Object(exception_class)),
    ] {
        let key = vm.heap.intern_copy(name);
        let hash = vm.heap.hash_of(key);
        globals.set(key, hash, value, |k| vm.heap.hash_of(k));
    }

    for name in TAXONOMY {
        define_exception_subclass(vm, &mut globals, exception_class, name);
    }

    Module {
        globals,
        exports: Table::new(),
        directory,
        object_class,
        iterator_class,
        import_class,
        exception_class,
    }
}

fn define_exception_subclass(vm: &mut Vm, globals: &mut Table, exception_class: ObjRef, name: &str) {
    let name_ref = vm.heap.intern_copy(name);
    let mut class = Class::new(name_ref);
    class.superclass = Some(exception_class);
    let exception_methods = vm.heap.get(exception_class).as_class().unwrap().methods.clone();
    let hashes: HashMap<u32, u32> = exception_methods
        .iter()
        .map(|(k, _)| (k.raw(), vm.heap.hash_of(k)))
        .collect();
    class.methods.add_all(&exception_methods, move |k| *hashes.get(&k.raw()).unwrap());
    let class_ref = vm.heap.alloc_class(class);
    let hash = vm.heap.hash_of(name_ref);
    globals.set(name_ref, hash, Value::Object(class_ref), |k| vm.heap.hash_of(k));
}

/// Allocates a fresh instance of `class_name` (looked up in `module`'s
/// globals) with `message` set, for engine-discovered violations
/// (`spec.md` §4.5's arity/type/index/property/undefined-variable/overflow
/// cases). User `throw` expressions go through `OpCode::Throw` instead.
pub(crate) fn make_exception(vm: &mut Vm, module: ModuleId, class_name: &str, message: String) -> ObjRef {
    let name_ref = vm.heap.intern_copy(class_name);
    let hash = vm.heap.hash_of(name_ref);
    let class_ref = match vm.modules[module].globals.get(name_ref, hash) {
        Some(Value::Object(r)) => r,
        _ => panic!("unknown exception class {class_name}"),
    };
    let inst_ref = vm.heap.alloc_instance(Instance::new(class_ref));
    let message_key = vm.strings.message;
    let message_val = Value::Object(vm.heap.intern_take(message));
    vm.set_field(inst_ref, message_key, message_val);
    inst_ref
}

fn describe_frame(vm: &Vm, frame: &CallFrame) -> (u32, String) {
    let closure = vm.heap.get(frame.closure).as_closure().unwrap();
    let function = vm.heap.get(closure.function).as_function().unwrap();
    let line = function.chunk.line_for(frame.ip);
    let name = match function.name {
        Some(n) => vm.heap.get(n).as_string().unwrap().bytes.clone(),
        None => "<script>".to_string(),
    };
    (line, name)
}

impl Vm {
    /// The unwind algorithm of `spec.md` §4.6: set a default `message`,
    /// build the trace header, pop frames (closing their upvalues) until a
    /// `try` frame is found or the stack empties, then either resume at the
    /// catch target with `stackTrace` attached or stash the full trace in
    /// `pending_uncaught` for the top-level driver.
    pub(crate) fn raise(&mut self, instance: ObjRef) {
        let message_key = self.strings.message;
        let hash = self.heap.hash_of(message_key);
        let has_message = self
            .heap
            .get(instance)
            .as_instance()
            .unwrap()
            .fields
            .get(message_key, hash)
            .is_some();
        if !has_message {
            self.set_field(instance, message_key, Value::Null);
        }
        let message_val = self
            .heap
            .get(instance)
            .as_instance()
            .unwrap()
            .fields
            .get(message_key, hash)
            .unwrap();
        let message_str = self.display_string(message_val).unwrap_or_else(|_| "<error>".to_string());

        let class_ref = self.heap.get(instance).as_instance().unwrap().class;
        let class_name_ref = self.heap.get(class_ref).as_class().unwrap().name;
        let class_name = self.heap.get(class_name_ref).as_string().unwrap().bytes.clone();

        let mut trace_lines = vec![format!("{class_name}: {message_str}")];
        let mut descs: Vec<(u32, String)> = Vec::new();
        let mut resumed = false;

        loop {
            let is_try_here = self.frames.last().map(|f| f.is_try).unwrap_or(false);
            if is_try_here {
                resumed = true;
                break;
            }
            let Some(frame) = self.frames.pop() else { break };
            self.close_upvalues(frame.base);
            descs.push(describe_frame(self, &frame));
        }

        let mut i = 0;
        while i < descs.len() {
            let mut j = i + 1;
            while j < descs.len() && descs[j] == descs[i] {
                j += 1;
            }
            let run = j - i;
            trace_lines.push(format!("[{}] in {}", descs[i].0, descs[i].1));
            if run > 1 {
                trace_lines.push(format!("[Previous × {}]", run - 1));
            }
            i = j;
        }

        if resumed {
            let (catch_jump, try_stack_height) = {
                let frame = self.frames.last_mut().unwrap();
                frame.is_try = false;
                (frame.catch_jump, frame.try_stack_height)
            };
            self.frames.last_mut().unwrap().ip = catch_jump;
            self.stack.truncate(try_stack_height);
            self.stack.push(Value::Object(instance));
            let trace_val = Value::Object(self.heap.intern_take(trace_lines.join("\n")));
            let stack_trace_key = self.strings.stack_trace;
            self.set_field(instance, stack_trace_key, trace_val);
        } else {
            self.pending_uncaught = Some(trace_lines.join("\n"));
        }
    }
}
