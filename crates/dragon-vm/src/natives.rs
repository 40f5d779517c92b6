//! Global natives every module starts with (`natives.c`'s
//! `defineGlobalNatives`; `module.c`'s `initModule` seeding `NaN`/`Infinity`).

use dragon_core::{NativeId, Value};

use crate::module::ModuleId;
use crate::vm::{NativeFn, Vm, VmResult};

const GLOBAL_NATIVES: &[(&str, NativeFn, u8, bool)] = &[
    ("toString", native_to_string, 1, false),
    ("repr", native_repr, 1, false),
    ("clock", native_clock, 0, false),
    ("sqrt", native_sqrt, 1, false),
    ("print", native_print, 0, true),
];

/// Registers the native function table itself. Called once, out of
/// `Vm::new`, before any module exists.
pub(crate) fn install_globals(vm: &mut Vm) {
    for (name, f, arity, is_varargs) in GLOBAL_NATIVES {
        vm.register_native(*f, *name, *arity, *is_varargs);
    }
}

/// Binds every registered native plus `NaN`/`Infinity` into a freshly
/// bootstrapped module's globals (`initModule`'s remaining responsibility
/// after `defineExceptionClasses`).
pub(crate) fn install_module_globals(vm: &mut Vm, module: ModuleId) {
    let count = vm.natives.len();
    for i in 0..count {
        let (_, name, _, _) = vm.natives[i];
        let native_ref = vm.alloc_native(NativeId(i as u32), None);
        let key = vm.heap.intern_copy(name);
        let hash = vm.heap.hash_of(key);
        vm.modules[module].globals.set(key, hash, Value::Object(native_ref), |k| vm.heap.hash_of(k));
    }
    for (name, value) in [("NaN", f64::NAN), ("Infinity", f64::INFINITY)] {
        let key = vm.heap.intern_copy(name);
        let hash = vm.heap.hash_of(key);
        vm.modules[module].globals.set(key, hash, Value::Number(value), |k| vm.heap.hash_of(k));
    }
}

fn native_to_string(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let s = vm.display_string(args[0])?;
    Ok(Value::Object(vm.heap.intern_take(s)))
}

fn native_repr(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let s = vm.repr_string(args[0])?;
    Ok(Value::Object(vm.heap.intern_take(s)))
}

fn native_clock(vm: &mut Vm, _bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    Ok(Value::Number(vm.start.elapsed().as_secs_f64()))
}

fn native_sqrt(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    match args[0].as_number() {
        Some(n) => Ok(Value::Number(n.sqrt())),
        None => Err(vm.throw_new("TypeException", "Expected number as first argument to sqrt.".into())),
    }
}

fn native_print(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let mut parts = Vec::with_capacity(args.len());
    for &a in args {
        parts.push(vm.display_string(a)?);
    }
    println!("{}", parts.join(" "));
    Ok(Value::Null)
}
