//! The `Iterator` protocol every module's `for` loop desugars to
//! (`spec.md` §4.4's iteration sugar; `iterator.c`'s `defineIteratorMethods`).
//!
//! `data` holds the list or string being walked and `index` the next
//! position to yield; `next`/`more` read both fields off the bound
//! instance so user code that constructs its own `Iterator` subclass still
//! works.

use dragon_core::{HeapObject, Instance, ObjRef, Value};

use crate::vm::{NativeFn, Vm, VmResult};

pub(crate) fn install_methods(vm: &mut Vm, iterator_class: ObjRef) {
    let entries: [(&str, NativeFn, u8, bool); 4] = [
        ("constructor", native_constructor, 1, false),
        ("iterator", native_self, 0, false),
        ("next", native_next, 0, false),
        ("more", native_more, 0, false),
    ];
    for (name, f, arity, is_varargs) in entries {
        let id = vm.register_native(f, name, arity, is_varargs);
        let native_ref = vm.alloc_native(id, None);
        let key = vm.heap.intern_copy(name);
        let hash = vm.heap.hash_of(key);
        let mut methods = std::mem::take(&mut vm.heap.get_mut(iterator_class).as_class_mut().unwrap().methods);
        methods.set(key, hash, Value::Object(native_ref), |k| vm.heap.hash_of(k));
        vm.heap.get_mut(iterator_class).as_class_mut().unwrap().methods = methods;
    }
}

/// Builds an `Iterator` instance over `data` (a list or string value),
/// shared by `list.iterator()`/`string.iterator()` and `Iterator`'s own
/// `constructor`.
pub(crate) fn construct(vm: &mut Vm, data: Value) -> ObjRef {
    let module = vm.current_module();
    let iterator_class = vm.modules[module].iterator_class;
    let inst = vm.heap.alloc_instance(Instance::new(iterator_class));
    let index_key = vm.strings.index;
    let data_key = vm.strings.data;
    vm.set_field(inst, index_key, Value::Number(0.0));
    vm.set_field(inst, data_key, data);
    inst
}

fn receiver(bound: Option<Value>) -> ObjRef {
    match bound {
        Some(Value::Object(r)) => r,
        _ => unreachable!("iterator methods are always invoked with a bound instance"),
    }
}

fn native_constructor(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let inst = receiver(bound);
    let index_key = vm.strings.index;
    let data_key = vm.strings.data;
    vm.set_field(inst, index_key, Value::Number(0.0));
    vm.set_field(inst, data_key, args[0]);
    Ok(Value::Object(inst))
}

fn native_self(_vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    Ok(bound.unwrap())
}

fn data_and_index(vm: &mut Vm, inst: ObjRef) -> VmResult<(Value, i64)> {
    let data_key = vm.strings.data;
    let index_key = vm.strings.index;
    let hash_data = vm.heap.hash_of(data_key);
    let hash_index = vm.heap.hash_of(index_key);
    let (data_opt, index_opt) = {
        let fields = &vm.heap.get(inst).as_instance().unwrap().fields;
        (fields.get(data_key, hash_data), fields.get(index_key, hash_index))
    };
    let Some(data) = data_opt else {
        return Err(vm.throw_new("PropertyException", "Iterator object must have a 'data' field.".into()));
    };
    let Some(index_val) = index_opt else {
        return Err(vm.throw_new("PropertyException", "Iterator object must have a 'index' field.".into()));
    };
    let Some(index) = index_val.as_number() else {
        return Err(vm.throw_new("TypeException", "Iterator object's 'index' must be a number.".into()));
    };
    if index.floor() != index {
        return Err(vm.throw_new("TypeException", "Iterator object's 'index' must be an integer.".into()));
    }
    Ok((data, index as i64))
}

fn native_next(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let inst = receiver(bound);
    let (data, index) = data_and_index(vm, inst)?;
    let Value::Object(data_ref) = data else {
        return Err(vm.throw_new("TypeException", "Iterator object's 'data' must be a string or a list.".into()));
    };
    let next_index = index + 1;
    enum Elem {
        Value(Value),
        Char(char),
        None,
    }
    let elem = match vm.heap.get(data_ref) {
        HeapObject::List(l) => {
            let idx = if index < 0 { l.items.len() as i64 + index } else { index };
            if idx < 0 || idx as usize >= l.items.len() {
                Elem::None
            } else {
                Elem::Value(l.items[idx as usize])
            }
        }
        HeapObject::String(s) => {
            let bytes = s.bytes.as_bytes();
            let idx = if index < 0 { bytes.len() as i64 + index } else { index };
            if idx < 0 || idx as usize >= bytes.len() {
                Elem::None
            } else {
                Elem::Char(bytes[idx as usize] as char)
            }
        }
        _ => return Err(vm.throw_new("TypeException", "Iterator object's 'data' must be a string or a list.".into())),
    };
    let result = match elem {
        Elem::Value(v) => v,
        Elem::Char(ch) => Value::Object(vm.heap.intern_copy(&ch.to_string())),
        Elem::None => Value::Null,
    };
    let index_key = vm.strings.index;
    vm.set_field(inst, index_key, Value::Number(next_index as f64));
    Ok(result)
}

fn native_more(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let inst = receiver(bound);
    let (data, index) = data_and_index(vm, inst)?;
    let Value::Object(data_ref) = data else {
        return Err(vm.throw_new("TypeException", "Iterator object's 'data' must be a string or a list.".into()));
    };
    let len = match vm.heap.get(data_ref) {
        HeapObject::List(l) => l.items.len() as i64,
        HeapObject::String(s) => s.bytes.as_bytes().len() as i64,
        _ => return Err(vm.throw_new("TypeException", "Iterator object's 'data' must be a string or a list.".into())),
    };
    let idx = if index < 0 { len + index } else { index };
    Ok(Value::Bool(idx >= 0 && idx < len))
}
