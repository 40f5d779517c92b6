//! Built-in `String` methods (`strings.c`'s `defineStringMethods`).

use dragon_core::{ObjRef, Value};

use crate::vm::{NativeFn, Vm, VmResult};

const METHODS: &[(&str, NativeFn, u8, bool)] = &[
    ("concat", native_concat, 1, false),
    ("endsWith", native_ends_with, 1, false),
    ("indexOf", native_index_of, 1, false),
    ("iterator", native_iterator, 0, false),
    ("lastIndexOf", native_last_index_of, 1, false),
    ("length", native_length, 0, false),
    ("parseNumber", native_parse_number, 0, false),
    ("repeat", native_repeat, 1, false),
    ("startsWith", native_starts_with, 1, false),
    ("substring", native_substring, 2, false),
];

pub(crate) fn install(vm: &mut Vm) {
    for (name, f, arity, is_varargs) in METHODS {
        let id = vm.register_native(*f, *name, *arity, *is_varargs);
        let native_ref = vm.alloc_native(id, None);
        let key = vm.heap.intern_copy(name);
        let hash = vm.heap.hash_of(key);
        vm.string_methods.set(key, hash, Value::Object(native_ref), |k| vm.heap.hash_of(k));
    }
}

fn receiver(bound: Option<Value>) -> ObjRef {
    match bound {
        Some(Value::Object(r)) => r,
        _ => unreachable!("string methods are always invoked with a bound string"),
    }
}

fn bytes_of(vm: &Vm, r: ObjRef) -> String {
    vm.heap.get(r).as_string().unwrap().bytes.clone()
}

fn native_concat(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let suffix = vm.display_string(args[0])?;
    let combined = bytes_of(vm, r) + &suffix;
    Ok(Value::Object(vm.heap.intern_take(combined)))
}

fn native_ends_with(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let test = vm.display_string(args[0])?;
    Ok(Value::Bool(bytes_of(vm, r).ends_with(&test)))
}

fn native_starts_with(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let test = vm.display_string(args[0])?;
    Ok(Value::Bool(bytes_of(vm, r).starts_with(&test)))
}

fn native_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let test = vm.display_string(args[0])?;
    let haystack = bytes_of(vm, r);
    match haystack.find(&test) {
        Some(byte_idx) => Ok(Value::Number(byte_idx as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn native_last_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let test = vm.display_string(args[0])?;
    let haystack = bytes_of(vm, r);
    match haystack.rfind(&test) {
        Some(byte_idx) => Ok(Value::Number(byte_idx as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn native_length(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    Ok(Value::Number(bytes_of(vm, r).len() as f64))
}

fn native_parse_number(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let s = bytes_of(vm, r);
    match s.trim().parse::<f64>() {
        Ok(n) => Ok(Value::Number(n)),
        Err(_) => Err(vm.throw_new("TypeException", "String does not represent a valid number.".into())),
    }
}

fn native_repeat(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let Some(n) = args[0].as_number() else {
        return Err(vm.throw_new("TypeException", "Expected number as first argument in repeat.".into()));
    };
    if n.floor() != n {
        return Err(vm.throw_new("TypeException", "Expected integer as first argument in repeat.".into()));
    }
    let count = if n < 0.0 { 0 } else { n as usize };
    let base = bytes_of(vm, r);
    Ok(Value::Object(vm.heap.intern_take(base.repeat(count))))
}

fn native_iterator(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    Ok(Value::Object(crate::iterator::construct(vm, Value::Object(r))))
}

fn native_substring(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let len = bytes_of(vm, r).len() as i64;

    let Some(start_num) = args[0].as_number() else {
        return Err(vm.throw_new("TypeException", "Index must be a number.".into()));
    };
    if start_num.floor() != start_num {
        return Err(vm.throw_new("TypeException", "Index must be an integer.".into()));
    }
    let mut start = start_num as i64;
    if start < 0 {
        start += len;
    }

    let Some(end_num) = args[1].as_number() else {
        return Err(vm.throw_new("TypeException", "Index must be a number.".into()));
    };
    if end_num.floor() != end_num {
        return Err(vm.throw_new("TypeException", "Index must be an integer.".into()));
    }
    let mut end = end_num as i64;
    if end < 0 {
        end += len;
    }

    if start < 0 || start > len {
        return Err(vm.throw_new("IndexException", format!("Index {start} is out of bounds for length {len}.")));
    }
    if end > len {
        return Err(vm.throw_new("IndexException", format!("Index {end} is out of bounds for length {len}.")));
    }
    if end < start {
        return Err(vm.throw_new("IndexException", "End index cannot be less than start index.".into()));
    }

    let bytes = bytes_of(vm, r);
    let slice = &bytes.as_bytes()[start as usize..end as usize];
    let out = String::from_utf8_lossy(slice).into_owned();
    Ok(Value::Object(vm.heap.intern_take(out)))
}
