//! Built-in `List` methods (`list.c`'s `defineListMethods`). Bound and
//! invoked the same way user-defined methods are (`Vm::bind_builtin`,
//! `Vm::invoke_builtin`), just looked up in `vm.list_methods` instead of a
//! `Class`.

use dragon_core::{List, ObjRef, Value};

use crate::vm::{NativeFn, Vm, VmResult};

const METHODS: &[(&str, NativeFn, u8, bool)] = &[
    ("any", native_any, 0, false),
    ("clear", native_clear, 0, false),
    ("concat", native_concat, 1, false),
    ("every", native_every, 0, false),
    ("extend", native_extend, 1, false),
    ("filter", native_filter, 1, false),
    ("fill", native_fill, 1, false),
    ("forEach", native_for_each, 1, false),
    ("indexOf", native_index_of, 1, false),
    ("iterator", native_iterator, 0, false),
    ("lastIndexOf", native_last_index_of, 1, false),
    ("length", native_length, 0, false),
    ("map", native_map, 1, false),
    ("ofLength", native_of_length, 1, false),
    ("pop", native_pop, 0, false),
    ("push", native_push, 1, false),
    ("reduce", native_reduce, 1, false),
    ("reverse", native_reverse, 0, false),
    ("sort", native_sort, 1, false),
];

pub(crate) fn install(vm: &mut Vm) {
    for (name, f, arity, is_varargs) in METHODS {
        let id = vm.register_native(*f, *name, *arity, *is_varargs);
        let native_ref = vm.alloc_native(id, None);
        let key = vm.heap.intern_copy(name);
        let hash = vm.heap.hash_of(key);
        vm.list_methods.set(key, hash, Value::Object(native_ref), |k| vm.heap.hash_of(k));
    }
}

fn receiver(bound: Option<Value>) -> ObjRef {
    match bound {
        Some(Value::Object(r)) => r,
        _ => unreachable!("list methods are always invoked with a bound list"),
    }
}

fn items(vm: &Vm, r: ObjRef) -> Vec<Value> {
    vm.heap.get(r).as_list().unwrap().items.clone()
}

fn native_any(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let any = vm.heap.get(r).as_list().unwrap().items.iter().any(|v| !v.is_falsey());
    Ok(Value::Bool(any))
}

fn native_every(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let every = vm.heap.get(r).as_list().unwrap().items.iter().all(|v| !v.is_falsey());
    Ok(Value::Bool(every))
}

fn native_clear(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    vm.heap.get_mut(r).as_list_mut().unwrap().items.clear();
    Ok(Value::Object(r))
}

fn native_concat(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let Value::Object(other_ref) = args[0] else {
        return Err(vm.throw_new("TypeException", "Expected list as first argument in concat.".into()));
    };
    if vm.heap.get(other_ref).as_list().is_none() {
        return Err(vm.throw_new("TypeException", "Expected list as first argument in concat.".into()));
    }
    let mut combined = items(vm, r);
    combined.extend(items(vm, other_ref));
    Ok(Value::Object(vm.heap.alloc_list(List { items: combined })))
}

fn native_extend(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let Value::Object(other_ref) = args[0] else {
        return Err(vm.throw_new("TypeException", "Expected list as first argument in extend.".into()));
    };
    if vm.heap.get(other_ref).as_list().is_none() {
        return Err(vm.throw_new("TypeException", "Expected list as first argument in extend.".into()));
    }
    let extra = items(vm, other_ref);
    vm.heap.get_mut(r).as_list_mut().unwrap().items.extend(extra);
    Ok(Value::Object(r))
}

fn native_fill(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let filler = args[0];
    for slot in vm.heap.get_mut(r).as_list_mut().unwrap().items.iter_mut() {
        *slot = filler;
    }
    Ok(Value::Object(r))
}

fn native_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let needle = args[0];
    for (i, &v) in items(vm, r).iter().enumerate() {
        if vm.heap.values_equal(needle, v) {
            return Ok(Value::Number(i as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn native_last_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let needle = args[0];
    let list = items(vm, r);
    for i in (0..list.len()).rev() {
        if vm.heap.values_equal(needle, list[i]) {
            return Ok(Value::Number(i as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn native_length(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    Ok(Value::Number(vm.heap.get(r).as_list().unwrap().items.len() as f64))
}

fn native_pop(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    match vm.heap.get_mut(r).as_list_mut().unwrap().items.pop() {
        Some(v) => Ok(v),
        None => Err(vm.throw_new("IndexException", "Cannot pop from an empty list.".into())),
    }
}

fn native_push(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    vm.heap.get_mut(r).as_list_mut().unwrap().items.push(args[0]);
    Ok(args[0])
}

fn native_reverse(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let mut reversed = items(vm, r);
    reversed.reverse();
    Ok(Value::Object(vm.heap.alloc_list(List { items: reversed })))
}

fn native_of_length(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let Some(n) = args[0].as_number() else {
        return Err(vm.throw_new("TypeException", "Expected number as first argument in ofLength.".into()));
    };
    if n.floor() != n {
        return Err(vm.throw_new("TypeException", "Expected integer as first argument in ofLength.".into()));
    }
    let current = items(vm, r);
    let mut size = n as i64;
    if size < 0 {
        size = (current.len() as i64 + size).max(0);
    }
    let mut out = Vec::with_capacity(size as usize);
    for i in 0..size {
        out.push(current.get(i as usize).copied().unwrap_or(Value::Null));
    }
    Ok(Value::Object(vm.heap.alloc_list(List { items: out })))
}

fn native_iterator(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    Ok(Value::Object(crate::iterator::construct(vm, Value::Object(r))))
}

fn native_for_each(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let callback = args[0];
    let len = items(vm, r).len();
    for i in 0..len {
        let value = vm.heap.get(r).as_list().unwrap().items[i];
        vm.call_from_native(callback, &[value, Value::Number(i as f64), Value::Object(r)])?;
    }
    Ok(Value::Null)
}

fn native_filter(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let callback = args[0];
    let source = items(vm, r);
    let mut kept = Vec::new();
    for (i, &value) in source.iter().enumerate() {
        let condition = vm.call_from_native(callback, &[value, Value::Number(i as f64), Value::Object(r)])?;
        if !condition.is_falsey() {
            kept.push(value);
        }
    }
    Ok(Value::Object(vm.heap.alloc_list(List { items: kept })))
}

fn native_map(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let callback = args[0];
    let source = items(vm, r);
    let mut mapped = Vec::with_capacity(source.len());
    for (i, &value) in source.iter().enumerate() {
        let result = vm.call_from_native(callback, &[value, Value::Number(i as f64), Value::Object(r)])?;
        mapped.push(result);
    }
    Ok(Value::Object(vm.heap.alloc_list(List { items: mapped })))
}

fn native_reduce(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let callback = args[0];
    let source = items(vm, r);
    if source.is_empty() {
        return Ok(Value::Null);
    }
    if source.len() == 1 {
        return Ok(source[0]);
    }
    let mut previous = source[0];
    for i in 1..source.len() {
        previous = vm.call_from_native(
            callback,
            &[previous, source[i], Value::Number(i as f64), Value::Object(r)],
        )?;
    }
    Ok(previous)
}

/// Stable merge sort driven by a user comparator, in place of the
/// original's hand-tuned timsort (minrun + insertion-sort runs + merge).
/// Behaviorally equivalent for a comparator returning negative/zero/positive
/// like the standard library expects; only the internal run structure
/// differs.
fn native_sort(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> VmResult<Value> {
    let r = receiver(bound);
    let comparator = args[0];
    let mut values = items(vm, r);
    merge_sort(vm, &mut values, comparator)?;
    vm.heap.get_mut(r).as_list_mut().unwrap().items = values;
    Ok(Value::Object(r))
}

fn compare(vm: &mut Vm, a: Value, b: Value, comparator: Value) -> VmResult<f64> {
    let result = vm.call_from_native(comparator, &[a, b])?;
    match result.as_number() {
        Some(n) => Ok(n),
        None => Err(vm.throw_new("TypeException", "Expected comparator to return a number, in sort.".into())),
    }
}

fn merge_sort(vm: &mut Vm, values: &mut [Value], comparator: Value) -> VmResult<()> {
    let len = values.len();
    if len <= 1 {
        return Ok(());
    }
    let mid = len / 2;
    let mut left = values[..mid].to_vec();
    let mut right = values[mid..].to_vec();
    merge_sort(vm, &mut left, comparator)?;
    merge_sort(vm, &mut right, comparator)?;

    let (mut i, mut j, mut k) = (0, 0, 0);
    while i < left.len() && j < right.len() {
        if compare(vm, left[i], right[j], comparator)? <= 0.0 {
            values[k] = left[i];
            i += 1;
        } else {
            values[k] = right[j];
            j += 1;
        }
        k += 1;
    }
    while i < left.len() {
        values[k] = left[i];
        i += 1;
        k += 1;
    }
    while j < right.len() {
        values[k] = right[j];
        j += 1;
        k += 1;
    }
    Ok(())
}
