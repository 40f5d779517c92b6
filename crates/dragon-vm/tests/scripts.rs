//! End-to-end execution tests: compile and run complete `.dgn`-style source
//! through [`Vm::run_source`] and inspect the resulting globals, the way
//! `runtime/tests/test_closures.rs` drives its crate's public API from
//! outside rather than through `#[cfg(test)]` modules.

use std::path::PathBuf;

use dragon_vm::{RunError, Vm, VmConfig};

fn run(src: &str) -> Result<Vm, RunError> {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.create_module(PathBuf::from("."));
    vm.run_source(module, src)?;
    Ok(vm)
}

fn global(vm: &mut Vm, name: &str) -> String {
    vm.read_global(0, name).unwrap_or_else(|| panic!("no global named {name}"))
}

#[test]
fn closures_capture_upvalues_by_reference() {
    let src = r#"
        var makeCounter = || {
            var count = 0;
            return || { count += 1; return count; };
        };
        var counter = makeCounter();
        counter();
        counter();
        var result = counter();
    "#;
    let mut vm = run(src).expect("script should run cleanly");
    assert_eq!(global(&mut vm, "result"), "3");
}

#[test]
fn two_closures_over_the_same_maker_have_independent_state() {
    let src = r#"
        var makeCounter = || {
            var count = 0;
            return || { count += 1; return count; };
        };
        var a = makeCounter();
        var b = makeCounter();
        a();
        a();
        var result = a() + "," + b();
    "#;
    let mut vm = run(src).expect("script should run cleanly");
    assert_eq!(global(&mut vm, "result"), "3,1");
}

#[test]
fn single_inheritance_and_super_call() {
    let src = r#"
        class Animal {
            function constructor(name) { this.name = name; }
            function speak() { return this.name + " makes a sound"; }
        }
        class Dog : Animal {
            function speak() { return super.speak() + ", specifically a bark"; }
        }
        var d = Dog("Rex");
        var result = d.speak();
    "#;
    let mut vm = run(src).expect("script should run cleanly");
    assert_eq!(global(&mut vm, "result"), "Rex makes a sound, specifically a bark");
}

#[test]
fn try_catch_recovers_from_a_thrown_exception() {
    let src = r#"
        function boom() {
            throw Exception();
        }
        var caught = false;
        try {
            boom();
        } catch (e) {
            caught = true;
        }
        var result = caught;
    "#;
    let mut vm = run(src).expect("the throw should be caught, not escape run_source");
    assert_eq!(global(&mut vm, "result"), "true");
}

#[test]
fn uncaught_exception_produces_a_trace_with_the_throw_site() {
    let src = r#"
        function boom() {
            var e = Exception();
            e.message = "kaboom";
            throw e;
        }
        boom();
    "#;
    let err = run(src).expect_err("an uncaught throw should fail run_source");
    match err {
        RunError::Runtime(trace) => {
            assert!(trace.contains("Exception: kaboom"), "trace was: {trace}");
            assert!(trace.contains("in boom"), "trace was: {trace}");
        }
        RunError::Compile(msg) => panic!("expected a runtime error, got a compile error: {msg}"),
    }
}

#[test]
fn compile_error_is_reported_as_compile_not_runtime() {
    let err = run("function f() { return 1;").expect_err("unterminated block should fail to compile");
    assert!(matches!(err, RunError::Compile(_)));
}

#[test]
fn variadic_function_sums_all_arguments() {
    let src = r#"
        function sum(args...) {
            var total = 0;
            foreach (var n in args) { total += n; }
            return total;
        }
        var result = sum(1, 2, 3, 4);
    "#;
    let mut vm = run(src).expect("script should run cleanly");
    assert_eq!(global(&mut vm, "result"), "10");
}

#[test]
fn calling_a_variadic_function_with_too_few_arguments_throws() {
    let src = r#"
        function needsTwo(a, b, rest...) { return a + b; }
        needsTwo(1);
    "#;
    let err = run(src).expect_err("arity violation should be an uncaught ArityException");
    assert!(matches!(err, RunError::Runtime(_)));
}

#[test]
fn module_import_is_cached_across_repeated_imports() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("lib.dgn"), "export box = 0;\n").expect("write lib.dgn");

    let mut vm = Vm::new(VmConfig::default());
    let module = vm.create_module(dir.path().to_path_buf());
    vm.run_source(
        module,
        r#"
            var m = import "lib";
            m.box = 99;
            var m2 = import "lib";
            var result = m2.box;
        "#,
    )
    .expect("script should run cleanly");
    assert_eq!(global(&mut vm, "result"), "99");
}

#[test]
fn importing_a_missing_module_raises_import_exception() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.create_module(dir.path().to_path_buf());
    let err = vm
        .run_source(module, r#"var m = import "does_not_exist";"#)
        .expect_err("importing a nonexistent module should fail");
    match err {
        RunError::Runtime(trace) => assert!(trace.contains("ImportException"), "trace was: {trace}"),
        RunError::Compile(msg) => panic!("expected a runtime error, got a compile error: {msg}"),
    }
}

#[test]
fn garbage_collection_survives_many_short_lived_allocations() {
    let config = VmConfig { initial_gc_threshold: 1024, ..VmConfig::default() };
    let mut vm = Vm::new(config);
    let module = vm.create_module(PathBuf::from("."));
    vm.run_source(
        module,
        r#"
            var total = 0;
            for (var i = 0; i < 3000; i += 1) {
                var label = "item" + i;
                var pair = [label, i];
                total += pair[1];
            }
            var result = total;
        "#,
    )
    .expect("repeated allocation under a tiny GC threshold should not corrupt state");
    assert_eq!(global(&mut vm, "result"), "4498500");
}
