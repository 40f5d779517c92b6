//! End-to-end compiler smoke tests: feed complete source strings through
//! [`dragon_compiler::compile`] and check the diagnostics, the way
//! `runtime/tests/test_closures.rs` exercises its crate's public surface
//! from outside rather than through `#[cfg(test)]` modules.

use dragon_core::{GcConfig, Heap};

fn compiles(source: &str) -> Result<(), Vec<String>> {
    let mut heap = Heap::new(GcConfig::default());
    dragon_compiler::compile(source, &mut heap)
        .map(|_| ())
        .map_err(|errors| errors.iter().map(|e| e.to_string()).collect())
}

#[test]
fn import_expression_is_a_valid_prefix() {
    assert!(compiles(r#"var lib = import "mathlib"; print(lib);"#).is_ok());
}

#[test]
fn export_statement_requires_assignment() {
    assert!(compiles("export PI = 3.14159;").is_ok());
    assert!(compiles("export PI;").is_err());
}

#[test]
fn import_and_export_are_reserved_words() {
    assert!(compiles("var import = 1;").is_err());
    assert!(compiles("var export = 1;").is_err());
}

#[test]
fn class_with_inheritance_and_super_call() {
    let src = r#"
        class Animal {
            function constructor(name) { this.name = name; }
            function speak() { return this.name + " makes a sound"; }
        }
        class Dog : Animal {
            function speak() { return super.speak() + ", specifically a bark"; }
        }
        var d = Dog("Rex");
        print(d.speak());
    "#;
    assert!(compiles(src).is_ok());
}

#[test]
fn try_catch_finally_compiles() {
    let src = r#"
        function risky() {
            throw Exception();
        }
        try {
            risky();
        } catch (e) {
            print(e.message);
        } finally {
            print("cleanup");
        }
    "#;
    assert!(compiles(src).is_ok());
}

#[test]
fn throw_outside_a_function_is_rejected() {
    assert!(compiles("throw Exception();").is_err());
}

#[test]
fn variadic_function_declaration() {
    assert!(compiles(
        "function sum(args...) { var total = 0; foreach (var n in args) { total += n; } return total; }"
    )
    .is_ok());
}

#[test]
fn unterminated_block_reports_an_error_not_a_panic() {
    assert!(compiles("function f() { return 1;").is_err());
}

#[test]
fn multiple_errors_are_all_collected() {
    let errors = compiles("var export = 1; var import = 2;").unwrap_err();
    assert!(errors.len() >= 2, "expected both reserved-word errors, got {errors:?}");
}
