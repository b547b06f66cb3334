//! Error-taxonomy tests: each failure class produces its documented kind,
//! message shape, and exit code.

use std::path::PathBuf;

use lnc::{CompileError, ErrorKind};
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn compile_err(src: &str) -> CompileError {
    lnc::compile_string(src).expect_err("expected a compile error")
}

#[test]
fn cross_type_comparison_reports_remaining_statement() {
    let err = compile_err("from @std/app import start, print, exit\n\non start { print(true == 1); }\n");
    assert_eq!(err.kind(), ErrorKind::Type);
    let message = err.message();
    assert!(
        message.starts_with("Cannot resolve operators with remaining statement"),
        "got: {message}"
    );
    assert!(message.contains("true == 1"), "got: {message}");
    assert!(message.contains("<bool> == <int64>"), "got: {message}");
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn recursion_is_detected_during_inlining() {
    let src = "from @std/app import start, exit\n\nfn f(n: int64): int64 {\n  if n < 2 return 1 else return f(n - 1) + f(n - 2)\n}\n\non start {\n  emit exit toInt8(f(10));\n}\n";
    let err = compile_err(src);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(err.message(), "Recursive callstack detected: f -> f. Aborting.");
}

#[test]
fn importing_an_unexported_name_is_a_name_error() {
    let err = lnc::compile_file(fixture("unexported/main.ln")).expect_err("Piece is not exported");
    assert_eq!(err.kind(), ErrorKind::Name);
    let message = err.message();
    assert!(message.contains("Piece is not a type"), "got: {message}");
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn import_cycles_are_rejected_with_the_cycle_path() {
    let err = lnc::compile_file(fixture("cycle/main.ln")).expect_err("cycle must be rejected");
    assert_eq!(err.kind(), ErrorKind::ModuleCycle);
    let message = err.message();
    assert!(message.starts_with("Circular import detected:"), "got: {message}");
    assert!(message.contains("a.ln"), "got: {message}");
    assert!(message.contains("b.ln"), "got: {message}");
}

#[test]
fn missing_files_exit_with_io_code() {
    let err = lnc::compile_file("definitely/not/here.ln").expect_err("missing file");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn naming_an_opcode_is_rejected() {
    let err = compile_err(
        "from @std/app import start, exit\n\non start {\n  const s: string = i64str(5);\n  emit exit 0;\n}\n",
    );
    assert_eq!(err.kind(), ErrorKind::OpcodeMisuse);
    assert_eq!(err.message(), "i64str is not a function but used as one.");
}

#[test]
fn statements_after_return_are_unreachable() {
    let src = "from @std/app import start, exit\n\nfn g(): int8 {\n  return 1;\n  return 2;\n}\n\non start {\n  emit exit g();\n}\n";
    let err = compile_err(src);
    assert_eq!(err.kind(), ErrorKind::Reachability);
    assert!(
        err.message().starts_with("Unreachable code in function 'g' after:"),
        "got: {}",
        err.message()
    );
}

#[test]
fn const_reassignment_is_rejected_at_construction() {
    let err = compile_err(
        "from @std/app import start, exit\n\non start {\n  const x: int8 = 0;\n  x = 1;\n  emit exit x;\n}\n",
    );
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(err.message(), "Cannot reassign x: it was declared const");
}

#[test]
fn reassignment_must_keep_the_declared_type() {
    let err = compile_err(
        "from @std/app import start, exit\n\non start {\n  let x: int64 = 1;\n  x = 'two';\n  emit exit 0;\n}\n",
    );
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn prefix_infix_tie_is_ambiguous() {
    let src = "from @std/app import start, exit\n\nprefix negate as ~~ precedence 7\ninfix sub as ~~ precedence 7\n\non start {\n  emit exit toInt8(1 ~~ ~~ 2);\n}\n";
    let err = compile_err(src);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(
        err.message().starts_with("Ambiguous operator resolution"),
        "got: {}",
        err.message()
    );
}

#[test]
fn multiple_precedences_for_one_symbol_are_rejected() {
    let src = "from @std/app import start, exit\n\ninfix add as +++ precedence 4\ninfix sub as +++ precedence 5\n\non start {\n  emit exit toInt8(1 +++ 2);\n}\n";
    let err = compile_err(src);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(
        err.message().contains("multiple declared precedences"),
        "got: {}",
        err.message()
    );
}

#[test]
fn handler_payload_mismatch_fails_selection() {
    let src = "from @std/app import start, exit\n\nevent tick: int64\n\non tick fn () {\n  emit exit 0;\n}\n\non start {\n  emit tick 1;\n}\n";
    let err = compile_err(src);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(
        err.message().contains("Unable to select a handler for event tick"),
        "got: {}",
        err.message()
    );
}

#[test]
fn overload_selection_failure_names_the_function() {
    let src = "from @std/app import start, exit\n\non start {\n  const s: int64 = length(5);\n  emit exit 0;\n}\n";
    let err = compile_err(src);
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(
        err.message().starts_with("Unable to find matching function length"),
        "got: {}",
        err.message()
    );
}

#[test]
fn undefined_names_are_name_errors() {
    let err = compile_err("from @std/app import start, exit\n\non start {\n  emit exit nope;\n}\n");
    assert_eq!(err.kind(), ErrorKind::Name);
    assert!(err.message().contains("nope is not defined"), "got: {}", err.message());
}

#[test]
fn syntax_errors_carry_position_and_expectations() {
    let err = compile_err("from @std/app import start, exit\n\non start {\n  const x = ;\n}\n");
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.exit_code(), 1);
    let rendered = err.to_string();
    assert!(rendered.contains("<input>"), "got: {rendered}");
    assert!(rendered.contains(":4:"), "got: {rendered}");
}

#[test]
fn integer_literals_must_fit_their_narrowed_type() {
    let err = compile_err("from @std/app import start, exit\n\non start {\n  emit exit 300;\n}\n");
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(
        err.message().contains("out of range for int8"),
        "got: {}",
        err.message()
    );
}

#[test]
fn local_string_imports_are_rejected() {
    let err = compile_err("import ./something\n\n");
    assert_eq!(err.kind(), ErrorKind::Name);
    assert!(
        err.message().contains("string input has no directory"),
        "got: {}",
        err.message()
    );
}
