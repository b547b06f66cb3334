//! Whole-pipeline tests over `compile_string`/`compile_file`: output shape,
//! determinism, and the structural invariants every emitted AMM program
//! must satisfy.

use std::path::PathBuf;

use pretty_assertions::assert_eq;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[test]
fn start_handler_emits_exit_with_int8_const() {
    let amm = lnc::compile_string("from @std/app import start, exit\n\non start { emit exit 0; }\n").unwrap();
    assert!(amm.contains("const _cst0: int8 = 0i8"), "missing global const:\n{amm}");
    assert!(amm.contains("on _start fn (): void {"), "missing start handler:\n{amm}");
    assert!(amm.contains("emit exit "), "missing emit:\n{amm}");
    assert!(amm.contains("\n  return\n"), "handler must end with return:\n{amm}");
    // start is runtime-defined: no event declaration for it
    assert!(!amm.contains("event _start"), "runtime event must not be declared:\n{amm}");
}

#[test]
fn user_event_declares_and_wires_two_handlers() {
    let src = "from @std/app import start, print, exit\n\nevent aNumber: int64\n\non aNumber fn (num: int64) {\n  print('I got a number! ' + num.toString());\n  emit exit 0;\n}\n\non start {\n  emit aNumber 5;\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    assert!(amm.contains("event aNumber: int64"), "missing event line:\n{amm}");
    assert_eq!(amm.matches("\non ").count() + usize::from(amm.starts_with("on ")), 2);
    // the string concat lowers through the literal copy, i64str, and catstr
    assert!(amm.contains("i64str(num, @0)"), "missing conversion:\n{amm}");
    assert!(amm.contains("catstr("), "missing concat:\n{amm}");
    assert!(amm.contains("\"I got a number! \"str"), "missing string const:\n{amm}");
}

#[test]
fn int8_variable_feeds_exit_without_conversion() {
    let amm =
        lnc::compile_string("from @std/app import start, exit\n\non start { const x: int8 = 0; emit exit x; }\n")
            .unwrap();
    assert!(amm.contains("const x: int8 = copyi8("), "missing declaration:\n{amm}");
    assert!(amm.contains("emit exit x"), "missing emit of x:\n{amm}");
    for conversion in ["i8i16", "i8i32", "i8i64", "i8f32", "i8f64"] {
        assert!(!amm.contains(conversion), "unexpected conversion {conversion}:\n{amm}");
    }
}

#[test]
fn compilation_is_deterministic() {
    let src = "from @std/app import start, print, exit\n\non start {\n  print('x = ' + toInt64(21).toString());\n  emit exit 0;\n}\n";
    let first = lnc::compile_string(src).unwrap();
    let second = lnc::compile_string(src).unwrap();
    assert_eq!(first, second);
}

#[test]
fn whitespace_changes_do_not_affect_output() {
    let compact = "from @std/app import start, exit\non start { emit exit 0; }\n";
    let airy = "from @std/app   import   start ,  exit\n\n\non start {\n\n  emit   exit   0 ;\n\n}\n";
    assert_eq!(
        lnc::compile_string(compact).unwrap(),
        lnc::compile_string(airy).unwrap()
    );
}

#[test]
fn type_alias_behaves_like_its_target() {
    let direct = "from @std/app import start, exit\n\non start { const x: int64 = 9; emit exit toInt8(x); }\n";
    let aliased =
        "from @std/app import start, exit\n\ntype Code = int64\n\non start { const x: Code = 9; emit exit toInt8(x); }\n";
    assert_eq!(
        lnc::compile_string(direct).unwrap(),
        lnc::compile_string(aliased).unwrap()
    );
}

#[test]
fn print_accepts_any_stringifiable() {
    let amm = lnc::compile_string(
        "from @std/app import start, print, exit\n\non start {\n  print(true);\n  print(1.5);\n  emit exit 0;\n}\n",
    )
    .unwrap();
    assert!(amm.contains("boolstr("), "bool print goes through boolstr:\n{amm}");
    assert!(amm.contains("f64str("), "float print goes through f64str:\n{amm}");
    assert!(amm.contains("1.5f64"), "decimal literal defaults to float64:\n{amm}");
}

#[test]
fn conditionals_lower_to_condfn_execcond_closures() {
    let src = "from @std/app import start, exit\n\non start {\n  const n: int8 = 1;\n  if n < 2 {\n    emit exit 0;\n  } else {\n    emit exit 1;\n  }\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    assert!(amm.contains("condfn("), "missing condfn:\n{amm}");
    assert!(amm.contains("execcond("), "missing execcond:\n{amm}");
    assert!(amm.contains("\nfn _clos0 (): void {"), "missing lifted closure:\n{amm}");
    assert!(amm.contains("truebool"), "else branch runs on a true literal:\n{amm}");
}

#[test]
fn named_function_set_attaches_as_handler() {
    let src = "from @std/app import start, exit\n\nevent tick: int64\n\nfn onTick(n: int64) {\n  emit exit toInt8(n);\n}\n\non tick onTick\n\non start {\n  emit tick 3;\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    assert!(amm.contains("on tick fn (n: int64): void {"), "handler header:\n{amm}");
    assert!(amm.contains("i64i8(n, @0)"), "conversion inside handler:\n{amm}");
}

#[test]
fn let_variables_reassign_through_copy() {
    let src = "from @std/app import start, exit\n\non start {\n  let x: int64 = 1;\n  x = 2;\n  emit exit toInt8(x);\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    assert!(amm.contains("let x: int64 = copyi64("), "let declaration:\n{amm}");
    assert!(amm.contains("\n  x: int64 = copyi64("), "reassignment line:\n{amm}");
}

#[test]
fn module_const_inlines_at_use_site() {
    let src = "from @std/app import start, exit\n\nconst answer: int8 = 42;\n\non start {\n  emit exit answer;\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    assert!(amm.contains("const _cst0: int8 = 42i8"), "const literal:\n{amm}");
    assert!(amm.contains("emit exit "), "emit uses the inlined const:\n{amm}");
}

#[test]
fn operators_respect_precedence() {
    // 1 + 2 * 3: the multiply happens first, feeding the add
    let src = "from @std/app import start, exit\n\non start {\n  emit exit toInt8(1 + 2 * 3);\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    let mul_at = amm.find("muli64(").expect("multiply emitted");
    let add_at = amm.find("addi64(").expect("add emitted");
    assert!(mul_at < add_at, "multiplication must be emitted before addition:\n{amm}");
}

#[test]
fn local_imports_resolve_and_inline() {
    let amm = lnc::compile_file(fixture("multi/main.ln")).unwrap();
    assert!(amm.contains("muli64("), "imported double() inlines to muli64:\n{amm}");
    assert!(amm.contains("i64i8("), "toInt8 inlines to i64i8:\n{amm}");
}

#[test]
fn emitted_amm_satisfies_the_structural_invariants() {
    let src = "from @std/app import start, print, exit\n\nevent aNumber: int64\n\non aNumber fn (num: int64) {\n  const doubled: int64 = num * 2;\n  if doubled < 10 {\n    print('small: ' + doubled.toString());\n  } else {\n    print('large');\n  }\n  emit exit 0;\n}\n\non start {\n  emit aNumber 5;\n}\n";
    let amm = lnc::compile_string(src).unwrap();
    check_amm_invariants(&amm);
}

/// The output contract: every block line is an opcode assignment, emit, or
/// return; every referenced name was declared earlier (closures run in the
/// creating handler's frame, so handler temporaries count as visible);
/// literal operands carry a recognized suffix; bodies open with their
/// literal copy lines.
fn check_amm_invariants(amm: &str) {
    let mut known: Vec<String> = Vec::new();
    let mut in_block = false;
    let mut past_copy_prefix = false;

    for line in amm.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !in_block {
            if let Some(rest) = trimmed.strip_prefix("const ") {
                // global constant: `const _cst0: int8 = 0i8`
                let name = rest.split(':').next().unwrap().trim();
                let literal = rest.split('=').nth(1).unwrap().trim();
                assert!(is_suffixed_literal(literal), "global literal without suffix: {line}");
                known.push(name.to_string());
            } else if let Some(rest) = trimmed.strip_prefix("event ") {
                known.push(rest.split(':').next().unwrap().trim().to_string());
            } else if trimmed.starts_with("on ") || trimmed.starts_with("fn ") {
                assert!(trimmed.ends_with('{'), "malformed block header: {line}");
                in_block = true;
                past_copy_prefix = false;
                if let (Some(open), Some(close)) = (trimmed.find('('), trimmed.find(')')) {
                    for param in trimmed[open + 1..close].split(',') {
                        let name = param.split(':').next().unwrap().trim();
                        if !name.is_empty() {
                            known.push(name.to_string());
                        }
                    }
                }
                if trimmed.starts_with("fn ") {
                    known.push(trimmed.split_whitespace().nth(1).unwrap().to_string());
                }
            } else {
                panic!("unexpected top-level line: {line}");
            }
            continue;
        }
        if trimmed == "}" {
            in_block = false;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("emit ") {
            let mut parts = rest.split_whitespace();
            let event = parts.next().unwrap();
            assert!(
                known.contains(&event.to_string()) || event == "_start" || event == "exit",
                "emit of undeclared event {event}"
            );
            if let Some(arg) = parts.next() {
                assert_operand_known(arg, &known, line);
            }
            past_copy_prefix = true;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("return") {
            if let Some(arg) = rest.trim().split_whitespace().next() {
                assert_operand_known(arg, &known, line);
            }
            past_copy_prefix = true;
            continue;
        }
        // assignment with opcode-call right-hand side
        let (lhs, rhs) = trimmed
            .split_once('=')
            .unwrap_or_else(|| panic!("unexpected line: {line}"));
        let name = lhs
            .trim()
            .trim_start_matches("const ")
            .trim_start_matches("let ")
            .split(':')
            .next()
            .unwrap()
            .trim();
        let rhs = rhs.trim();
        let open = rhs
            .find('(')
            .unwrap_or_else(|| panic!("rhs is not an opcode call: {line}"));
        let is_copy_line = rhs.starts_with("copy") && !rhs.contains("@0");
        if is_copy_line {
            assert!(!past_copy_prefix, "literal copy line after body statements: {line}");
        } else {
            past_copy_prefix = true;
        }
        for arg in rhs[open + 1..rhs.len() - 1].split(',') {
            let arg = arg.trim();
            if arg.is_empty() || arg == "@0" {
                continue;
            }
            assert_operand_known(arg, &known, line);
        }
        known.push(name.to_string());
    }
}

fn is_suffixed_literal(arg: &str) -> bool {
    let literal_start = arg
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '"')
        || arg.starts_with("true")
        || arg.starts_with("false");
    let suffixes = ["i8", "i16", "i32", "i64", "f32", "f64", "str", "bool"];
    literal_start && suffixes.iter().any(|s| arg.ends_with(s))
}

fn assert_operand_known(arg: &str, known: &[String], line: &str) {
    if is_suffixed_literal(arg) {
        return;
    }
    assert!(
        known.contains(&arg.to_string()) || arg.starts_with("_clos"),
        "operand {arg} not declared before use: {line}"
    );
}
