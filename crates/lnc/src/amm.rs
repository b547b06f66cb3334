//! The AMM emitter.
//!
//! Serializes a fully-resolved program as one text stream: deduplicated
//! global constants, user event declarations, one `on <event> fn …` block
//! per handler, and the conditional-branch closures lifted out of their
//! handlers. Every literal a handler uses is first copied into a local
//! temporary, so handler bodies open with their `copy` lines.

use std::fmt::Write;

use ahash::AHashMap;

use crate::{
    error::{CompileError, CompileResult},
    function::EventId,
    ir::{ConstVal, Expr, Stmt, VarId},
    program::Program,
    types::{Builtin, TypeId, TypeKind},
};

/// Emits the whole program. Deterministic: names and ordering depend only
/// on declaration and statement order.
pub(crate) fn emit(prog: &Program) -> CompileResult<String> {
    let mut consts = ConstTable::default();
    let handler_order = collect_handlers(prog);
    for (eid, idx) in &handler_order {
        collect_literals(prog, &prog.events.get(*eid).handlers[*idx].body, &mut consts)?;
    }

    let mut out = String::new();
    for entry in &consts.entries {
        let _ = writeln!(out, "const {}: {} = {}", entry.name, entry.type_name, entry.literal);
    }
    if !consts.entries.is_empty() {
        out.push('\n');
    }

    let mut wrote_events = false;
    for eid in prog.events.ids() {
        let event = prog.events.get(eid);
        if event.runtime {
            continue;
        }
        let payload = amm_type(prog, event.payload)?;
        let _ = writeln!(out, "event {}: {payload}", event.amm_name);
        wrote_events = true;
    }
    if wrote_events {
        out.push('\n');
    }

    for (eid, idx) in &handler_order {
        let event = prog.events.get(*eid);
        let handler = &event.handlers[*idx];
        let mut params = Vec::new();
        for (pname, pty) in &handler.params {
            params.push(format!("{pname}: {}", amm_type(prog, *pty)?));
        }
        let ret = match handler.selected.and_then(|f| prog.fns.get(f).ret) {
            Some(r) => amm_type(prog, r)?,
            None => "void".to_string(),
        };
        let _ = writeln!(out, "on {} fn ({}): {ret} {{", event.amm_name, params.join(", "));
        emit_body(prog, &handler.body, &consts, &mut out)?;
        out.push_str("}\n\n");
    }

    for closure in prog.closures.iter() {
        let _ = writeln!(out, "fn {} (): void {{", closure.name);
        emit_body(prog, &closure.body, &consts, &mut out)?;
        out.push_str("}\n\n");
    }

    while out.ends_with("\n\n") {
        out.pop();
    }
    Ok(out)
}

/// Handlers in event-declaration order, attachment order within an event.
fn collect_handlers(prog: &Program) -> Vec<(EventId, usize)> {
    let mut order = Vec::new();
    for eid in prog.events.ids() {
        for idx in 0..prog.events.get(eid).handlers.len() {
            if prog.events.get(eid).handlers[idx].selected.is_some() {
                order.push((eid, idx));
            }
        }
    }
    order
}

#[derive(Default)]
struct ConstTable {
    entries: Vec<ConstEntry>,
    /// (amm type, rendered literal) → index into `entries`.
    index: AHashMap<(String, String), usize>,
}

struct ConstEntry {
    name: String,
    type_name: String,
    literal: String,
}

impl ConstTable {
    fn intern(&mut self, type_name: String, literal: String) -> &str {
        let key = (type_name.clone(), literal.clone());
        let next = self.entries.len();
        let idx = *self.index.entry(key).or_insert_with(|| {
            self.entries.push(ConstEntry {
                name: format!("_cst{next}"),
                type_name,
                literal,
            });
            next
        });
        &self.entries[idx].name
    }

    fn lookup(&self, type_name: &str, literal: &str) -> &str {
        let idx = self.index[&(type_name.to_string(), literal.to_string())];
        &self.entries[idx].name
    }
}

/// First pass: assign deterministic global names to every unique
/// (type, literal) pair, in first-use order.
fn collect_literals(prog: &Program, stmts: &[Stmt], consts: &mut ConstTable) -> CompileResult<()> {
    for stmt in stmts {
        match stmt {
            Stmt::Dec {
                expr: Expr::Const(c), ..
            } => {
                let (type_name, literal) = render_literal(prog, c, c.ty)?;
                consts.intern(type_name, literal);
            }
            Stmt::Cond { branches, .. } => {
                for b in branches {
                    collect_literals(prog, &prog.closures.get(b.closure).body, consts)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn emit_body(prog: &Program, stmts: &[Stmt], consts: &ConstTable, out: &mut String) -> CompileResult<()> {
    // literal copies open the body
    for stmt in stmts {
        if let Stmt::Dec {
            var,
            mutable,
            expr: Expr::Const(c),
        } = stmt
        {
            let (type_name, literal) = render_literal(prog, c, c.ty)?;
            let cst = consts.lookup(&type_name, &literal);
            let kw = if *mutable { "let" } else { "const" };
            let suffix = literal_suffix(prog, c.ty)?;
            let _ = writeln!(
                out,
                "  {kw} {}: {type_name} = copy{suffix}({cst})",
                prog.vars.name(*var)
            );
        }
    }
    for stmt in stmts {
        match stmt {
            Stmt::Dec { expr: Expr::Const(_), .. } => {}
            Stmt::Dec { var, mutable, expr } => {
                let kw = if *mutable { "let " } else { "const " };
                let line = render_value_line(prog, *var, expr)?;
                let _ = writeln!(out, "  {kw}{line}");
            }
            Stmt::Assign { var, expr } => {
                let line = render_value_line(prog, *var, expr)?;
                let _ = writeln!(out, "  {line}");
            }
            Stmt::Emit { event, arg } => {
                let event = &prog.events.get(*event).amm_name;
                match arg {
                    Some(a) => {
                        let _ = writeln!(out, "  emit {event} {}", prog.vars.name(*a));
                    }
                    None => {
                        let _ = writeln!(out, "  emit {event}");
                    }
                }
            }
            Stmt::Exit { arg } => match arg {
                Some(a) => {
                    let _ = writeln!(out, "  return {}", prog.vars.name(*a));
                }
                None => out.push_str("  return\n"),
            },
            Stmt::Cond { branches, exec_var } => {
                for b in branches {
                    let closure = prog.closures.get(b.closure);
                    let _ = writeln!(
                        out,
                        "  const {}: void = condfn({}, {})",
                        prog.vars.name(b.pair_var),
                        prog.vars.name(b.cond),
                        closure.name
                    );
                }
                let pairs: Vec<&str> = branches.iter().map(|b| prog.vars.name(b.pair_var)).collect();
                let second = pairs.get(1).copied().unwrap_or("@0");
                let _ = writeln!(
                    out,
                    "  const {}: void = execcond({}, {second})",
                    prog.vars.name(*exec_var),
                    pairs[0]
                );
            }
        }
    }
    Ok(())
}

/// Renders the right-hand side of a declaration or assignment line.
fn render_value_line(prog: &Program, var: VarId, expr: &Expr) -> CompileResult<String> {
    let name = prog.vars.name(var);
    let ty = prog.vars.ty(var);
    let type_name = amm_type(prog, ty)?;
    match expr {
        Expr::Call(call) => {
            let selected = call.selected.expect("finalize guarantees selection");
            let func = prog.fns.get(selected);
            let crate::function::FnBody::Opcode(op) = &func.body else {
                unreachable!("user calls are inlined before emission");
            };
            let mut args: Vec<String> = call.args.iter().map(|&a| prog.vars.name(a).to_string()).collect();
            while args.len() < 2 {
                args.push("@0".to_string());
            }
            Ok(format!("{name}: {type_name} = {}({})", op.0, args.join(", ")))
        }
        Expr::Ref(r) => {
            let suffix = literal_suffix(prog, ty)?;
            Ok(format!(
                "{name}: {type_name} = copy{suffix}({}, @0)",
                prog.vars.name(*r)
            ))
        }
        Expr::Default => {
            let suffix = literal_suffix(prog, ty)?;
            let zero = match instance_builtin(prog, ty)? {
                Builtin::Float32 | Builtin::Float64 => "0.0",
                Builtin::Bool => "false",
                Builtin::Str => "\"\"",
                _ => "0",
            };
            Ok(format!(
                "{name}: {type_name} = copy{suffix}({zero}{suffix}, @0)"
            ))
        }
        Expr::Const(_) => unreachable!("literal declarations are emitted as copy lines"),
    }
}

/// Renders a literal as its AMM (type name, suffixed literal) pair.
fn render_literal(prog: &Program, c: &ConstVal, ty: TypeId) -> CompileResult<(String, String)> {
    let b = instance_builtin(prog, ty)?;
    let type_name = b.to_string();
    let suffix = b.suffix().ok_or_else(|| {
        CompileError::type_error(format!("A {b} literal cannot reach the emitter"), None)
    })?;
    let literal = match b {
        Builtin::Bool => format!("{}{suffix}", c.value),
        Builtin::Str => format!("{}{suffix}", requote(&c.value)),
        Builtin::Float32 => {
            let parsed: f32 = c.value.parse().map_err(|_| {
                CompileError::type_error(format!("Invalid float32 literal {}", c.value), None)
            })?;
            format!("{}{suffix}", ryu::Buffer::new().format(parsed))
        }
        Builtin::Float64 => {
            let parsed: f64 = c.value.parse().map_err(|_| {
                CompileError::type_error(format!("Invalid float64 literal {}", c.value), None)
            })?;
            format!("{}{suffix}", ryu::Buffer::new().format(parsed))
        }
        _ => format!("{}{suffix}", c.value),
    };
    Ok((type_name, literal))
}

/// Converts a source string literal (single- or double-quoted) to the AMM
/// double-quoted form, normalizing escapes.
fn requote(source: &str) -> String {
    let body = &source[1..source.len().saturating_sub(1)];
    let mut unescaped = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => unescaped.push('\n'),
                Some('t') => unescaped.push('\t'),
                Some(other) => unescaped.push(other),
                None => {}
            }
        } else {
            unescaped.push(ch);
        }
    }
    let mut requoted = String::with_capacity(unescaped.len() + 2);
    requoted.push('"');
    for ch in unescaped.chars() {
        match ch {
            '"' => requoted.push_str("\\\""),
            '\\' => requoted.push_str("\\\\"),
            '\n' => requoted.push_str("\\n"),
            '\t' => requoted.push_str("\\t"),
            _ => requoted.push(ch),
        }
    }
    requoted.push('"');
    requoted
}

fn instance_builtin(prog: &Program, ty: TypeId) -> CompileResult<Builtin> {
    let instance = prog
        .types
        .instance(ty)
        .map_err(|msg| CompileError::type_error(msg, None))?;
    match prog.types.kind(instance) {
        TypeKind::Builtin(b) => Ok(*b),
        _ => Err(CompileError::type_error(
            format!("{} cannot be represented in AMM", prog.types.display(instance)),
            None,
        )),
    }
}

fn amm_type(prog: &Program, ty: TypeId) -> CompileResult<String> {
    Ok(instance_builtin(prog, ty)?.to_string())
}

fn literal_suffix(prog: &Program, ty: TypeId) -> CompileResult<&'static str> {
    let b = instance_builtin(prog, ty)?;
    b.suffix().ok_or_else(|| {
        CompileError::type_error(format!("A {b} value has no literal suffix"), None)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn requote_normalizes_quotes_and_escapes() {
        assert_eq!(requote("'I got a number! '"), "\"I got a number! \"");
        assert_eq!(requote("'don\\'t'"), "\"don't\"");
        assert_eq!(requote("\"tab\\there\""), "\"tab\\there\"");
        assert_eq!(requote("'line\\n'"), "\"line\\n\"");
    }
}
