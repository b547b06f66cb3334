//! Statement and expression lowering to the three-address form, and the
//! cleanup fixed point that drives inference to completion.
//!
//! Lowering turns every source statement into a sequence of [`Stmt`]s whose
//! call and operator operands are always named temporaries. Calls carry
//! their full overload pool; the cleanup loop filters pools as argument
//! types narrow, selects a single overload once every argument has an
//! instance type (reverse definition order, so later definitions win), and
//! inlines user functions at their call sites. Conditional branches become
//! closures driven by `condfn`/`execcond` pairs.

use std::rc::Rc;

use indexmap::IndexMap;
use log::trace;
use smallvec::{SmallVec, smallvec};

use crate::{
    error::{CompileError, CompileResult, SourceLoc},
    function::{ConstId, EventId, FnBody, FnId},
    ir::{CallExpr, Closure, CondBranch, ConstVal, Expr, Stmt, VarId},
    peg::Node,
    program::Program,
    scope::{Binding, ScopeId},
    types::{Builtin, TypeId, TypeKind},
};

/// Where `return` statements deliver their value.
enum RetKind {
    /// The body belongs to a handler: `return` lowers to [`Stmt::Exit`].
    Handler,
    /// The body is being inlined at a call site: `return` binds or assigns
    /// the call's result temporary.
    Inline,
}

/// Lowering context for one function body (handler or inlined callee).
struct Ctx {
    /// Scope the body's names resolve against.
    scope: ScopeId,
    /// In-scope variables, innermost frame last.
    frames: Vec<IndexMap<String, VarId>>,
    /// Inline ancestry, for recursion detection.
    stack: Vec<FnId>,
    /// Module-const ancestry, for recursion detection across consts.
    const_stack: Vec<ConstId>,
    ret: RetKind,
    /// The result variable of an inlined body, once a `return` produced one
    /// (or up front, when branches assign into a pre-declared slot).
    ret_slot: Option<VarId>,
    ret_declared: Option<TypeId>,
    /// Whether `return` assigns into the pre-declared slot instead of
    /// binding it.
    ret_assigned: bool,
    /// Function name for diagnostics.
    display: String,
}

impl Ctx {
    fn new(scope: ScopeId, display: String, ret: RetKind) -> Self {
        Self {
            scope,
            frames: vec![IndexMap::new()],
            stack: Vec::new(),
            const_stack: Vec::new(),
            ret,
            ret_slot: None,
            ret_declared: None,
            ret_assigned: false,
            display,
        }
    }

    fn lookup(&self, name: &str) -> Option<VarId> {
        self.frames.iter().rev().find_map(|f| f.get(name).copied())
    }

    fn bind(&mut self, name: &str, var: VarId) {
        self.frames
            .last_mut()
            .expect("context always has a frame")
            .insert(name.to_string(), var);
    }
}

/// A lowered operand: the temporary (or existing variable) holding the
/// value, whether this expression freshly declared it, and the source text
/// for diagnostics.
struct Operand {
    var: VarId,
    fresh: bool,
    text: String,
}

/// Lowers every selected handler body and runs its cleanup to a fixed
/// point. Handler selection must have run first.
pub(crate) fn lower_program(prog: &mut Program) -> CompileResult<()> {
    let event_ids: Vec<EventId> = prog.events.ids().collect();
    for eid in event_ids {
        for idx in 0..prog.events.get(eid).handlers.len() {
            let Some(f) = prog.events.get(eid).handlers[idx].selected else {
                continue;
            };
            let body = lower_handler(prog, eid, f)?;
            prog.events.get_mut(eid).handlers[idx].body = body;
        }
    }
    Ok(())
}

fn lower_handler(prog: &mut Program, eid: EventId, f: FnId) -> CompileResult<Vec<Stmt>> {
    let func = prog.fns.get(f).clone();
    let event_name = prog.events.get(eid).name.clone();
    let payload = prog.events.get(eid).payload;
    let display = func.name.clone().unwrap_or_else(|| format!("on {event_name}"));
    trace!("lowering handler {display}");

    let mut ctx = Ctx::new(func.scope, display, RetKind::Handler);
    let mut stmts = Vec::new();
    for (pname, pty) in &func.params {
        prog.types
            .constrain(*pty, payload)
            .map_err(|msg| CompileError::type_error(msg, None))?;
        let var = prog.vars.add(pname.clone(), *pty, false);
        ctx.bind(pname, var);
    }
    match &func.body {
        FnBody::Block(node) => lower_block(prog, &mut ctx, node, &mut stmts)?,
        FnBody::Expression(node) => {
            lower_assignables(prog, &mut ctx, node, &mut stmts)?;
        }
        FnBody::Opcode(_) => unreachable!("opcodes cannot be event handlers"),
    }
    if !matches!(stmts.last(), Some(Stmt::Exit { .. })) {
        stmts.push(Stmt::Exit { arg: None });
    }

    // iterative cleanup: constraints are monotone, so this terminates
    loop {
        let progress = cleanup_stmts(prog, ctx.scope, &mut stmts)?;
        if !progress {
            break;
        }
    }
    finalize_stmts(prog, &stmts)?;
    Ok(stmts)
}

// --- statement lowering --------------------------------------------------

fn lower_block(prog: &mut Program, ctx: &mut Ctx, block: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
    let mut terminated: Option<String> = None;
    for stmt in block.get_all("statement") {
        if let Some(after) = &terminated {
            return Err(CompileError::Reachability {
                message: format!("Unreachable code in function '{}' after:\n{after}", ctx.display),
                loc: Some(stmt.loc()),
            });
        }
        lower_statement(prog, ctx, stmt, stmts, &mut terminated)?;
    }
    Ok(())
}

fn lower_statement(
    prog: &mut Program,
    ctx: &mut Ctx,
    stmt: &Rc<Node>,
    stmts: &mut Vec<Stmt>,
    terminated: &mut Option<String>,
) -> CompileResult<()> {
    let inner = &stmt.children()[0];
    match inner.name {
        "declaration" => lower_declaration(prog, ctx, inner, stmts),
        "assignment" => lower_assignment(prog, ctx, inner, stmts),
        "conditional" => lower_conditional(prog, ctx, inner, stmts),
        "emitstmt" => lower_emit(prog, ctx, inner, stmts),
        "exitstmt" => {
            lower_exit(prog, ctx, inner, stmts)?;
            *terminated = Some(inner.text().trim().to_string());
            Ok(())
        }
        "assignablestmt" => {
            let assignables = inner.get("assignables").expect("assignablestmt wraps assignables");
            lower_assignables(prog, ctx, assignables, stmts)?;
            Ok(())
        }
        other => unreachable!("unexpected statement {other}"),
    }
}

fn lower_declaration(prog: &mut Program, ctx: &mut Ctx, node: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
    let name = node.get("name").expect("declaration has a name").text().to_string();
    let mutable = node.get("declkind").expect("declaration has a kind").text() == "let";
    let assignables = node.get("assignables").expect("declaration has a value");
    let operand = lower_assignables(prog, ctx, assignables, stmts)?;
    if let Some(ftn) = node.get("fulltypename") {
        let declared = crate::module::resolve_fulltypename(prog, ctx.scope, ftn, &IndexMap::new())?;
        let have = prog.vars.ty(operand.var);
        prog.types
            .constrain(have, declared)
            .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))?;
    }
    let var = if operand.fresh {
        // the freshly declared temporary simply takes the user's name
        let var = prog.vars.resolve(operand.var);
        let entry = prog.vars.get_mut(var);
        entry.name = name.clone();
        entry.mutable = mutable;
        if let Some(Stmt::Dec { mutable: m, .. }) = find_dec_mut(stmts, var) {
            *m = mutable;
        }
        var
    } else {
        let ty = prog.vars.ty(operand.var);
        let var = prog.vars.add(name.clone(), ty, mutable);
        stmts.push(Stmt::Dec {
            var,
            mutable,
            expr: Expr::Ref(operand.var),
        });
        var
    };
    ctx.bind(&name, var);
    Ok(())
}

fn lower_assignment(prog: &mut Program, ctx: &mut Ctx, node: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
    let name = node.get("name").expect("assignment has a target").text();
    let Some(target) = ctx.lookup(name) else {
        return match prog.scopes.get(ctx.scope, name) {
            Some(Binding::Const(_)) => Err(CompileError::type_error(
                format!("Cannot reassign {name}: it was declared const"),
                Some(node.loc()),
            )),
            _ => Err(CompileError::name(format!("{name} is not defined"), Some(node.loc()))),
        };
    };
    if !prog.vars.get(prog.vars.resolve(target)).mutable {
        return Err(CompileError::type_error(
            format!("Cannot reassign {name}: it was declared const"),
            Some(node.loc()),
        ));
    }
    let assignables = node.get("assignables").expect("assignment has a value");
    let operand = lower_assignables(prog, ctx, assignables, stmts)?;
    let target_ty = prog.vars.ty(target);
    let value_ty = prog.vars.ty(operand.var);
    prog.types
        .constrain(value_ty, target_ty)
        .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))?;
    stmts.push(Stmt::Assign {
        var: target,
        expr: Expr::Ref(operand.var),
    });
    Ok(())
}

fn lower_conditional(prog: &mut Program, ctx: &mut Ctx, node: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
    let cond_node = node.get("assignables").expect("conditional has a condition");
    let cond = lower_assignables(prog, ctx, cond_node, stmts)?;
    let boolean = prog.types.builtin(Builtin::Bool);
    let cond_ty = prog.vars.ty(cond.var);
    prog.types
        .constrain(cond_ty, boolean)
        .map_err(|msg| CompileError::type_error(msg, Some(cond_node.loc())))?;

    let mut branches = Vec::new();
    let if_branch = node.get("ifbranch").expect("conditional has a branch");
    let closure = lower_branch_closure(prog, ctx, if_branch)?;
    let pair_var = prog.vars.add(prog.r#gen.temp(), prog.types.builtin(Builtin::Void), false);
    branches.push(CondBranch {
        cond: cond.var,
        pair_var,
        closure,
    });

    if let Some(else_branch) = node.get("elsebranch") {
        // the else arm is a branch whose condition is literally true
        let true_ty = prog.types.builtin(Builtin::Bool);
        let true_var = prog.vars.add(prog.r#gen.temp(), true_ty, false);
        stmts.push(Stmt::Dec {
            var: true_var,
            mutable: false,
            expr: Expr::Const(ConstVal {
                value: "true".to_string(),
                ty: true_ty,
            }),
        });
        let closure = lower_branch_closure(prog, ctx, else_branch)?;
        let pair_var = prog.vars.add(prog.r#gen.temp(), prog.types.builtin(Builtin::Void), false);
        branches.push(CondBranch {
            cond: true_var,
            pair_var,
            closure,
        });
    }

    let exec_var = prog.vars.add(prog.r#gen.temp(), prog.types.builtin(Builtin::Void), false);
    stmts.push(Stmt::Cond { branches, exec_var });
    Ok(())
}

/// Lowers one conditional branch into a closure. The branch sees the
/// enclosing frames (closures run in the creating handler's frame).
fn lower_branch_closure(prog: &mut Program, ctx: &mut Ctx, wrapper: &Rc<Node>) -> CompileResult<crate::ir::ClosId> {
    let mut body = Vec::new();
    ctx.frames.push(IndexMap::new());
    let child = &wrapper.children()[0];
    let result = match child.name {
        "functionbody" => lower_block(prog, ctx, child, &mut body),
        "conditional" => lower_conditional(prog, ctx, child, &mut body),
        "statement" => {
            let mut terminated = None;
            lower_statement(prog, ctx, child, &mut body, &mut terminated)
        }
        other => unreachable!("unexpected branch node {other}"),
    };
    ctx.frames.pop();
    result?;
    if !matches!(body.last(), Some(Stmt::Exit { .. })) {
        body.push(Stmt::Exit { arg: None });
    }
    let name = prog.r#gen.closure();
    Ok(prog.closures.add(Closure { name, body }))
}

fn lower_emit(prog: &mut Program, ctx: &mut Ctx, node: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
    let event_name = node.get("eventname").expect("emit names an event").text();
    let event = match prog.scopes.deep_get(ctx.scope, event_name) {
        Some(Binding::Event(id)) => *id,
        Some(_) => {
            return Err(CompileError::type_error(
                format!("{event_name} is not an event"),
                Some(node.loc()),
            ));
        }
        None => {
            return Err(CompileError::name(
                format!("Event {event_name} is not defined"),
                Some(node.loc()),
            ));
        }
    };
    let payload = prog.events.get(event).payload;
    let payload_is_void = prog.types.eq(payload, prog.types.builtin(Builtin::Void));
    let arg = match node.get("assignables") {
        Some(assignables) => {
            if payload_is_void {
                return Err(CompileError::type_error(
                    format!("Event {event_name} takes no payload"),
                    Some(node.loc()),
                ));
            }
            let operand = lower_assignables(prog, ctx, assignables, stmts)?;
            let ty = prog.vars.ty(operand.var);
            prog.types
                .constrain(ty, payload)
                .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))?;
            Some(operand.var)
        }
        None => {
            if !payload_is_void {
                return Err(CompileError::type_error(
                    format!(
                        "Event {event_name} requires a {} payload",
                        prog.types.display(payload)
                    ),
                    Some(node.loc()),
                ));
            }
            None
        }
    };
    stmts.push(Stmt::Emit { event, arg });
    Ok(())
}

fn lower_exit(prog: &mut Program, ctx: &mut Ctx, node: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<()> {
    let value = match node.get("assignables") {
        Some(assignables) => Some(lower_assignables(prog, ctx, assignables, stmts)?),
        None => None,
    };
    match ctx.ret {
        RetKind::Handler => {
            stmts.push(Stmt::Exit {
                arg: value.map(|v| v.var),
            });
        }
        RetKind::Inline => {
            if ctx.ret_assigned {
                let slot = ctx.ret_slot.expect("assigned-style return has a slot");
                if let Some(v) = value {
                    let slot_ty = prog.vars.ty(slot);
                    let value_ty = prog.vars.ty(v.var);
                    prog.types
                        .constrain(value_ty, slot_ty)
                        .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))?;
                    stmts.push(Stmt::Assign {
                        var: slot,
                        expr: Expr::Ref(v.var),
                    });
                }
            } else if let Some(v) = value {
                if let Some(declared) = ctx.ret_declared {
                    let ty = prog.vars.ty(v.var);
                    prog.types
                        .constrain(ty, declared)
                        .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))?;
                }
                ctx.ret_slot = Some(v.var);
            }
        }
    }
    Ok(())
}

// --- expression lowering -------------------------------------------------

/// One element of the working array the operator-resolution loop consumes.
enum OpItem {
    Expr(Operand),
    Op(OpTok),
}

struct OpTok {
    symbol: String,
    prefix: bool,
    precedence: u32,
    fns: Vec<FnId>,
    loc: SourceLoc,
}

fn lower_assignables(
    prog: &mut Program,
    ctx: &mut Ctx,
    node: &Rc<Node>,
    stmts: &mut Vec<Stmt>,
) -> CompileResult<Operand> {
    // lower operands left to right, then decide prefix/infix per token
    let mut items: Vec<OpItem> = Vec::new();
    for child in node.children() {
        match child.name {
            "baseassignablelist" => {
                let operand = lower_bal(prog, ctx, child, stmts)?;
                items.push(OpItem::Expr(operand));
            }
            "opsymbol" => {
                let follows_expr = matches!(items.last(), Some(OpItem::Expr(_)));
                items.push(OpItem::Op(resolve_operator(
                    prog,
                    ctx.scope,
                    child.text(),
                    !follows_expr,
                    child.loc(),
                )?));
            }
            other => unreachable!("unexpected assignables child {other}"),
        }
    }

    while items.iter().any(|i| matches!(i, OpItem::Op(_))) {
        let maxp = items
            .iter()
            .filter_map(|i| match i {
                OpItem::Op(op) => Some(op.precedence),
                OpItem::Expr(_) => None,
            })
            .max()
            .expect("at least one operator remains");
        let has_prefix = items
            .iter()
            .any(|i| matches!(i, OpItem::Op(op) if op.precedence == maxp && op.prefix));
        let has_infix = items
            .iter()
            .any(|i| matches!(i, OpItem::Op(op) if op.precedence == maxp && !op.prefix));
        if has_prefix && has_infix {
            return Err(CompileError::type_error(
                format!(
                    "Ambiguous operator resolution: prefix and infix operators share precedence {maxp} in statement\n{}",
                    render_items(&items)
                ),
                Some(node.loc()),
            ));
        }
        if has_prefix {
            // prefix operators apply right to left
            let mut idx = items.len();
            while idx > 0 {
                idx -= 1;
                let applies = matches!(&items[idx], OpItem::Op(op) if op.precedence == maxp && op.prefix);
                if !applies {
                    continue;
                }
                if !matches!(items.get(idx + 1), Some(OpItem::Expr(_))) {
                    return Err(cannot_resolve(prog, &items, node));
                }
                let OpItem::Expr(rhs) = items.remove(idx + 1) else {
                    unreachable!()
                };
                let op = read_op(&items, idx);
                let result = apply_operator(prog, ctx, stmts, &op, &[&rhs])?;
                items[idx] = OpItem::Expr(result);
            }
        } else {
            // infix operators apply left to right
            let mut idx = 0;
            while idx < items.len() {
                let applies = matches!(&items[idx], OpItem::Op(op) if op.precedence == maxp && !op.prefix);
                if !applies {
                    idx += 1;
                    continue;
                }
                let lhs_ok = idx > 0 && matches!(items[idx - 1], OpItem::Expr(_));
                let rhs_ok = matches!(items.get(idx + 1), Some(OpItem::Expr(_)));
                if !lhs_ok || !rhs_ok {
                    return Err(cannot_resolve(prog, &items, node));
                }
                let OpItem::Expr(rhs) = items.remove(idx + 1) else {
                    unreachable!()
                };
                let OpItem::Op(op) = items.remove(idx) else { unreachable!() };
                let OpItem::Expr(lhs) = items.remove(idx - 1) else {
                    unreachable!()
                };
                let result = apply_operator(prog, ctx, stmts, &op, &[&lhs, &rhs])?;
                items.insert(idx - 1, OpItem::Expr(result));
            }
        }
    }

    match items.len() {
        1 => match items.pop().expect("one item") {
            OpItem::Expr(operand) => Ok(operand),
            OpItem::Op(_) => Err(cannot_resolve(prog, &items, node)),
        },
        _ => Err(cannot_resolve(prog, &items, node)),
    }
}

/// Clones the operator token at `idx` out of the items array (the slot is
/// about to be overwritten by the application result).
fn read_op(items: &[OpItem], idx: usize) -> OpTok {
    match &items[idx] {
        OpItem::Op(op) => OpTok {
            symbol: op.symbol.clone(),
            prefix: op.prefix,
            precedence: op.precedence,
            fns: op.fns.clone(),
            loc: op.loc.clone(),
        },
        OpItem::Expr(_) => unreachable!("caller checked for an operator"),
    }
}

fn resolve_operator(
    prog: &Program,
    scope: ScopeId,
    symbol: &str,
    prefix: bool,
    loc: SourceLoc,
) -> CompileResult<OpTok> {
    let ids = prog.scopes.operators(scope, symbol);
    let defs: Vec<&crate::function::OperatorDef> = ids
        .iter()
        .map(|&id| prog.ops.get(id))
        .filter(|d| d.prefix == prefix)
        .collect();
    if defs.is_empty() {
        let fixity = if prefix { "prefix" } else { "infix" };
        return Err(CompileError::type_error(
            format!("No {fixity} operator {symbol} is defined"),
            Some(loc),
        ));
    }
    let precedence = defs[0].precedence;
    if defs.iter().any(|d| d.precedence != precedence) {
        return Err(CompileError::type_error(
            format!("Operator {symbol} has multiple declared precedences; cannot resolve"),
            Some(loc),
        ));
    }
    let mut fns = Vec::new();
    for def in defs {
        for &f in &def.fns {
            if !fns.contains(&f) {
                fns.push(f);
            }
        }
    }
    Ok(OpTok {
        symbol: symbol.to_string(),
        prefix,
        precedence,
        fns,
        loc,
    })
}

fn apply_operator(
    prog: &mut Program,
    ctx: &mut Ctx,
    stmts: &mut Vec<Stmt>,
    op: &OpTok,
    operands: &[&Operand],
) -> CompileResult<Operand> {
    let arg_tys: Vec<TypeId> = operands.iter().map(|o| prog.vars.ty(o.var)).collect();
    let text = if op.prefix {
        format!("{}{}", op.symbol, operands[0].text)
    } else {
        format!("{} {} {}", operands[0].text, op.symbol, operands[1].text)
    };
    let surviving: Vec<FnId> = op
        .fns
        .iter()
        .copied()
        .filter(|&f| {
            let f = prog.fns.get(f);
            f.params.len() == operands.len()
                && f.params
                    .iter()
                    .zip(&arg_tys)
                    .all(|((_, p), &a)| prog.arg_accepts(*p, a, ctx.scope))
        })
        .collect();
    if surviving.is_empty() {
        let typed = if op.prefix {
            format!("{}<{}>", op.symbol, prog.types.display(arg_tys[0]))
        } else {
            format!(
                "<{}> {} <{}>",
                prog.types.display(arg_tys[0]),
                op.symbol,
                prog.types.display(arg_tys[1])
            )
        };
        return Err(CompileError::type_error(
            format!("Cannot resolve operators with remaining statement\n{text}\n{typed}"),
            Some(op.loc.clone()),
        ));
    }
    let args: SmallVec<[VarId; 3]> = operands.iter().map(|o| o.var).collect();
    Ok(make_call(prog, ctx, &op.symbol, surviving, args, op.loc.clone(), stmts, text))
}

fn cannot_resolve(prog: &Program, items: &[OpItem], node: &Rc<Node>) -> CompileError {
    let mut typed = Vec::new();
    for item in items {
        match item {
            OpItem::Expr(o) => typed.push(format!("<{}>", prog.types.display(prog.vars.ty(o.var)))),
            OpItem::Op(op) => typed.push(op.symbol.clone()),
        }
    }
    CompileError::type_error(
        format!(
            "Cannot resolve operators with remaining statement\n{}\n{}",
            render_items(items),
            typed.join(" ")
        ),
        Some(node.loc()),
    )
}

fn render_items(items: &[OpItem]) -> String {
    items
        .iter()
        .map(|i| match i {
            OpItem::Expr(o) => o.text.clone(),
            OpItem::Op(op) => op.symbol.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowers a dot-separated base-assignable chain: scope navigation through
/// module references, method-dispatch sugar for `.fn(args)`, literals, and
/// parenthesized groups.
fn lower_bal(prog: &mut Program, ctx: &mut Ctx, bal: &Rc<Node>, stmts: &mut Vec<Stmt>) -> CompileResult<Operand> {
    let mut acc: Option<Operand> = None;
    // a module path being navigated: (export scope, dotted text so far)
    let mut pending: Option<(ScopeId, String)> = None;

    for seg in bal.get_all("baseassignable") {
        let inner = &seg.children()[0];
        match inner.name {
            "fncall" => {
                let fname = inner.get("name").expect("fncall has a name").text();
                let mut args: SmallVec<[VarId; 3]> = smallvec![];
                let mut text_parts = Vec::new();
                if let Some(receiver) = acc.take() {
                    text_parts.push(receiver.text.clone());
                    args.push(receiver.var);
                }
                if let Some(callargs) = inner.get("callargs") {
                    for a in callargs.get_all("assignables") {
                        let operand = lower_assignables(prog, ctx, a, stmts)?;
                        args.push(operand.var);
                    }
                }
                let candidates = match pending.take() {
                    Some((exports, path)) => match prog.scopes.shallow_get(exports, fname) {
                        Some(Binding::Fns(fns)) => fns.clone(),
                        Some(_) => {
                            return Err(CompileError::type_error(
                                format!("{fname} is not a function but used as one."),
                                Some(inner.loc()),
                            ));
                        }
                        None => {
                            return Err(CompileError::name(
                                format!("{path}.{fname} is not defined"),
                                Some(inner.loc()),
                            ));
                        }
                    },
                    None => resolve_fn_candidates(prog, ctx.scope, fname, inner)?,
                };
                let text = format!("{}{}", text_parts.join("."), inner.text());
                acc = Some(make_call(
                    prog,
                    ctx,
                    fname,
                    candidates,
                    args,
                    inner.loc(),
                    stmts,
                    text,
                ));
            }
            "constants" => {
                if acc.is_some() || pending.is_some() {
                    return Err(CompileError::type_error(
                        format!("Unexpected literal {}", inner.text()),
                        Some(inner.loc()),
                    ));
                }
                acc = Some(lower_constant(prog, inner, stmts));
            }
            "variable" => {
                let vname = inner.text();
                if let Some(receiver) = &acc {
                    return Err(CompileError::type_error(
                        format!("{} has no property {vname}", receiver.text),
                        Some(inner.loc()),
                    ));
                }
                if let Some((exports, path)) = pending.take() {
                    match prog.scopes.shallow_get(exports, vname) {
                        Some(Binding::Module(next)) => {
                            pending = Some((*next, format!("{path}.{vname}")));
                        }
                        Some(Binding::Const(c)) => {
                            let c = *c;
                            acc = Some(inline_const(prog, ctx, c, stmts, inner)?);
                        }
                        Some(_) => {
                            return Err(CompileError::type_error(
                                format!("{path}.{vname} cannot be used as a value"),
                                Some(inner.loc()),
                            ));
                        }
                        None => {
                            return Err(CompileError::name(
                                format!("{vname} is not exported by {path}"),
                                Some(inner.loc()),
                            ));
                        }
                    }
                } else if let Some(var) = ctx.lookup(vname) {
                    acc = Some(Operand {
                        var,
                        fresh: false,
                        text: vname.to_string(),
                    });
                } else {
                    match prog.scopes.get(ctx.scope, vname) {
                        Some(Binding::Const(c)) => {
                            let c = *c;
                            acc = Some(inline_const(prog, ctx, c, stmts, inner)?);
                        }
                        Some(Binding::Module(exports)) => {
                            pending = Some((*exports, vname.to_string()));
                        }
                        Some(_) => {
                            return Err(CompileError::type_error(
                                format!("{vname} cannot be used as a value here"),
                                Some(inner.loc()),
                            ));
                        }
                        None => {
                            return Err(CompileError::name(
                                format!("{vname} is not defined"),
                                Some(inner.loc()),
                            ));
                        }
                    }
                }
            }
            "group" => {
                if acc.is_some() || pending.is_some() {
                    return Err(CompileError::type_error(
                        "Unexpected parenthesized expression".to_string(),
                        Some(inner.loc()),
                    ));
                }
                let assignables = inner.get("assignables").expect("group wraps assignables");
                acc = Some(lower_assignables(prog, ctx, assignables, stmts)?);
            }
            other => unreachable!("unexpected base assignable {other}"),
        }
    }
    if let Some((_, path)) = pending {
        return Err(CompileError::type_error(
            format!("{path} is a module, not a value"),
            Some(bal.loc()),
        ));
    }
    acc.ok_or_else(|| CompileError::type_error("Empty expression".to_string(), Some(bal.loc())))
}

/// Lowers a literal: numbers get their OneOf candidate set, strings and
/// booleans their builtin type.
fn lower_constant(prog: &mut Program, node: &Rc<Node>, stmts: &mut Vec<Stmt>) -> Operand {
    let inner = &node.children()[0];
    let text = inner.text().to_string();
    let ty = match inner.name {
        "bool" => prog.types.builtin(Builtin::Bool),
        "str" => prog.types.builtin(Builtin::Str),
        "num" => {
            let candidates = if text.contains('.') {
                vec![
                    prog.types.builtin(Builtin::Float32),
                    prog.types.builtin(Builtin::Float64),
                ]
            } else {
                vec![
                    prog.types.builtin(Builtin::Float32),
                    prog.types.builtin(Builtin::Float64),
                    prog.types.builtin(Builtin::Int8),
                    prog.types.builtin(Builtin::Int16),
                    prog.types.builtin(Builtin::Int32),
                    prog.types.builtin(Builtin::Int64),
                ]
            };
            prog.types.add(TypeKind::OneOf { candidates })
        }
        other => unreachable!("unexpected constant {other}"),
    };
    let var = prog.vars.add(prog.r#gen.temp(), ty, false);
    stmts.push(Stmt::Dec {
        var,
        mutable: false,
        expr: Expr::Const(ConstVal {
            value: text.clone(),
            ty,
        }),
    });
    Operand {
        var,
        fresh: true,
        text,
    }
}

fn resolve_fn_candidates(prog: &Program, scope: ScopeId, name: &str, node: &Rc<Node>) -> CompileResult<Vec<FnId>> {
    let fns = prog.scopes.functions(scope, name);
    if !fns.is_empty() {
        return Ok(fns);
    }
    match prog.scopes.get(scope, name) {
        Some(_) => Err(CompileError::type_error(
            format!("{name} is not a function but used as one."),
            Some(node.loc()),
        )),
        None if prog.opcode_names.contains(name) => Err(CompileError::OpcodeMisuse {
            message: format!("{name} is not a function but used as one."),
            loc: Some(node.loc()),
        }),
        None => Err(CompileError::name(format!("{name} is not defined"), Some(node.loc()))),
    }
}

/// Lowers a module-level const's expression at this use site, like a
/// zero-parameter function inline.
fn inline_const(
    prog: &mut Program,
    ctx: &mut Ctx,
    cid: ConstId,
    stmts: &mut Vec<Stmt>,
    node: &Rc<Node>,
) -> CompileResult<Operand> {
    if ctx.const_stack.contains(&cid) {
        let mut names: Vec<String> = ctx
            .const_stack
            .iter()
            .map(|&c| prog.consts.get(c).name.clone())
            .collect();
        names.push(prog.consts.get(cid).name.clone());
        return Err(CompileError::type_error(
            format!("Recursive callstack detected: {}. Aborting.", names.join(" -> ")),
            Some(node.loc()),
        ));
    }
    ctx.const_stack.push(cid);
    let mc = prog.consts.get(cid).clone();
    let saved_scope = ctx.scope;
    let saved_frames = std::mem::take(&mut ctx.frames);
    ctx.scope = mc.scope;
    ctx.frames = vec![IndexMap::new()];
    let result = lower_assignables(prog, ctx, &mc.expr, stmts);
    ctx.scope = saved_scope;
    ctx.frames = saved_frames;
    ctx.const_stack.pop();
    let operand = result?;
    if let Some(declared) = mc.decl_type {
        let ty = prog.vars.ty(operand.var);
        prog.types
            .constrain(ty, declared)
            .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))?;
    }
    Ok(Operand {
        var: operand.var,
        fresh: operand.fresh,
        text: mc.name.clone(),
    })
}

/// Creates a call with its full candidate pool and declares its result
/// temporary. The return type starts as the OneOf of every candidate's
/// declared return and narrows as the pool shrinks.
#[expect(clippy::too_many_arguments, reason = "a call site carries exactly this much context")]
fn make_call(
    prog: &mut Program,
    ctx: &Ctx,
    name: &str,
    candidates: Vec<FnId>,
    args: SmallVec<[VarId; 3]>,
    loc: SourceLoc,
    stmts: &mut Vec<Stmt>,
    text: String,
) -> Operand {
    let mut rets = Vec::new();
    let mut all_declared = true;
    for &f in &candidates {
        match prog.fns.get(f).ret {
            Some(r)
                if !matches!(
                    prog.types.kind(prog.types.resolve(r)),
                    TypeKind::Interface { .. } | TypeKind::Generated { .. }
                ) =>
            {
                if !rets.iter().any(|&x| prog.types.eq(x, r)) {
                    rets.push(r);
                }
            }
            _ => all_declared = false,
        }
    }
    let ret = if all_declared && !rets.is_empty() {
        prog.types.add(TypeKind::OneOf { candidates: rets })
    } else {
        prog.types.add(TypeKind::Generated {
            iface: None,
            constraint: None,
        })
    };
    let call = CallExpr {
        name: name.to_string(),
        candidates,
        args,
        ret,
        selected: None,
        constrained_at: usize::MAX,
        stack: ctx.stack.clone(),
        loc: Some(loc),
    };
    let var = prog.vars.add(prog.r#gen.temp(), ret, false);
    stmts.push(Stmt::Dec {
        var,
        mutable: false,
        expr: Expr::Call(call),
    });
    Operand {
        var,
        fresh: true,
        text,
    }
}

// --- cleanup -------------------------------------------------------------

enum Outcome {
    Quiet,
    Progress,
    Inline(Vec<Stmt>, Option<VarId>),
}

/// One cleanup sweep over a statement list (recursing into conditional
/// closures). Returns whether anything narrowed, selected, or inlined.
pub(crate) fn cleanup_stmts(prog: &mut Program, scope: ScopeId, stmts: &mut Vec<Stmt>) -> CompileResult<bool> {
    let mut progress = false;
    let mut i = 0;
    while i < stmts.len() {
        let outcome = match &mut stmts[i] {
            // assignments only ever hold references after lowering, so
            // calls appear in declarations alone
            Stmt::Dec {
                expr: Expr::Call(call), ..
            } => Some(cleanup_call(prog, scope, call)?),
            Stmt::Cond { branches, .. } => {
                let closure_ids: Vec<crate::ir::ClosId> = branches.iter().map(|b| b.closure).collect();
                for c in closure_ids {
                    let mut body = prog.closures.take_body(c);
                    progress |= cleanup_stmts(prog, scope, &mut body)?;
                    prog.closures.put_body(c, body);
                }
                None
            }
            _ => None,
        };
        match outcome {
            None | Some(Outcome::Quiet) => {}
            Some(Outcome::Progress) => progress = true,
            Some(Outcome::Inline(inlined, result)) => {
                progress = true;
                let Stmt::Dec { var, .. } = stmts.remove(i) else {
                    unreachable!("only declarations hold calls");
                };
                if let Some(r) = result {
                    prog.vars.set_alias(var, r);
                }
                let n = inlined.len();
                stmts.splice(i..i, inlined);
                i += n;
                continue;
            }
        }
        i += 1;
    }
    Ok(progress)
}

fn cleanup_call(prog: &mut Program, scope: ScopeId, call: &mut CallExpr) -> CompileResult<Outcome> {
    if call.selected.is_some() {
        return Ok(Outcome::Quiet);
    }
    let mut progress = false;

    // 1. argument-position filtering
    let arg_tys: Vec<TypeId> = call.args.iter().map(|&a| prog.vars.ty(a)).collect();
    let before = call.candidates.len();
    call.candidates.retain(|&f| {
        let f = prog.fns.get(f);
        f.params.len() == call.args.len()
            && f.params
                .iter()
                .zip(&arg_tys)
                .all(|((_, p), &a)| prog.arg_accepts(*p, a, scope))
    });
    if call.candidates.is_empty() {
        return Err(unmatched_call(prog, call, &arg_tys));
    }
    if call.candidates.len() < before {
        progress = true;
    }

    // 2. constrain every argument to the OneOf of surviving parameter types
    if call.constrained_at != call.candidates.len() {
        for (i, &arg) in call.args.iter().enumerate() {
            let mut position: Vec<TypeId> = Vec::new();
            for &f in &call.candidates {
                let p = prog.fns.get(f).params[i].1;
                let resolved = prog.types.resolve(p);
                if matches!(
                    prog.types.kind(resolved),
                    TypeKind::Interface { .. } | TypeKind::Generated { .. } | TypeKind::TypeVar(_)
                ) {
                    // interface-typed positions do not narrow the argument
                    position.clear();
                    break;
                }
                if !position.iter().any(|&x| prog.types.eq(x, resolved)) {
                    position.push(resolved);
                }
            }
            if position.is_empty() {
                continue;
            }
            let target = if position.len() == 1 {
                position[0]
            } else {
                prog.types.add(TypeKind::OneOf { candidates: position })
            };
            prog.types
                .constrain(arg_tys[i], target)
                .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
        }
        call.constrained_at = call.candidates.len();
        progress = true;
    }

    // 3. selection once every argument has an instance type
    if call
        .args
        .iter()
        .all(|&a| prog.types.has_instance(prog.vars.ty(a)))
    {
        let instances: Vec<TypeId> = call
            .args
            .iter()
            .map(|&a| prog.types.instance(prog.vars.ty(a)).expect("instance checked"))
            .collect();
        let selected = call.candidates.iter().rev().copied().find(|&f| {
            let f = prog.fns.get(f);
            f.params
                .iter()
                .zip(&instances)
                .all(|((_, p), &inst)| prog.accepts_instance(*p, inst, scope))
        });
        let Some(selected) = selected else {
            return Err(unmatched_call(prog, call, &arg_tys));
        };
        trace!("selected {} for call {}", selected.index(), call.name);
        if matches!(prog.fns.get(selected).body, FnBody::Opcode(_)) {
            let func = prog.fns.get(selected).clone();
            for ((_, p), &arg) in func.params.iter().zip(&call.args) {
                let arg_ty = prog.vars.ty(arg);
                prog.types
                    .constrain(arg_ty, *p)
                    .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
            }
            let ret = func.ret.expect("opcodes declare their return type");
            prog.types
                .constrain(call.ret, ret)
                .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
            call.selected = Some(selected);
            Ok(Outcome::Progress)
        } else {
            if call.stack.contains(&selected) {
                return Err(recursion_error(prog, call, selected));
            }
            let (stmts, result) = inline_function(prog, selected, call)?;
            Ok(Outcome::Inline(stmts, result))
        }
    } else {
        Ok(if progress { Outcome::Progress } else { Outcome::Quiet })
    }
}

fn unmatched_call(prog: &Program, call: &CallExpr, arg_tys: &[TypeId]) -> CompileError {
    let types: Vec<String> = arg_tys.iter().map(|&t| prog.types.display(t)).collect();
    CompileError::type_error(
        format!(
            "Unable to find matching function {} accepting ({})",
            call.name,
            types.join(", ")
        ),
        call.loc.clone(),
    )
}

fn recursion_error(prog: &Program, call: &CallExpr, selected: FnId) -> CompileError {
    let fn_name = |f: FnId| {
        prog.fns
            .get(f)
            .name
            .clone()
            .unwrap_or_else(|| "<anonymous>".to_string())
    };
    let start = call
        .stack
        .iter()
        .position(|&f| f == selected)
        .expect("selected is on the stack");
    let mut names: Vec<String> = call.stack[start..].iter().map(|&f| fn_name(f)).collect();
    names.push(fn_name(selected));
    CompileError::type_error(
        format!("Recursive callstack detected: {}. Aborting.", names.join(" -> ")),
        call.loc.clone(),
    )
}

/// Lowers the selected function's body at this call site. Parameters bind
/// directly to the caller's argument temporaries; interface-typed hints are
/// duplicated into per-call solver slots first.
fn inline_function(prog: &mut Program, f: FnId, call: &CallExpr) -> CompileResult<(Vec<Stmt>, Option<VarId>)> {
    let func = prog.fns.get(f).clone();
    let display = func.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
    let mut ctx = Ctx::new(func.scope, display, RetKind::Inline);
    ctx.stack = call.stack.clone();
    ctx.stack.push(f);
    ctx.ret_declared = func.ret;

    for ((pname, pty), &arg) in func.params.iter().zip(&call.args) {
        let arg_ty = prog.vars.ty(arg);
        let hint = prog.types.dup(*pty);
        prog.types
            .constrain(hint, arg_ty)
            .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
        ctx.bind(pname, arg);
    }

    let mut out = Vec::new();
    let result = match &func.body {
        FnBody::Expression(node) => {
            let operand = lower_assignables(prog, &mut ctx, node, &mut out)?;
            if let Some(declared) = func.ret {
                let ty = prog.vars.ty(operand.var);
                prog.types
                    .constrain(ty, declared)
                    .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
            }
            Some(operand.var)
        }
        FnBody::Block(node) => {
            if conditional_contains_return(node) {
                // branches assign into a pre-declared result slot
                let ty = func.ret.unwrap_or_else(|| {
                    prog.types.add(TypeKind::Generated {
                        iface: None,
                        constraint: None,
                    })
                });
                let slot = prog.vars.add(prog.r#gen.temp(), ty, true);
                out.push(Stmt::Dec {
                    var: slot,
                    mutable: true,
                    expr: Expr::Default,
                });
                ctx.ret_assigned = true;
                ctx.ret_slot = Some(slot);
            }
            lower_block(prog, &mut ctx, node, &mut out)?;
            ctx.ret_slot
        }
        FnBody::Opcode(_) => unreachable!("opcode calls are never inlined"),
    };

    match result {
        Some(r) => {
            let ty = prog.vars.ty(r);
            prog.types
                .constrain(call.ret, ty)
                .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
        }
        None => {
            let void = prog.types.builtin(Builtin::Void);
            prog.types
                .constrain(call.ret, void)
                .map_err(|msg| CompileError::type_error(msg, call.loc.clone()))?;
        }
    }
    Ok((out, result))
}

/// Whether any conditional nested in this body contains a `return`.
fn conditional_contains_return(body: &Rc<Node>) -> bool {
    fn subtree_has_exit(node: &Rc<Node>) -> bool {
        node.name == "exitstmt" || node.children().iter().any(subtree_has_exit)
    }
    fn walk(node: &Rc<Node>) -> bool {
        if node.name == "conditional" {
            subtree_has_exit(node)
        } else {
            node.children().iter().any(walk)
        }
    }
    walk(body)
}

// --- final validation ----------------------------------------------------

/// Asserts that cleanup actually finished the job: every declaration has a
/// concrete instance type, every call was selected (and user calls
/// inlined), and integer literals fit the type they narrowed to.
pub(crate) fn finalize_stmts(prog: &Program, stmts: &[Stmt]) -> CompileResult<()> {
    for stmt in stmts {
        match stmt {
            Stmt::Dec { var, expr, .. } | Stmt::Assign { var, expr, .. } => {
                let ty = prog.vars.ty(*var);
                let instance = prog
                    .types
                    .instance(ty)
                    .map_err(|msg| CompileError::type_error(msg, None))?;
                if let Expr::Call(call) = expr {
                    if call.selected.is_none() {
                        let arg_tys: Vec<TypeId> = call.args.iter().map(|&a| prog.vars.ty(a)).collect();
                        return Err(unmatched_call(prog, call, &arg_tys));
                    }
                }
                if let Expr::Const(c) = expr {
                    check_literal_range(prog, c, instance)?;
                }
            }
            Stmt::Cond { branches, .. } => {
                for b in branches {
                    finalize_stmts(prog, &prog.closures.get(b.closure).body)?;
                }
            }
            Stmt::Emit { .. } | Stmt::Exit { .. } => {}
        }
    }
    Ok(())
}

fn check_literal_range(prog: &Program, c: &ConstVal, instance: TypeId) -> CompileResult<()> {
    if c.value.contains('.') || c.value.starts_with('\'') || c.value.starts_with('"') {
        return Ok(());
    }
    let TypeKind::Builtin(b) = prog.types.kind(instance) else {
        return Ok(());
    };
    if matches!(b, Builtin::Bool | Builtin::Str | Builtin::Void | Builtin::Function) {
        return Ok(());
    }
    if let Ok(value) = c.value.parse::<i64>() {
        if !b.fits(value) {
            return Err(CompileError::type_error(
                format!("Integer literal {} is out of range for {b}", c.value),
                None,
            ));
        }
    }
    Ok(())
}

/// Finds the declaration statement for a variable, to retag its mutability
/// when a user declaration adopts a generated temporary.
fn find_dec_mut(stmts: &mut [Stmt], var: VarId) -> Option<&mut Stmt> {
    stmts.iter_mut().rev().find(|s| matches!(s, Stmt::Dec { var: v, .. } if *v == var))
}
