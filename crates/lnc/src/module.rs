//! Per-module declaration processing.
//!
//! Walks a parsed module and populates its scope pair. Declarations are
//! processed in file order; operator mappings and handlers run in later
//! passes so they can reference functions declared further down the file,
//! and exports are copied last so exported overload sets are complete.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::{
    error::{CompileError, CompileResult},
    function::{Event, FnBody, Function, ModConst, OperatorDef},
    peg::Node,
    program::Program,
    scope::{Binding, ScopeId},
    types::{FnReq, OpReq, TypeId, TypeKind},
};

/// Resolves a `fulltypename` node against a scope, with an extra map of
/// local type variables (generic parameters, an interface's self name).
pub(crate) fn resolve_fulltypename(
    prog: &mut Program,
    scope: ScopeId,
    node: &Rc<Node>,
    typevars: &IndexMap<String, TypeId>,
) -> CompileResult<TypeId> {
    let name = node.get("typename").expect("fulltypename has a typename").text();
    let base = if let Some(&tv) = typevars.get(name) {
        tv
    } else {
        match prog.scopes.deep_get(scope, name) {
            Some(Binding::Type(t) | Binding::Interface(t)) => *t,
            _ => {
                return Err(CompileError::name(
                    format!("{name} is not a type"),
                    Some(node.loc()),
                ));
            }
        }
    };
    match node.get("genericargs") {
        None => Ok(base),
        Some(args) => {
            let mut resolved = Vec::new();
            for arg in args.get_all("fulltypename") {
                resolved.push(resolve_fulltypename(prog, scope, arg, typevars)?);
            }
            prog.types
                .instantiate(base, &resolved)
                .map_err(|msg| CompileError::type_error(msg, Some(node.loc())))
        }
    }
}

/// Builds a [`Function`] record from a `functions` parse node. The body is
/// kept as a parse-tree reference; it is lowered per call site.
pub(crate) fn build_function(prog: &mut Program, scope: ScopeId, node: &Rc<Node>) -> CompileResult<Function> {
    let name = node.get("name").map(|n| n.text().to_string());
    let mut params = Vec::new();
    if let Some(list) = node.get("paramlist") {
        for param in list.get_all("param") {
            let pname = param.get("name").expect("param has a name").text().to_string();
            let ftn = param.get("fulltypename").expect("param has a type");
            let ty = resolve_fulltypename(prog, scope, ftn, &IndexMap::new())?;
            params.push((pname, ty));
        }
    }
    let ret = match node.get("rettype") {
        Some(r) => Some(resolve_fulltypename(
            prog,
            scope,
            r.get("fulltypename").expect("rettype wraps a type"),
            &IndexMap::new(),
        )?),
        None => None,
    };
    let fnbody = node.get("fnbody").expect("functions have a body");
    let body = if let Some(block) = fnbody.get("functionbody") {
        FnBody::Block(Rc::clone(block))
    } else {
        let assign = fnbody.get("assignfunction").expect("fnbody alternatives");
        FnBody::Expression(Rc::clone(assign.get("assignables").expect("assignfunction wraps assignables")))
    };
    Ok(Function {
        name,
        scope,
        params,
        ret,
        body,
    })
}

/// Processes every declaration in a parsed module into `module_scope`, then
/// copies the exported names into `export_scope`.
pub(crate) fn declare_module(
    prog: &mut Program,
    tree: &Rc<Node>,
    module_scope: ScopeId,
    export_scope: ScopeId,
) -> CompileResult<()> {
    let items: Vec<Rc<Node>> = tree.get_all("moduleitem").into_iter().map(Rc::clone).collect();
    let mut exports: Vec<(String, Rc<Node>)> = Vec::new();

    // pass 1: types, interfaces, consts, events, functions
    for item in &items {
        let (inner, exported) = unwrap_export(item);
        if let Some(name) = declare_item(prog, module_scope, inner)? {
            if exported {
                exports.push((name, Rc::clone(inner)));
            }
        }
    }

    // pass 2: operator mappings, which capture their candidate sets from
    // the fully-populated scope
    for item in &items {
        let (inner, exported) = unwrap_export(item);
        if inner.name == "opmap" {
            let symbol = declare_opmap(prog, module_scope, inner)?;
            if exported {
                exports.push((symbol, Rc::clone(inner)));
            }
        }
    }

    // pass 3: handlers
    for item in &items {
        let (inner, _) = unwrap_export(item);
        if inner.name == "handlers" {
            declare_handler(prog, module_scope, inner)?;
        }
    }

    // pass 4: exports (including bare re-exports)
    for item in &items {
        let (inner, exported) = unwrap_export(item);
        if exported && inner.name == "reexport" {
            exports.push((inner.text().to_string(), Rc::clone(inner)));
        }
    }
    for (name, node) in exports {
        let Some(binding) = prog.scopes.get(module_scope, &name).cloned() else {
            return Err(CompileError::name(
                format!("Cannot export {name}: it is not defined"),
                Some(node.loc()),
            ));
        };
        prog.scopes.put(export_scope, &name, binding);
    }
    Ok(())
}

/// Peels the `export` wrapper off a module item, returning the inner
/// declaration node and whether it was exported.
fn unwrap_export(item: &Rc<Node>) -> (&Rc<Node>, bool) {
    match item.get("exportdecl") {
        Some(export) => {
            let exportable = export.get("exportable").expect("exportdecl wraps an exportable");
            (&exportable.children()[0], true)
        }
        None => (&item.children()[0], false),
    }
}

/// Declares one non-operator, non-handler item. Returns the bound name.
fn declare_item(prog: &mut Program, scope: ScopeId, node: &Rc<Node>) -> CompileResult<Option<String>> {
    match node.name {
        "typedecl" => declare_type(prog, scope, node).map(Some),
        "interfacedecl" => declare_interface(prog, scope, node).map(Some),
        "constdecl" => {
            let name = node.get("name").expect("constdecl has a name").text().to_string();
            let decl_type = match node.get("fulltypename") {
                Some(ftn) => Some(resolve_fulltypename(prog, scope, ftn, &IndexMap::new())?),
                None => None,
            };
            let expr = Rc::clone(node.get("assignables").expect("constdecl has a value"));
            let id = prog.consts.add(ModConst {
                name: name.clone(),
                scope,
                decl_type,
                expr,
            });
            prog.scopes.put(scope, &name, Binding::Const(id));
            Ok(Some(name))
        }
        "eventdecl" => {
            let name = node.get("name").expect("eventdecl has a name").text().to_string();
            let ftn = node.get("fulltypename").expect("eventdecl has a payload type");
            let payload = resolve_fulltypename(prog, scope, ftn, &IndexMap::new())?;
            let amm_name = unique_event_name(prog, &name);
            let id = prog.events.add(Event {
                name: name.clone(),
                amm_name,
                payload,
                runtime: false,
                handlers: Vec::new(),
            });
            prog.scopes.put(scope, &name, Binding::Event(id));
            Ok(Some(name))
        }
        "functions" => {
            let function = build_function(prog, scope, node)?;
            let Some(name) = function.name.clone() else {
                return Err(CompileError::name(
                    "A module-level function needs a name",
                    Some(node.loc()),
                ));
            };
            let id = prog.fns.add(function);
            prog.scopes.put(scope, &name, Binding::Fns(vec![id]));
            Ok(Some(name))
        }
        // handled in later passes
        "opmap" | "handlers" | "reexport" => Ok(None),
        other => unreachable!("unexpected module item {other}"),
    }
}

fn declare_type(prog: &mut Program, scope: ScopeId, node: &Rc<Node>) -> CompileResult<String> {
    let name = node.get("name").expect("typedecl has a name").text().to_string();
    let mut typevars = IndexMap::new();
    let mut generics = Vec::new();
    if let Some(decl) = node.get("genericdecl") {
        for tv in decl.get_all("name") {
            let tv_name = tv.text().to_string();
            let id = prog.types.add(TypeKind::TypeVar(tv_name.clone()));
            typevars.insert(tv_name.clone(), id);
            generics.push(tv_name);
        }
    }
    let typedef = node.get("typedef").expect("typedecl has a definition");
    let id = if let Some(alias) = typedef.get("typealias") {
        let target = resolve_fulltypename(
            prog,
            scope,
            alias.get("fulltypename").expect("alias target"),
            &typevars,
        )?;
        prog.types.add(TypeKind::Alias {
            name: name.clone(),
            target,
        })
    } else {
        let body = typedef.get("typebody").expect("typedef alternatives");
        let mut fields = IndexMap::new();
        for line in body.get_all("typeline") {
            let field = line.get("name").expect("typeline has a name").text().to_string();
            let ftn = line.get("fulltypename").expect("typeline has a type");
            let ty = resolve_fulltypename(prog, scope, ftn, &typevars)?;
            if matches!(prog.types.kind(prog.types.resolve(ty)), TypeKind::Interface { .. }) {
                return Err(CompileError::type_error(
                    format!("Field {field} of type {name} cannot be typed by an interface"),
                    Some(line.loc()),
                ));
            }
            fields.insert(field, ty);
        }
        prog.types.add(TypeKind::Struct {
            name: name.clone(),
            fields,
            generics,
        })
    };
    prog.scopes.put(scope, &name, Binding::Type(id));
    Ok(name)
}

fn declare_interface(prog: &mut Program, scope: ScopeId, node: &Rc<Node>) -> CompileResult<String> {
    let name = node.get("name").expect("interfacedecl has a name").text().to_string();
    // pre-register so requirement lines can reference the interface itself
    let id = prog.types.add(TypeKind::Interface {
        name: name.clone(),
        props: Vec::new(),
        fns: Vec::new(),
        ops: Vec::new(),
    });
    let mut typevars = IndexMap::new();
    typevars.insert(name.clone(), id);

    let mut props = Vec::new();
    let mut fn_reqs = Vec::new();
    let mut op_reqs = Vec::new();
    for line in node.get_all("interfaceline") {
        if let Some(prop) = line.get("propreq") {
            let pname = prop.get("name").expect("propreq has a name").text().to_string();
            let ftn = prop.get("fulltypename").expect("propreq has a type");
            let ty = resolve_fulltypename(prog, scope, ftn, &typevars)?;
            if matches!(prog.types.kind(prog.types.resolve(ty)), TypeKind::Interface { .. }) {
                return Err(CompileError::type_error(
                    format!("Property {pname} of interface {name} cannot itself be an interface"),
                    Some(line.loc()),
                ));
            }
            props.push((pname, ty));
        } else if let Some(freq) = line.get("fnreq") {
            let fname = freq.get("name").expect("fnreq has a name").text().to_string();
            let params = resolve_typelist(prog, scope, freq, &typevars)?;
            let ret = resolve_fulltypename(
                prog,
                scope,
                freq.get("rettype")
                    .expect("fnreq has a return type")
                    .get("fulltypename")
                    .expect("rettype wraps a type"),
                &typevars,
            )?;
            if matches!(prog.types.kind(prog.types.resolve(ret)), TypeKind::Interface { .. }) && ret != id {
                return Err(CompileError::type_error(
                    format!("Function {fname} of interface {name} cannot return an interface"),
                    Some(line.loc()),
                ));
            }
            fn_reqs.push(FnReq {
                name: fname,
                params,
                ret,
            });
        } else if let Some(oreq) = line.get("operatorreq") {
            let fixity = oreq.get("fixity").expect("operatorreq has a fixity").text();
            let symbol = oreq.get("opsymbol").expect("operatorreq has a symbol").text().to_string();
            let params = resolve_typelist(prog, scope, oreq, &typevars)?;
            let ret = resolve_fulltypename(
                prog,
                scope,
                oreq.get("rettype")
                    .expect("operatorreq has a return type")
                    .get("fulltypename")
                    .expect("rettype wraps a type"),
                &typevars,
            )?;
            op_reqs.push(OpReq {
                symbol,
                prefix: fixity == "prefix",
                params,
                ret,
            });
        }
    }
    prog.types.replace(id, TypeKind::Interface {
        name: name.clone(),
        props,
        fns: fn_reqs,
        ops: op_reqs,
    });
    prog.scopes.put(scope, &name, Binding::Interface(id));
    Ok(name)
}

fn resolve_typelist(
    prog: &mut Program,
    scope: ScopeId,
    node: &Rc<Node>,
    typevars: &IndexMap<String, TypeId>,
) -> CompileResult<Vec<TypeId>> {
    let mut out = Vec::new();
    if let Some(list) = node.get("typelist") {
        for ftn in list.get_all("fulltypename") {
            out.push(resolve_fulltypename(prog, scope, ftn, typevars)?);
        }
    }
    Ok(out)
}

/// Declares an operator mapping, capturing the named function's current
/// overload set as the operator's candidates. Returns the symbol.
fn declare_opmap(prog: &mut Program, scope: ScopeId, node: &Rc<Node>) -> CompileResult<String> {
    let fixity = node.get("fixity").expect("opmap has a fixity").text();
    let fn_name = node.get("fnname").expect("opmap has a function name").text();
    let symbol = node.get("opsymbol").expect("opmap has a symbol").text().to_string();
    let precedence: u32 = node
        .get("opprecedence")
        .expect("opmap has a precedence")
        .text()
        .parse()
        .map_err(|_| CompileError::type_error("Operator precedence out of range", Some(node.loc())))?;
    let fns = prog.scopes.functions(scope, fn_name);
    if fns.is_empty() {
        return Err(CompileError::name(
            format!("Cannot map operator {symbol} to {fn_name}: no such function"),
            Some(node.loc()),
        ));
    }
    let id = prog.ops.add(OperatorDef {
        symbol: symbol.clone(),
        precedence,
        prefix: fixity == "prefix",
        fns,
    });
    prog.scopes.put(scope, &symbol, Binding::Operators(vec![id]));
    Ok(symbol)
}

/// Attaches a handler to its event. Payload checking and lowering happen
/// once all modules are loaded.
fn declare_handler(prog: &mut Program, scope: ScopeId, node: &Rc<Node>) -> CompileResult<()> {
    let event_name = node.get("eventname").expect("handlers name an event").text();
    let event = match prog.scopes.deep_get(scope, event_name) {
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
    let def = node.get("handlerdef").expect("handlers have a definition");
    let candidates = if let Some(fn_node) = def.get("functions") {
        let function = build_function(prog, scope, fn_node)?;
        vec![prog.fns.add(function)]
    } else if let Some(block) = def.get("functionbody") {
        let function = Function {
            name: None,
            scope,
            params: Vec::new(),
            ret: None,
            body: FnBody::Block(Rc::clone(block)),
        };
        vec![prog.fns.add(function)]
    } else {
        let fn_name = def.get("fnname").expect("handlerdef alternatives").text();
        let candidates = prog.scopes.functions(scope, fn_name);
        if candidates.is_empty() {
            return Err(CompileError::name(
                format!("{fn_name} is not a function"),
                Some(node.loc()),
            ));
        }
        candidates
    };
    prog.events.get_mut(event).handlers.push(crate::function::Handler {
        candidates,
        selected: None,
        params: Vec::new(),
        body: Vec::new(),
    });
    Ok(())
}

/// User event names pass through to AMM unless a previous event already
/// claimed the name.
fn unique_event_name(prog: &Program, name: &str) -> String {
    let taken = |candidate: &str| {
        prog.events
            .ids()
            .any(|id| prog.events.get(id).amm_name == candidate)
    };
    if !taken(name) {
        return name.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{name}_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
