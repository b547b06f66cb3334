//! Functions, operators, events, and module-level constants.
//!
//! A function body stays a parse-tree reference until a call site needs it:
//! user functions are lowered afresh per call so every interface-typed
//! parameter gets its own solver slot. Opcode-bodied functions are the
//! primitives of the catalog and are never lowered, only emitted.

use std::rc::Rc;

use crate::{
    error::{CompileError, CompileResult},
    ir::Stmt,
    opcode::Opcode,
    peg::Node,
    program::Program,
    scope::ScopeId,
    types::{Builtin, TypeId},
};

/// Handle into [`FnStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FnId(u32);

impl FnId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("function arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FnBody {
    /// A `{ … }` body as parsed; lowered per call site.
    Block(Rc<Node>),
    /// A single-expression body (`fn f(…) = expr;`).
    Expression(Rc<Node>),
    /// A catalog primitive; the emitter writes the opcode name directly.
    Opcode(Opcode),
}

#[derive(Debug, Clone)]
pub(crate) struct Function {
    pub name: Option<String>,
    /// Scope the function was declared in; bodies resolve names against it.
    pub scope: ScopeId,
    pub params: Vec<(String, TypeId)>,
    /// Declared return type, if any. Undeclared returns are inferred from
    /// the body at inline time.
    pub ret: Option<TypeId>,
    pub body: FnBody,
}

#[derive(Debug, Default)]
pub(crate) struct FnStore {
    fns: Vec<Function>,
}

impl FnStore {
    pub fn add(&mut self, f: Function) -> FnId {
        let id = FnId::new(self.fns.len());
        self.fns.push(f);
        id
    }

    pub fn get(&self, id: FnId) -> &Function {
        &self.fns[id.index()]
    }
}

/// Handle into [`OpStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OpId(u32);

impl OpId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("operator arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One operator mapping: a symbol at a fixity and precedence, backed by the
/// overload set of a named function. Mappings for the same symbol merge
/// their candidate sets during resolution.
#[derive(Debug, Clone)]
pub(crate) struct OperatorDef {
    pub symbol: String,
    pub precedence: u32,
    pub prefix: bool,
    pub fns: Vec<FnId>,
}

#[derive(Debug, Default)]
pub(crate) struct OpStore {
    ops: Vec<OperatorDef>,
}

impl OpStore {
    pub fn add(&mut self, op: OperatorDef) -> OpId {
        let id = OpId::new(self.ops.len());
        self.ops.push(op);
        id
    }

    pub fn get(&self, id: OpId) -> &OperatorDef {
        &self.ops[id.index()]
    }
}

/// Handle into [`EventStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EventId(u32);

impl EventId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("event arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A handler attached to an event: a candidate set until payload checking
/// selects exactly one function, then the lowered body after compilation.
#[derive(Debug)]
pub(crate) struct Handler {
    pub candidates: Vec<FnId>,
    pub selected: Option<FnId>,
    /// Parameter variable names and types of the selected function, for the
    /// `on <event> fn (<params>)` header.
    pub params: Vec<(String, TypeId)>,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub(crate) struct Event {
    pub name: String,
    /// Name used in emitted AMM (`start` emits as `_start`).
    pub amm_name: String,
    pub payload: TypeId,
    /// Runtime-defined events (`start`, `exit`) emit no `event` line.
    pub runtime: bool,
    pub handlers: Vec<Handler>,
}

#[derive(Debug, Default)]
pub(crate) struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn add(&mut self, event: Event) -> EventId {
        let id = EventId::new(self.events.len());
        self.events.push(event);
        id
    }

    pub fn get(&self, id: EventId) -> &Event {
        &self.events[id.index()]
    }

    pub fn get_mut(&mut self, id: EventId) -> &mut Event {
        &mut self.events[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = EventId> {
        (0..self.events.len()).map(EventId::new)
    }
}

/// Handle into [`ConstStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConstId(u32);

impl ConstId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("const arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A module-level constant. The expression is lowered at each use site, the
/// same way a zero-parameter function is inlined.
#[derive(Debug, Clone)]
pub(crate) struct ModConst {
    pub name: String,
    pub scope: ScopeId,
    pub decl_type: Option<TypeId>,
    pub expr: Rc<Node>,
}

#[derive(Debug, Default)]
pub(crate) struct ConstStore {
    consts: Vec<ModConst>,
}

impl ConstStore {
    pub fn add(&mut self, c: ModConst) -> ConstId {
        let id = ConstId::new(self.consts.len());
        self.consts.push(c);
        id
    }

    pub fn get(&self, id: ConstId) -> &ModConst {
        &self.consts[id.index()]
    }
}

/// Selects the concrete function for every attached handler.
///
/// A void payload keeps only zero-parameter candidates; any other payload
/// requires exactly one parameter the payload can bind to (probed with a
/// scoped constraint that is rolled back). Exactly one candidate must
/// survive.
pub(crate) fn check_event_handlers(prog: &mut Program) -> CompileResult<()> {
    let void = prog.types.builtin(Builtin::Void);
    let event_ids: Vec<EventId> = prog.events.ids().collect();
    for eid in event_ids {
        let payload = prog.events.get(eid).payload;
        let payload_is_void = prog.types.eq(payload, void);
        for idx in 0..prog.events.get(eid).handlers.len() {
            let candidates = prog.events.get(eid).handlers[idx].candidates.clone();
            let mut surviving = Vec::new();
            for f in candidates {
                let func = prog.fns.get(f);
                let ok = if payload_is_void {
                    func.params.is_empty()
                } else if func.params.len() == 1 {
                    let param = func.params[0].1;
                    let bindable = prog.types.temp_constrain(param, payload).is_ok();
                    prog.types.reset_temp();
                    bindable
                } else {
                    false
                };
                if ok {
                    surviving.push(f);
                }
            }
            if surviving.len() != 1 {
                let event = prog.events.get(eid);
                return Err(CompileError::type_error(
                    format!(
                        "Unable to select a handler for event {}: {} candidate(s) match the {} payload",
                        event.name,
                        surviving.len(),
                        prog.types.display(payload),
                    ),
                    None,
                ));
            }
            let selected = surviving[0];
            let params = prog.fns.get(selected).params.clone();
            let handler = &mut prog.events.get_mut(eid).handlers[idx];
            handler.selected = Some(selected);
            handler.params = params;
        }
    }
    Ok(())
}
