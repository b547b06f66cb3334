//! The lowered, three-address intermediate form.
//!
//! Every source statement lowers to a sequence of [`Stmt`]s in which call
//! and operator operands are always references to named temporaries. Lowered
//! code is SSA-adjacent: `const` declarations are single-assignment and only
//! `let` variables may be the target of an [`Stmt::Assign`].

use smallvec::SmallVec;

use crate::{
    error::SourceLoc,
    function::{EventId, FnId},
    types::TypeId,
};

/// Handle into [`VarStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct VarId(u32);

impl VarId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("variable arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named value in lowered code: a handler parameter, a user variable, or a
/// generated temporary.
#[derive(Debug)]
pub(crate) struct Var {
    pub name: String,
    pub ty: TypeId,
    pub mutable: bool,
    /// Set when an inlined call bound this variable to the callee's result;
    /// emission and later statements read through the alias.
    pub alias_of: Option<VarId>,
}

#[derive(Debug, Default)]
pub(crate) struct VarStore {
    vars: Vec<Var>,
}

impl VarStore {
    pub fn add(&mut self, name: String, ty: TypeId, mutable: bool) -> VarId {
        let id = VarId::new(self.vars.len());
        self.vars.push(Var {
            name,
            ty,
            mutable,
            alias_of: None,
        });
        id
    }

    pub fn get(&self, id: VarId) -> &Var {
        &self.vars[id.index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id.index()]
    }

    /// Follows alias links to the variable that actually holds the value.
    pub fn resolve(&self, id: VarId) -> VarId {
        let mut current = id;
        while let Some(next) = self.vars[current.index()].alias_of {
            current = next;
        }
        current
    }

    pub fn name(&self, id: VarId) -> &str {
        &self.vars[self.resolve(id).index()].name
    }

    pub fn ty(&self, id: VarId) -> TypeId {
        self.vars[self.resolve(id).index()].ty
    }

    pub fn set_alias(&mut self, id: VarId, target: VarId) {
        debug_assert!(self.vars[id.index()].alias_of.is_none(), "variable aliased twice");
        self.vars[id.index()].alias_of = Some(target);
    }
}

/// A literal constant in lowered code; `value` is the source spelling.
#[derive(Debug, Clone)]
pub(crate) struct ConstVal {
    pub value: String,
    pub ty: TypeId,
}

/// A call pending overload selection and, for user functions, inlining.
#[derive(Debug, Clone)]
pub(crate) struct CallExpr {
    /// Callee name as written, for diagnostics.
    pub name: String,
    /// Overload pool, in definition order. Selection scans in reverse so
    /// later definitions win.
    pub candidates: Vec<FnId>,
    pub args: SmallVec<[VarId; 3]>,
    pub ret: TypeId,
    pub selected: Option<FnId>,
    /// Candidate count the argument-position OneOf constraints were last
    /// applied at; re-applied whenever filtering shrinks the pool.
    pub constrained_at: usize,
    /// Inline ancestry at the call's creation; re-entering a function on
    /// this stack is the recursion error.
    pub stack: Vec<FnId>,
    pub loc: Option<SourceLoc>,
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Ref(VarId),
    Const(ConstVal),
    Call(CallExpr),
    /// Zero value of the variable's eventual instance type. Used to
    /// pre-declare a result slot that conditional branches assign into.
    Default,
}

/// One branch of a lowered conditional: the pair variable holds the
/// `condfn(cond, closure)` result consumed by `execcond`.
#[derive(Debug)]
pub(crate) struct CondBranch {
    pub cond: VarId,
    pub pair_var: VarId,
    pub closure: ClosId,
}

#[derive(Debug)]
pub(crate) enum Stmt {
    Dec {
        var: VarId,
        mutable: bool,
        expr: Expr,
    },
    Assign {
        var: VarId,
        expr: Expr,
    },
    Emit {
        event: EventId,
        arg: Option<VarId>,
    },
    Exit {
        arg: Option<VarId>,
    },
    Cond {
        branches: Vec<CondBranch>,
        exec_var: VarId,
    },
}

/// Handle into [`ClosStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClosId(u32);

impl ClosId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("closure arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A conditional branch body lifted out of its handler. Closures execute in
/// the creating handler's frame, so their statements may reference the
/// handler's temporaries.
#[derive(Debug)]
pub(crate) struct Closure {
    pub name: String,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Default)]
pub(crate) struct ClosStore {
    closures: Vec<Closure>,
}

impl ClosStore {
    pub fn add(&mut self, closure: Closure) -> ClosId {
        let id = ClosId::new(self.closures.len());
        self.closures.push(closure);
        id
    }

    pub fn get(&self, id: ClosId) -> &Closure {
        &self.closures[id.index()]
    }

    pub fn take_body(&mut self, id: ClosId) -> Vec<Stmt> {
        std::mem::take(&mut self.closures[id.index()].body)
    }

    pub fn put_body(&mut self, id: ClosId, body: Vec<Stmt>) {
        self.closures[id.index()].body = body;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Closure> {
        self.closures.iter()
    }

    pub fn len(&self) -> usize {
        self.closures.len()
    }
}

/// Deterministic generated-name source: one monotonic counter per prefix.
#[derive(Debug, Default)]
pub(crate) struct NameGen {
    temps: u64,
    closures: u64,
}

impl NameGen {
    pub fn temp(&mut self) -> String {
        let n = self.temps;
        self.temps += 1;
        format!("_t{n}")
    }

    pub fn closure(&mut self) -> String {
        let n = self.closures;
        self.closures += 1;
        format!("_clos{n}")
    }
}
