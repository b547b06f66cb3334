//! The whole-compilation state: every arena, the module registry, and the
//! scope wiring between the opcode catalog, the std root, and user modules.

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{
    function::{ConstStore, EventId, EventStore, FnStore, OpStore},
    ir::{ClosStore, NameGen, VarStore},
    opcode,
    scope::{ScopeId, ScopeStore},
    types::{TypeId, TypeKind, TypeStore},
};

/// A loaded module, registered by its export scope (whose parent is the
/// module's full scope).
#[derive(Debug, Clone)]
pub(crate) struct ModuleInfo {
    pub exports: ScopeId,
}

/// Owns all compilation state. Single-threaded by design: types carry
/// internal inference state and are mutated freely through the arenas.
pub(crate) struct Program {
    pub types: TypeStore,
    pub scopes: ScopeStore,
    pub fns: FnStore,
    pub ops: OpStore,
    pub events: EventStore,
    pub consts: ConstStore,
    pub vars: VarStore,
    pub closures: ClosStore,
    pub r#gen: NameGen,
    /// Keyed by canonical module id (`@std/app` or the resolved file path),
    /// in load order.
    pub modules: IndexMap<String, ModuleInfo>,
    /// Builtin type names; parent of every module scope.
    pub root_scope: ScopeId,
    /// The opcode catalog; secondary parent of std module scopes only.
    pub opcode_scope: ScopeId,
    /// Builtins plus the std root exports; parent of user module scopes.
    /// Set once the std root module has loaded.
    pub user_root_scope: ScopeId,
    pub start_event: EventId,
    pub exit_event: EventId,
    pub opcode_names: AHashSet<String>,
}

impl Program {
    pub fn new() -> Self {
        let mut types = TypeStore::new();
        let mut scopes = ScopeStore::default();
        let mut fns = FnStore::default();
        let mut events = EventStore::default();
        let seeded = opcode::seed(&mut types, &mut scopes, &mut fns, &mut events);
        let user_root_scope = scopes.add(Some(seeded.root_scope), None);
        Self {
            types,
            scopes,
            fns,
            ops: OpStore::default(),
            events,
            consts: ConstStore::default(),
            vars: VarStore::default(),
            closures: ClosStore::default(),
            r#gen: NameGen::default(),
            modules: IndexMap::new(),
            root_scope: seeded.root_scope,
            opcode_scope: seeded.opcode_scope,
            user_root_scope,
            start_event: seeded.start_event,
            exit_event: seeded.exit_event,
            opcode_names: seeded.opcode_names,
        }
    }

    /// Copies the std root module's exports into the scope every user module
    /// inherits from. Users get the std surface without the opcode catalog
    /// behind it.
    pub fn publish_std_root(&mut self, exports: ScopeId) {
        let bindings: Vec<(String, crate::scope::Binding)> = self
            .scopes
            .iter(exports)
            .map(|(name, binding)| (name.clone(), binding.clone()))
            .collect();
        for (name, binding) in bindings {
            self.scopes.put(self.user_root_scope, &name, binding);
        }
    }

    /// Whether `candidate` (a concrete type) satisfies every requirement of
    /// the interface, judged against the function and operator sets visible
    /// from `scope`. Occurrences of the interface's own id in requirement
    /// signatures stand for the candidate.
    pub fn interface_satisfied(&self, iface: TypeId, candidate: TypeId, scope: ScopeId) -> bool {
        let iface = self.types.resolve(iface);
        let TypeKind::Interface { props, fns, ops, .. } = self.types.kind(iface) else {
            return false;
        };

        for (prop, want) in props {
            let TypeKind::Struct { fields, .. } = self.types.kind(self.types.resolve(candidate)) else {
                return false;
            };
            let Some(&have) = fields.get(prop) else {
                return false;
            };
            let want = if *want == iface { candidate } else { *want };
            if !self.types.eq(have, want) {
                return false;
            }
        }

        for req in fns {
            let params: Vec<TypeId> = req
                .params
                .iter()
                .map(|&p| if p == iface { candidate } else { p })
                .collect();
            let ret = if req.ret == iface { candidate } else { req.ret };
            let overloads = self.scopes.functions(scope, &req.name);
            let satisfied = overloads.iter().any(|&f| {
                let f = self.fns.get(f);
                f.params.len() == params.len()
                    && f.params
                        .iter()
                        .zip(&params)
                        .all(|((_, decl), want)| self.types.compatible(*decl, *want))
                    && f.ret.is_none_or(|r| self.types.compatible(r, ret))
            });
            if !satisfied {
                return false;
            }
        }

        for req in ops {
            let params: Vec<TypeId> = req
                .params
                .iter()
                .map(|&p| if p == iface { candidate } else { p })
                .collect();
            let mappings = self.scopes.operators(scope, &req.symbol);
            let satisfied = mappings.iter().any(|&op| {
                let op = self.ops.get(op);
                op.symbol == req.symbol
                    && op.prefix == req.prefix
                    && op.fns.iter().any(|&f| {
                        let f = self.fns.get(f);
                        f.params.len() == params.len()
                            && f.params
                                .iter()
                                .zip(&params)
                                .all(|((_, decl), want)| self.types.compatible(*decl, *want))
                    })
            });
            if !satisfied {
                return false;
            }
        }

        true
    }

    /// Probe used during overload filtering: could an argument of the
    /// current type bind to this declared parameter type?
    pub fn arg_accepts(&self, param: TypeId, arg: TypeId, scope: ScopeId) -> bool {
        let param = self.types.resolve(param);
        match self.types.kind(param) {
            TypeKind::Interface { .. } => match self.types.instance(arg) {
                Ok(instance) => self.interface_satisfied(param, instance, scope),
                // an undecided argument might still narrow to a satisfying
                // candidate
                Err(_) => match self.types.kind(self.types.resolve(arg)) {
                    TypeKind::OneOf { candidates } => candidates
                        .iter()
                        .any(|&c| self.interface_satisfied(param, c, scope)),
                    TypeKind::Generated { .. } => true,
                    _ => false,
                },
            },
            _ => self.types.compatible(param, arg),
        }
    }

    /// Final acceptance check at selection time, when the argument has a
    /// concrete instance type.
    pub fn accepts_instance(&self, param: TypeId, arg_instance: TypeId, scope: ScopeId) -> bool {
        let param = self.types.resolve(param);
        match self.types.kind(param) {
            TypeKind::Interface { .. } => self.interface_satisfied(param, arg_instance, scope),
            _ => self.types.eq(param, arg_instance),
        }
    }
}
