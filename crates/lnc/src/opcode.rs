//! The opcode catalog: primitive types, runtime events, and the atomic
//! operations the AMM consumer understands.
//!
//! The catalog is seeded once per [`Program`](crate::program::Program) into
//! a dedicated scope. Opcode names, parameter order, and return types are
//! the contract with the downstream assembler; changing any entry breaks
//! already-emitted AMM.

use ahash::AHashSet;

use crate::{
    function::{Event, EventId, EventStore, FnBody, FnStore, Function},
    scope::{Binding, ScopeId, ScopeStore},
    types::{Builtin, TypeStore},
};

/// The name of a catalog primitive, written verbatim into AMM output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Opcode(pub String);

/// Handles produced by seeding the catalog.
pub(crate) struct Seeded {
    /// Scope holding every opcode as a single-function set. Only std module
    /// scopes chain to it.
    pub opcode_scope: ScopeId,
    /// Scope holding the primitive type names; every module chains to it.
    pub root_scope: ScopeId,
    pub start_event: EventId,
    pub exit_event: EventId,
    /// All opcode names, for the misuse diagnostic on user code.
    pub opcode_names: AHashSet<String>,
}

const NUMERIC: [(&str, Builtin); 6] = [
    ("i8", Builtin::Int8),
    ("i16", Builtin::Int16),
    ("i32", Builtin::Int32),
    ("i64", Builtin::Int64),
    ("f32", Builtin::Float32),
    ("f64", Builtin::Float64),
];

const INTEGER: [(&str, Builtin); 4] = [
    ("i8", Builtin::Int8),
    ("i16", Builtin::Int16),
    ("i32", Builtin::Int32),
    ("i64", Builtin::Int64),
];

/// Seeds primitive type bindings, the runtime events, and the opcode table.
pub(crate) fn seed(
    types: &mut TypeStore,
    scopes: &mut ScopeStore,
    fns: &mut FnStore,
    events: &mut EventStore,
) -> Seeded {
    let root_scope = scopes.add(None, None);
    for b in Builtin::ALL {
        if b == Builtin::Function {
            continue;
        }
        scopes.put(root_scope, &b.to_string(), Binding::Type(types.builtin(b)));
    }

    let start_event = events.add(Event {
        name: "start".to_string(),
        amm_name: "_start".to_string(),
        payload: types.builtin(Builtin::Void),
        runtime: true,
        handlers: Vec::new(),
    });
    let exit_event = events.add(Event {
        name: "exit".to_string(),
        amm_name: "exit".to_string(),
        payload: types.builtin(Builtin::Int8),
        runtime: true,
        handlers: Vec::new(),
    });

    let opcode_scope = scopes.add(None, None);
    scopes.put(opcode_scope, "start", Binding::Event(start_event));
    scopes.put(opcode_scope, "exit", Binding::Event(exit_event));

    let mut opcode_names = AHashSet::new();
    let mut def = |name: String, params: &[Builtin], ret: Builtin| {
        let params = params
            .iter()
            .enumerate()
            .map(|(i, b)| (format!("a{i}"), types.builtin(*b)))
            .collect();
        let id = fns.add(Function {
            name: Some(name.clone()),
            scope: opcode_scope,
            params,
            ret: Some(types.builtin(ret)),
            body: FnBody::Opcode(Opcode(name.clone())),
        });
        scopes.put(opcode_scope, &name, Binding::Fns(vec![id]));
        opcode_names.insert(name);
    };

    // numeric conversions
    for (s1, t1) in NUMERIC {
        for (s2, t2) in NUMERIC {
            if s1 != s2 {
                def(format!("{s1}{s2}"), &[t1], t2);
            }
        }
    }
    for (s, t) in NUMERIC {
        def(format!("{s}str"), &[t], Builtin::Str);
        def(format!("str{s}"), &[Builtin::Str], t);
    }
    def("boolstr".to_string(), &[Builtin::Bool], Builtin::Str);

    // arithmetic, saturating arithmetic, negation, absolute value
    for op in ["add", "sub", "mul", "div", "mod", "pow"] {
        for (s, t) in NUMERIC {
            def(format!("{op}{s}"), &[t, t], t);
        }
    }
    for op in ["sadd", "ssub", "smul", "sdiv"] {
        for (s, t) in NUMERIC {
            def(format!("{op}{s}"), &[t, t], t);
        }
    }
    for (s, t) in NUMERIC {
        def(format!("neg{s}"), &[t], t);
        def(format!("abs{s}"), &[t], t);
    }

    // comparisons
    for op in ["eq", "neq", "lt", "lte", "gt", "gte"] {
        for (s, t) in NUMERIC {
            def(format!("{op}{s}"), &[t, t], Builtin::Bool);
        }
        def(format!("{op}str"), &[Builtin::Str, Builtin::Str], Builtin::Bool);
    }
    def("eqbool".to_string(), &[Builtin::Bool, Builtin::Bool], Builtin::Bool);
    def("neqbool".to_string(), &[Builtin::Bool, Builtin::Bool], Builtin::Bool);

    // boolean and bitwise
    for op in ["and", "or", "xor"] {
        def(format!("{op}bool"), &[Builtin::Bool, Builtin::Bool], Builtin::Bool);
        for (s, t) in INTEGER {
            def(format!("{op}{s}"), &[t, t], t);
        }
    }
    def("notbool".to_string(), &[Builtin::Bool], Builtin::Bool);
    for (s, t) in INTEGER {
        def(format!("not{s}"), &[t], t);
        def(format!("shl{s}"), &[t, t], t);
        def(format!("shr{s}"), &[t, t], t);
    }

    // strings
    def("catstr".to_string(), &[Builtin::Str, Builtin::Str], Builtin::Str);
    def("lenstr".to_string(), &[Builtin::Str], Builtin::Int64);
    def("repstr".to_string(), &[Builtin::Str, Builtin::Int64], Builtin::Str);
    def("matches".to_string(), &[Builtin::Str, Builtin::Str], Builtin::Bool);
    def("indstr".to_string(), &[Builtin::Str, Builtin::Str], Builtin::Int64);
    def("trim".to_string(), &[Builtin::Str], Builtin::Str);

    // arrays and maps
    // TODO: give the array-valued slots real types once array literals land
    // in the surface language; until then they are typed void and are not
    // reachable from Ln source.
    def("newarr".to_string(), &[], Builtin::Void);
    def("pusharr".to_string(), &[Builtin::Void, Builtin::Void], Builtin::Void);
    def("poparr".to_string(), &[Builtin::Void], Builtin::Void);
    def("lenarr".to_string(), &[Builtin::Void], Builtin::Int64);
    def("indexarr".to_string(), &[Builtin::Void, Builtin::Int64], Builtin::Void);
    def("hasarr".to_string(), &[Builtin::Void, Builtin::Void], Builtin::Bool);
    def("joinarr".to_string(), &[Builtin::Void, Builtin::Str], Builtin::Str);
    def("splitstr".to_string(), &[Builtin::Str, Builtin::Str], Builtin::Void);
    def("copyfrom".to_string(), &[Builtin::Void, Builtin::Int64], Builtin::Void);
    def("newmap".to_string(), &[], Builtin::Void);
    def("keymap".to_string(), &[Builtin::Void], Builtin::Void);
    def("valmap".to_string(), &[Builtin::Void], Builtin::Void);
    def("lenmap".to_string(), &[Builtin::Void], Builtin::Int64);

    // io
    def("stdoutp".to_string(), &[Builtin::Str], Builtin::Void);
    def("stderrp".to_string(), &[Builtin::Str], Builtin::Void);
    def("exitop".to_string(), &[Builtin::Int8], Builtin::Void);

    // control
    def("condfn".to_string(), &[Builtin::Bool, Builtin::Function], Builtin::Void);
    def("execcond".to_string(), &[Builtin::Void, Builtin::Void], Builtin::Void);
    def("seqnext".to_string(), &[Builtin::Void], Builtin::Void);
    def("recurse".to_string(), &[Builtin::Function, Builtin::Void], Builtin::Void);

    // copies
    for (s, t) in NUMERIC {
        def(format!("copy{s}"), &[t], t);
    }
    def("copybool".to_string(), &[Builtin::Bool], Builtin::Bool);
    def("copystr".to_string(), &[Builtin::Str], Builtin::Str);

    Seeded {
        opcode_scope,
        root_scope,
        start_event,
        exit_event,
        opcode_names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_contains_the_fixed_entries() {
        let mut types = TypeStore::new();
        let mut scopes = ScopeStore::default();
        let mut fns = FnStore::default();
        let mut events = EventStore::default();
        let seeded = seed(&mut types, &mut scopes, &mut fns, &mut events);

        for name in ["addi64", "catstr", "i64str", "exitop", "condfn", "execcond", "copyi8", "saddf32"] {
            assert!(seeded.opcode_names.contains(name), "missing opcode {name}");
            assert!(scopes.get(seeded.opcode_scope, name).is_some());
        }
        assert!(!seeded.opcode_names.contains("addbool"));
        assert_eq!(events.get(seeded.start_event).amm_name, "_start");
        assert!(events.get(seeded.exit_event).runtime);
    }
}
