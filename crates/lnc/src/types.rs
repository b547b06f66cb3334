//! Nominal types, interfaces, and the inference machinery.
//!
//! All types live in a single [`TypeStore`] arena and are addressed by
//! [`TypeId`]. Scopes, functions, events, statements and expressions hold
//! ids, never owned types, so a constraint applied anywhere propagates
//! everywhere. Inference state is carried by two variants: `Generated` (a
//! fresh inference variable, optionally bounded by an interface) and `OneOf`
//! (a disjunction of concrete candidates that only ever narrows).

use indexmap::IndexMap;
use strum::{Display, EnumString, IntoStaticStr};

/// Handle into the [`TypeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TypeId(u32);

impl TypeId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("type arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The primitive types. The string form is the AMM type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Builtin {
    Void,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    #[strum(serialize = "string")]
    Str,
    /// Closure references passed to `condfn`. Internal: never a field or
    /// declaration type in emitted AMM.
    Function,
}

impl Builtin {
    pub const ALL: [Self; 10] = [
        Self::Void,
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::Float32,
        Self::Float64,
        Self::Bool,
        Self::Str,
        Self::Function,
    ];

    /// Literal/opcode suffix for this type (`0i8`, `copystr`, …).
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Self::Int8 => Some("i8"),
            Self::Int16 => Some("i16"),
            Self::Int32 => Some("i32"),
            Self::Int64 => Some("i64"),
            Self::Float32 => Some("f32"),
            Self::Float64 => Some("f64"),
            Self::Bool => Some("bool"),
            Self::Str => Some("str"),
            Self::Void | Self::Function => None,
        }
    }

    /// Whether an `int64`-range literal value fits this type.
    pub fn fits(self, value: i64) -> bool {
        match self {
            Self::Int8 => i8::try_from(value).is_ok(),
            Self::Int16 => i16::try_from(value).is_ok(),
            Self::Int32 => i32::try_from(value).is_ok(),
            _ => true,
        }
    }
}

/// A function-signature requirement inside an interface.
///
/// Occurrences of the interface's own id in `params`/`ret` stand for the
/// candidate type under test ("self").
#[derive(Debug, Clone)]
pub(crate) struct FnReq {
    pub name: String,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
}

/// An operator requirement inside an interface.
#[derive(Debug, Clone)]
pub(crate) struct OpReq {
    pub symbol: String,
    pub prefix: bool,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
}

#[derive(Debug, Clone)]
pub(crate) enum TypeKind {
    Builtin(Builtin),
    Struct {
        name: String,
        fields: IndexMap<String, TypeId>,
        /// Generic parameter names for templates; empty once instantiated.
        generics: Vec<String>,
    },
    /// `type Alias = Target`: forwards every operation to the target, so the
    /// alias is observationally identical to it.
    Alias { name: String, target: TypeId },
    Interface {
        name: String,
        props: Vec<(String, TypeId)>,
        fns: Vec<FnReq>,
        ops: Vec<OpReq>,
    },
    /// A generic parameter inside a struct template body.
    TypeVar(String),
    /// Fresh inference variable. `iface` is the interface bound it was
    /// duplicated from, if any; `constraint` the upstream type once known.
    Generated {
        iface: Option<TypeId>,
        constraint: Option<TypeId>,
    },
    /// Disjunction of concrete candidates; narrows monotonically and
    /// collapses once a single survivor remains.
    OneOf { candidates: Vec<TypeId> },
}

struct TypeEntry {
    kind: TypeKind,
}

/// The type arena. See the module docs for the sharing model.
pub(crate) struct TypeStore {
    entries: Vec<TypeEntry>,
    builtin_ids: [TypeId; Builtin::ALL.len()],
    /// Undo log for scoped (temporary) constraints: (id, kind before the
    /// first temp mutation). Populated only between `begin_temp` and
    /// `reset_temp`/`commit_temp`.
    temp_log: Option<Vec<(TypeId, TypeKind)>>,
}

impl TypeStore {
    pub fn new() -> Self {
        let mut store = Self {
            entries: Vec::new(),
            builtin_ids: [TypeId(0); Builtin::ALL.len()],
            temp_log: None,
        };
        for (i, b) in Builtin::ALL.iter().enumerate() {
            store.builtin_ids[i] = store.add(TypeKind::Builtin(*b));
        }
        store
    }

    pub fn add(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId::new(self.entries.len());
        self.entries.push(TypeEntry { kind });
        id
    }

    pub fn builtin(&self, b: Builtin) -> TypeId {
        self.builtin_ids[Builtin::ALL.iter().position(|x| *x == b).expect("known builtin")]
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.entries[id.index()].kind
    }

    /// Overwrites a pre-registered entry; used to fill an interface after
    /// its self-referencing requirement lines are resolved.
    pub fn replace(&mut self, id: TypeId, kind: TypeKind) {
        self.entries[id.index()].kind = kind;
    }

    fn set_kind(&mut self, id: TypeId, kind: TypeKind) {
        if let Some(log) = &mut self.temp_log {
            if !log.iter().any(|(logged, _)| *logged == id) {
                log.push((id, self.entries[id.index()].kind.clone()));
            }
        }
        self.entries[id.index()].kind = kind;
    }

    /// Starts a scoped-constraint section; mutations are recorded until
    /// `reset_temp` rolls them back or `commit_temp` keeps them.
    pub fn begin_temp(&mut self) {
        debug_assert!(self.temp_log.is_none(), "nested temp constraint sections");
        self.temp_log = Some(Vec::new());
    }

    /// Rolls back every mutation since `begin_temp`.
    pub fn reset_temp(&mut self) {
        if let Some(log) = self.temp_log.take() {
            for (id, kind) in log.into_iter().rev() {
                self.entries[id.index()].kind = kind;
            }
        }
    }

    /// Follows aliases, solved inference variables, and single-candidate
    /// OneOfs to the representative type.
    pub fn resolve(&self, id: TypeId) -> TypeId {
        let mut current = id;
        // constraint chains are acyclic by construction; the fuel guard only
        // protects against arena corruption
        for _ in 0..self.entries.len() + 1 {
            match self.kind(current) {
                TypeKind::Alias { target, .. } => current = *target,
                TypeKind::Generated {
                    constraint: Some(c), ..
                } => current = *c,
                TypeKind::OneOf { candidates } if candidates.len() == 1 => current = candidates[0],
                _ => return current,
            }
        }
        current
    }

    /// Structural equality on the resolved types.
    pub fn eq(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return true;
        }
        match (self.kind(a), self.kind(b)) {
            (TypeKind::Builtin(x), TypeKind::Builtin(y)) => x == y,
            (
                TypeKind::Struct {
                    name: na, fields: fa, ..
                },
                TypeKind::Struct {
                    name: nb, fields: fb, ..
                },
            ) => {
                na == nb
                    && fa.len() == fb.len()
                    && fa
                        .iter()
                        .zip(fb.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && self.eq(*va, *vb))
            }
            _ => false,
        }
    }

    /// Human-readable name of the current best view of the type, used in
    /// diagnostics like `<bool> == <int64>`.
    pub fn display(&self, id: TypeId) -> String {
        let id = self.resolve(id);
        match self.kind(id) {
            TypeKind::Builtin(b) => b.to_string(),
            TypeKind::Struct { name, .. } | TypeKind::Alias { name, .. } | TypeKind::Interface { name, .. } => {
                name.clone()
            }
            TypeKind::TypeVar(name) => name.clone(),
            TypeKind::Generated { iface, .. } => match iface {
                Some(i) => self.display(*i),
                None => "generated".to_string(),
            },
            TypeKind::OneOf { candidates } => match candidates.last() {
                Some(last) => self.display(*last),
                None => "impossible".to_string(),
            },
        }
    }

    /// The unique concrete (Builtin or Struct) type, once inference can
    /// decide one. A multi-candidate OneOf resolves to its **last**
    /// survivor, which is why bare integer literals default to `int64` and
    /// decimal literals to `float64`.
    pub fn instance(&self, id: TypeId) -> Result<TypeId, String> {
        let id = self.resolve(id);
        match self.kind(id) {
            TypeKind::Builtin(_) | TypeKind::Struct { .. } => Ok(id),
            TypeKind::OneOf { candidates } => match candidates.last() {
                Some(last) => self.instance(*last),
                None => Err("no remaining candidate types".to_string()),
            },
            TypeKind::Generated { iface, .. } => match iface {
                Some(i) => Err(format!("interface {} never bound to a concrete type", self.display(*i))),
                None => Err("type could not be determined".to_string()),
            },
            TypeKind::Interface { name, .. } => Err(format!("interface {name} is not a concrete type")),
            TypeKind::TypeVar(name) => Err(format!("unbound type variable {name}")),
            TypeKind::Alias { .. } => unreachable!("resolve() strips aliases"),
        }
    }

    /// Whether `instance` would currently succeed.
    pub fn has_instance(&self, id: TypeId) -> bool {
        self.instance(id).is_ok()
    }

    /// Duplicates an interface hint into a fresh inference variable so each
    /// call site gets its own solver slot.
    pub fn dup(&mut self, id: TypeId) -> TypeId {
        let resolved = self.resolve(id);
        let kind = self.kind(resolved).clone();
        match kind {
            TypeKind::Interface { .. } => self.add(TypeKind::Generated {
                iface: Some(resolved),
                constraint: None,
            }),
            TypeKind::Generated { iface, constraint } => self.add(TypeKind::Generated { iface, constraint }),
            _ => resolved,
        }
    }

    /// Asserts that `a` must accept `b`, mutating inference state. The
    /// effect is commutative; an impossible combination reports the pair in
    /// the returned message for the caller to wrap with source context.
    pub fn constrain(&mut self, a: TypeId, b: TypeId) -> Result<(), String> {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return Ok(());
        }
        match (self.kind(a).clone(), self.kind(b).clone()) {
            (TypeKind::Generated { constraint: None, iface }, _) => {
                // the interface bound, if any, was checked by the caller
                self.set_kind(a, TypeKind::Generated {
                    iface,
                    constraint: Some(b),
                });
                Ok(())
            }
            (_, TypeKind::Generated { constraint: None, iface }) => {
                self.set_kind(b, TypeKind::Generated {
                    iface,
                    constraint: Some(a),
                });
                Ok(())
            }
            (TypeKind::OneOf { candidates: ca }, TypeKind::OneOf { candidates: cb }) => {
                let merged: Vec<TypeId> = ca.iter().copied().filter(|x| cb.iter().any(|y| self.eq(*x, *y))).collect();
                if merged.is_empty() {
                    return Err(self.mismatch(a, b));
                }
                self.set_kind(a, TypeKind::OneOf {
                    candidates: merged.clone(),
                });
                self.set_kind(b, TypeKind::OneOf { candidates: merged });
                Ok(())
            }
            (TypeKind::OneOf { candidates }, _) => {
                let kept: Vec<TypeId> = candidates.iter().copied().filter(|x| self.eq(*x, b)).collect();
                if kept.is_empty() {
                    return Err(self.mismatch(a, b));
                }
                self.set_kind(a, TypeKind::OneOf { candidates: kept });
                Ok(())
            }
            (_, TypeKind::OneOf { candidates }) => {
                let kept: Vec<TypeId> = candidates.iter().copied().filter(|x| self.eq(*x, a)).collect();
                if kept.is_empty() {
                    return Err(self.mismatch(a, b));
                }
                self.set_kind(b, TypeKind::OneOf { candidates: kept });
                Ok(())
            }
            (TypeKind::Builtin(x), TypeKind::Builtin(y)) => {
                if x == y { Ok(()) } else { Err(self.mismatch(a, b)) }
            }
            (
                TypeKind::Struct {
                    name: na, fields: fa, ..
                },
                TypeKind::Struct {
                    name: nb, fields: fb, ..
                },
            ) => {
                if na != nb {
                    return Err(self.mismatch(a, b));
                }
                let missing: Vec<&String> = fa.keys().filter(|k| !fb.contains_key(*k)).collect();
                let extra: Vec<&String> = fb.keys().filter(|k| !fa.contains_key(*k)).collect();
                if !missing.is_empty() || !extra.is_empty() {
                    let mut msg = format!("{na} fields do not match.");
                    if !missing.is_empty() {
                        msg.push_str(&format!(
                            " Missing fields: {}.",
                            missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                        ));
                    }
                    if !extra.is_empty() {
                        msg.push_str(&format!(
                            " Extra fields: {}.",
                            extra.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                        ));
                    }
                    return Err(msg);
                }
                for (field, ta) in fa {
                    let tb = fb[&field];
                    self.constrain(ta, tb)?;
                }
                Ok(())
            }
            _ => Err(self.mismatch(a, b)),
        }
    }

    /// Scoped variant of [`constrain`]: mutations are rolled back by
    /// [`reset_temp`](Self::reset_temp).
    pub fn temp_constrain(&mut self, a: TypeId, b: TypeId) -> Result<(), String> {
        if self.temp_log.is_none() {
            self.begin_temp();
        }
        self.constrain(a, b)
    }

    /// Boolean probe: could `a` and `b` be constrained together? Never
    /// mutates. Interface bounds are the caller's concern (they need scope
    /// access); an unconstrained inference variable is compatible with
    /// anything.
    pub fn compatible(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return true;
        }
        match (self.kind(a), self.kind(b)) {
            (TypeKind::Generated { .. } | TypeKind::Interface { .. }, _)
            | (_, TypeKind::Generated { .. } | TypeKind::Interface { .. }) => true,
            (TypeKind::OneOf { candidates: ca }, TypeKind::OneOf { candidates: cb }) => {
                ca.iter().any(|x| cb.iter().any(|y| self.eq(*x, *y)))
            }
            (TypeKind::OneOf { candidates }, _) => candidates.iter().any(|x| self.eq(*x, b)),
            (_, TypeKind::OneOf { candidates }) => candidates.iter().any(|x| self.eq(*x, a)),
            _ => self.eq(a, b),
        }
    }

    /// Instantiates a struct template, substituting its type variables with
    /// `args` positionally.
    pub fn instantiate(&mut self, template: TypeId, args: &[TypeId]) -> Result<TypeId, String> {
        let template = self.resolve(template);
        let TypeKind::Struct { name, fields, generics } = self.kind(template).clone() else {
            return Err(format!("{} does not take type arguments", self.display(template)));
        };
        if generics.len() != args.len() {
            return Err(format!(
                "{name} expects {} type argument(s), got {}",
                generics.len(),
                args.len()
            ));
        }
        let mut substituted = IndexMap::new();
        for (field, ty) in fields {
            let ty = self.substitute(ty, &generics, args);
            substituted.insert(field, ty);
        }
        Ok(self.add(TypeKind::Struct {
            name,
            fields: substituted,
            generics: Vec::new(),
        }))
    }

    fn substitute(&mut self, ty: TypeId, names: &[String], args: &[TypeId]) -> TypeId {
        match self.kind(self.resolve(ty)).clone() {
            TypeKind::TypeVar(name) => names
                .iter()
                .position(|n| *n == name)
                .map_or(ty, |i| args[i]),
            TypeKind::Struct { name, fields, generics } if generics.is_empty() => {
                let fields: IndexMap<String, TypeId> = fields
                    .into_iter()
                    .map(|(f, t)| (f, self.substitute(t, names, args)))
                    .collect();
                self.add(TypeKind::Struct {
                    name,
                    fields,
                    generics: Vec::new(),
                })
            }
            _ => ty,
        }
    }

    fn mismatch(&self, a: TypeId, b: TypeId) -> String {
        format!("Cannot constrain {} to {}", self.display(a), self.display(b))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn int_literal(store: &mut TypeStore) -> TypeId {
        let candidates = vec![
            store.builtin(Builtin::Float32),
            store.builtin(Builtin::Float64),
            store.builtin(Builtin::Int8),
            store.builtin(Builtin::Int16),
            store.builtin(Builtin::Int32),
            store.builtin(Builtin::Int64),
        ];
        store.add(TypeKind::OneOf { candidates })
    }

    #[test]
    fn bare_integer_defaults_to_int64() {
        let mut store = TypeStore::new();
        let lit = int_literal(&mut store);
        assert_eq!(store.instance(lit).unwrap(), store.builtin(Builtin::Int64));
    }

    #[test]
    fn narrowing_to_int8_sticks() {
        let mut store = TypeStore::new();
        let lit = int_literal(&mut store);
        let i8ty = store.builtin(Builtin::Int8);
        store.constrain(lit, i8ty).unwrap();
        assert_eq!(store.instance(lit).unwrap(), i8ty);
    }

    #[test]
    fn impossible_narrowing_reports_both_sides() {
        let mut store = TypeStore::new();
        let lit = int_literal(&mut store);
        let boolean = store.builtin(Builtin::Bool);
        let err = store.constrain(lit, boolean).unwrap_err();
        assert!(err.contains("bool"), "got: {err}");
    }

    #[test]
    fn alias_is_transparent() {
        let mut store = TypeStore::new();
        let target = store.builtin(Builtin::Int64);
        let alias = store.add(TypeKind::Alias {
            name: "MyInt".into(),
            target,
        });
        assert!(store.eq(alias, target));
        assert_eq!(store.instance(alias).unwrap(), target);
        let lit = int_literal(&mut store);
        store.constrain(lit, alias).unwrap();
        assert_eq!(store.instance(lit).unwrap(), target);
    }

    #[test]
    fn generated_picks_up_its_constraint() {
        let mut store = TypeStore::new();
        let r#gen = store.add(TypeKind::Generated {
            iface: None,
            constraint: None,
        });
        assert!(store.instance(r#gen).is_err());
        let s = store.builtin(Builtin::Str);
        store.constrain(r#gen, s).unwrap();
        assert_eq!(store.instance(r#gen).unwrap(), s);
    }

    #[test]
    fn temp_constrain_rolls_back() {
        let mut store = TypeStore::new();
        let lit = int_literal(&mut store);
        let i8ty = store.builtin(Builtin::Int8);
        store.begin_temp();
        store.temp_constrain(lit, i8ty).unwrap();
        assert_eq!(store.instance(lit).unwrap(), i8ty);
        store.reset_temp();
        assert_eq!(store.instance(lit).unwrap(), store.builtin(Builtin::Int64));
    }

    #[test]
    fn struct_field_mismatch_lists_fields() {
        let mut store = TypeStore::new();
        let b = store.builtin(Builtin::Bool);
        let i = store.builtin(Builtin::Int64);
        let left = store.add(TypeKind::Struct {
            name: "Piece".into(),
            fields: IndexMap::from([("owner".to_string(), b), ("rank".to_string(), i)]),
            generics: Vec::new(),
        });
        let right = store.add(TypeKind::Struct {
            name: "Piece".into(),
            fields: IndexMap::from([("owner".to_string(), b)]),
            generics: Vec::new(),
        });
        let err = store.constrain(left, right).unwrap_err();
        assert!(err.contains("Missing fields: rank"), "got: {err}");
    }

    #[test]
    fn generic_instantiation_substitutes_fields() {
        let mut store = TypeStore::new();
        let a = store.add(TypeKind::TypeVar("A".into()));
        let template = store.add(TypeKind::Struct {
            name: "Point".into(),
            fields: IndexMap::from([("x".to_string(), a), ("y".to_string(), a)]),
            generics: vec!["A".into()],
        });
        let i = store.builtin(Builtin::Int64);
        let point = store.instantiate(template, &[i]).unwrap();
        let TypeKind::Struct { fields, .. } = store.kind(point) else {
            panic!("expected struct");
        };
        assert_eq!(fields["x"], i);
        assert_eq!(fields["y"], i);
    }

    #[test]
    fn oneof_intersection_narrows_both_sides() {
        let mut store = TypeStore::new();
        let a = int_literal(&mut store);
        let candidates = vec![store.builtin(Builtin::Int8), store.builtin(Builtin::Bool)];
        let b = store.add(TypeKind::OneOf { candidates });
        store.constrain(a, b).unwrap();
        assert_eq!(store.instance(a).unwrap(), store.builtin(Builtin::Int8));
        assert_eq!(store.instance(b).unwrap(), store.builtin(Builtin::Int8));
    }
}
