//! Ordered name→binding tables with parent chains.
//!
//! A scope has a primary parent and an optional secondary parent (std
//! modules use the secondary slot to see the root std exports and the
//! opcode catalog). Function and operator sets accumulate on insert rather
//! than shadowing; every other binding is unique per name.

use indexmap::IndexMap;

use crate::{
    function::{ConstId, EventId, FnId, OpId},
    types::TypeId,
};

/// Handle into [`ScopeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ScopeId(u32);

impl ScopeId {
    pub fn new(index: usize) -> Self {
        Self(index.try_into().expect("scope arena overflow"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Type(TypeId),
    Interface(TypeId),
    Const(ConstId),
    Event(EventId),
    Fns(Vec<FnId>),
    Operators(Vec<OpId>),
    /// A foreign module's export scope bound under a local name.
    Module(ScopeId),
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    secondary: Option<ScopeId>,
    bindings: IndexMap<String, Binding>,
}

#[derive(Debug, Default)]
pub(crate) struct ScopeStore {
    scopes: Vec<Scope>,
}

impl ScopeStore {
    pub fn add(&mut self, parent: Option<ScopeId>, secondary: Option<ScopeId>) -> ScopeId {
        let id = ScopeId::new(self.scopes.len());
        self.scopes.push(Scope {
            parent,
            secondary,
            bindings: IndexMap::new(),
        });
        id
    }

    /// Inserts a binding. Function and operator sets merge with an existing
    /// set of the same name, preserving definition order (already-present
    /// members are not duplicated); anything else replaces a previous
    /// binding.
    pub fn put(&mut self, scope: ScopeId, name: &str, binding: Binding) {
        let bindings = &mut self.scopes[scope.index()].bindings;
        match (bindings.get_mut(name), binding) {
            (Some(Binding::Fns(existing)), Binding::Fns(new)) => {
                for f in new {
                    if !existing.contains(&f) {
                        existing.push(f);
                    }
                }
            }
            (Some(Binding::Operators(existing)), Binding::Operators(new)) => {
                for op in new {
                    if !existing.contains(&op) {
                        existing.push(op);
                    }
                }
            }
            (_, binding) => {
                bindings.insert(name.to_string(), binding);
            }
        }
    }

    /// Looks only at the scope's own table.
    pub fn shallow_get(&self, scope: ScopeId, name: &str) -> Option<&Binding> {
        self.scopes[scope.index()].bindings.get(name)
    }

    /// Walks this scope, then the primary parent chain, then the secondary.
    pub fn get(&self, scope: ScopeId, name: &str) -> Option<&Binding> {
        let s = &self.scopes[scope.index()];
        if let Some(b) = s.bindings.get(name) {
            return Some(b);
        }
        if let Some(parent) = s.parent {
            if let Some(b) = self.get(parent, name) {
                return Some(b);
            }
        }
        s.secondary.and_then(|sec| self.get(sec, name))
    }

    pub fn has(&self, scope: ScopeId, name: &str) -> bool {
        self.get(scope, name).is_some()
    }

    /// Resolves a dotted path, descending into nested module scopes with
    /// shallow lookups so only exported names are visible through a module
    /// reference.
    pub fn deep_get(&self, scope: ScopeId, path: &str) -> Option<&Binding> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut binding = self.get(scope, first)?;
        for segment in segments {
            let Binding::Module(inner) = binding else {
                return None;
            };
            binding = self.shallow_get(*inner, segment)?;
        }
        Some(binding)
    }

    /// Collects the full overload set for a function name across the scope
    /// chain, outermost first, so reverse-order selection prefers the most
    /// local, most recent definition.
    pub fn functions(&self, scope: ScopeId, name: &str) -> Vec<FnId> {
        let mut out = Vec::new();
        self.collect_fns(scope, name, &mut out);
        out
    }

    fn collect_fns(&self, scope: ScopeId, name: &str, out: &mut Vec<FnId>) {
        let s = &self.scopes[scope.index()];
        if let Some(parent) = s.parent {
            self.collect_fns(parent, name, out);
        }
        if let Some(secondary) = s.secondary {
            self.collect_fns(secondary, name, out);
        }
        if let Some(Binding::Fns(fns)) = s.bindings.get(name) {
            for f in fns {
                if !out.contains(f) {
                    out.push(*f);
                }
            }
        }
    }

    /// Collects every operator mapping for a symbol across the scope chain,
    /// outermost first.
    pub fn operators(&self, scope: ScopeId, symbol: &str) -> Vec<OpId> {
        let mut out = Vec::new();
        self.collect_ops(scope, symbol, &mut out);
        out
    }

    fn collect_ops(&self, scope: ScopeId, symbol: &str, out: &mut Vec<OpId>) {
        let s = &self.scopes[scope.index()];
        if let Some(parent) = s.parent {
            self.collect_ops(parent, symbol, out);
        }
        if let Some(secondary) = s.secondary {
            self.collect_ops(secondary, symbol, out);
        }
        if let Some(Binding::Operators(ops)) = s.bindings.get(symbol) {
            for op in ops {
                if !out.contains(op) {
                    out.push(*op);
                }
            }
        }
    }

    /// Iterates a scope's own bindings in definition order.
    pub fn iter(&self, scope: ScopeId) -> impl Iterator<Item = (&String, &Binding)> {
        self.scopes[scope.index()].bindings.iter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::TypeId;

    #[test]
    fn get_walks_parent_then_secondary() {
        let mut scopes = ScopeStore::default();
        let grandparent = scopes.add(None, None);
        let secondary = scopes.add(None, None);
        let parent = scopes.add(Some(grandparent), None);
        let child = scopes.add(Some(parent), Some(secondary));

        scopes.put(grandparent, "a", Binding::Type(TypeId::new(1)));
        scopes.put(secondary, "b", Binding::Type(TypeId::new(2)));
        scopes.put(child, "c", Binding::Type(TypeId::new(3)));

        assert!(scopes.get(child, "a").is_some());
        assert!(scopes.get(child, "b").is_some());
        assert!(scopes.get(child, "c").is_some());
        assert!(scopes.shallow_get(child, "a").is_none());
        assert!(!scopes.has(child, "d"));
    }

    #[test]
    fn function_sets_merge_in_definition_order() {
        let mut scopes = ScopeStore::default();
        let s = scopes.add(None, None);
        scopes.put(s, "f", Binding::Fns(vec![FnId::new(0)]));
        scopes.put(s, "f", Binding::Fns(vec![FnId::new(1), FnId::new(2)]));
        let Some(Binding::Fns(fns)) = scopes.shallow_get(s, "f") else {
            panic!("expected a function set");
        };
        assert_eq!(fns.len(), 3);
        assert_eq!(fns[0], FnId::new(0));
        assert_eq!(fns[2], FnId::new(2));
    }

    #[test]
    fn overloads_collect_outermost_first() {
        let mut scopes = ScopeStore::default();
        let outer = scopes.add(None, None);
        let inner = scopes.add(Some(outer), None);
        scopes.put(outer, "f", Binding::Fns(vec![FnId::new(0)]));
        scopes.put(inner, "f", Binding::Fns(vec![FnId::new(1)]));
        assert_eq!(scopes.functions(inner, "f"), vec![FnId::new(0), FnId::new(1)]);
    }

    #[test]
    fn deep_get_descends_modules_shallowly() {
        let mut scopes = ScopeStore::default();
        let module = scopes.add(None, None);
        let exports = scopes.add(Some(module), None);
        scopes.put(module, "hidden", Binding::Type(TypeId::new(1)));
        scopes.put(exports, "visible", Binding::Type(TypeId::new(2)));

        let user = scopes.add(None, None);
        scopes.put(user, "app", Binding::Module(exports));

        assert!(scopes.deep_get(user, "app.visible").is_some());
        assert!(scopes.deep_get(user, "app.hidden").is_none());
        assert!(scopes.deep_get(user, "app").is_some());
    }
}
