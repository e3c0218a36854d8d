//! # Effect Rows
//!
//! An effect row is the set of operations a computation may perform, plus an
//! optional tail variable marking the row as open:
//!
//! ```text
//! {}                        pure
//! {State.get, State.put}    closed
//! {Log.emit | ρ0}           open
//! ```
//!
//! Rows are hash-consed in a [`RowStore`] and referred to by [`RowId`]. The
//! canonical form of a row is its operation list deduplicated by name and
//! sorted by name, plus the tail. Two rows are equal exactly when their ids
//! are equal.
//!
//! Overloads of one operation share a name, so a row records each name once.
//! Handling removes every operation with a handled name.

use std::fmt;

use rill_runtime::ResumeKind;
use rustc_hash::FxHashMap;
use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::hir::DefId;

/// Interned operation label (`Effect.op`).
pub type OpName = DefaultSymbol;

/// A row variable standing for an unknown rest of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowVar(pub u32);

impl fmt::Display for RowVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ρ{}", self.0)
    }
}

/// Handle to an interned row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(u32);

impl RowId {
    /// The empty, closed row.
    pub const PURE: RowId = RowId(0);
}

/// An operation as recorded in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectOp {
    pub name: OpName,
    pub effect: DefId,
    pub kind: ResumeKind,
}

/// Canonical row contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Row {
    ops: Vec<EffectOp>,
    tail: Option<RowVar>,
}

/// Interns rows and operation names.
#[derive(Debug)]
pub struct RowStore {
    names: DefaultStringInterner,
    rows: Vec<Row>,
    index: FxHashMap<Row, RowId>,
    next_var: u32,
}

impl Default for RowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore {
    pub fn new() -> Self {
        let pure = Row {
            ops: Vec::new(),
            tail: None,
        };
        let mut index = FxHashMap::default();
        index.insert(pure.clone(), RowId::PURE);
        Self {
            names: DefaultStringInterner::new(),
            rows: vec![pure],
            index,
            next_var: 0,
        }
    }

    /// Intern an operation label.
    pub fn op(&mut self, label: &str, effect: DefId, kind: ResumeKind) -> EffectOp {
        EffectOp {
            name: self.names.get_or_intern(label),
            effect,
            kind,
        }
    }

    /// The interned symbol for `label`, if any row ever mentioned it.
    pub fn lookup_name(&self, label: &str) -> Option<OpName> {
        self.names.get(label)
    }

    pub fn name(&self, op: OpName) -> &str {
        self.names.resolve(op).unwrap_or("?")
    }

    pub fn fresh_row_var(&mut self) -> RowVar {
        let var = RowVar(self.next_var);
        self.next_var += 1;
        var
    }

    /// Intern a row. Idempotent: the same operations (in any order, with
    /// duplicates) and tail always give the same id.
    pub fn intern(&mut self, ops: impl IntoIterator<Item = EffectOp>, tail: Option<RowVar>) -> RowId {
        let mut ops: Vec<EffectOp> = ops.into_iter().collect();
        let names = &self.names;
        ops.sort_by(|a, b| names.resolve(a.name).cmp(&names.resolve(b.name)));
        ops.dedup_by(|a, b| a.name == b.name);
        let row = Row { ops, tail };
        if let Some(id) = self.index.get(&row) {
            return *id;
        }
        let id = RowId(self.rows.len() as u32);
        self.rows.push(row.clone());
        self.index.insert(row, id);
        id
    }

    fn row(&self, id: RowId) -> &Row {
        &self.rows[id.0 as usize]
    }

    pub fn ops(&self, id: RowId) -> &[EffectOp] {
        &self.row(id).ops
    }

    pub fn tail(&self, id: RowId) -> Option<RowVar> {
        self.row(id).tail
    }

    /// Union of rows. The result is open if any input is open; when several
    /// are, the smallest variable is kept so composition is commutative.
    pub fn compose(&mut self, rows: &[RowId]) -> RowId {
        match rows {
            [] => RowId::PURE,
            [single] => *single,
            _ => {
                let mut ops = Vec::new();
                let mut tail: Option<RowVar> = None;
                for id in rows {
                    let row = self.row(*id);
                    ops.extend_from_slice(&row.ops);
                    tail = match (tail, row.tail) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                self.intern(ops, tail)
            }
        }
    }

    /// Remove every operation named `name`, keeping the tail.
    pub fn drop(&mut self, id: RowId, name: OpName) -> RowId {
        self.drop_all(id, &[name])
    }

    pub fn drop_all(&mut self, id: RowId, names: &[OpName]) -> RowId {
        let row = self.row(id);
        if !row.ops.iter().any(|op| names.contains(&op.name)) {
            return id;
        }
        let ops: Vec<EffectOp> = row.ops.iter().filter(|op| !names.contains(&op.name)).copied().collect();
        let tail = row.tail;
        self.intern(ops, tail)
    }

    /// Replace the tail variable `var` with `replacement`.
    pub fn substitute(&mut self, id: RowId, var: RowVar, replacement: RowId) -> RowId {
        let row = self.row(id);
        if row.tail != Some(var) {
            return id;
        }
        let ops = row.ops.clone();
        let closed = self.intern(ops, None);
        self.compose(&[closed, replacement])
    }

    /// Whether the row has no operations. An open row with no operations is
    /// empty but not pure.
    pub fn is_empty(&self, id: RowId) -> bool {
        self.row(id).ops.is_empty()
    }

    pub fn is_open(&self, id: RowId) -> bool {
        self.row(id).tail.is_some()
    }

    pub fn is_pure(&self, id: RowId) -> bool {
        id == RowId::PURE
    }

    pub fn contains(&self, id: RowId, name: OpName) -> bool {
        self.row(id).ops.iter().any(|op| op.name == name)
    }

    /// Operation labels of a row, in canonical order.
    pub fn labels(&self, id: RowId) -> Vec<&str> {
        self.row(id).ops.iter().map(|op| self.name(op.name)).collect()
    }

    /// Render a row for diagnostics, e.g. `{A.x, B.y | ρ0}`.
    pub fn display(&self, id: RowId) -> String {
        let row = self.row(id);
        let mut out = String::from("{");
        out.push_str(&self.labels(id).join(", "));
        if let Some(var) = row.tail {
            if !row.ops.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("| {var}"));
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(store: &mut RowStore, labels: &[&str]) -> Vec<EffectOp> {
        labels
            .iter()
            .map(|l| store.op(l, DefId::new(0), ResumeKind::Tail))
            .collect()
    }

    #[test]
    fn test_intern_is_canonical() {
        let mut store = RowStore::new();
        let a = ops(&mut store, &["B.y", "A.x", "B.y"]);
        let b = ops(&mut store, &["A.x", "B.y"]);
        let r1 = store.intern(a, None);
        let r2 = store.intern(b, None);
        assert_eq!(r1, r2);
        assert_eq!(store.labels(r1), vec!["A.x", "B.y"]);
        assert_eq!(store.intern(Vec::new(), None), RowId::PURE);
    }

    #[test]
    fn test_compose_keeps_smallest_tail() {
        let mut store = RowStore::new();
        let v0 = store.fresh_row_var();
        let v1 = store.fresh_row_var();
        let a = ops(&mut store, &["A.x"]);
        let b = ops(&mut store, &["B.y"]);
        let ra = store.intern(a, Some(v1));
        let rb = store.intern(b, Some(v0));
        let ab = store.compose(&[ra, rb]);
        let ba = store.compose(&[rb, ra]);
        assert_eq!(ab, ba);
        assert_eq!(store.tail(ab), Some(v0));
        assert_eq!(store.display(ab), "{A.x, B.y | ρ0}");
    }

    #[test]
    fn test_drop_preserves_tail() {
        let mut store = RowStore::new();
        let var = store.fresh_row_var();
        let a = ops(&mut store, &["A.x", "A.y"]);
        let row = store.intern(a, Some(var));
        let x = store.lookup_name("A.x").unwrap();
        let dropped = store.drop(row, x);
        assert_eq!(store.labels(dropped), vec!["A.y"]);
        assert!(store.is_open(dropped));
        assert!(!store.contains(dropped, x));
        let y = store.lookup_name("A.y").unwrap();
        let empty = store.drop(dropped, y);
        assert!(store.is_empty(empty));
        assert!(!store.is_pure(empty));
        assert_eq!(store.display(empty), "{| ρ0}");
    }

    #[test]
    fn test_substitute_tail() {
        let mut store = RowStore::new();
        let var = store.fresh_row_var();
        let a = ops(&mut store, &["A.x"]);
        let b = ops(&mut store, &["B.y"]);
        let open = store.intern(a, Some(var));
        let replacement = store.intern(b, None);
        let out = store.substitute(open, var, replacement);
        assert_eq!(store.labels(out), vec!["A.x", "B.y"]);
        assert!(!store.is_open(out));
        let other = store.fresh_row_var();
        assert_eq!(store.substitute(open, other, replacement), open);
    }
}
