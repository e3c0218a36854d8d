//! Algebraic properties of the effect row store.

use proptest::prelude::*;
use rill_runtime::ResumeKind;
use rillc::effects::{EffectOp, RowId, RowStore, RowVar};
use rillc::hir::DefId;

const LABELS: &[&str] = &["Async.await", "Log.emit", "State.get", "State.put", "Choice.choose", "Ask.ask"];

fn effect_of(label: &str) -> DefId {
    let index = LABELS.iter().position(|l| l.split('.').next() == label.split('.').next());
    DefId::new(index.unwrap_or(0) as u32)
}

fn ops(store: &mut RowStore, picks: &[usize]) -> Vec<EffectOp> {
    picks
        .iter()
        .map(|&i| {
            let label = LABELS[i % LABELS.len()];
            store.op(label, effect_of(label), ResumeKind::Resume)
        })
        .collect()
}

fn row(store: &mut RowStore, picks: &[usize], tail: Option<u32>) -> RowId {
    let ops = ops(store, picks);
    store.intern(ops, tail.map(RowVar))
}

fn row_strategy() -> impl Strategy<Value = (Vec<usize>, Option<u32>)> {
    (prop::collection::vec(0..LABELS.len(), 0..8), prop::option::of(0u32..3))
}

proptest! {
    #[test]
    fn test_intern_ignores_order_and_duplicates((picks, tail) in row_strategy()) {
        let mut store = RowStore::new();
        let a = row(&mut store, &picks, tail);
        let mut shuffled: Vec<usize> = picks.iter().rev().copied().collect();
        shuffled.extend(picks.iter().copied());
        let b = row(&mut store, &shuffled, tail);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn test_labels_are_sorted_and_unique((picks, tail) in row_strategy()) {
        let mut store = RowStore::new();
        let id = row(&mut store, &picks, tail);
        let labels = store.labels(id);
        let mut expected: Vec<&str> = picks.iter().map(|&i| LABELS[i]).collect();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(labels, expected);
    }

    #[test]
    fn test_compose_is_commutative(a in row_strategy(), b in row_strategy()) {
        let mut store = RowStore::new();
        let x = row(&mut store, &a.0, a.1);
        let y = row(&mut store, &b.0, b.1);
        prop_assert_eq!(store.compose(&[x, y]), store.compose(&[y, x]));
    }

    #[test]
    fn test_compose_is_associative(a in row_strategy(), b in row_strategy(), c in row_strategy()) {
        let mut store = RowStore::new();
        let x = row(&mut store, &a.0, a.1);
        let y = row(&mut store, &b.0, b.1);
        let z = row(&mut store, &c.0, c.1);
        let xy = store.compose(&[x, y]);
        let left = store.compose(&[xy, z]);
        let yz = store.compose(&[y, z]);
        let right = store.compose(&[x, yz]);
        prop_assert_eq!(left, right);
    }

    #[test]
    fn test_compose_is_idempotent_with_pure_identity((picks, tail) in row_strategy()) {
        let mut store = RowStore::new();
        let x = row(&mut store, &picks, tail);
        prop_assert_eq!(store.compose(&[x, x]), x);
        prop_assert_eq!(store.compose(&[x, RowId::PURE]), x);
    }

    #[test]
    fn test_drop_removes_only_the_name((picks, tail) in row_strategy(), victim in 0..LABELS.len()) {
        let mut store = RowStore::new();
        let x = row(&mut store, &picks, tail);
        let name = store.op(LABELS[victim], effect_of(LABELS[victim]), ResumeKind::Resume).name;
        let dropped = store.drop(x, name);
        prop_assert!(!store.contains(dropped, name));
        prop_assert_eq!(store.tail(dropped), store.tail(x));
        for label in store.labels(x) {
            if label != LABELS[victim] {
                prop_assert!(store.labels(dropped).contains(&label));
            }
        }
    }
}

#[test]
fn test_open_empty_row_is_not_pure() {
    let mut store = RowStore::new();
    let var = store.fresh_row_var();
    let open = store.intern(Vec::new(), Some(var));
    assert!(store.is_empty(open));
    assert!(store.is_open(open));
    assert!(!store.is_pure(open));
    assert_eq!(store.display(open), "{| ρ0}");
}
