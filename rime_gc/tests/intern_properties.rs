//! Property tests for interning random object graphs.
//!
//! Graphs are small sets of two-reference nodes with arbitrary edges, so
//! they mix shared children, self-loops and nested cycles. Two graphs must
//! intern to the same object exactly when they are bisimilar: same values
//! and same reference shape, unrolled forever.
//!
//! Layered cases first intern a base graph and let later graphs point into
//! it, so fresh objects reach cycles that are already published.

use proptest::prelude::*;
use rime_core::{ObjPtr, Type};
use rime_gc::{Arena, GcConfig, InternTable, deep_compare};
use std::cmp::Ordering;
use std::sync::Arc;

/// `left` at 0, `right` at 8, a value at 16.
static PAIR: Type = Type::class("Pair", 24, &[0, 8]);

#[derive(Debug, Clone)]
struct Shape {
    value: u64,
    left: Option<usize>,
    right: Option<usize>,
}

/// Graphs whose edges index their own nodes first, then `shared` nodes of
/// an already interned base graph.
fn graph_over(shared: usize) -> impl Strategy<Value = Vec<Shape>> {
    (1usize..6).prop_flat_map(move |n| {
        prop::collection::vec(
            (0u64..3, prop::option::of(0..n + shared), prop::option::of(0..n + shared))
                .prop_map(|(value, left, right)| Shape { value, left, right }),
            n,
        )
    })
}

fn graph_strategy() -> impl Strategy<Value = Vec<Shape>> {
    graph_over(0)
}

/// A base graph and two graphs that may point into it.
fn layered_strategy() -> impl Strategy<Value = (Vec<Shape>, Vec<Shape>, Vec<Shape>)> {
    graph_over(0).prop_flat_map(|base| {
        let shared = base.len();
        (Just(base), graph_over(shared), graph_over(shared))
    })
}

fn build(arena: &mut Arena, graph: &[Shape], shared: &[ObjPtr]) -> Vec<ObjPtr> {
    let objs: Vec<_> = graph
        .iter()
        .map(|shape| {
            let obj = arena.alloc_object(&PAIR, 0);
            obj.write_u64(16, shape.value);
            obj
        })
        .collect();
    let target = |i: usize| if i < objs.len() { objs[i] } else { shared[i - objs.len()] };
    for (obj, shape) in objs.iter().zip(graph) {
        obj.write_ref(0, shape.left.map(target));
        obj.write_ref(8, shape.right.map(target));
    }
    objs
}

/// Greatest bisimulation over the union of `base`, `a` and `b`, asked for
/// the entry nodes `a[0]` and `b[0]`. Edges of `a` and `b` past their own
/// nodes lead into `base`.
fn bisimilar(base: &[Shape], a: &[Shape], b: &[Shape]) -> bool {
    let place = |graph: &[Shape], offset: usize| -> Vec<(u64, Option<usize>, Option<usize>)> {
        let n = graph.len();
        let edge = move |i: usize| if i < n { i + offset } else { i - n };
        graph.iter().map(|s| (s.value, s.left.map(edge), s.right.map(edge))).collect()
    };
    let a_at = base.len();
    let b_at = a_at + a.len();
    let nodes: Vec<(u64, Option<usize>, Option<usize>)> = place(base, 0)
        .into_iter()
        .chain(place(a, a_at))
        .chain(place(b, b_at))
        .collect();
    let n = nodes.len();
    let mut related = vec![vec![false; n]; n];
    for i in 0..n {
        for j in 0..n {
            let (vi, li, ri) = nodes[i];
            let (vj, lj, rj) = nodes[j];
            related[i][j] = vi == vj && li.is_some() == lj.is_some() && ri.is_some() == rj.is_some();
        }
    }

    let edge_ok = |related: &Vec<Vec<bool>>, x: Option<usize>, y: Option<usize>| match (x, y) {
        (Some(x), Some(y)) => related[x][y],
        (None, None) => true,
        _ => false,
    };
    loop {
        let mut changed = false;
        for i in 0..n {
            for j in 0..n {
                if related[i][j] {
                    let (_, li, ri) = nodes[i];
                    let (_, lj, rj) = nodes[j];
                    if !edge_ok(&related, li, lj) || !edge_ok(&related, ri, rj) {
                        related[i][j] = false;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            return related[a_at][b_at];
        }
    }
}

fn setup() -> (Arc<InternTable>, Arena) {
    let table = Arc::new(InternTable::new());
    let config = GcConfig {
        verify_invariants: true,
        ..Default::default()
    };
    let arena = Arena::with_table(config, Arc::clone(&table));
    (table, arena)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn intern_is_idempotent(graph in graph_strategy()) {
        let (table, mut arena) = setup();
        let first = table.intern(build(&mut arena, &graph, &[])[0]);
        let size = table.size();
        let second = table.intern(build(&mut arena, &graph, &[])[0]);
        prop_assert_eq!(first, second);
        prop_assert_eq!(table.size(), size);
        prop_assert_eq!(table.intern(first.obj()), first);

        table.decref(first);
        table.decref(second);
        table.decref(first);
        table.verify_invariants();
        prop_assert!(table.is_empty());
    }

    #[test]
    fn intern_identity_matches_bisimilarity(a in graph_strategy(), b in graph_strategy()) {
        let (table, mut arena) = setup();
        let ia = table.intern(build(&mut arena, &a, &[])[0]);
        let ib = table.intern(build(&mut arena, &b, &[])[0]);
        prop_assert_eq!(ia == ib, bisimilar(&[], &a, &b));
        prop_assert_eq!(deep_compare(ia, ib) == Ordering::Equal, ia == ib);

        table.decref(ia);
        table.decref(ib);
        prop_assert!(table.is_empty());
    }

    #[test]
    fn forced_collisions_change_nothing(a in graph_strategy(), b in graph_strategy()) {
        let (table, mut arena) = setup();
        table.force_local_hash_collisions(true);
        let ia = table.intern(build(&mut arena, &a, &[])[0]);
        let ib = table.intern(build(&mut arena, &b, &[])[0]);
        prop_assert_eq!(ia == ib, bisimilar(&[], &a, &b));

        table.decref(ia);
        table.decref(ib);
        prop_assert!(table.is_empty());
    }

    #[test]
    fn compare_is_antisymmetric(a in graph_strategy(), b in graph_strategy()) {
        let (table, mut arena) = setup();
        let ia = table.intern(build(&mut arena, &a, &[])[0]);
        let ib = table.intern(build(&mut arena, &b, &[])[0]);
        prop_assert_eq!(deep_compare(ia, ib), deep_compare(ib, ia).reverse());

        table.decref(ia);
        table.decref(ib);
    }

    #[test]
    fn intern_over_published_graph_matches_bisimilarity((base, a, b) in layered_strategy()) {
        let (table, mut arena) = setup();
        let published: Vec<_> = build(&mut arena, &base, &[]).into_iter().map(|obj| table.intern(obj)).collect();
        let shared: Vec<ObjPtr> = published.iter().map(|iobj| iobj.obj()).collect();

        let ia = table.intern(build(&mut arena, &a, &shared)[0]);
        let ib = table.intern(build(&mut arena, &b, &shared)[0]);
        prop_assert_eq!(ia == ib, bisimilar(&base, &a, &b));
        table.verify_invariants();

        table.decref(ia);
        for iobj in published {
            table.decref(iobj);
        }
        table.decref(ib);
        table.verify_invariants();
        prop_assert!(table.is_empty());
    }
}
