//! End-to-end scenarios for interning and collection.
//!
//! Coverage:
//! - Self-cycles and chains collapsing onto them
//! - Checkpoint collection without roots
//! - Refcount discipline for acyclic and cyclic values
//! - Duplicate elimination inside a component

use rime_core::{IObjPtr, ObjPtr, Type};
use rime_gc::intern::cycle_handle;
use rime_gc::intern::refcount::{CYCLE_MEMBER, refcount_delegate};
use rime_gc::{Arena, GcConfig, InternTable};
use std::sync::Arc;

/// `next` at offset 0, a value at offset 8.
static NODE: Type = Type::class("Node", 16, &[0]);

const NODE_SIZE: usize = 32;

fn config() -> GcConfig {
    GcConfig {
        verify_invariants: true,
        ..Default::default()
    }
}

fn setup() -> (Arc<InternTable>, Arena) {
    let table = Arc::new(InternTable::new());
    let arena = Arena::with_table(config(), Arc::clone(&table));
    (table, arena)
}

fn node(arena: &mut Arena, next: Option<ObjPtr>, value: u64) -> ObjPtr {
    let obj = arena.alloc_object(&NODE, 0);
    obj.write_ref(0, next);
    obj.write_u64(8, value);
    obj
}

fn ring(arena: &mut Arena, values: &[u64]) -> Vec<ObjPtr> {
    let objs: Vec<_> = values.iter().map(|&v| node(arena, None, v)).collect();
    for (i, obj) in objs.iter().enumerate() {
        obj.write_ref(0, Some(objs[(i + 1) % objs.len()]));
    }
    objs
}

fn next_of(iobj: IObjPtr) -> IObjPtr {
    iobj.read_ref(0)
        .and_then(|next| next.as_interned())
        .expect("interned node without interned next")
}

// =============================================================================
// Cycles
// =============================================================================

#[test]
fn test_self_cycle_and_chain_collapse() {
    let (table, mut arena) = setup();

    let a = ring(&mut arena, &[7])[0];
    let ia = table.intern(a);
    assert_eq!(table.size(), 1);
    let handle = refcount_delegate(ia);
    assert_eq!(handle.refcount(), 1);
    assert_eq!(cycle_handle::root(handle), ia);
    assert_eq!(next_of(ia), ia);

    let b = ring(&mut arena, &[7])[0];
    let ib = table.intern(b);
    assert_eq!(ib, ia);
    assert_eq!(table.size(), 1);
    assert_eq!(handle.refcount(), 2);

    let mut head = ia.obj();
    for _ in 0..5 {
        head = node(&mut arena, Some(head), 7);
    }
    let ic = table.intern(head);
    assert_eq!(ic, ia);
    assert_eq!(table.size(), 1);
    assert_eq!(handle.refcount(), 3);

    for iobj in [ia, ib, ic] {
        table.decref(iobj);
    }
    assert!(table.is_empty());
}

#[test]
fn test_cycle_identity_ignores_entry_point() {
    let (table, mut arena) = setup();
    let first = ring(&mut arena, &[1, 2, 3]);
    let second = ring(&mut arena, &[1, 2, 3]);
    let third = ring(&mut arena, &[1, 2, 3]);

    let from_one = table.intern(first[0]);
    let from_two = table.intern(second[1]);
    let from_three = table.intern(third[2]);
    assert_eq!(table.size(), 1);
    assert_eq!(next_of(from_one), from_two);
    assert_eq!(next_of(from_two), from_three);
    assert_eq!(next_of(from_three), from_one);
    assert!(rime_gc::deep_equal(from_one, next_of(from_three)));

    for iobj in [from_one, from_two, from_three] {
        table.decref(iobj);
    }
    assert!(table.is_empty());
}

#[test]
fn test_rotated_values_are_distinct_cycles() {
    let (table, mut arena) = setup();
    let a = table.intern(ring(&mut arena, &[1, 2, 3])[0]);
    let b = table.intern(ring(&mut arena, &[1, 3, 2])[0]);
    assert_ne!(a, b);
    assert_ne!(refcount_delegate(a), refcount_delegate(b));
    assert_eq!(table.size(), 2);
    table.decref(a);
    table.decref(b);
    assert!(table.is_empty());
}

// =============================================================================
// Collection
// =============================================================================

#[test]
fn test_collect_without_roots_returns_to_checkpoint() {
    let (_table, mut arena) = setup();
    let olds: Vec<_> = (0..10).map(|i| node(&mut arena, None, i)).collect();
    let chunks = arena.chunk_count();
    let note = arena.note();
    for (i, old) in olds.iter().enumerate() {
        node(&mut arena, Some(*old), 100 + i as u64);
    }
    assert!(arena.usage(note) >= 10 * NODE_SIZE);

    arena.collect(note, &mut []);
    assert_eq!(arena.usage(note), 0);
    assert_eq!(arena.chunk_count(), chunks);
    for (i, old) in olds.iter().enumerate() {
        assert_eq!(old.read_u64(8), i as u64);
    }
}

#[test]
fn test_collect_without_roots_releases_chunks() {
    let (_table, mut arena) = setup();
    let chunks = arena.chunk_count();
    let note = arena.note();
    let mut head = None;
    for i in 0..5000 {
        head = Some(node(&mut arena, head, i));
    }
    assert!(arena.chunk_count() > chunks);

    arena.collect(note, &mut []);
    assert_eq!(arena.usage(note), 0);
    assert_eq!(arena.chunk_count(), chunks);
}

#[test]
fn test_survivors_keep_their_data() {
    let (_table, mut arena) = setup();
    let note = arena.note();
    let mut head = None;
    for i in 0..10 {
        head = Some(node(&mut arena, head, i));
        node(&mut arena, None, 1000 + i);
    }
    let mut roots = [head.expect("empty chain")];
    arena.collect(note, &mut roots);

    assert_eq!(arena.usage(note), 10 * NODE_SIZE);
    let mut expected = 10;
    let mut cur = Some(roots[0]);
    while let Some(obj) = cur {
        expected -= 1;
        assert_eq!(obj.read_u64(8), expected);
        cur = obj.read_ref(0);
    }
    assert_eq!(expected, 0);
}

// =============================================================================
// Refcounts and deduplication
// =============================================================================

#[test]
fn test_acyclic_refcount_counts_interns() {
    let (table, mut arena) = setup();
    let results: Vec<_> = (0..5)
        .map(|_| {
            let tail = node(&mut arena, None, 2);
            let head = node(&mut arena, Some(tail), 1);
            table.intern(head)
        })
        .collect();
    assert!(results.iter().all(|&r| r == results[0]));
    assert_eq!(results[0].refcount(), 5);
    assert_eq!(next_of(results[0]).refcount(), 1);
    assert_eq!(table.size(), 2);

    for iobj in results {
        table.decref(iobj);
    }
    assert!(table.is_empty());
}

#[test]
fn test_cyclic_refcount_lives_on_handle() {
    let (table, mut arena) = setup();
    let results: Vec<_> = (0..4).map(|_| table.intern(ring(&mut arena, &[4, 5])[0])).collect();
    let handle = refcount_delegate(results[0]);
    assert_eq!(handle.refcount(), 4);
    assert_eq!(results[0].refcount(), CYCLE_MEMBER);
    assert_eq!(next_of(results[0]).refcount(), CYCLE_MEMBER);

    for iobj in results {
        table.decref(iobj);
    }
    assert!(table.is_empty());
}

#[test]
fn test_duplicates_inside_component_collapse() {
    let (table, mut arena) = setup();
    let single = table.intern(ring(&mut arena, &[3])[0]);
    let quad = table.intern(ring(&mut arena, &[3, 3, 3, 3])[0]);
    assert_eq!(quad, single);
    assert_eq!(table.size(), 1);

    let alternating = table.intern(ring(&mut arena, &[1, 2, 1, 2])[0]);
    assert_eq!(next_of(next_of(alternating)), alternating);
    assert_eq!(table.size(), 2);

    for iobj in [single, quad, alternating] {
        table.decref(iobj);
    }
    assert!(table.is_empty());
}
