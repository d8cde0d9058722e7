//! Structural-walker sweeps over differently shaped trees: ordering inside
//! nodes, separator bounds, fill limits, chain termination, and mapping
//! integrity are checked after every workload.

mod common;

use common::{build_index, key, value, IndexParams, KeySequence};

#[test]
fn sequential_build_passes_checker() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;

    for v in 1..=1_000u32 {
        index.put(&key(v), &value(v)).unwrap();
    }

    let check = index.verify_structure().unwrap();
    assert_eq!(check.records, 1_000);
    assert_eq!(check.nodes, index.num_nodes());
    assert_eq!(check.depth, index.levels());
}

#[test]
fn reverse_build_passes_checker() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;

    for v in (1..=1_000u32).rev() {
        index.put(&key(v), &value(v)).unwrap();
    }

    let check = index.verify_structure().unwrap();
    assert_eq!(check.records, 1_000);
    assert_eq!(check.nodes, index.num_nodes());
}

#[test]
fn random_build_with_overwrites_passes_checker() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;

    let n = 1_000u32;
    let mut stream = KeySequence::new(n, 21);
    for _ in 0..n {
        let k = stream.next();
        index.put(&key(k), &value(k)).unwrap();
    }
    // Overwrites must not create duplicates or grow the tree.
    let nodes = index.num_nodes();
    let mut stream = KeySequence::new(n, 22);
    for _ in 0..n / 2 {
        let k = stream.next();
        index.put(&key(k), &value(k)).unwrap();
    }
    assert_eq!(index.num_nodes(), nodes);

    let check = index.verify_structure().unwrap();
    assert_eq!(check.records, n as u64);
}

#[test]
fn checker_holds_under_ring_pressure() {
    let mut harness = build_index(IndexParams {
        page_size: 256,
        pages: 2_048,
        erase_block_pages: 4,
        num_buffers: 4,
        mapping_capacity: 16,
        ..IndexParams::default()
    });
    let index = &mut harness.index;

    let n = 5_000u32;
    let mut stream = KeySequence::new(n, 31);
    for _ in 0..n {
        let k = stream.next();
        index.put(&key(k), &value(k)).unwrap();
    }
    assert!(index.store().wrapped_memory());

    let check = index.verify_structure().unwrap();
    assert_eq!(check.records, n as u64);
    assert_eq!(check.nodes, index.num_nodes());
}

#[test]
fn render_tree_shape_matches_checker() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;

    for v in 1..=300u32 {
        index.put(&key(v), &value(v)).unwrap();
    }

    let check = index.verify_structure().unwrap();
    let rendered = index.render_tree().unwrap();
    assert_eq!(rendered.lines().count() as u32, check.nodes);
    assert!(rendered.lines().next().unwrap().contains("root"));
}
