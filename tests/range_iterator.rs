//! Range-scan laws: completeness of the unbounded scan and closedness of
//! bounded ranges.

mod common;

use common::{build_index, key, value, IndexParams};

fn collect_range(
    index: &mut flintdb::BTreeIndex,
    min: Option<u32>,
    max: Option<u32>,
) -> Vec<u32> {
    let min_bytes = min.map(key);
    let max_bytes = max.map(key);
    let mut iter = index
        .range(min_bytes.as_ref().map(|k| &k[..]), max_bytes.as_ref().map(|k| &k[..]))
        .unwrap();

    let mut keys = Vec::new();
    let mut k = [0u8; 4];
    let mut v = [0u8; 12];
    while iter.next_record(&mut k, &mut v).unwrap() {
        let parsed = u32::from_le_bytes(k);
        assert_eq!(v, value(parsed));
        keys.push(parsed);
    }
    keys
}

#[test]
fn closed_range_over_dense_keys() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;
    for v in 1..=500u32 {
        index.put(&key(v), &value(v)).unwrap();
    }

    let keys = collect_range(index, Some(40), Some(299));
    assert_eq!(keys.len(), 260);
    assert_eq!(keys, (40..=299).collect::<Vec<_>>());
}

#[test]
fn unbounded_scan_is_complete_and_ordered() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;
    for v in (1..=500u32).rev() {
        index.put(&key(v), &value(v)).unwrap();
    }

    let keys = collect_range(index, None, None);
    assert_eq!(keys, (1..=500).collect::<Vec<_>>());
}

#[test]
fn range_bounds_falling_between_keys() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;
    for v in (10..=500u32).step_by(10) {
        index.put(&key(v), &value(v)).unwrap();
    }

    // 45 and 205 sit between stored keys; the range must still be the
    // exact set of stored keys inside [45, 205].
    let keys = collect_range(index, Some(45), Some(205));
    assert_eq!(keys, (50..=200).step_by(10).collect::<Vec<_>>());
}

#[test]
fn half_open_ranges() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;
    for v in 1..=100u32 {
        index.put(&key(v), &value(v)).unwrap();
    }

    assert_eq!(
        collect_range(index, Some(90), None),
        (90..=100).collect::<Vec<_>>()
    );
    assert_eq!(
        collect_range(index, None, Some(10)),
        (1..=10).collect::<Vec<_>>()
    );
}
