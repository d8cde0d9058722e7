//! Dense shuffled workload: insert a permutation of 1..=500 and confirm
//! after every insert that nothing inserted so far has been lost.

mod common;

use common::{build_index, check_all, key, value, IndexParams};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};

#[test]
fn shuffled_dense_sequence_stays_retrievable() {
    let mut harness = build_index(IndexParams::default());
    let index = &mut harness.index;

    let mut keys: Vec<u32> = (1..=500).collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    keys.shuffle(&mut rng);

    for (done, k) in keys.iter().enumerate() {
        index.put(&key(*k), &value(*k)).unwrap();
        check_all(index, keys[..=done].iter().copied());
    }

    check_all(index, 1..=500);

    let check = index.verify_structure().unwrap();
    assert_eq!(check.records, 500);
    assert_eq!(check.nodes, index.num_nodes());

    // Probes outside the key range must miss.
    let mut out = [0u8; 12];
    assert!(!index.get(&key(0), &mut out).unwrap());
    assert!(!index.get(&key(-1i32 as u32), &mut out).unwrap());
    assert!(!index.get(&key(3_500_000), &mut out).unwrap());

    // A full-range scan yields every key exactly once, in order.
    let mut iter = index.range(None, None).unwrap();
    let mut k = [0u8; 4];
    let mut v = [0u8; 12];
    let mut expect = 1u32;
    while iter.next_record(&mut k, &mut v).unwrap() {
        assert_eq!(u32::from_le_bytes(k), expect);
        assert_eq!(v, value(expect));
        expect += 1;
    }
    assert_eq!(expect, 501);
}
