//! A single-threaded model check: a stream of `Insert`/`Remove`/`Lookup` operations is applied to
//! both a `ConMap` and a `std::collections::HashMap` oracle, and every `Lookup` must agree.

use std::collections::HashMap;

use catrie::ConMap;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8, u8),
    Remove(u8),
    Lookup(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Op::Insert(k, v)),
        any::<u8>().prop_map(Op::Remove),
        any::<u8>().prop_map(Op::Lookup),
    ]
}

proptest! {
    #[test]
    fn agrees_with_hash_map_oracle(ops in prop::collection::vec(op_strategy(), 0..500)) {
        let map: ConMap<u8, u8> = ConMap::new();
        let mut oracle: HashMap<u8, u8> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let got = map.insert(k, v).expect("u8 keys never collide past the root");
                    let want = oracle.insert(k, v);
                    prop_assert_eq!(got, want);
                }
                Op::Remove(k) => {
                    let got = map.remove(&k);
                    let want = oracle.remove(&k);
                    prop_assert_eq!(got, want);
                }
                Op::Lookup(k) => {
                    prop_assert_eq!(map.get(&k), oracle.get(&k).copied());
                }
            }
        }

        for k in 0..=u8::MAX {
            prop_assert_eq!(map.get(&k), oracle.get(&k).copied());
        }
        prop_assert_eq!(map.is_empty(), oracle.is_empty());
    }
}

#[test]
fn idempotent_insert() {
    let map: ConMap<i32, i32> = ConMap::new();
    assert_eq!(map.insert(1, 10).unwrap(), None);
    assert_eq!(map.insert(1, 10).unwrap(), Some(10));
    assert_eq!(map.get(&1), Some(10));
}

#[test]
fn idempotent_remove() {
    let map: ConMap<i32, i32> = ConMap::new();
    map.insert(1, 10).unwrap();
    assert_eq!(map.remove(&1), Some(10));
    assert_eq!(map.remove(&1), None);
}

#[test]
fn round_trip() {
    let map: ConMap<i32, &'static str> = ConMap::new();
    map.insert(1, "a").unwrap();
    assert_eq!(map.get(&1), Some("a"));
    map.remove(&1);
    assert_eq!(map.get(&1), None);
}
