//! The concrete concurrency scenarios. Each one hammers a single `ConMap` from several scoped
//! threads and checks the result is what a sequential execution would have produced.

use std::collections::HashSet;

use catrie::ConMap;
use crossbeam_utils::thread;

#[test]
fn narrow_to_wide_expansion_on_collision() {
    let map: ConMap<i32, i32> = ConMap::new();
    for k in [0, 4, 8, 12] {
        map.insert(k, k).unwrap();
    }
    for k in [0, 4, 8, 12] {
        assert_eq!(map.get(&k), Some(k));
    }
}

#[test]
fn insert_remove_round_trip() {
    let map: ConMap<i32, i32> = ConMap::new();
    for k in [0, 4, 1, 15] {
        map.insert(k, k).unwrap();
    }
    map.remove(&15);
    for k in (16..=256).step_by(16) {
        map.insert(k, k).unwrap();
    }
    map.remove(&256);

    assert_eq!(map.get(&256), None);
    assert_eq!(map.get(&48), Some(48));
    assert_eq!(map.get(&15), None);
    assert_eq!(map.get(&0), Some(0));
}

#[test]
fn overwrite() {
    let map: ConMap<i32, char> = ConMap::new();
    map.insert(7, 'a').unwrap();
    map.insert(7, 'b').unwrap();
    assert_eq!(map.get(&7), Some('b'));
}

#[test]
fn remove_of_absent_on_empty_map() {
    let map: ConMap<i32, i32> = ConMap::new();
    assert_eq!(map.remove(&42), None);
    assert!(map.is_empty());
}

#[test]
fn disjoint_keys_across_many_threads() {
    const THREADS: usize = 8;
    const PER_THREAD: i32 = 12_500;

    let map: ConMap<i32, i32> = ConMap::new();
    thread::scope(|scope| {
        for t in 0..THREADS as i32 {
            let map = &map;
            scope.spawn(move |_| {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    map.insert(key, key).unwrap();
                }
            });
        }
    })
    .unwrap();

    for t in 0..THREADS as i32 {
        for i in 0..PER_THREAD {
            let key = t * PER_THREAD + i;
            assert_eq!(map.get(&key), Some(key));
        }
    }
}

#[test]
fn concurrent_insert_and_remove_on_same_key() {
    const ROUNDS: usize = 2_000;

    let map: ConMap<i32, i32> = ConMap::new();
    thread::scope(|scope| {
        let inserter = &map;
        let remover = &map;
        scope.spawn(move |_| {
            for v in 0..ROUNDS as i32 {
                inserter.insert(0, v).ok();
            }
        });
        scope.spawn(move |_| {
            for _ in 0..ROUNDS {
                remover.remove(&0);
            }
        });
    })
    .unwrap();

    // No linearizability checker here (see DESIGN.md); the property under test is narrower: the
    // final state must be one a sequential interleaving could have produced, i.e. either absent
    // or one of the values ever inserted.
    match map.get(&0) {
        None => {}
        Some(v) => assert!((0..ROUNDS as i32).contains(&v)),
    }
}

#[test]
fn concurrent_inserts_of_the_same_key_set_never_lose_a_key() {
    const THREADS: usize = 4;
    const KEYS: i32 = 2_000;

    let map: ConMap<i32, i32> = ConMap::new();
    thread::scope(|scope| {
        for _ in 0..THREADS {
            let map = &map;
            scope.spawn(move |_| {
                for k in 0..KEYS {
                    map.insert(k, k).ok();
                }
            });
        }
    })
    .unwrap();

    let present: HashSet<i32> = (0..KEYS).filter(|k| map.get(k).is_some()).collect();
    assert_eq!(present.len(), KEYS as usize);
}
