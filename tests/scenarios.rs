//! End-to-end scenarios and cross-call invariants for the data-access
//! engine, run against the public API only (no access to crate
//! internals). The six scenarios below are literal input/output byte
//! strings; the property-style checks after them generate small random
//! dictionaries the same way the original C test harness's manually
//! written fixtures did, just varied across seeds instead of hand-picked.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use tnet_access::{DataAccess, Error, Term};

#[test]
fn scenario_1_empty_root_insert() {
    let root = DataAccess::create(b"0:}").unwrap();
    root.set(b"foo", Term::string(b"bar").unwrap()).unwrap();
    assert_eq!(root.as_term().unwrap().as_bytes(), b"12:3:foo,3:bar,}");
}

#[test]
fn scenario_2_top_level_in_place_update_same_length() {
    let root = DataAccess::create(b"12:3:foo,3:bar,}").unwrap();
    root.set(b"foo", Term::string(b"baz").unwrap()).unwrap();
    assert_eq!(root.as_term().unwrap().as_bytes(), b"12:3:foo,3:baz,}");
}

#[test]
fn scenario_3_top_level_update_longer_value() {
    let root = DataAccess::create(b"12:3:foo,3:bar,}").unwrap();
    root.set(b"foo", Term::string(b"foobar").unwrap()).unwrap();
    assert_eq!(root.as_term().unwrap().as_bytes(), b"15:3:foo,6:foobar,}");
}

#[test]
fn scenario_4_nested_update_shorter_value_shrinks_ancestor_prefixes() {
    let root = DataAccess::create(b"27:5:outer,15:3:foo,6:foobar,}}").unwrap();
    let outer_term = root.get(b"outer").unwrap();
    let inner = root.create_nested(&outer_term).unwrap();
    drop(outer_term);

    inner.set(b"foo", Term::string(b"bar").unwrap()).unwrap();

    assert_eq!(root.as_term().unwrap().as_bytes(), b"24:5:outer,12:3:foo,3:bar,}}");
}

#[test]
fn scenario_5_remove_nested_key() {
    let root = DataAccess::create(b"24:5:outer,12:3:foo,3:bar,}}").unwrap();
    let outer_term = root.get(b"outer").unwrap();
    let inner = root.create_nested(&outer_term).unwrap();
    drop(outer_term);

    inner.remove(b"foo").unwrap();

    assert_eq!(root.as_term().unwrap().as_bytes(), b"11:5:outer,0:}}");
}

#[test]
fn scenario_6_orphaning_by_parent_overwrite() {
    let root = DataAccess::create(b"51:6:level1,38:6:level2,25:6:level3,12:3:key,3:bar,}}}}").unwrap();

    let level1_term = root.get(b"level1").unwrap();
    let level1 = root.create_nested(&level1_term).unwrap();
    drop(level1_term);

    let level2_term = level1.get(b"level2").unwrap();
    let level2 = level1.create_nested(&level2_term).unwrap();
    drop(level2_term);

    let level3_term = level2.get(b"level3").unwrap();
    let level3 = level2.create_nested(&level3_term).unwrap();
    drop(level3_term);

    let replacement = DataAccess::create(b"31:9:newlevel3,15:3:key,6:foobar,}}").unwrap();
    let replacement_term = replacement.as_term().unwrap();
    level1.set(b"level2", replacement_term.to_owned_term()).unwrap();
    drop(replacement_term);

    assert_eq!(level3.get(b"key").unwrap_err(), Error::InvalidChild);
    assert_eq!(level2.get(b"level3").unwrap_err(), Error::InvalidChild);

    let new_level2 = level1.get(b"level2").unwrap();
    assert_eq!(new_level2.as_bytes(), b"31:9:newlevel3,15:3:key,6:foobar,}}");
}

/// Builds a small, flat dictionary `"k0" -> v0, "k1" -> v1, ...` with
/// random ASCII string values, plus the key/value list used to check it.
fn random_flat_dict(rng: &mut impl Rng, count: usize, max_value_len: usize) -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
    let mut entries = Vec::new();
    for i in 0..count {
        let value_len = rng.gen_range(0..=max_value_len);
        let value: Vec<u8> = (0..value_len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        entries.push((format!("k{i}"), value));
    }

    let mut payload = Vec::new();
    for (k, v) in &entries {
        let key_term = Term::string(k.as_bytes()).unwrap();
        let value_term = Term::string(v).unwrap();
        payload.extend_from_slice(key_term.as_bytes());
        payload.extend_from_slice(value_term.as_bytes());
    }
    let mut bytes = format!("{}:", payload.len()).into_bytes();
    bytes.extend_from_slice(&payload);
    bytes.push(b'}');
    (bytes, entries)
}

#[test]
fn invariant_well_formedness_and_round_trip() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
    for trial in 0..20 {
        let (bytes, _entries) = random_flat_dict(&mut rng, trial % 6, 12);
        let root = DataAccess::create(&bytes).unwrap();
        let term = root.as_term().unwrap();
        assert_eq!(term.as_bytes(), bytes.as_slice());
        assert_eq!(*term.as_bytes().last().unwrap(), b'}');
    }
}

#[test]
fn invariant_get_set_idempotence_and_unchanged_elsewhere() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
    for trial in 0..20 {
        let (bytes, entries) = random_flat_dict(&mut rng, 3 + trial % 5, 8);
        let root = DataAccess::create(&bytes).unwrap();

        let target = trial % entries.len().max(1);
        let new_value_len = rng.gen_range(0..16);
        let new_value: Vec<u8> = (0..new_value_len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        let key = entries[target].0.clone();

        root.set(key.as_bytes(), Term::string(&new_value).unwrap()).unwrap();

        let got = root.get(key.as_bytes()).unwrap();
        assert_eq!(got.payload(), new_value.as_slice());
        drop(got);

        for (i, (k, v)) in entries.iter().enumerate() {
            if i == target {
                continue;
            }
            let unchanged = root.get(k.as_bytes()).unwrap();
            assert_eq!(unchanged.payload(), v.as_slice());
        }
    }
}

#[test]
fn invariant_prefix_arithmetic_after_growth_and_shrink() {
    let root = DataAccess::create(b"0:}").unwrap();

    root.set(b"a", Term::string(b"x").unwrap()).unwrap();
    assert_eq!(root.as_term().unwrap().as_bytes(), b"8:1:a,1:x,}");

    root.set(b"a", Term::string(b"a much longer replacement value").unwrap())
        .unwrap();
    assert_eq!(
        root.as_term().unwrap().as_bytes(),
        b"40:1:a,32:a much longer replacement value,}"
    );

    root.remove(b"a").unwrap();
    assert_eq!(root.as_term().unwrap().as_bytes(), b"0:}");
}

#[test]
fn insert_new_key_into_nonempty_dict() {
    let root = DataAccess::create(b"12:3:foo,3:bar,}").unwrap();
    root.set(b"baz", Term::string(b"quux").unwrap()).unwrap();
    assert_eq!(
        root.as_term().unwrap().as_bytes(),
        b"25:3:foo,3:bar,3:baz,4:quux,}"
    );
    assert_eq!(root.get(b"foo").unwrap().payload(), b"bar");
    assert_eq!(root.get(b"baz").unwrap().payload(), b"quux");
}

#[test]
fn invariant_address_consistency_for_nested_view() {
    let root = DataAccess::create(b"21:3:foo,12:3:bar,3:baz,}}").unwrap();
    let foo_term = root.get(b"foo").unwrap();
    let foo_offset_in_root = {
        let root_bytes = root.as_term().unwrap();
        root_bytes
            .as_bytes()
            .windows(foo_term.as_bytes().len())
            .position(|w| w == foo_term.as_bytes())
            .unwrap()
    };
    drop(foo_term);

    let foo_view = root.get(b"foo").unwrap();
    let inner = root.create_nested(&foo_view).unwrap();
    drop(foo_view);

    assert_eq!(inner.offset(), foo_offset_in_root);
}
