use moonveil_core::dispatch::{self, DispatchNode};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

fn random_keys(rng: &mut StdRng, count: usize) -> Vec<i64> {
    index::sample(rng, 4096, count)
        .into_iter()
        .map(|k| k as i64 - 2048)
        .collect()
}

#[test]
fn every_key_reaches_its_own_leaf() {
    let mut rng = StdRng::seed_from_u64(0xd15);
    for round in 0..50 {
        let count = rng.random_range(1..=90);
        let keys = random_keys(&mut rng, count);
        let entries: Vec<(i64, i64)> = keys.iter().map(|k| (*k, k * 3)).collect();
        let tree = dispatch::build(entries, &mut rng).unwrap();

        assert_eq!(tree.leaves().len(), keys.len(), "round {round}");
        for key in &keys {
            assert_eq!(tree.eval(*key), Some(&(key * 3)), "round {round} key {key}");
        }
    }
}

#[test]
fn depth_is_logarithmic() {
    let mut rng = StdRng::seed_from_u64(7);
    let entries: Vec<(i64, ())> = (0..256).map(|k| (k, ())).collect();
    let tree = dispatch::build(entries, &mut rng).unwrap();
    assert_eq!(tree.depth(), 8);
}

#[test]
fn same_rng_state_builds_the_same_tree() {
    let keys: Vec<(i64, u8)> = (0..40).map(|k| (k * 7 - 100, k as u8)).collect();
    let a = dispatch::build(keys.clone(), &mut StdRng::seed_from_u64(99)).unwrap();
    let b = dispatch::build(keys.clone(), &mut StdRng::seed_from_u64(99)).unwrap();
    let c = dispatch::build(keys, &mut StdRng::seed_from_u64(100)).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn empty_and_duplicate_keys_are_rejected() {
    let mut rng = StdRng::seed_from_u64(1);
    assert!(dispatch::build(Vec::<(i64, ())>::new(), &mut rng).is_err());
    assert!(dispatch::build(vec![(1, ()), (2, ()), (1, ())], &mut rng).is_err());
}

#[test]
fn rendered_tree_selects_each_body_in_lua() {
    let mut rng = StdRng::seed_from_u64(42);
    let keys = random_keys(&mut rng, 37);
    let tree: DispatchNode<i64> =
        dispatch::build(keys.iter().map(|k| (*k, k * 2 + 1)).collect(), &mut rng).unwrap();
    let body = tree.render("op", &mut |_, value| format!("return {value}"));
    let source = format!("return function(op)\n{body}\nend");

    let lua = mlua::Lua::new();
    let select: mlua::Function = lua.load(source.as_str()).eval().unwrap();
    for key in keys {
        let value: i64 = select.call(key).unwrap();
        assert_eq!(value, key * 2 + 1);
    }
}
