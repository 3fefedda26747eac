use moonveil_core::seed::Seed;
use rand::RngCore;

const SEED: &str = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

#[test]
fn test_deterministic_rng() {
    let seed = Seed::from_hex(SEED).unwrap();

    let mut rng1 = seed.create_deterministic_rng();
    let mut rng2 = seed.create_deterministic_rng();

    assert_eq!(rng1.next_u32(), rng2.next_u32());
    assert_eq!(rng1.next_u64(), rng2.next_u64());
}

#[test]
fn test_hex_round_trip() {
    let seed = Seed::from_hex(SEED).unwrap();
    assert_eq!(seed.to_hex(), SEED);
    assert_eq!(Seed::from_hex(&SEED[2..]).unwrap().to_hex(), SEED);
}

#[test]
fn test_malformed_hex_is_rejected() {
    assert!(Seed::from_hex("0x12").is_err());
    assert!(Seed::from_hex("zz").is_err());
}

#[test]
fn test_hash_deterministic() {
    let seed = Seed::from_hex(SEED).unwrap();
    assert_eq!(seed.hash(), seed.hash());

    let hash_hex = seed.hash_hex();
    assert!(hash_hex.starts_with("0x"));
    assert_eq!(hash_hex.len(), 66);
}

#[test]
fn test_different_seeds_different_rngs() {
    let seed1 =
        Seed::from_hex("0x1111111111111111111111111111111111111111111111111111111111111111")
            .unwrap();
    let seed2 =
        Seed::from_hex("0x2222222222222222222222222222222222222222222222222222222222222222")
            .unwrap();

    let mut rng1 = seed1.create_deterministic_rng();
    let mut rng2 = seed2.create_deterministic_rng();

    assert_ne!(rng1.next_u64(), rng2.next_u64());
}
