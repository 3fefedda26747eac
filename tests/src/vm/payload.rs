use moonveil_core::frontend::Frontend;
use moonveil_core::{LuaFrontend, Settings};
use moonveil_tests::{eval, interpret};
use moonveil_vm::payload::{compress, decompress, pack, unpack};
use moonveil_vm::{BuildContext, allocate, serialize};
use rand::SeedableRng;
use rand::rngs::StdRng;

const PROGRAM: &str = r#"
    local words = {}
    for w in string.gmatch("the quick brown fox jumps over the lazy dog", "%a+") do
        words[#words + 1] = string.upper(w)
    end
    return table.concat(words, "-")
"#;

fn serialized() -> Vec<u8> {
    let mut root = LuaFrontend.load(PROGRAM, "payload").unwrap();
    root.recompute_all();
    root.resolve_all().unwrap();
    let mut ctx = BuildContext::new(root, Settings::default(), StdRng::seed_from_u64(5));
    allocate(&mut ctx).unwrap();
    serialize(&mut ctx).unwrap()
}

#[test]
fn serialized_chunks_survive_both_encodings() {
    let bytes = serialized();
    assert!(!bytes.is_empty());
    for key in [0u8, 0x17, 0xff] {
        for compressed in [true, false] {
            let text = pack(&bytes, key, compressed);
            assert_eq!(unpack(&text, key, compressed).unwrap(), bytes);
        }
    }
}

#[test]
fn compression_shrinks_repetitive_payloads() {
    let bytes: Vec<u8> = (0..4000u32).map(|n| (n % 17) as u8).collect();
    let tokens = compress(&bytes);
    assert!(tokens.len() < bytes.len() / 4);
    assert_eq!(decompress(&tokens).unwrap(), bytes);
    assert!(pack(&bytes, 1, true).len() < pack(&bytes, 1, false).len());
}

#[test]
fn hex_and_compressed_interpreters_agree() {
    let expected: String = eval(PROGRAM).unwrap();
    for extra_compression in [true, false] {
        let settings = Settings {
            extra_compression,
            ..Settings::default()
        };
        let root = LuaFrontend.load(PROGRAM, "payload").unwrap();
        let source = interpret(root, settings, 11).unwrap();
        let actual: String = eval(&source).unwrap();
        assert_eq!(actual, expected, "compression {extra_compression}");
    }
}
