use moonveil_syntax::{Options, obfuscate_source};
use moonveil_tests::eval;
use rand::SeedableRng;
use rand::rngs::StdRng;

const PROGRAM: &str = r#"
    local function mix(a, b)
        return a * 31 + b % 977 - 4096
    end
    local acc = 0
    for i = 1, 40 do
        acc = mix(acc % 65521, i * 13)
    end
    return acc + 0.5, -17, 1e3
"#;

fn numbers_only() -> Options {
    Options {
        flatten_threshold: usize::MAX,
        rewrite_rate: 0.0,
        loop_rate: 0.0,
        wrap_rate: 0.0,
        pad_rate: 0.0,
        number_rate: 1.0,
    }
}

#[test]
fn obscured_literals_keep_their_values() {
    let expected: (f64, f64, f64) = eval(PROGRAM).unwrap();
    for seed in 0..16 {
        let text = obfuscate_source(PROGRAM, &mut StdRng::seed_from_u64(seed), &numbers_only()).unwrap();
        let actual: (f64, f64, f64) = eval(&text).unwrap();
        assert_eq!(actual, expected, "seed {seed}:\n{text}");
    }
}

#[test]
fn zero_rate_prints_literals_verbatim() {
    let options = Options {
        number_rate: 0.0,
        ..numbers_only()
    };
    let text = obfuscate_source(PROGRAM, &mut StdRng::seed_from_u64(3), &options).unwrap();
    assert!(text.contains("65521"));
    assert!(text.contains("977"));

    let obscured = obfuscate_source(PROGRAM, &mut StdRng::seed_from_u64(3), &numbers_only()).unwrap();
    assert_ne!(obscured, text);
}

#[test]
fn protected_bodies_keep_their_literals() {
    let source = r#"
        local function checksum()
            --@protect
            return 987654
        end
        return checksum() + 12345
    "#;
    let text = obfuscate_source(source, &mut StdRng::seed_from_u64(9), &numbers_only()).unwrap();
    assert!(text.contains("987654"), "{text}");
    let value: f64 = eval(&text).unwrap();
    assert_eq!(value, 999999.0);
}
