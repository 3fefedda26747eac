//! Disguised library lookups.

use rand::Rng;

/// Builds a string expression spelling `name` without a literal, one character at a time.
///
/// Each character is either a `Char(n)` call or, one time in three, a decimal-escaped string
/// literal. Relies on a local `Char` bound to `string.char`.
pub fn spell<R: Rng + ?Sized>(name: &str, rng: &mut R) -> String {
    let parts: Vec<String> = name
        .bytes()
        .map(|byte| {
            if rng.random_range(0..3) == 0 {
                format!("\"\\{byte}\"")
            } else {
                format!("Char({byte})")
            }
        })
        .collect();
    format!("({})", parts.join(" .. "))
}

/// Expression resolving a dotted library path (`["string", "byte"]`) through `Env`.
pub fn uglify_func<R: Rng + ?Sized>(path: &[&str], rng: &mut R) -> String {
    let mut out = String::from("Env");
    for segment in path {
        out.push('[');
        out.push_str(&spell(segment, rng));
        out.push(']');
    }
    out
}
