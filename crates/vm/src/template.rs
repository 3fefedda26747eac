//! Textual rewrites over handler templates.

use moonveil_core::Field;
use moonveil_core::instruction::{Offset, Permutation, PolymorphicEncoding};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static OPERAND_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bOP_([ABC])\b").expect("static regex"));
static OPERAND_READ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bInst\[OP_([ABC])\]").expect("static regex"));
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(OP_(?:ENUM|[ABCEF])|K_[A-Z]+)\b").expect("static regex"));

fn field(name: &str) -> Field {
    match name {
        "A" => Field::A,
        "B" => Field::B,
        _ => Field::C,
    }
}

/// Renames operand keys so the handler reads each semantic operand from its permuted slot.
pub fn permute(body: &str, permutation: Permutation) -> String {
    OPERAND_KEY
        .replace_all(body, |caps: &Captures| {
            format!("OP_{}", permutation.storage(field(&caps[1])).name())
        })
        .into_owned()
}

/// Wraps every operand read in the inverse of its per-instance offset.
pub fn polymorph(body: &str, encoding: &PolymorphicEncoding) -> String {
    OPERAND_READ
        .replace_all(body, |caps: &Captures| {
            let read = format!("Inst[OP_{}]", &caps[1]);
            match encoding.offset(field(&caps[1])) {
                Offset::None => read,
                Offset::Add(k) => format!("({read} - {k})"),
                Offset::Sub(k) => format!("({read} + {k})"),
            }
        })
        .into_owned()
}

/// Substitutes build keys for `OP_*`/`K_*` placeholders. Unknown placeholders are left alone.
pub fn bind(text: &str, keys: &BTreeMap<&'static str, u32>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match keys.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutation_renames_simultaneously() {
        let body = "Stk[Inst[OP_A]] = Stk[Inst[OP_B]] + Inst[OP_C]";
        assert_eq!(
            permute(body, Permutation::Cab),
            "Stk[Inst[OP_C]] = Stk[Inst[OP_A]] + Inst[OP_B]"
        );
    }

    #[test]
    fn polymorph_leaves_patch_targets_alone() {
        let encoding = PolymorphicEncoding {
            a: Offset::Add(3),
            b: Offset::Sub(2),
            c: Offset::None,
        };
        let body = "Stk[Inst[OP_A]] = Stk[Inst[OP_B]][Inst[OP_C]]";
        assert_eq!(
            polymorph(body, &encoding),
            "Stk[(Inst[OP_A] - 3)] = Stk[(Inst[OP_B] + 2)][Inst[OP_C]]"
        );
        assert_eq!(polymorph("Instr[1][OP_A]", &encoding), "Instr[1][OP_A]");
    }

    #[test]
    fn bind_replaces_known_keys() {
        let keys = BTreeMap::from([("OP_A", 7), ("K_CAPS", 3)]);
        assert_eq!(bind("Inst[OP_A] P[K_CAPS] OP_Z", &keys), "Inst[7] P[3] OP_Z");
    }
}
