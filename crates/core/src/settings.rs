use serde::{Deserialize, Serialize};

/// User-facing knobs of one obfuscation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Raises substitution density and lets substitution reach into the anti-tamper prefix.
    pub enhanced_security: bool,
    /// Clones handlers with permuted operand roles for a share of instructions.
    pub dynamic_opcode_structure: bool,
    /// LZW + base-36 payload instead of plain hex.
    pub extra_compression: bool,
    /// Emitted as a leading comment line when non-empty.
    pub watermark: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enhanced_security: false,
            dynamic_opcode_structure: true,
            extra_compression: true,
            watermark: String::new(),
        }
    }
}

impl Settings {
    /// Probability that an eligible instruction is handed to a substitution strategy.
    pub fn substitution_density(&self) -> f64 {
        if self.enhanced_security { 0.45 } else { 0.2 }
    }
}
