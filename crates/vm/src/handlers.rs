//! Static registry of interpreter handler templates.
//!
//! Each opcode maps to a constructor that renders the Lua body executed when the interpreter
//! dispatches to it. Bodies address their own operands as `Inst[OP_X]` and registers as
//! `Stk[...]`; placeholders are bound to per-build keys by the emitter. Constant-carrying RK
//! operands are resolved into the instruction table at load time, so the `kb`/`kc` flags
//! select between `Stk[Inst[OP_B]]` and a direct `Inst[OP_B]` read.
//!
//! Names available to bodies: `Inst`, `Instr`, `InstrPoint`, `Stk`, `Top`, `Varargs`, `Varg`,
//! `Env`, `Upvalues`, `Proto`, `Open`, `Vt`, `State`, `Snapshot`, `Wrap`, `Pack`, `Unpack`,
//! `Pairs`.

use moonveil_core::{Field, Instruction, OpCode};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Handler flavour beyond the opcode itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variant {
    Plain,
    /// `LOADBOOL` with its skip flag set.
    Skip,
    /// Patching pseudo-op that writes the given operand of its target.
    Patch(Field),
}

/// Identity of a builtin handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub opcode: OpCode,
    pub kb: bool,
    pub kc: bool,
    pub variant: Variant,
}

impl HandlerKey {
    pub fn of(instruction: &Instruction) -> Self {
        let variant = match instruction.opcode {
            OpCode::LoadBool if instruction.jump.is_some() => Variant::Skip,
            OpCode::Reload | OpCode::PopCachedKey => {
                Variant::Patch(instruction.patch_field.unwrap_or(Field::A))
            }
            _ => Variant::Plain,
        };
        Self {
            opcode: instruction.opcode,
            kb: instruction.k_b.is_some(),
            kc: instruction.k_c.is_some(),
            variant,
        }
    }
}

type Constructor = fn(&HandlerKey) -> String;

/// Opcode -> body constructor, built once.
pub static REGISTRY: LazyLock<BTreeMap<OpCode, Constructor>> = LazyLock::new(|| {
    let mut registry: BTreeMap<OpCode, Constructor> = BTreeMap::new();
    for op in OpCode::LUA51 {
        registry.insert(op, body);
    }
    for op in [
        OpCode::GetEnv,
        OpCode::GetState,
        OpCode::GetSnapshot,
        OpCode::NewStack,
        OpCode::Redirect,
        OpCode::Reload,
        OpCode::PushCachedKey,
        OpCode::PopCachedKey,
        OpCode::DynamicRedirect,
        OpCode::FakeForPrep,
    ] {
        registry.insert(op, body);
    }
    registry
});

/// Renders the template for `key`.
pub fn template(key: &HandlerKey) -> Option<String> {
    REGISTRY.get(&key.opcode).map(|constructor| constructor(key))
}

fn rk(constant: bool, field: &str) -> String {
    if constant {
        format!("Inst[OP_{field}]")
    } else {
        format!("Stk[Inst[OP_{field}]]")
    }
}

fn arith(key: &HandlerKey, operator: &str) -> String {
    format!(
        "Stk[Inst[OP_A]] = {} {operator} {}",
        rk(key.kb, "B"),
        rk(key.kc, "C")
    )
}

fn compare(key: &HandlerKey, operator: &str) -> String {
    format!(
        "if ({} {operator} {}) ~= (Inst[OP_A] ~= 0) then\n\tInstrPoint = Inst[OP_E]\nend",
        rk(key.kb, "B"),
        rk(key.kc, "C")
    )
}

fn field_key(variant: Variant) -> &'static str {
    match variant {
        Variant::Patch(Field::B) => "OP_B",
        Variant::Patch(Field::C) => "OP_C",
        _ => "OP_A",
    }
}

fn body(key: &HandlerKey) -> String {
    match key.opcode {
        OpCode::Move => "Stk[Inst[OP_A]] = Stk[Inst[OP_B]]".into(),
        OpCode::LoadK => "Stk[Inst[OP_A]] = Inst[OP_B]".into(),
        OpCode::LoadBool => {
            if key.variant == Variant::Skip {
                "Stk[Inst[OP_A]] = (Inst[OP_B] ~= 0)\nInstrPoint = Inst[OP_E]".into()
            } else {
                "Stk[Inst[OP_A]] = (Inst[OP_B] ~= 0)".into()
            }
        }
        OpCode::LoadNil => "for Idx = Inst[OP_A], Inst[OP_B] do\n\tStk[Idx] = nil\nend".into(),
        OpCode::GetUpval => {
            "local Cell = Upvalues[Inst[OP_B]]\nStk[Inst[OP_A]] = Cell[1][Cell[2]]".into()
        }
        OpCode::GetGlobal => "Stk[Inst[OP_A]] = Env[Inst[OP_B]]".into(),
        OpCode::GetTable => format!("Stk[Inst[OP_A]] = Stk[Inst[OP_B]][{}]", rk(key.kc, "C")),
        OpCode::SetGlobal => "Env[Inst[OP_B]] = Stk[Inst[OP_A]]".into(),
        OpCode::SetUpval => {
            "local Cell = Upvalues[Inst[OP_B]]\nCell[1][Cell[2]] = Stk[Inst[OP_A]]".into()
        }
        OpCode::SetTable => format!(
            "Stk[Inst[OP_A]][{}] = {}",
            rk(key.kb, "B"),
            rk(key.kc, "C")
        ),
        OpCode::NewTable => "Stk[Inst[OP_A]] = {}".into(),
        OpCode::SelfOp => format!(
            "local A = Inst[OP_A]\nlocal Object = Stk[Inst[OP_B]]\nStk[A + 1] = Object\nStk[A] = Object[{}]",
            rk(key.kc, "C")
        ),
        OpCode::Add => arith(key, "+"),
        OpCode::Sub => arith(key, "-"),
        OpCode::Mul => arith(key, "*"),
        OpCode::Div => arith(key, "/"),
        OpCode::Mod => arith(key, "%"),
        OpCode::Pow => arith(key, "^"),
        OpCode::Unm => "Stk[Inst[OP_A]] = -Stk[Inst[OP_B]]".into(),
        OpCode::Not => "Stk[Inst[OP_A]] = not Stk[Inst[OP_B]]".into(),
        OpCode::Len => "Stk[Inst[OP_A]] = #Stk[Inst[OP_B]]".into(),
        OpCode::Concat => concat!(
            "local B = Inst[OP_B]\n",
            "local C = Inst[OP_C]\n",
            "local Str = Stk[C]\n",
            "for Idx = C - 1, B, -1 do\n",
            "\tStr = Stk[Idx] .. Str\n",
            "end\n",
            "Stk[Inst[OP_A]] = Str"
        )
        .into(),
        OpCode::Jmp => "InstrPoint = Inst[OP_B]".into(),
        OpCode::Eq => compare(key, "=="),
        OpCode::Lt => compare(key, "<"),
        OpCode::Le => compare(key, "<="),
        OpCode::Test => concat!(
            "if (not Stk[Inst[OP_A]]) == (Inst[OP_C] ~= 0) then\n",
            "\tInstrPoint = Inst[OP_E]\n",
            "end"
        )
        .into(),
        OpCode::TestSet => concat!(
            "local Value = Stk[Inst[OP_B]]\n",
            "if (not Value) == (Inst[OP_C] ~= 0) then\n",
            "\tInstrPoint = Inst[OP_E]\n",
            "else\n",
            "\tStk[Inst[OP_A]] = Value\n",
            "end"
        )
        .into(),
        OpCode::Call => concat!(
            "local A = Inst[OP_A]\n",
            "local Limit\n",
            "if Inst[OP_B] == 0 then\n",
            "\tLimit = Top\n",
            "else\n",
            "\tLimit = A + Inst[OP_B] - 1\n",
            "end\n",
            "local Results = Pack(Stk[A](Unpack(Stk, A + 1, Limit)))\n",
            "local Count = Results.n\n",
            "if Inst[OP_C] == 0 then\n",
            "\tTop = A + Count - 1\n",
            "else\n",
            "\tCount = Inst[OP_C] - 1\n",
            "end\n",
            "for Idx = 1, Count do\n",
            "\tStk[A + Idx - 1] = Results[Idx]\n",
            "end"
        )
        .into(),
        OpCode::TailCall => concat!(
            "local A = Inst[OP_A]\n",
            "local Limit\n",
            "if Inst[OP_B] == 0 then\n",
            "\tLimit = Top\n",
            "else\n",
            "\tLimit = A + Inst[OP_B] - 1\n",
            "end\n",
            "return Stk[A](Unpack(Stk, A + 1, Limit))"
        )
        .into(),
        OpCode::Return => concat!(
            "local A = Inst[OP_A]\n",
            "local B = Inst[OP_B]\n",
            "if B == 1 then\n",
            "\treturn\n",
            "elseif B == 0 then\n",
            "\treturn Unpack(Stk, A, Top)\n",
            "else\n",
            "\treturn Unpack(Stk, A, A + B - 2)\n",
            "end"
        )
        .into(),
        OpCode::ForLoop => concat!(
            "local A = Inst[OP_A]\n",
            "local Step = Stk[A + 2]\n",
            "local Index = Stk[A] + Step\n",
            "Stk[A] = Index\n",
            "if Step > 0 then\n",
            "\tif Index <= Stk[A + 1] then\n",
            "\t\tInstrPoint = Inst[OP_B]\n",
            "\t\tStk[A + 3] = Index\n",
            "\tend\n",
            "elseif Index >= Stk[A + 1] then\n",
            "\tInstrPoint = Inst[OP_B]\n",
            "\tStk[A + 3] = Index\n",
            "end"
        )
        .into(),
        OpCode::ForPrep => concat!(
            "local A = Inst[OP_A]\n",
            "Stk[A] = Stk[A] - Stk[A + 2]\n",
            "InstrPoint = Inst[OP_B]"
        )
        .into(),
        OpCode::TForLoop => concat!(
            "local A = Inst[OP_A]\n",
            "local Results = Pack(Stk[A](Stk[A + 1], Stk[A + 2]))\n",
            "for Idx = 1, Inst[OP_C] do\n",
            "\tStk[A + 2 + Idx] = Results[Idx]\n",
            "end\n",
            "if Stk[A + 3] ~= nil then\n",
            "\tStk[A + 2] = Stk[A + 3]\n",
            "else\n",
            "\tInstrPoint = Inst[OP_E]\n",
            "end"
        )
        .into(),
        OpCode::SetList => concat!(
            "local A = Inst[OP_A]\n",
            "local Count = Inst[OP_B]\n",
            "local Target = Stk[A]\n",
            "if Count == 0 then\n",
            "\tCount = Top - A\n",
            "end\n",
            "local Offset = (Inst[OP_C] - 1) * 50\n",
            "for Idx = 1, Count do\n",
            "\tTarget[Offset + Idx] = Stk[A + Idx]\n",
            "end"
        )
        .into(),
        OpCode::Close => concat!(
            "local A = Inst[OP_A]\n",
            "for Reg, Cell in Pairs(Open) do\n",
            "\tif Reg >= A then\n",
            "\t\tCell[1] = {[Reg] = Stk[Reg]}\n",
            "\t\tOpen[Reg] = nil\n",
            "\tend\n",
            "end"
        )
        .into(),
        OpCode::Closure => concat!(
            "local NewProto = Proto[Inst[OP_B]]\n",
            "local Captures = NewProto[K_CAPS]\n",
            "local Cells = {}\n",
            "for Idx = 1, #Captures do\n",
            "\tlocal Capture = Captures[Idx]\n",
            "\tlocal Reg = Capture[2]\n",
            "\tif Capture[1] == 0 then\n",
            "\t\tlocal Cell = Open[Reg]\n",
            "\t\tif not Cell then\n",
            "\t\t\tCell = {Stk, Reg}\n",
            "\t\t\tOpen[Reg] = Cell\n",
            "\t\tend\n",
            "\t\tCells[Idx - 1] = Cell\n",
            "\telse\n",
            "\t\tCells[Idx - 1] = Upvalues[Reg]\n",
            "\tend\n",
            "end\n",
            "Stk[Inst[OP_A]] = Wrap(NewProto, Cells, Env)"
        )
        .into(),
        OpCode::VarArg => concat!(
            "local A = Inst[OP_A]\n",
            "local Count = Inst[OP_B] - 1\n",
            "if Count < 0 then\n",
            "\tCount = Varg\n",
            "\tTop = A + Varg - 1\n",
            "end\n",
            "for Idx = 0, Count - 1 do\n",
            "\tStk[A + Idx] = Varargs[Idx]\n",
            "end"
        )
        .into(),
        OpCode::GetEnv => "Stk[Inst[OP_A]] = Env".into(),
        OpCode::GetState => "Stk[Inst[OP_A]] = State".into(),
        OpCode::GetSnapshot => "Stk[Inst[OP_A]] = Snapshot[Inst[OP_B]]".into(),
        OpCode::NewStack => "Stk[Inst[OP_A]] = {}".into(),
        OpCode::Redirect => "Instr[InstrPoint + Inst[OP_F]][OP_ENUM] = Inst[OP_A]".into(),
        OpCode::Reload => format!(
            "Instr[InstrPoint + Inst[OP_F]][{}] = Inst[OP_A]",
            field_key(key.variant)
        ),
        OpCode::PushCachedKey => "Vt[Inst[OP_B]] = Inst[OP_A]".into(),
        OpCode::PopCachedKey => format!(
            "local Slot = Inst[OP_B]\nInstr[InstrPoint + Inst[OP_F]][{}] = Vt[Slot]\nVt[Slot] = nil",
            field_key(key.variant)
        ),
        OpCode::DynamicRedirect => {
            "Instr[InstrPoint + Inst[OP_F]][OP_ENUM] = Inst[OP_A]\nInstrPoint = Inst[OP_B]".into()
        }
        OpCode::FakeForPrep => concat!(
            "local Init = Inst[OP_B]\n",
            "if Init > Inst[OP_C] then\n",
            "\tInstrPoint = Inst[OP_A]\n",
            "end"
        )
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_is_registered() {
        for op in OpCode::LUA51 {
            assert!(REGISTRY.contains_key(&op), "{op} missing");
        }
        assert_eq!(REGISTRY.len(), 48);
    }

    #[test]
    fn rk_flags_select_constant_reads() {
        let key = HandlerKey {
            opcode: OpCode::Add,
            kb: true,
            kc: false,
            variant: Variant::Plain,
        };
        assert_eq!(
            template(&key).unwrap(),
            "Stk[Inst[OP_A]] = Inst[OP_B] + Stk[Inst[OP_C]]"
        );
    }

    #[test]
    fn patch_variants_write_distinct_fields() {
        let reload = |field| HandlerKey {
            opcode: OpCode::Reload,
            kb: false,
            kc: false,
            variant: Variant::Patch(field),
        };
        assert!(template(&reload(Field::A)).unwrap().contains("][OP_A]"));
        assert!(template(&reload(Field::B)).unwrap().contains("][OP_B]"));
    }
}
