//! Closed opcode set: the 38 Lua 5.1 operations plus the pseudo-operations the obfuscator
//! introduces. Every pass that needs per-opcode knowledge matches on [`OpCode`] exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operand slot of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    A,
    B,
    C,
    E,
    F,
}

impl Field {
    pub const ALL: [Field; 5] = [Field::A, Field::B, Field::C, Field::E, Field::F];
    pub const STORAGE: [Field; 3] = [Field::A, Field::B, Field::C];

    pub fn name(self) -> &'static str {
        match self {
            Field::A => "A",
            Field::B => "B",
            Field::C => "C",
            Field::E => "E",
            Field::F => "F",
        }
    }
}

/// Meaning of one of the A/B/C operand slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Unused,
    /// Stack register.
    Register,
    /// Register, or constant when the decoded value has the RK bit set.
    RegisterOrConstant,
    /// Constant pool index.
    Constant,
    Upvalue,
    /// Child function pool index.
    Prototype,
    /// Plain integer.
    Immediate,
    /// Control target held as a symbolic jump reference.
    Jump,
}

/// How an instruction hands control to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Falls through to the next instruction.
    Next,
    /// Always transfers to its jump target.
    Jump,
    /// Either falls through or transfers to its jump target.
    Branch,
    /// Leaves the function.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpCode {
    Move,
    LoadK,
    LoadBool,
    LoadNil,
    GetUpval,
    GetGlobal,
    GetTable,
    SetGlobal,
    SetUpval,
    SetTable,
    NewTable,
    SelfOp,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForLoop,
    SetList,
    Close,
    Closure,
    VarArg,
    /// `R(A) := environment`
    GetEnv,
    /// `R(A) := per-prototype state table`
    GetState,
    /// `R(A) := boot-time snapshot[K(B)]`
    GetSnapshot,
    /// `R(A) := fresh stack table`
    NewStack,
    /// Patches the dispatch id of the instruction at `F` with `A`.
    Redirect,
    /// Patches an operand of the instruction at `F` with `A`.
    Reload,
    /// `Vt[B] := A`
    PushCachedKey,
    /// Moves `Vt[B]` into an operand of the instruction at `F`.
    PopCachedKey,
    /// Redirect followed by an unconditional jump.
    DynamicRedirect,
    /// Unconditional jump dressed as a numeric for preparation with `B > C`.
    FakeForPrep,
}

use self::Operand::{
    Constant as K, Immediate as I, Jump as J, Register as R, RegisterOrConstant as RK,
    Unused as U,
};

impl OpCode {
    /// Lua 5.1 opcodes in wire order.
    pub const LUA51: [OpCode; 38] = [
        OpCode::Move,
        OpCode::LoadK,
        OpCode::LoadBool,
        OpCode::LoadNil,
        OpCode::GetUpval,
        OpCode::GetGlobal,
        OpCode::GetTable,
        OpCode::SetGlobal,
        OpCode::SetUpval,
        OpCode::SetTable,
        OpCode::NewTable,
        OpCode::SelfOp,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Pow,
        OpCode::Unm,
        OpCode::Not,
        OpCode::Len,
        OpCode::Concat,
        OpCode::Jmp,
        OpCode::Eq,
        OpCode::Lt,
        OpCode::Le,
        OpCode::Test,
        OpCode::TestSet,
        OpCode::Call,
        OpCode::TailCall,
        OpCode::Return,
        OpCode::ForLoop,
        OpCode::ForPrep,
        OpCode::TForLoop,
        OpCode::SetList,
        OpCode::Close,
        OpCode::Closure,
        OpCode::VarArg,
    ];

    pub fn from_lua51(raw: u8) -> Option<Self> {
        Self::LUA51.get(raw as usize).copied()
    }

    pub fn is_pseudo(self) -> bool {
        matches!(
            self,
            OpCode::GetEnv
                | OpCode::GetState
                | OpCode::GetSnapshot
                | OpCode::NewStack
                | OpCode::Redirect
                | OpCode::Reload
                | OpCode::PushCachedKey
                | OpCode::PopCachedKey
                | OpCode::DynamicRedirect
                | OpCode::FakeForPrep
        )
    }

    /// Meaning of the A, B and C slots.
    pub fn operands(self) -> [Operand; 3] {
        match self {
            OpCode::Move => [R, R, U],
            OpCode::LoadK => [R, K, U],
            OpCode::LoadBool => [R, I, I],
            OpCode::LoadNil => [R, R, U],
            OpCode::GetUpval => [R, Operand::Upvalue, U],
            OpCode::GetGlobal => [R, K, U],
            OpCode::GetTable => [R, R, RK],
            OpCode::SetGlobal => [R, K, U],
            OpCode::SetUpval => [R, Operand::Upvalue, U],
            OpCode::SetTable => [R, RK, RK],
            OpCode::NewTable => [R, I, I],
            OpCode::SelfOp => [R, R, RK],
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                [R, RK, RK]
            }
            OpCode::Unm | OpCode::Not | OpCode::Len => [R, R, U],
            OpCode::Concat => [R, R, R],
            OpCode::Jmp => [U, J, U],
            OpCode::Eq | OpCode::Lt | OpCode::Le => [I, RK, RK],
            OpCode::Test => [R, U, I],
            OpCode::TestSet => [R, R, I],
            OpCode::Call | OpCode::TailCall => [R, I, I],
            OpCode::Return => [R, I, U],
            OpCode::ForLoop | OpCode::ForPrep => [R, J, U],
            OpCode::TForLoop => [R, U, I],
            OpCode::SetList => [R, I, I],
            OpCode::Close => [R, U, U],
            OpCode::Closure => [R, Operand::Prototype, U],
            OpCode::VarArg => [R, I, U],
            OpCode::GetEnv | OpCode::GetState | OpCode::NewStack => [R, U, U],
            OpCode::GetSnapshot => [R, K, U],
            OpCode::Redirect | OpCode::Reload => [I, U, U],
            OpCode::PushCachedKey => [I, I, U],
            OpCode::PopCachedKey => [U, I, U],
            OpCode::DynamicRedirect => [I, J, U],
            OpCode::FakeForPrep => [J, I, I],
        }
    }

    pub fn operand(self, field: Field) -> Operand {
        let [a, b, c] = self.operands();
        match field {
            Field::A => a,
            Field::B => b,
            Field::C => c,
            Field::E => {
                if self.jump_field() == Some(Field::E) {
                    J
                } else {
                    U
                }
            }
            Field::F => {
                if self.patches() {
                    I
                } else {
                    U
                }
            }
        }
    }

    /// Slot that receives the resolved jump reference.
    ///
    /// `LoadBool` only has one when its skip flag is set; callers decide that from the
    /// instruction itself.
    pub fn jump_field(self) -> Option<Field> {
        match self {
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::DynamicRedirect => {
                Some(Field::B)
            }
            OpCode::FakeForPrep => Some(Field::A),
            OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Test
            | OpCode::TestSet
            | OpCode::TForLoop
            | OpCode::LoadBool => Some(Field::E),
            _ => None,
        }
    }

    /// Whether the instruction rewrites another instruction addressed through F.
    pub fn patches(self) -> bool {
        matches!(
            self,
            OpCode::Redirect | OpCode::Reload | OpCode::PopCachedKey | OpCode::DynamicRedirect
        )
    }

    /// Control behaviour, given whether the instruction carries a jump reference.
    pub fn control(self, has_jump: bool) -> Control {
        match self {
            OpCode::Jmp | OpCode::ForPrep | OpCode::DynamicRedirect | OpCode::FakeForPrep => {
                Control::Jump
            }
            OpCode::LoadBool if has_jump => Control::Jump,
            OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Test
            | OpCode::TestSet
            | OpCode::ForLoop
            | OpCode::TForLoop => Control::Branch,
            OpCode::Return | OpCode::TailCall => Control::Stop,
            _ => Control::Next,
        }
    }

    /// Whether the instruction substitution engine may wrap this opcode.
    pub fn substitutable(self) -> bool {
        match self {
            OpCode::Move
            | OpCode::LoadNil
            | OpCode::GetUpval
            | OpCode::GetTable
            | OpCode::SetUpval
            | OpCode::SetTable
            | OpCode::NewTable
            | OpCode::SelfOp
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Unm
            | OpCode::Not
            | OpCode::Len
            | OpCode::Concat
            | OpCode::Call
            | OpCode::SetList
            | OpCode::Close
            | OpCode::VarArg => true,
            OpCode::LoadK
            | OpCode::LoadBool
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::Jmp
            | OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Test
            | OpCode::TestSet
            | OpCode::TailCall
            | OpCode::Return
            | OpCode::ForLoop
            | OpCode::ForPrep
            | OpCode::TForLoop
            | OpCode::Closure
            | OpCode::GetEnv
            | OpCode::GetState
            | OpCode::GetSnapshot
            | OpCode::NewStack
            | OpCode::Redirect
            | OpCode::Reload
            | OpCode::PushCachedKey
            | OpCode::PopCachedKey
            | OpCode::DynamicRedirect
            | OpCode::FakeForPrep => false,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Close => "CLOSE",
            OpCode::Closure => "CLOSURE",
            OpCode::VarArg => "VARARG",
            OpCode::GetEnv => "GETENV",
            OpCode::GetState => "GETSTATE",
            OpCode::GetSnapshot => "GETSNAPSHOT",
            OpCode::NewStack => "NEWSTACK",
            OpCode::Redirect => "REDIRECT",
            OpCode::Reload => "RELOAD",
            OpCode::PushCachedKey => "PUSHKEY",
            OpCode::PopCachedKey => "POPKEY",
            OpCode::DynamicRedirect => "DYNREDIRECT",
            OpCode::FakeForPrep => "FAKEFORPREP",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_order_matches_lua51() {
        assert_eq!(OpCode::from_lua51(0), Some(OpCode::Move));
        assert_eq!(OpCode::from_lua51(22), Some(OpCode::Jmp));
        assert_eq!(OpCode::from_lua51(30), Some(OpCode::Return));
        assert_eq!(OpCode::from_lua51(37), Some(OpCode::VarArg));
        assert_eq!(OpCode::from_lua51(38), None);
    }

    #[test]
    fn pseudo_ops_are_never_substituted() {
        for op in [
            OpCode::GetEnv,
            OpCode::Redirect,
            OpCode::PopCachedKey,
            OpCode::FakeForPrep,
        ] {
            assert!(op.is_pseudo());
            assert!(!op.substitutable());
        }
    }

    #[test]
    fn every_jump_op_has_a_jump_field() {
        for op in OpCode::LUA51 {
            if matches!(op.control(true), Control::Jump | Control::Branch) {
                assert!(op.jump_field().is_some(), "{op} has no jump field");
            }
        }
    }
}
