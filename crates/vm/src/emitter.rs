//! Interpreter assembly.
//!
//! The emitted script is self-contained: it spells its library lookups through [`uglify`],
//! decodes the embedded payload, deserializes the chunk tree in this build's section order and
//! runs it through `Wrap`, whose loop dispatches on a randomized comparison tree over the
//! allocated handler ids.
//!
//! The body of the dispatch loop starts with a `--@protect` marker so source-level passes keep
//! it as written.

use crate::context::{BuildContext, ChunkStep};
use crate::payload::{self, LUA_DECOMPRESS, LUA_HEX, LUA_XOR};
use crate::template;
use crate::uglify::{spell, uglify_func};
use crate::{Error, Result};
use moonveil_core::dispatch;
use rand::seq::SliceRandom;
use std::fmt::Write as _;
use tracing::debug;

/// Library bindings captured once at boot.
const LIBRARY: [(&str, &[&str]); 10] = [
    ("Byte", &["string", "byte"]),
    ("Sub", &["string", "sub"]),
    ("Concat", &["table", "concat"]),
    ("ToNumber", &["tonumber"]),
    ("Select", &["select"]),
    ("Unpack", &["unpack"]),
    ("SetMetatable", &["setmetatable"]),
    ("Pairs", &["pairs"]),
    ("Ldexp", &["math", "ldexp"]),
    ("Version", &["_VERSION"]),
];

const READERS: [(&str, &str); 7] = [
    (
        "gBit",
        r#"gBit = function(Bit, Start, End)
	if End then
		local Res = (Bit / 2 ^ (Start - 1)) % 2 ^ ((End - 1) - (Start - 1) + 1)
		return Res - Res % 1
	end
	local Plc = 2 ^ (Start - 1)
	if Bit % (Plc + Plc) >= Plc then
		return 1
	end
	return 0
end"#,
    ),
    (
        "gBits8",
        r#"gBits8 = function()
	local Value = Bytes[Pos]
	Pos = Pos + 1
	return Value
end"#,
    ),
    (
        "gBits32",
        r#"gBits32 = function()
	local W, X, Y, Z = Bytes[Pos], Bytes[Pos + 1], Bytes[Pos + 2], Bytes[Pos + 3]
	Pos = Pos + 4
	return (Z * 16777216) + (Y * 65536) + (X * 256) + W
end"#,
    ),
    (
        "gLeb",
        r#"gLeb = function()
	local Value, Scale = 0, 1
	while true do
		local Part = gBits8()
		Value = Value + (Part % 128) * Scale
		Scale = Scale * 128
		if Part < 128 then
			return Value
		end
	end
end"#,
    ),
    (
        "gSigned",
        r#"gSigned = function()
	local Value = gLeb()
	if Value % 2 == 0 then
		return Value / 2
	end
	return -(Value + 1) / 2
end"#,
    ),
    (
        "gFloat",
        r#"gFloat = function()
	local Left = gBits32()
	local Right = gBits32()
	local IsNormal = 1
	local Mantissa = (gBit(Right, 1, 20) * (2 ^ 32)) + Left
	local Exponent = gBit(Right, 21, 31)
	local Sign = (-1) ^ gBit(Right, 32)
	if Exponent == 0 then
		if Mantissa == 0 then
			return Sign * 0
		end
		Exponent = 1
		IsNormal = 0
	elseif Exponent == 2047 then
		if Mantissa == 0 then
			return Sign * (1 / 0)
		end
		return Sign * (0 / 0)
	end
	return Ldexp(Sign, Exponent - 1023) * (IsNormal + (Mantissa / (2 ^ 52)))
end"#,
    ),
    (
        "gString",
        r#"gString = function()
	local Len = gLeb()
	local Parts = {}
	for Idx = 1, Len do
		Parts[Idx] = Char(gBits8())
	end
	return Concat(Parts)
end"#,
    ),
];

const TRAP: &str = r##"local function Trap()
	while true do
	end
end
local Crash = SetMetatable({}, {__index = Trap, __newindex = Trap, __call = Trap, __tostring = Trap, __len = Trap})
local function Pack(...)
	return {n = Select("#", ...), ...}
end"##;

const INSTRUCTIONS: &str = r#"	for Idx = 1, gLeb() do
		local Descriptor = gBits8()
		local Inst = {}
		Inst[OP_ENUM] = gLeb()
		if gBit(Descriptor, 4) == 1 then
			Inst[OP_A] = gSigned()
		end
		if gBit(Descriptor, 5) == 1 then
			Inst[OP_B] = gSigned()
		end
		if gBit(Descriptor, 6) == 1 then
			Inst[OP_C] = gSigned()
		end
		if gBit(Descriptor, 7) == 1 then
			Inst[OP_E] = gSigned()
		end
		if gBit(Descriptor, 8) == 1 then
			Inst[OP_F] = gSigned()
		end
		if gBit(Descriptor, 1) == 1 then
			Fix[#Fix + 1] = {Inst, OP_A, Inst[OP_A]}
		end
		if gBit(Descriptor, 2) == 1 then
			Fix[#Fix + 1] = {Inst, OP_B, Inst[OP_B]}
		end
		if gBit(Descriptor, 3) == 1 then
			Fix[#Fix + 1] = {Inst, OP_C, Inst[OP_C]}
		end
		Instr[Idx] = Inst
	end
"#;

const FUNCTIONS: &str = r#"	for Idx = 0, gLeb() - 1 do
		Proto[Idx] = Deserialize()
	end
"#;

const WRAP_HEAD: &str = r#"local function Wrap(Chunk, Upvalues, Env)
	local Instr = Chunk[K_INSTR]
	local Proto = Chunk[K_PROTO]
	local Params = Chunk[K_PARAMS]
	local State = Chunk[K_STATE]
	return function(...)
		local Stk, Open, Vt, Varargs = {}, {}, {}, {}
		local Top, InstrPoint = -1, 1
		local Args = Pack(...)
		local Varg = Args.n - Params
		if Varg < 0 then
			Varg = 0
		end
		for Idx = 0, Args.n - 1 do
			if Idx >= Params then
				Varargs[Idx - Params] = Args[Idx + 1]
			else
				Stk[Idx] = Args[Idx + 1]
			end
		end
		while true do
			--@protect
			local Inst = Instr[InstrPoint]
			local Enum = Inst[OP_ENUM]
			do
"#;

const WRAP_TAIL: &str = r#"
			end
			InstrPoint = InstrPoint + 1
		end
	end
end
"#;

fn constants(ctx: &mut BuildContext) -> String {
    let tags = ctx.tags;
    let mut branches = vec![
        (tags.boolean, "gBits8() ~= 0"),
        (tags.number, "gFloat()"),
        (tags.string, "gString()"),
        (tags.crash, "Crash"),
    ];
    branches.shuffle(&mut ctx.rng);

    let mut out = String::from("\tfor Idx = 0, gLeb() - 1 do\n\t\tlocal Tag = gBits8()\n");
    for (n, (tag, reader)) in branches.iter().enumerate() {
        let keyword = if n == 0 { "if" } else { "elseif" };
        let _ = writeln!(out, "\t\t{keyword} Tag == {tag} then\n\t\t\tConst[Idx] = {reader}");
    }
    out.push_str("\t\tend\n\tend\n");
    out
}

fn deserializer(ctx: &mut BuildContext) -> String {
    let mut out = String::from(concat!(
        "local function Deserialize()\n",
        "\tlocal Instr, Const, Proto, Fix, Caps = {}, {}, {}, {}, {}\n",
        "\tlocal Chunk = {}\n",
        "\tChunk[K_INSTR] = Instr\n",
        "\tChunk[K_PROTO] = Proto\n",
        "\tChunk[K_CAPS] = Caps\n",
        "\tChunk[K_STATE] = {}\n",
        "\tfor Idx = 1, gLeb() do\n",
        "\t\tlocal Kind = gBits8()\n",
        "\t\tCaps[Idx] = {Kind, gLeb()}\n",
        "\tend\n",
    ));
    for step in ctx.chunk_steps {
        match step {
            ChunkStep::Params => out.push_str("\tChunk[K_PARAMS] = gBits8()\n"),
            ChunkStep::Constants => out.push_str(&constants(ctx)),
            ChunkStep::Instructions => out.push_str(INSTRUCTIONS),
            ChunkStep::Functions => out.push_str(FUNCTIONS),
        }
    }
    out.push_str(concat!(
        "\tfor Idx = 1, #Fix do\n",
        "\t\tlocal Entry = Fix[Idx]\n",
        "\t\tEntry[1][Entry[2]] = Const[Entry[3]]\n",
        "\tend\n",
        "\treturn Chunk\n",
        "end\n",
    ));
    out
}

/// Renders the interpreter around `bytes`, the serialized chunk tree.
pub fn emit(ctx: &mut BuildContext, bytes: &[u8]) -> Result<String> {
    if ctx.handlers.is_empty() {
        return Err(Error::NoHandlers);
    }
    let data = payload::pack(bytes, ctx.xor_key, ctx.settings.extra_compression);

    let entries: Vec<(i64, String)> = ctx
        .handlers
        .iter()
        .enumerate()
        .map(|(id, handler)| (id as i64, handler.body.clone()))
        .collect();
    let tree = dispatch::build(entries, &mut ctx.rng)?;
    debug!(
        "dispatch tree over {} handlers, depth {}",
        ctx.handlers.len(),
        tree.depth()
    );
    let switch = tree.render("Enum", &mut |_, body: &String| body.clone());

    let mut out = String::from("local Env = getfenv()\nlocal Char = (\"\").char\n");

    let mut library = LIBRARY.to_vec();
    library.shuffle(&mut ctx.rng);
    for (name, path) in library {
        let _ = writeln!(out, "local {name} = {}", uglify_func(path, &mut ctx.rng));
    }

    let _ = writeln!(out, "local Key = {}", ctx.xor_key);
    let _ = writeln!(out, "local Data = \"{data}\"");
    out.push_str(LUA_XOR);
    out.push('\n');
    out.push_str(if ctx.settings.extra_compression {
        LUA_DECOMPRESS
    } else {
        LUA_HEX
    });
    out.push_str(concat!(
        "\nlocal Bytes, Pos = {}, 1\n",
        "do\n",
        "\tlocal Raw = Decompress(Data)\n",
        "\tfor Idx = 1, #Raw do\n",
        "\t\tBytes[Idx] = BitXOR(Byte(Raw, Idx), Key)\n",
        "\tend\n",
        "end\n",
    ));

    let mut readers = READERS.to_vec();
    readers.shuffle(&mut ctx.rng);
    let names: Vec<&str> = readers.iter().map(|(name, _)| *name).collect();
    let _ = writeln!(out, "local {}", names.join(", "));
    readers.shuffle(&mut ctx.rng);
    for (_, body) in readers {
        out.push_str(body);
        out.push('\n');
    }

    out.push_str(TRAP);
    out.push_str("\nlocal Snapshot = {}\n");
    let snapshot: Vec<(String, String)> = ctx
        .snapshot
        .iter()
        .map(|(alias, global)| (alias.clone(), global.clone()))
        .collect();
    for (alias, global) in snapshot {
        let _ = writeln!(
            out,
            "Snapshot[{}] = {}",
            spell(&alias, &mut ctx.rng),
            uglify_func(&[global.as_str()], &mut ctx.rng)
        );
    }

    out.push_str(&deserializer(ctx));
    out.push_str(WRAP_HEAD);
    out.push_str(&switch);
    out.push_str(WRAP_TAIL);
    out.push_str("return Wrap(Deserialize(), {}, Env)(...)\n");

    Ok(template::bind(&out, &ctx.placeholders()))
}
