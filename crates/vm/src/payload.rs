//! Payload codec: XOR masking, LZW + base-36 token text, or plain hex.
//!
//! Token text is a sequence of `<len><value>` pairs where both parts are lowercase base-36 and
//! `<len>` is a single digit giving the width of `<value>`.

use crate::{Error, Result};
use std::collections::HashMap;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// LZW over a 256-entry initial dictionary.
pub fn compress(bytes: &[u8]) -> Vec<u32> {
    let mut dictionary: HashMap<Vec<u8>, u32> =
        (0..=255u8).map(|byte| (vec![byte], byte as u32)).collect();
    let mut tokens = Vec::new();
    let mut word: Vec<u8> = Vec::new();

    for &byte in bytes {
        let mut extended = word.clone();
        extended.push(byte);
        if dictionary.contains_key(&extended) {
            word = extended;
            continue;
        }
        tokens.push(dictionary[&word]);
        let next = dictionary.len() as u32;
        dictionary.insert(extended, next);
        word = vec![byte];
    }
    if !word.is_empty() {
        tokens.push(dictionary[&word]);
    }
    tokens
}

/// Inverse of [`compress`].
pub fn decompress(tokens: &[u32]) -> Result<Vec<u8>> {
    let Some((&first, rest)) = tokens.split_first() else {
        return Ok(Vec::new());
    };
    let mut dictionary: Vec<Vec<u8>> = (0..=255u8).map(|byte| vec![byte]).collect();
    let mut previous = dictionary
        .get(first as usize)
        .cloned()
        .ok_or_else(|| Error::MalformedPayload(format!("first token {first} is not a byte")))?;
    let mut out = previous.clone();

    for &token in rest {
        let entry = match dictionary.get(token as usize) {
            Some(entry) => entry.clone(),
            None if token as usize == dictionary.len() => {
                let mut entry = previous.clone();
                entry.push(previous[0]);
                entry
            }
            None => {
                return Err(Error::MalformedPayload(format!(
                    "token {token} is past the dictionary"
                )));
            }
        };
        let mut added = previous;
        added.push(entry[0]);
        dictionary.push(added);
        out.extend_from_slice(&entry);
        previous = entry;
    }
    Ok(out)
}

fn base36(mut value: u32) -> String {
    if value == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

pub fn encode(tokens: &[u32]) -> String {
    let mut out = String::new();
    for token in tokens {
        let value = base36(*token);
        out.push_str(&base36(value.len() as u32));
        out.push_str(&value);
    }
    out
}

pub fn decode(text: &str) -> Result<Vec<u32>> {
    let digit = |c: char| {
        c.to_digit(36)
            .ok_or_else(|| Error::MalformedPayload(format!("'{c}' is not a base-36 digit")))
    };
    let mut chars = text.chars();
    let mut tokens = Vec::new();
    while let Some(c) = chars.next() {
        let width = digit(c)?;
        let mut value: u32 = 0;
        for _ in 0..width {
            let c = chars
                .next()
                .ok_or_else(|| Error::MalformedPayload("truncated token".into()))?;
            value = value * 36 + digit(c)?;
        }
        tokens.push(value);
    }
    Ok(tokens)
}

pub fn xor(bytes: &[u8], key: u8) -> Vec<u8> {
    bytes.iter().map(|byte| byte ^ key).collect()
}

/// Masks and encodes a serialized chunk for embedding as a string literal.
pub fn pack(bytes: &[u8], key: u8, compressed: bool) -> String {
    let masked = xor(bytes, key);
    if compressed {
        encode(&compress(&masked))
    } else {
        hex::encode(masked)
    }
}

/// Inverse of [`pack`].
pub fn unpack(text: &str, key: u8, compressed: bool) -> Result<Vec<u8>> {
    let masked = if compressed {
        decompress(&decode(text)?)?
    } else {
        hex::decode(text).map_err(|e| Error::MalformedPayload(e.to_string()))?
    };
    Ok(xor(&masked, key))
}

/// Lua decoder for token text. The dictionary size is derived from the first byte of
/// `_VERSION` ("L", 76).
pub const LUA_DECOMPRESS: &str = r#"local function Decompress(Data)
	if #Data == 0 then
		return Data
	end
	local Dict, Size, Pos = {}, 2 ^ (Byte(Version, 1) - 68), 1
	for Idx = 0, Size - 1 do
		Dict[Idx] = Char(Idx)
	end
	local function Token()
		local Len = ToNumber(Sub(Data, Pos, Pos), 36)
		Pos = Pos + 1
		local Value = ToNumber(Sub(Data, Pos, Pos + Len - 1), 36)
		Pos = Pos + Len
		return Value
	end
	local Prev = Char(Token())
	local Parts = {Prev}
	while Pos <= #Data do
		local Code = Token()
		local Entry = Dict[Code]
		if not Entry then
			Entry = Prev .. Sub(Prev, 1, 1)
		end
		Dict[Size] = Prev .. Sub(Entry, 1, 1)
		Size = Size + 1
		Parts[#Parts + 1] = Entry
		Prev = Entry
	end
	return Concat(Parts)
end"#;

/// Lua decoder for hex text.
pub const LUA_HEX: &str = r#"local function Decompress(Data)
	local Parts = {}
	for Idx = 1, #Data, 2 do
		Parts[#Parts + 1] = Char(ToNumber(Sub(Data, Idx, Idx + 1), 16))
	end
	return Concat(Parts)
end"#;

/// Pure Lua XOR over byte values.
pub const LUA_XOR: &str = r#"local function BitXOR(A, B)
	local Result, Bit = 0, 1
	while A > 0 or B > 0 do
		local X, Y = A % 2, B % 2
		if X ~= Y then
			Result = Result + Bit
		end
		A, B, Bit = (A - X) / 2, (B - Y) / 2, Bit * 2
	end
	return Result
end"#;
