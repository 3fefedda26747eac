//! Anti-tamper weaving.
//!
//! A compiled Lua template is merged in front of every original prototype. The root gets the
//! entry template (hook probes, trap install), every nested prototype gets the cheaper nested
//! template. Template globals are lowered before merging:
//!
//! | global       | becomes                                   |
//! |--------------|-------------------------------------------|
//! | `__STATE`    | `GetState`                                |
//! | `__ENV`      | `GetEnv`                                  |
//! | `__CRASH`    | `LOADK` of a crash constant               |
//! | `__NEWSTACK` | `NewStack`, only inside the allocator helper |
//! | anything else| `GetSnapshot` of a per-build alias        |
//!
//! The allocator helper is the one template function whose first constant is `__NEWSTACK`;
//! its body must be `GETGLOBAL, RETURN, RETURN` or `SETGLOBAL, JMP, RETURN`.

use crate::{BuildSite, Error, Result, Transform};
use moonveil_core::frontend::Frontend;
use moonveil_core::{
    ChunkId, ConstId, Chunk, Constant, ConstantValue, Field, InstrId, Instruction, LuaFrontend,
    OpCode, Operand,
};
use rand::Rng;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

const ENTRY: &str = include_str!("../templates/entry.lua");
const NESTED: &str = include_str!("../templates/nested.lua");

const PASS: &str = "AntiTamper";
const STATE: &str = "__STATE";
const ENV: &str = "__ENV";
const CRASH: &str = "__CRASH";
const NEW_STACK: &str = "__NEWSTACK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Entry,
    Nested,
}

/// Both templates, compiled once per build.
#[derive(Debug, Clone)]
pub struct Templates {
    entry: Chunk,
    nested: Chunk,
}

impl Templates {
    pub fn compile(frontend: &dyn Frontend) -> Result<Self> {
        Self::from_sources(frontend, ENTRY, NESTED)
    }

    pub fn from_sources(frontend: &dyn Frontend, entry: &str, nested: &str) -> Result<Self> {
        Ok(Self {
            entry: frontend.load(entry, "entry")?,
            nested: frontend.load(nested, "nested")?,
        })
    }

    fn get(&self, variant: Variant) -> &Chunk {
        match variant {
            Variant::Entry => &self.entry,
            Variant::Nested => &self.nested,
        }
    }
}

pub struct AntiTamper {
    templates: Templates,
}

impl AntiTamper {
    /// Compiles the bundled templates with the embedded Lua front end.
    pub fn new() -> Result<Self> {
        Ok(Self::with_templates(Templates::compile(&LuaFrontend)?))
    }

    pub fn with_templates(templates: Templates) -> Self {
        Self { templates }
    }
}

impl Transform for AntiTamper {
    fn name(&self) -> &'static str {
        PASS
    }

    fn apply(&self, root: &mut Chunk, rng: &mut StdRng) -> Result<bool> {
        Ok(weave(root, &self.templates, rng)? > 0)
    }
}

/// Weaves the templates into `root` and every nested prototype. Returns the number of woven
/// chunks; chunks that already carry a prefix are left alone.
pub fn weave<R: Rng + ?Sized>(root: &mut Chunk, templates: &Templates, rng: &mut R) -> Result<usize> {
    debug!("weaving anti-tamper templates into chunk #{}", root.prototype_id);
    let mut weaver = Weaver {
        templates,
        rng,
        aliases: BTreeMap::new(),
        taken: HashSet::new(),
        next_prototype: root.max_prototype_id() + 1,
        woven: 0,
    };
    weaver.chunk(root, Variant::Entry)?;
    Ok(weaver.woven)
}

struct Weaver<'a, R: ?Sized> {
    templates: &'a Templates,
    rng: &'a mut R,
    /// Global name -> snapshot alias, shared by the whole build.
    aliases: BTreeMap<String, String>,
    taken: HashSet<String>,
    next_prototype: u32,
    woven: usize,
}

impl<R: Rng + ?Sized> Weaver<'_, R> {
    fn chunk(&mut self, target: &mut Chunk, variant: Variant) -> Result<()> {
        if target.has_anti_tamper() {
            debug!("chunk #{} already woven", target.prototype_id);
            return Ok(());
        }
        let originals = target.functions.ids().to_vec();
        let template = self.templates.get(variant).clone();
        self.merge(target, template)?;
        self.woven += 1;

        for id in originals {
            self.chunk(&mut target.functions[id], Variant::Nested)?;
        }
        Ok(())
    }

    fn merge(&mut self, target: &mut Chunk, mut template: Chunk) -> Result<()> {
        let site = BuildSite::new(target, PASS);
        relocatable(&template, &site)?;

        let ret = match template.instructions.ids().last() {
            Some(id) if template.instructions[*id].opcode == OpCode::Return => *id,
            _ => {
                return Err(Error::StructuralAssumption {
                    site,
                    reason: "template does not end in RETURN".into(),
                });
            }
        };
        let Some(&entry) = target.instructions.ids().first() else {
            return Err(Error::StructuralAssumption {
                site,
                reason: "target chunk has no instructions".into(),
            });
        };

        rewrite_helper(&mut template, &site)?;
        let mut used = self.lower_globals(&mut template, ret, &site)?;
        for id in template.functions.ids().to_vec() {
            self.lower_globals_nested(&mut template.functions[id], &site, &mut used)?;
        }
        prune_constants(&mut template);

        // Template registers move above the target's frame.
        let shift = target.stack_size as i32;
        target.stack_size += template.stack_size;

        let constants: HashMap<ConstId, ConstId> = template
            .constants
            .iter()
            .map(|(id, constant)| (id, target.constants.push(constant.clone())))
            .collect();
        let mut functions: HashMap<ChunkId, ChunkId> = HashMap::new();
        for id in template.functions.ids().to_vec() {
            let mut child = template.functions[id].clone();
            self.renumber(&mut child);
            functions.insert(id, target.functions.push(child));
        }

        let mut prefix = Vec::with_capacity(template.instructions.len());
        let mut moved: HashMap<InstrId, InstrId> = HashMap::from([(ret, entry)]);
        for (id, instruction) in template.instructions.iter() {
            if id == ret {
                continue;
            }
            let mut copy = instruction.clone();
            shift_registers(&mut copy, shift);
            copy.constant = copy.constant.map(|k| constants[&k]);
            copy.k_b = copy.k_b.map(|k| constants[&k]);
            copy.k_c = copy.k_c.map(|k| constants[&k]);
            copy.prototype = copy.prototype.map(|p| functions[&p]);
            let new = target.instructions.alloc(copy);
            moved.insert(id, new);
            prefix.push(new);
        }
        for id in &prefix {
            let instruction = &mut target.instructions[*id];
            if let Some(jump) = instruction.jump {
                instruction.jump = Some(moved[&jump]);
            }
        }

        let Some(&last) = prefix.last() else {
            return Err(Error::StructuralAssumption {
                site,
                reason: "template has no instructions besides RETURN".into(),
            });
        };
        debug!(
            "chunk #{}: woven {} instructions, {} constants, register shift {}",
            target.prototype_id,
            prefix.len(),
            constants.len(),
            shift
        );
        let mut order = prefix;
        order.extend_from_slice(target.instructions.ids());
        target.instructions.set_order(order);
        target.recompute();
        target.anti_tamper = Some(last);
        for global in used {
            if let Some(alias) = self.aliases.get(&global) {
                target.environment_names.insert(global, alias.clone());
            }
        }
        Ok(())
    }

    /// Lowers the global reads of the template's main body. Returns the globals that went
    /// through the snapshot.
    fn lower_globals(&mut self, template: &mut Chunk, ret: InstrId, site: &BuildSite) -> Result<Vec<String>> {
        let mut used = Vec::new();
        let mut crash = None;
        for (position, id) in template.instructions.ids().to_vec().into_iter().enumerate() {
            let instruction = &template.instructions[id];
            match instruction.opcode {
                OpCode::GetGlobal => {}
                OpCode::Return if id == ret => continue,
                OpCode::SetGlobal | OpCode::Return | OpCode::TailCall | OpCode::VarArg => {
                    return Err(Error::UnsupportedInstruction {
                        site: site.clone().at(position),
                        opcode: instruction.opcode.mnemonic().into(),
                    });
                }
                op if op.is_pseudo() => {
                    return Err(Error::UnsupportedInstruction {
                        site: site.clone().at(position),
                        opcode: op.mnemonic().into(),
                    });
                }
                _ => continue,
            }

            let register = instruction.a;
            let name = global_name(template, instruction, site, position)?;
            let lowered = match name.as_str() {
                STATE => Instruction::new(OpCode::GetState).with_a(register),
                ENV => Instruction::new(OpCode::GetEnv).with_a(register),
                CRASH => {
                    let constant = *crash.get_or_insert_with(|| {
                        template.constants.push(Constant::tamper(ConstantValue::Crash))
                    });
                    let mut load = Instruction::new(OpCode::LoadK).with_a(register);
                    load.constant = Some(constant);
                    load
                }
                NEW_STACK => {
                    return Err(Error::TemplateContractViolation {
                        site: site.clone().at(position),
                        reason: format!("{NEW_STACK} read outside the allocator helper"),
                    });
                }
                _ => {
                    let load = self.snapshot(template, register, &name);
                    used.push(name);
                    load
                }
            };
            template.instructions[id] = lowered;
        }
        Ok(used)
    }

    /// Global reads inside template functions other than the allocator helper.
    fn lower_globals_nested(&mut self, chunk: &mut Chunk, site: &BuildSite, used: &mut Vec<String>) -> Result<()> {
        for (position, id) in chunk.instructions.ids().to_vec().into_iter().enumerate() {
            let instruction = &chunk.instructions[id];
            match instruction.opcode {
                OpCode::GetGlobal => {
                    let register = instruction.a;
                    let name = global_name(chunk, instruction, site, position)?;
                    if name.starts_with("__") {
                        return Err(Error::TemplateContractViolation {
                            site: site.clone().at(position),
                            reason: format!("marker {name} used inside a template function"),
                        });
                    }
                    chunk.instructions[id] = self.snapshot(chunk, register, &name);
                    used.push(name);
                }
                OpCode::SetGlobal => {
                    return Err(Error::UnsupportedInstruction {
                        site: site.clone().at(position),
                        opcode: instruction.opcode.mnemonic().into(),
                    });
                }
                _ => {}
            }
        }
        prune_constants(chunk);
        for id in chunk.functions.ids().to_vec() {
            self.lower_globals_nested(&mut chunk.functions[id], site, used)?;
        }
        Ok(())
    }

    fn snapshot(&mut self, chunk: &mut Chunk, register: i32, global: &str) -> Instruction {
        let alias = self.alias(global);
        let constant = chunk
            .constants
            .push(Constant::tamper(ConstantValue::string(alias)));
        let mut load = Instruction::new(OpCode::GetSnapshot).with_a(register);
        load.constant = Some(constant);
        load
    }

    fn alias(&mut self, global: &str) -> String {
        if let Some(alias) = self.aliases.get(global) {
            return alias.clone();
        }
        let alias = loop {
            let len = self.rng.random_range(6..=10);
            let candidate: String = (0..len)
                .map(|_| char::from(b'a' + self.rng.random_range(0..26u8)))
                .collect();
            if self.taken.insert(candidate.clone()) {
                break candidate;
            }
        };
        self.aliases.insert(global.to_string(), alias.clone());
        alias
    }

    fn renumber(&mut self, chunk: &mut Chunk) {
        chunk.prototype_id = self.next_prototype;
        self.next_prototype += 1;
        for id in chunk.functions.ids().to_vec() {
            self.renumber(&mut chunk.functions[id]);
        }
    }
}

/// Rejects templates that reach outside their own frame.
fn relocatable(chunk: &Chunk, site: &BuildSite) -> Result<()> {
    if chunk.num_upvalues > 0 || !chunk.captures.is_empty() {
        return Err(Error::TemplateContractViolation {
            site: site.clone(),
            reason: format!("template function #{} captures upvalues", chunk.prototype_id),
        });
    }
    for (position, (_, instruction)) in chunk.instructions.iter().enumerate() {
        if matches!(instruction.opcode, OpCode::GetUpval | OpCode::SetUpval) {
            return Err(Error::TemplateContractViolation {
                site: site.clone().at(position),
                reason: "template references an upvalue".into(),
            });
        }
    }
    for (_, child) in chunk.functions.iter() {
        relocatable(child, site)?;
    }
    Ok(())
}

fn global_name(chunk: &Chunk, instruction: &Instruction, site: &BuildSite, position: usize) -> Result<String> {
    instruction
        .constant
        .and_then(|k| chunk.constants.get(k))
        .and_then(|k| k.value.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::StructuralAssumption {
            site: site.clone().at(position),
            reason: "global access without a string constant".into(),
        })
}

fn shift_registers(instruction: &mut Instruction, shift: i32) {
    for field in Field::STORAGE {
        let register = match instruction.opcode.operand(field) {
            Operand::Register => true,
            Operand::RegisterOrConstant => instruction.constant_in(field).is_none(),
            _ => false,
        };
        if register {
            *instruction.field_mut(field) += shift;
        }
    }
}

/// Drops constants no instruction refers to any more, keeping the order of the rest.
fn prune_constants(chunk: &mut Chunk) {
    let referenced: HashSet<ConstId> = chunk
        .instructions
        .iter()
        .flat_map(|(_, instruction)| [instruction.constant, instruction.k_b, instruction.k_c])
        .flatten()
        .collect();
    let order: Vec<ConstId> = chunk
        .constants
        .ids()
        .iter()
        .copied()
        .filter(|id| referenced.contains(id))
        .collect();
    chunk.constants.set_order(order);
}

/// Finds the allocator helper and turns its marker access into `NewStack`.
///
/// Two three-instruction bodies are accepted. Lua 5.1 compiles `function() return __NEWSTACK
/// end` to `GETGLOBAL, RETURN, RETURN`; an assignment-style helper compiles to `SETGLOBAL, JMP,
/// RETURN`. In both the first instruction's A register is the slot the new stack lands in, and
/// the instructions after it are left as they are.
fn rewrite_helper(template: &mut Chunk, site: &BuildSite) -> Result<()> {
    let helpers: Vec<ChunkId> = template
        .functions
        .iter()
        .filter(|(_, child)| {
            child.constants.iter().next().and_then(|(_, k)| k.value.as_str()) == Some(NEW_STACK)
        })
        .map(|(id, _)| id)
        .collect();
    let [helper] = helpers[..] else {
        return Err(Error::StructuralAssumption {
            site: site.clone(),
            reason: format!("expected exactly one allocator helper, found {}", helpers.len()),
        });
    };

    let chunk = &mut template.functions[helper];
    let body = chunk.instructions.ids().to_vec();
    let shape: Vec<OpCode> = body.iter().map(|id| chunk.instructions[*id].opcode).collect();
    let recognized = matches!(
        shape[..],
        [OpCode::GetGlobal, OpCode::Return, OpCode::Return] | [OpCode::SetGlobal, OpCode::Jmp, OpCode::Return]
    );
    if !recognized {
        return Err(Error::StructuralAssumption {
            site: site.clone(),
            reason: format!("allocator helper has unexpected shape {shape:?}"),
        });
    }
    let register = chunk.instructions[body[0]].a;
    chunk.instructions[body[0]] = Instruction::new(OpCode::NewStack).with_a(register);
    debug!("allocator helper lowered to NEWSTACK ({:?})", shape[0]);
    Ok(())
}
