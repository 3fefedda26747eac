//! Statement-list flattening.
//!
//! A function body with enough top-level statements is cut into steps and driven by a state
//! variable inside `while true do ... end`. The steps are selected either through an
//! `if`/`elseif` chain over a contiguous key range, or through a dispatch tree over scattered
//! keys. Top-level locals are hoisted into one declaration so every step sees them.

use crate::Options;
use crate::ast::*;
use crate::names::Names;
use crate::Result;
use moonveil_core::dispatch::{self, Comparison, DispatchNode};
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::debug;

pub fn flatten<R: Rng + ?Sized>(
    chunk: &mut Block,
    rng: &mut R,
    names: &mut Names,
    options: &Options,
) -> Result<usize> {
    let mut pass = Flattener {
        rng,
        names,
        options,
        flattened: 0,
    };
    pass.function(&[], chunk)?;
    debug!("flattened {} function bodies", pass.flattened);
    Ok(pass.flattened)
}

struct Flattener<'a, R: ?Sized> {
    rng: &'a mut R,
    names: &'a mut Names,
    options: &'a Options,
    flattened: usize,
}

impl<R: Rng + ?Sized> Flattener<'_, R> {
    fn function(&mut self, params: &[String], body: &mut Block) -> Result<()> {
        if body.protected {
            return Ok(());
        }
        self.nested(body)?;
        if let Some(hoisted) = hoistable(params, body, self.options.flatten_threshold) {
            self.rebuild(body, hoisted)?;
            self.flattened += 1;
        }
        Ok(())
    }

    /// Flattens every function defined inside `block`.
    fn nested(&mut self, block: &mut Block) -> Result<()> {
        if block.protected {
            return Ok(());
        }
        for stat in &mut block.stats {
            for child in stat.children_mut() {
                self.child(child)?;
            }
        }
        Ok(())
    }

    fn child(&mut self, child: Child<'_>) -> Result<()> {
        match child {
            Child::Func(func) => self.function(&func.params, &mut func.body),
            Child::Block(block) => self.nested(block),
            Child::Expr(expr) => {
                for child in expr.children_mut() {
                    self.child(child)?;
                }
                Ok(())
            }
        }
    }

    fn rebuild(&mut self, body: &mut Block, hoisted: Vec<String>) -> Result<()> {
        let stats: Vec<Stat> = std::mem::take(&mut body.stats).into_iter().map(unlocal).collect();

        let mut steps = Vec::new();
        let mut rest = stats.into_iter().peekable();
        while rest.peek().is_some() {
            let size = self.rng.random_range(1..=2);
            steps.push(rest.by_ref().take(size).collect::<Vec<_>>());
        }

        let count = steps.len();
        let tree = self.rng.random_bool(0.5);
        let keys: Vec<i64> = if tree {
            rand::seq::index::sample(self.rng, 1 << 20, count)
                .into_iter()
                .map(|k| k as i64)
                .collect()
        } else {
            let start = self.rng.random_range(0..100_000);
            (start..start + count as i64).collect()
        };

        let state = self.names.fresh(self.rng);
        let mut entries = Vec::with_capacity(count);
        for (n, mut stats) in steps.into_iter().enumerate() {
            if !matches!(stats.last(), Some(Stat::Return(_))) {
                stats.push(match keys.get(n + 1) {
                    Some(next) => Stat::Assign {
                        targets: vec![Expr::name(&state)],
                        values: vec![Expr::number(*next)],
                    },
                    None => Stat::Break,
                });
            }
            entries.push((keys[n], stats));
        }

        let dispatch = if tree {
            let node = dispatch::build(entries, self.rng)?;
            to_stats(node, &state)
        } else {
            entries.shuffle(self.rng);
            let branches = entries
                .into_iter()
                .map(|(key, stats)| {
                    (
                        Expr::binary(BinOp::Eq, Expr::name(&state), Expr::number(key)),
                        Block::new(stats),
                    )
                })
                .collect();
            vec![Stat::If {
                branches,
                otherwise: None,
            }]
        };

        let mut out = Vec::with_capacity(3);
        if !hoisted.is_empty() {
            out.push(Stat::Local {
                names: hoisted,
                values: Vec::new(),
            });
        }
        out.push(Stat::Local {
            names: vec![state],
            values: vec![Expr::number(keys[0])],
        });
        out.push(Stat::While {
            cond: Expr::True,
            body: Block::new(dispatch),
        });
        body.stats = out;
        Ok(())
    }
}

/// The locals to hoist when `body` can be flattened, `None` when it must stay as written.
///
/// Hoisting is refused when a local is declared twice, shadows a parameter, or its name is
/// read before the declaration (including by its own initializer).
fn hoistable(params: &[String], body: &Block, threshold: usize) -> Option<Vec<String>> {
    if body.stats.len() < threshold.max(2) || has_direct_break(body) {
        return None;
    }
    let mut hoisted: Vec<String> = Vec::new();
    for (n, stat) in body.stats.iter().enumerate() {
        let declared: Vec<&String> = match stat {
            Stat::Local { names, .. } => names.iter().collect(),
            Stat::LocalFunction { name, .. } => vec![name],
            _ => continue,
        };
        for name in declared {
            if hoisted.contains(name) || params.contains(name) {
                return None;
            }
            if body.stats[..n].iter().any(|earlier| mentions(earlier, name)) {
                return None;
            }
            if let Stat::Local { values, .. } = stat
                && values.iter().any(|value| expr_mentions(value, name))
            {
                return None;
            }
            hoisted.push(name.clone());
        }
    }
    Some(hoisted)
}

fn unlocal(stat: Stat) -> Stat {
    match stat {
        Stat::Local { names, values } => Stat::Assign {
            targets: names.into_iter().map(Expr::Name).collect(),
            values: if values.is_empty() { vec![Expr::Nil] } else { values },
        },
        Stat::LocalFunction { name, func } => Stat::Assign {
            targets: vec![Expr::Name(name)],
            values: vec![Expr::Function(func)],
        },
        other => other,
    }
}

fn comparison(op: Comparison) -> BinOp {
    match op {
        Comparison::Lt => BinOp::Lt,
        Comparison::Le => BinOp::Le,
        Comparison::Gt => BinOp::Gt,
        Comparison::Ge => BinOp::Ge,
        Comparison::Eq => BinOp::Eq,
        Comparison::Ne => BinOp::Ne,
    }
}

/// Lowers a dispatch tree over statement lists into nested `if` statements on `subject`.
pub(crate) fn to_stats(node: DispatchNode<Vec<Stat>>, subject: &str) -> Vec<Stat> {
    match node {
        DispatchNode::Leaf { body, .. } => body,
        DispatchNode::Branch {
            guard,
            then,
            otherwise,
        } => {
            let (left, right) = if guard.key_first {
                (Expr::number(guard.key), Expr::name(subject))
            } else {
                (Expr::name(subject), Expr::number(guard.key))
            };
            vec![Stat::If {
                branches: vec![(
                    Expr::binary(comparison(guard.op), left, right),
                    Block::new(to_stats(*then, subject)),
                )],
                otherwise: Some(Block::new(to_stats(*otherwise, subject))),
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::Parser;
    use crate::printer::print;
    use rand::{SeedableRng, rngs::StdRng};

    fn run(source: &str, seed: u64) -> (String, usize) {
        let tokens = lex(source).unwrap();
        let mut names = Names::from_tokens(&tokens);
        let mut block = Parser::new(tokens).parse_chunk().unwrap();
        let count = flatten(
            &mut block,
            &mut StdRng::seed_from_u64(seed),
            &mut names,
            &Options::default(),
        )
        .unwrap();
        (print(&block), count)
    }

    const PROGRAM: &str = r##"
        local acc = {}
        local function push(v) acc[#acc + 1] = v end
        local function fib(n)
            local a, b = 0, 1
            for _ = 1, n do a, b = b, a + b end
            push(a)
            return a
        end
        fib(10)
        push("x")
        local total = 0
        for _, v in ipairs(acc) do total = total .. v end
        return total, select("#", ...)
    "##;

    #[test]
    fn flattened_program_behaves_identically() {
        let lua = mlua::Lua::new();
        let expected: (String, i64) = lua.load(PROGRAM).call((1, 2)).unwrap();
        for seed in 0..16 {
            let (text, count) = run(PROGRAM, seed);
            assert_eq!(count, 2, "{text}");
            assert!(text.contains("while true do"));
            let actual: (String, i64) = lua.load(text.as_str()).call((1, 2)).unwrap();
            assert_eq!(actual, expected, "seed {seed}:\n{text}");
        }
    }

    #[test]
    fn use_before_declaration_blocks_hoisting() {
        let (_, count) = run("print(x); local x = 1; x = x + 1; print(x); return x", 0);
        assert_eq!(count, 0);
    }

    #[test]
    fn self_referencing_initializer_blocks_hoisting() {
        let (_, count) = run("local a = 1; local b = 2; local c = 3; local a2 = a; local b = b", 0);
        assert_eq!(count, 0);
    }

    #[test]
    fn protected_bodies_and_short_bodies_stay() {
        let source = "local f = function() --@protect\n local a = 1; a = a + 1; a = a * 2; return a end return f()";
        let (text, count) = run(source, 4);
        assert_eq!(count, 0);
        assert!(!text.contains("while"));
    }
}
