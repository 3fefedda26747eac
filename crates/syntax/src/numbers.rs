//! Numeric literal obscuring.
//!
//! A non-negative integer literal `N` becomes
//!
//! ```lua
//! (function(V) while true do <tree on V> end end)(v0)
//! ```
//!
//! where the tree maps each intermediate `v_i` of a random walk to `V = V + d_i` and the final
//! key `N` to `return V`. The walk takes 4 to 12 steps through distinct values.

use crate::Options;
use crate::Result;
use crate::ast::*;
use crate::flatten::to_stats;
use crate::names::Names;
use moonveil_core::dispatch;
use rand::Rng;
use std::collections::HashSet;
use tracing::debug;

/// Largest literal that is rewritten.
const LIMIT: i64 = 1 << 31;
const SPREAD: i64 = 1 << 12;

pub fn obscure<R: Rng + ?Sized>(
    block: &mut Block,
    rng: &mut R,
    names: &mut Names,
    options: &Options,
) -> Result<usize> {
    let mut pass = Obscurer {
        rng,
        names,
        rate: options.number_rate,
        replaced: 0,
    };
    pass.block(block)?;
    debug!("obscured {} numeric literals", pass.replaced);
    Ok(pass.replaced)
}

struct Obscurer<'a, R: ?Sized> {
    rng: &'a mut R,
    names: &'a mut Names,
    rate: f64,
    replaced: usize,
}

impl<R: Rng + ?Sized> Obscurer<'_, R> {
    fn block(&mut self, block: &mut Block) -> Result<()> {
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
            Child::Expr(expr) => self.expr(expr),
            Child::Block(block) => self.block(block),
            Child::Func(func) => self.block(&mut func.body),
        }
    }

    fn expr(&mut self, expr: &mut Expr) -> Result<()> {
        if let Some(value) = expr.integer()
            && (0..=LIMIT).contains(&value)
        {
            if self.rate > 0.0 && self.rng.random_bool(self.rate.min(1.0)) {
                *expr = self.chain(value)?;
                self.replaced += 1;
            }
            return Ok(());
        }
        for child in expr.children_mut() {
            self.child(child)?;
        }
        Ok(())
    }

    /// Builds the closure that walks to `target`.
    fn chain(&mut self, target: i64) -> Result<Expr> {
        let steps = self.rng.random_range(4..=12);
        let mut walk = vec![target];
        let mut seen = HashSet::from([target]);
        while walk.len() <= steps {
            let delta = self.rng.random_range(-SPREAD..=SPREAD);
            let previous = walk[walk.len() - 1] - delta;
            if delta != 0 && seen.insert(previous) {
                walk.push(previous);
            }
        }
        walk.reverse();

        let value = self.names.fresh(self.rng);
        let mut entries = Vec::with_capacity(walk.len());
        for pair in walk.windows(2) {
            let delta = pair[1] - pair[0];
            let step = if delta < 0 {
                Expr::binary(BinOp::Sub, Expr::name(&value), Expr::number(-delta))
            } else {
                Expr::binary(BinOp::Add, Expr::name(&value), Expr::number(delta))
            };
            entries.push((
                pair[0],
                vec![Stat::Assign {
                    targets: vec![Expr::name(&value)],
                    values: vec![step],
                }],
            ));
        }
        entries.push((target, vec![Stat::Return(vec![Expr::name(&value)])]));

        let tree = dispatch::build(entries, self.rng)?;
        let func = FuncBody {
            params: vec![value.clone()],
            vararg: false,
            body: Block::new(vec![Stat::While {
                cond: Expr::True,
                body: Block::new(to_stats(tree, &value)),
            }]),
        };
        Ok(Expr::Call {
            callee: Box::new(Expr::Paren(Box::new(Expr::Function(func)))),
            args: vec![Expr::number(walk[0])],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::print_expr;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn chains_evaluate_to_their_literal() {
        let lua = mlua::Lua::new();
        let mut rng = StdRng::seed_from_u64(11);
        let mut names = Names::default();
        let mut pass = Obscurer {
            rng: &mut rng,
            names: &mut names,
            rate: 1.0,
            replaced: 0,
        };
        for target in [0, 1, 2, 7, 255, 4096, 65_535, 1 << 24] {
            let expr = pass.chain(target).unwrap();
            let text = format!("return {}", print_expr(&expr));
            let value: i64 = lua.load(text.as_str()).eval().unwrap();
            assert_eq!(value, target, "{text}");
        }
    }

    #[test]
    fn negative_and_fractional_literals_stay() {
        let mut block = Block::new(vec![Stat::Return(vec![
            Expr::number(-5),
            Expr::Number("1.5".into()),
        ])]);
        let options = Options {
            number_rate: 1.0,
            ..Options::default()
        };
        let count = obscure(
            &mut block,
            &mut StdRng::seed_from_u64(0),
            &mut Names::default(),
            &options,
        )
        .unwrap();
        // The 5 under the negation is still a non-negative literal.
        assert_eq!(count, 1);
        let Stat::Return(values) = &block.stats[0] else {
            panic!("expected return");
        };
        assert_eq!(values[1], Expr::Number("1.5".into()));
    }
}
