//! Opportunistic source rewrites.
//!
//! Each rewrite is applied per occurrence with its configured probability:
//!
//! - `a == b` / `a ~= b` become the negation of the opposite test.
//! - strict and non-strict comparisons of side-effect free operands are mirrored, and
//!   `a >= n` against a numeric literal becomes `(a > n) ~= (a == n)`.
//! - `x = a and b or c` is split into an assignment and a fallback `if`.
//! - numeric and generic `for` loops are lowered to `while` loops.
//! - tables that only hold non-nil values gain trailing `nil` fields.
//! - statements are wrapped in `do ... end` or `repeat ... until true`.

use crate::Options;
use crate::ast::*;
use crate::names::Names;
use rand::Rng;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewriteStats {
    pub comparisons: usize,
    pub splits: usize,
    pub loops: usize,
    pub tables: usize,
    pub wraps: usize,
}

pub fn rewrite<R: Rng + ?Sized>(
    block: &mut Block,
    rng: &mut R,
    names: &mut Names,
    options: &Options,
) -> RewriteStats {
    let mut pass = Rewriter {
        rng,
        names,
        options,
        stats: RewriteStats::default(),
    };
    pass.block(block);
    debug!("source rewrites: {:?}", pass.stats);
    pass.stats
}

struct Rewriter<'a, R: ?Sized> {
    rng: &'a mut R,
    names: &'a mut Names,
    options: &'a Options,
    stats: RewriteStats,
}

impl<R: Rng + ?Sized> Rewriter<'_, R> {
    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.random_bool(rate.min(1.0))
    }

    fn block(&mut self, block: &mut Block) {
        if block.protected {
            return;
        }
        let mut out = Vec::with_capacity(block.stats.len());
        for mut stat in std::mem::take(&mut block.stats) {
            for child in stat.children_mut() {
                self.child(child);
            }
            self.lower(stat, &mut out);
        }
        block.stats = self.wrap(out);
    }

    fn child(&mut self, child: Child<'_>) {
        match child {
            Child::Expr(expr) => self.expr(expr),
            Child::Block(block) => self.block(block),
            Child::Func(func) => self.block(&mut func.body),
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
        for child in expr.children_mut() {
            self.child(child);
        }
        match expr {
            Expr::Binary { op, left, right } => {
                let op = *op;
                let simple = left.is_simple() && right.is_simple();
                let literal = matches!(**left, Expr::Number(_)) || matches!(**right, Expr::Number(_));
                match op {
                    BinOp::Eq | BinOp::Ne if self.roll(self.options.rewrite_rate) => {
                        let opposite = if op == BinOp::Eq { BinOp::Ne } else { BinOp::Eq };
                        let (left, right) = (take(left), take(right));
                        *expr = Expr::not(Expr::binary(opposite, left, right));
                        self.stats.comparisons += 1;
                    }
                    BinOp::Ge | BinOp::Le
                        if simple && literal && self.roll(self.options.rewrite_rate / 2.0) =>
                    {
                        let strict = if op == BinOp::Ge { BinOp::Gt } else { BinOp::Lt };
                        let (left, right) = (take(left), take(right));
                        *expr = Expr::binary(
                            BinOp::Ne,
                            Expr::binary(strict, left.clone(), right.clone()),
                            Expr::binary(BinOp::Eq, left, right),
                        );
                        self.stats.comparisons += 1;
                    }
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
                        if simple && self.roll(self.options.rewrite_rate) =>
                    {
                        let mirrored = match op {
                            BinOp::Lt => BinOp::Gt,
                            BinOp::Le => BinOp::Ge,
                            BinOp::Gt => BinOp::Lt,
                            _ => BinOp::Le,
                        };
                        let (left, right) = (take(left), take(right));
                        *expr = Expr::binary(mirrored, right, left);
                        self.stats.comparisons += 1;
                    }
                    _ => {}
                }
            }
            Expr::Table(fields) if pad_safe(fields.as_slice()) && self.roll(self.options.pad_rate) => {
                for _ in 0..self.rng.random_range(1..=3) {
                    fields.push(TableField::Positional(Expr::Nil));
                }
                self.stats.tables += 1;
            }
            _ => {}
        }
    }

    fn lower(&mut self, stat: Stat, out: &mut Vec<Stat>) {
        match stat {
            Stat::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } if self.roll(self.options.loop_rate) => {
                self.stats.loops += 1;
                out.push(self.numeric_for(var, start, limit, step, body));
            }
            Stat::GenericFor { names, exprs, body } if self.roll(self.options.loop_rate) => {
                self.stats.loops += 1;
                out.push(self.generic_for(names, exprs, body));
            }
            Stat::Assign { targets, mut values }
                if targets.len() == 1
                    && values.len() == 1
                    && split_target(&targets[0], &values[0]).is_some()
                    && self.roll(self.options.rewrite_rate) =>
            {
                let name = split_target(&targets[0], &values[0])
                    .map(str::to_string)
                    .unwrap_or_default();
                match split_and_or(values.remove(0)) {
                    Ok((first, fallback)) => {
                        out.push(Stat::Assign {
                            targets,
                            values: vec![first],
                        });
                        out.push(fallback_if(name, fallback));
                        self.stats.splits += 1;
                    }
                    Err(value) => out.push(Stat::Assign {
                        targets,
                        values: vec![value],
                    }),
                }
            }
            Stat::Local { names, mut values }
                if names.len() == 1
                    && values.len() == 1
                    && split_target(&Expr::Name(names[0].clone()), &values[0]).is_some()
                    && self.roll(self.options.rewrite_rate) =>
            {
                let name = names[0].clone();
                match split_and_or(values.remove(0)) {
                    Ok((first, fallback)) => {
                        out.push(Stat::Local {
                            names,
                            values: vec![first],
                        });
                        out.push(fallback_if(name, fallback));
                        self.stats.splits += 1;
                    }
                    Err(value) => out.push(Stat::Local {
                        names,
                        values: vec![value],
                    }),
                }
            }
            stat => out.push(stat),
        }
    }

    /// ```lua
    /// do
    ///     local V, L, S = start, limit, step
    ///     while (S > 0 and V <= L) or (S <= 0 and V >= L) do
    ///         local var = V
    ///         do body end
    ///         V = V + S
    ///     end
    /// end
    /// ```
    fn numeric_for(&mut self, var: String, start: Expr, limit: Expr, step: Option<Expr>, body: Block) -> Stat {
        let value = self.names.fresh(self.rng);
        let bound = self.names.fresh(self.rng);
        let stride = self.names.fresh(self.rng);
        let ascending = step.as_ref().is_none_or(|s| s.integer().is_some_and(|n| n > 0));
        let step = step.unwrap_or_else(|| Expr::number(1));

        let cond = if ascending {
            Expr::binary(BinOp::Le, Expr::name(&value), Expr::name(&bound))
        } else {
            let zero = || Expr::number(0);
            Expr::binary(
                BinOp::Or,
                Expr::binary(
                    BinOp::And,
                    Expr::binary(BinOp::Gt, Expr::name(&stride), zero()),
                    Expr::binary(BinOp::Le, Expr::name(&value), Expr::name(&bound)),
                ),
                Expr::binary(
                    BinOp::And,
                    Expr::binary(BinOp::Le, Expr::name(&stride), zero()),
                    Expr::binary(BinOp::Ge, Expr::name(&value), Expr::name(&bound)),
                ),
            )
        };
        let looped = Block::new(vec![
            Stat::Local {
                names: vec![var],
                values: vec![Expr::name(&value)],
            },
            Stat::Do(body),
            Stat::Assign {
                targets: vec![Expr::name(&value)],
                values: vec![Expr::binary(BinOp::Add, Expr::name(&value), Expr::name(&stride))],
            },
        ]);
        Stat::Do(Block::new(vec![
            Stat::Local {
                names: vec![value, bound, stride],
                values: vec![start, limit, step],
            },
            Stat::While { cond, body: looped },
        ]))
    }

    /// ```lua
    /// do
    ///     local F, S, C = exprs
    ///     while true do
    ///         local n1, n2 = F(S, C)
    ///         if n1 == nil then break end
    ///         C = n1
    ///         do body end
    ///     end
    /// end
    /// ```
    fn generic_for(&mut self, names: Vec<String>, exprs: Vec<Expr>, body: Block) -> Stat {
        let iterator = self.names.fresh(self.rng);
        let state = self.names.fresh(self.rng);
        let control = self.names.fresh(self.rng);
        let first = names[0].clone();

        let looped = Block::new(vec![
            Stat::Local {
                names,
                values: vec![Expr::Call {
                    callee: Box::new(Expr::name(&iterator)),
                    args: vec![Expr::name(&state), Expr::name(&control)],
                }],
            },
            Stat::If {
                branches: vec![(
                    Expr::binary(BinOp::Eq, Expr::name(&first), Expr::Nil),
                    Block::new(vec![Stat::Break]),
                )],
                otherwise: None,
            },
            Stat::Assign {
                targets: vec![Expr::name(&control)],
                values: vec![Expr::name(first)],
            },
            Stat::Do(body),
        ]);
        Stat::Do(Block::new(vec![
            Stat::Local {
                names: vec![iterator, state, control],
                values: exprs,
            },
            Stat::While {
                cond: Expr::True,
                body: looped,
            },
        ]))
    }

    fn wrap(&mut self, stats: Vec<Stat>) -> Vec<Stat> {
        let mut out = Vec::with_capacity(stats.len());
        let mut stats = stats.into_iter().peekable();
        while let Some(stat) = stats.next() {
            if !wrappable(&stat) || !self.roll(self.options.wrap_rate) {
                out.push(stat);
                continue;
            }
            let mut inner = vec![stat];
            if self.rng.random_bool(0.5)
                && let Some(next) = stats.next_if(wrappable)
            {
                inner.push(next);
            }
            self.stats.wraps += 1;
            let body = Block::new(inner);
            if !has_direct_break(&body) && self.rng.random_bool(0.5) {
                out.push(Stat::Repeat {
                    body,
                    cond: Expr::True,
                });
            } else {
                out.push(Stat::Do(body));
            }
        }
        out
    }
}

fn take(expr: &mut Box<Expr>) -> Expr {
    std::mem::replace(&mut **expr, Expr::Nil)
}

/// Locals would change scope if wrapped.
fn wrappable(stat: &Stat) -> bool {
    !matches!(stat, Stat::Local { .. } | Stat::LocalFunction { .. })
}

/// Trailing nils keep the length of a table whose fields are all definitely non-nil.
fn pad_safe(fields: &[TableField]) -> bool {
    fields.iter().all(|field| {
        matches!(
            field,
            TableField::Positional(
                Expr::Number(_) | Expr::String(_) | Expr::True | Expr::False | Expr::Table(_) | Expr::Function(_)
            )
        )
    })
}

/// The assigned name when `target = value` has the shape `x = a and b or c` with `c` not
/// reading `x`.
fn split_target<'a>(target: &'a Expr, value: &Expr) -> Option<&'a str> {
    let Expr::Name(name) = target else {
        return None;
    };
    let Expr::Binary {
        op: BinOp::Or,
        left,
        right,
    } = value
    else {
        return None;
    };
    let left = match &**left {
        Expr::Paren(inner) => inner,
        other => other,
    };
    if !matches!(left, Expr::Binary { op: BinOp::And, .. }) || expr_mentions(right, name) {
        return None;
    }
    Some(name)
}

/// `a and b or c` into `a and b` and `c`; other expressions come back unchanged.
fn split_and_or(value: Expr) -> Result<(Expr, Expr), Expr> {
    match value {
        Expr::Binary {
            op: BinOp::Or,
            left,
            right,
        } => {
            let first = match *left {
                Expr::Paren(inner) => *inner,
                other => other,
            };
            Ok((first, *right))
        }
        other => Err(other),
    }
}

fn fallback_if(name: String, fallback: Expr) -> Stat {
    Stat::If {
        branches: vec![(
            Expr::not(Expr::name(&name)),
            Block::new(vec![Stat::Assign {
                targets: vec![Expr::name(name)],
                values: vec![fallback],
            }]),
        )],
        otherwise: None,
    }
}
