//! Lua 5.1 syntax tree.

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stats: Vec<Stat>,
    /// Set by a leading `--@protect` marker; passes leave the block as written.
    pub protected: bool,
}

impl Block {
    pub fn new(stats: Vec<Stat>) -> Self {
        Self {
            stats,
            protected: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    pub params: Vec<String>,
    pub vararg: bool,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncName {
    pub path: Vec<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stat {
    Local {
        names: Vec<String>,
        values: Vec<Expr>,
    },
    LocalFunction {
        name: String,
        func: FuncBody,
    },
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
    },
    Call(Expr),
    Do(Block),
    While {
        cond: Expr,
        body: Block,
    },
    Repeat {
        body: Block,
        cond: Expr,
    },
    If {
        branches: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
    },
    NumericFor {
        var: String,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor {
        names: Vec<String>,
        exprs: Vec<Expr>,
        body: Block,
    },
    Function {
        name: FuncName,
        func: FuncBody,
    },
    Return(Vec<Expr>),
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Left and right binding power, as in the reference parser.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9),
            BinOp::Concat => (5, 4),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::And => (2, 2),
            BinOp::Or => (1, 1),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Concat => "..",
            BinOp::Eq => "==",
            BinOp::Ne => "~=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

pub const UNARY_PRIORITY: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableField {
    Positional(Expr),
    Named(String, Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    True,
    False,
    Vararg,
    /// Numeric literal as written.
    Number(String),
    /// String literal as written, delimiters included.
    String(String),
    Function(FuncBody),
    Table(Vec<TableField>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Name(String),
    Index {
        object: Box<Expr>,
        key: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Method {
        object: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Paren(Box<Expr>),
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    /// Integer literal; negative values become a negated literal.
    pub fn number(value: i64) -> Self {
        if value < 0 {
            Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(Expr::Number(value.unsigned_abs().to_string())),
            }
        } else {
            Expr::Number(value.to_string())
        }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(operand: Expr) -> Self {
        Expr::Unary {
            op: UnOp::Not,
            operand: Box::new(operand),
        }
    }

    /// Prefix expressions can be called or indexed without parentheses.
    pub fn is_prefix(&self) -> bool {
        matches!(
            self,
            Expr::Name(_)
                | Expr::Index { .. }
                | Expr::Call { .. }
                | Expr::Method { .. }
                | Expr::Paren(_)
        )
    }

    /// Value of an integer literal, if this is one.
    pub fn integer(&self) -> Option<i64> {
        let Expr::Number(text) = self else {
            return None;
        };
        let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16).ok()?,
            None => {
                let value: f64 = text.parse().ok()?;
                if value.fract() != 0.0 || !value.is_finite() || value.abs() > 9.0e15 {
                    return None;
                }
                value as i64
            }
        };
        Some(value)
    }

    /// Literal or plain name: evaluating it has no side effects.
    pub fn is_simple(&self) -> bool {
        matches!(
            self,
            Expr::Nil | Expr::True | Expr::False | Expr::Number(_) | Expr::String(_) | Expr::Name(_)
        )
    }
}

/// Calls `f` on every expression in `block`, nested functions included.
pub fn visit_exprs(block: &Block, f: &mut impl FnMut(&Expr)) {
    for stat in &block.stats {
        visit_stat(stat, f);
    }
}

fn visit_func(func: &FuncBody, f: &mut impl FnMut(&Expr)) {
    visit_exprs(&func.body, f);
}

pub fn visit_stat(stat: &Stat, f: &mut impl FnMut(&Expr)) {
    match stat {
        Stat::Local { values, .. } => values.iter().for_each(|e| visit_expr(e, f)),
        Stat::LocalFunction { func, .. } => visit_func(func, f),
        Stat::Function { name, func } => {
            if let Some(root) = name.path.first() {
                f(&Expr::Name(root.clone()));
            }
            visit_func(func, f);
        }
        Stat::Assign { targets, values } => {
            targets.iter().chain(values).for_each(|e| visit_expr(e, f))
        }
        Stat::Call(call) => visit_expr(call, f),
        Stat::Do(body) => visit_exprs(body, f),
        Stat::While { cond, body } | Stat::Repeat { body, cond } => {
            visit_expr(cond, f);
            visit_exprs(body, f);
        }
        Stat::If {
            branches,
            otherwise,
        } => {
            for (cond, body) in branches {
                visit_expr(cond, f);
                visit_exprs(body, f);
            }
            if let Some(body) = otherwise {
                visit_exprs(body, f);
            }
        }
        Stat::NumericFor {
            start,
            limit,
            step,
            body,
            ..
        } => {
            visit_expr(start, f);
            visit_expr(limit, f);
            if let Some(step) = step {
                visit_expr(step, f);
            }
            visit_exprs(body, f);
        }
        Stat::GenericFor { exprs, body, .. } => {
            exprs.iter().for_each(|e| visit_expr(e, f));
            visit_exprs(body, f);
        }
        Stat::Return(values) => values.iter().for_each(|e| visit_expr(e, f)),
        Stat::Break => {}
    }
}

pub fn visit_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::Function(func) => visit_func(func, f),
        Expr::Table(fields) => {
            for field in fields {
                match field {
                    TableField::Positional(value) | TableField::Named(_, value) => {
                        visit_expr(value, f)
                    }
                    TableField::Keyed(key, value) => {
                        visit_expr(key, f);
                        visit_expr(value, f);
                    }
                }
            }
        }
        Expr::Binary { left, right, .. } => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        Expr::Unary { operand, .. } | Expr::Paren(operand) => visit_expr(operand, f),
        Expr::Index { object, key } => {
            visit_expr(object, f);
            visit_expr(key, f);
        }
        Expr::Call { callee, args } => {
            visit_expr(callee, f);
            args.iter().for_each(|e| visit_expr(e, f));
        }
        Expr::Method { object, args, .. } => {
            visit_expr(object, f);
            args.iter().for_each(|e| visit_expr(e, f));
        }
        _ => {}
    }
}

fn name_matcher<'a>(name: &'a str, found: &'a mut bool) -> impl FnMut(&Expr) + 'a {
    move |expr| {
        if let Expr::Name(n) = expr
            && n == name
        {
            *found = true;
        }
    }
}

/// Whether `name` appears as a plain name anywhere in `stat`.
pub fn mentions(stat: &Stat, name: &str) -> bool {
    let mut found = false;
    visit_stat(stat, &mut name_matcher(name, &mut found));
    found
}

pub fn expr_mentions(expr: &Expr, name: &str) -> bool {
    let mut found = false;
    visit_expr(expr, &mut name_matcher(name, &mut found));
    found
}

/// A direct child of a statement or expression, for passes that rewrite in place.
pub enum Child<'a> {
    Expr(&'a mut Expr),
    Block(&'a mut Block),
    Func(&'a mut FuncBody),
}

impl Stat {
    pub fn children_mut(&mut self) -> Vec<Child<'_>> {
        match self {
            Stat::Local { values, .. } | Stat::Return(values) => {
                values.iter_mut().map(Child::Expr).collect()
            }
            Stat::LocalFunction { func, .. } | Stat::Function { func, .. } => {
                vec![Child::Func(func)]
            }
            Stat::Assign { targets, values } => {
                targets.iter_mut().chain(values).map(Child::Expr).collect()
            }
            Stat::Call(call) => vec![Child::Expr(call)],
            Stat::Do(body) => vec![Child::Block(body)],
            Stat::While { cond, body } | Stat::Repeat { body, cond } => {
                vec![Child::Expr(cond), Child::Block(body)]
            }
            Stat::If {
                branches,
                otherwise,
            } => {
                let mut children = Vec::new();
                for (cond, body) in branches {
                    children.push(Child::Expr(cond));
                    children.push(Child::Block(body));
                }
                if let Some(body) = otherwise {
                    children.push(Child::Block(body));
                }
                children
            }
            Stat::NumericFor {
                start,
                limit,
                step,
                body,
                ..
            } => {
                let mut children = vec![Child::Expr(start), Child::Expr(limit)];
                if let Some(step) = step {
                    children.push(Child::Expr(step));
                }
                children.push(Child::Block(body));
                children
            }
            Stat::GenericFor { exprs, body, .. } => {
                let mut children: Vec<Child<'_>> = exprs.iter_mut().map(Child::Expr).collect();
                children.push(Child::Block(body));
                children
            }
            Stat::Break => Vec::new(),
        }
    }
}

impl Expr {
    pub fn children_mut(&mut self) -> Vec<Child<'_>> {
        match self {
            Expr::Function(func) => vec![Child::Func(func)],
            Expr::Table(fields) => {
                let mut children = Vec::new();
                for field in fields {
                    match field {
                        TableField::Positional(value) | TableField::Named(_, value) => {
                            children.push(Child::Expr(value))
                        }
                        TableField::Keyed(key, value) => {
                            children.push(Child::Expr(key));
                            children.push(Child::Expr(value));
                        }
                    }
                }
                children
            }
            Expr::Binary { left, right, .. } => vec![Child::Expr(left), Child::Expr(right)],
            Expr::Unary { operand, .. } | Expr::Paren(operand) => vec![Child::Expr(operand)],
            Expr::Index { object, key } => vec![Child::Expr(object), Child::Expr(key)],
            Expr::Call { callee, args } => {
                let mut children = vec![Child::Expr(callee)];
                children.extend(args.iter_mut().map(Child::Expr));
                children
            }
            Expr::Method { object, args, .. } => {
                let mut children = vec![Child::Expr(object)];
                children.extend(args.iter_mut().map(Child::Expr));
                children
            }
            _ => Vec::new(),
        }
    }
}

/// Whether `block` contains a `break` that would leave an enclosing loop of the block.
pub fn has_direct_break(block: &Block) -> bool {
    block.stats.iter().any(|stat| match stat {
        Stat::Break => true,
        Stat::Do(body) => has_direct_break(body),
        Stat::If {
            branches,
            otherwise,
        } => {
            branches.iter().any(|(_, body)| has_direct_break(body))
                || otherwise.as_ref().is_some_and(has_direct_break)
        }
        _ => false,
    })
}
