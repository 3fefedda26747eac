//! Renders a syntax tree back to Lua source.
//!
//! Output is normalised rather than faithful: every statement ends with `;`, calls always use
//! parentheses, field access is printed in bracket form and nested operators are fully
//! parenthesised, so no printed tree depends on precedence or line-break rules.

use crate::ast::*;

pub fn print(block: &Block) -> String {
    let mut printer = Printer::default();
    for stat in &block.stats {
        printer.stat(stat);
        printer.out.push('\n');
    }
    printer.out
}

pub fn print_expr(expr: &Expr) -> String {
    let mut printer = Printer::default();
    printer.expr(expr);
    printer.out
}

#[derive(Default)]
struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    fn line(&mut self) {
        self.out.push('\n');
        for _ in 0..self.indent {
            self.out.push('\t');
        }
    }

    fn block(&mut self, block: &Block) {
        self.indent += 1;
        for stat in &block.stats {
            self.line();
            self.stat(stat);
        }
        self.indent -= 1;
    }

    fn body(&mut self, block: &Block) {
        self.block(block);
        self.line();
    }

    fn names(&mut self, names: &[String]) {
        self.out.push_str(&names.join(", "));
    }

    fn exprs(&mut self, exprs: &[Expr]) {
        for (n, expr) in exprs.iter().enumerate() {
            if n > 0 {
                self.out.push_str(", ");
            }
            self.expr(expr);
        }
    }

    fn funcbody(&mut self, func: &FuncBody, skip_self: bool) {
        let params = if skip_self { &func.params[1..] } else { &func.params[..] };
        self.out.push('(');
        self.names(params);
        if func.vararg {
            if !params.is_empty() {
                self.out.push_str(", ");
            }
            self.out.push_str("...");
        }
        self.out.push(')');
        self.body(&func.body);
        self.out.push_str("end");
    }

    fn stat(&mut self, stat: &Stat) {
        match stat {
            Stat::Local { names, values } => {
                self.out.push_str("local ");
                self.names(names);
                if !values.is_empty() {
                    self.out.push_str(" = ");
                    self.exprs(values);
                }
            }
            Stat::LocalFunction { name, func } => {
                self.out.push_str("local function ");
                self.out.push_str(name);
                self.funcbody(func, false);
            }
            Stat::Assign { targets, values } => {
                self.exprs(targets);
                self.out.push_str(" = ");
                self.exprs(values);
            }
            Stat::Call(call) => self.expr(call),
            Stat::Do(body) => {
                self.out.push_str("do");
                self.body(body);
                self.out.push_str("end");
            }
            Stat::While { cond, body } => {
                self.out.push_str("while ");
                self.expr(cond);
                self.out.push_str(" do");
                self.body(body);
                self.out.push_str("end");
            }
            Stat::Repeat { body, cond } => {
                self.out.push_str("repeat");
                self.body(body);
                self.out.push_str("until ");
                self.expr(cond);
            }
            Stat::If {
                branches,
                otherwise,
            } => {
                for (n, (cond, body)) in branches.iter().enumerate() {
                    self.out.push_str(if n == 0 { "if " } else { "elseif " });
                    self.expr(cond);
                    self.out.push_str(" then");
                    self.body(body);
                }
                if let Some(body) = otherwise {
                    self.out.push_str("else");
                    self.body(body);
                }
                self.out.push_str("end");
            }
            Stat::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.out.push_str("for ");
                self.out.push_str(var);
                self.out.push_str(" = ");
                self.expr(start);
                self.out.push_str(", ");
                self.expr(limit);
                if let Some(step) = step {
                    self.out.push_str(", ");
                    self.expr(step);
                }
                self.out.push_str(" do");
                self.body(body);
                self.out.push_str("end");
            }
            Stat::GenericFor { names, exprs, body } => {
                self.out.push_str("for ");
                self.names(names);
                self.out.push_str(" in ");
                self.exprs(exprs);
                self.out.push_str(" do");
                self.body(body);
                self.out.push_str("end");
            }
            Stat::Function { name, func } => {
                self.out.push_str("function ");
                self.out.push_str(&name.path.join("."));
                if let Some(method) = &name.method {
                    self.out.push(':');
                    self.out.push_str(method);
                }
                self.funcbody(func, name.method.is_some());
            }
            Stat::Return(values) => {
                self.out.push_str("return");
                if !values.is_empty() {
                    self.out.push(' ');
                    self.exprs(values);
                }
            }
            Stat::Break => self.out.push_str("break"),
        }
        self.out.push(';');
    }

    /// Operands that are themselves operators get parentheses.
    fn operand(&mut self, expr: &Expr) {
        if matches!(expr, Expr::Binary { .. } | Expr::Unary { .. }) {
            self.out.push('(');
            self.expr(expr);
            self.out.push(')');
        } else {
            self.expr(expr);
        }
    }

    fn prefix(&mut self, expr: &Expr) {
        if expr.is_prefix() {
            self.expr(expr);
        } else {
            self.out.push('(');
            self.expr(expr);
            self.out.push(')');
        }
    }

    fn bracketed(&mut self, key: &Expr) {
        let start = self.out.len();
        self.expr(key);
        if self.out[start..].starts_with('[') {
            self.out.insert(start, ' ');
            self.out.push(' ');
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Nil => self.out.push_str("nil"),
            Expr::True => self.out.push_str("true"),
            Expr::False => self.out.push_str("false"),
            Expr::Vararg => self.out.push_str("..."),
            Expr::Number(text) | Expr::String(text) | Expr::Name(text) => self.out.push_str(text),
            Expr::Function(func) => {
                self.out.push_str("function");
                self.funcbody(func, false);
            }
            Expr::Table(fields) => {
                self.out.push('{');
                for (n, field) in fields.iter().enumerate() {
                    if n > 0 {
                        self.out.push_str(", ");
                    }
                    match field {
                        TableField::Positional(value) => self.expr(value),
                        TableField::Named(name, value) => {
                            self.out.push_str(name);
                            self.out.push_str(" = ");
                            self.expr(value);
                        }
                        TableField::Keyed(key, value) => {
                            self.out.push('[');
                            self.bracketed(key);
                            self.out.push_str("] = ");
                            self.expr(value);
                        }
                    }
                }
                self.out.push('}');
            }
            Expr::Binary { op, left, right } => {
                self.operand(left);
                self.out.push(' ');
                self.out.push_str(op.symbol());
                self.out.push(' ');
                self.operand(right);
            }
            Expr::Unary { op, operand } => {
                self.out.push_str(match op {
                    UnOp::Neg => "-",
                    UnOp::Not => "not ",
                    UnOp::Len => "#",
                });
                self.operand(operand);
            }
            Expr::Index { object, key } => {
                self.prefix(object);
                self.out.push('[');
                self.bracketed(key);
                self.out.push(']');
            }
            Expr::Call { callee, args } => {
                self.prefix(callee);
                self.out.push('(');
                self.exprs(args);
                self.out.push(')');
            }
            Expr::Method { object, name, args } => {
                self.prefix(object);
                self.out.push(':');
                self.out.push_str(name);
                self.out.push('(');
                self.exprs(args);
                self.out.push(')');
            }
            Expr::Paren(inner) => {
                self.out.push('(');
                self.expr(inner);
                self.out.push(')');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::Parser;

    fn reprint(source: &str) -> String {
        print(&Parser::new(lex(source).unwrap()).parse_chunk().unwrap())
    }

    #[test]
    fn normalises_fields_and_calls() {
        let out = reprint("print 'hi' t.x = {1, y = 2, [3] = 4}");
        assert!(out.contains("print('hi');"));
        assert!(out.contains("t[\"x\"] = {1, y = 2, [3] = 4};"));
    }

    #[test]
    fn nested_negation_never_forms_a_comment() {
        let out = reprint("x = - -y");
        assert!(out.contains("-(-y)"));
        assert!(!out.contains("--"));
    }

    #[test]
    fn method_definition_drops_implicit_self() {
        let out = reprint("function a.b:c(x) return self end");
        assert!(out.contains("function a.b:c(x)"));
    }

    #[test]
    fn reprinted_source_runs() {
        let source = r#"
            local t = {}
            for i = 1, 5 do t[#t + 1] = i * 2 end
            local s = 0
            for _, v in ipairs(t) do s = s + v end
            local function f(...) return select('#', ...) end
            return s .. ":" .. f(1, nil, 3) .. ":" .. (2 ^ 3 ^ 2) .. ":" .. -2 ^ 2
        "#;
        let lua = mlua::Lua::new();
        let expected: String = lua.load(source).eval().unwrap();
        let printed = reprint(source);
        let actual: String = lua.load(printed.as_str()).eval().unwrap();
        assert_eq!(actual, expected);
        assert_eq!(reprint(&printed), printed);
    }
}
