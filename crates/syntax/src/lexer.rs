use logos::{Lexer, Logos};

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\x0B\x0C]+")]
pub enum Token {
    #[token("and")]
    And,
    #[token("break")]
    Break,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("elseif")]
    ElseIf,
    #[token("end")]
    End,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("if")]
    If,
    #[token("in")]
    In,
    #[token("local")]
    Local,
    #[token("nil")]
    Nil,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("repeat")]
    Repeat,
    #[token("return")]
    Return,
    #[token("then")]
    Then,
    #[token("true")]
    True,
    #[token("until")]
    Until,
    #[token("while")]
    While,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("#")]
    Hash,
    #[token("==")]
    Eq,
    #[token("~=")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("..")]
    DotDot,
    #[token("...")]
    Ellipsis,

    /// Comment; `true` when it is the `--@protect` block marker.
    #[token("--", comment)]
    Comment(bool),

    /// Numeric literal, kept as written.
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| lex.slice().to_string())]
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice().to_string())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().to_string())]
    Number(String),

    /// String literal including its delimiters and escapes.
    #[regex(r#""([^"\\\n]|\\(.|\n))*""#, |lex| lex.slice().to_string())]
    #[regex(r#"'([^'\\\n]|\\(.|\n))*'"#, |lex| lex.slice().to_string())]
    #[regex(r"\[=*\[", long_string)]
    String(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),

    /// `--@protect`, produced by [`lex`] from a marker comment.
    Protect,
}

/// Length of the long bracket body starting right after an opening `[=*[` of `level`, up to
/// and including the closing bracket.
fn long_bracket(rest: &str, level: usize) -> Option<usize> {
    let close = format!("]{}]", "=".repeat(level));
    rest.find(&close).map(|end| end + close.len())
}

fn long_string(lex: &mut Lexer<Token>) -> Option<String> {
    let level = lex.slice().len() - 2;
    let length = long_bracket(lex.remainder(), level)?;
    lex.bump(length);
    Some(lex.slice().to_string())
}

fn comment(lex: &mut Lexer<Token>) -> bool {
    let rest = lex.remainder();
    if let Some(open) = rest.strip_prefix('[') {
        let level = open.chars().take_while(|c| *c == '=').count();
        if open[level..].starts_with('[') {
            let body = &open[level + 1..];
            let length = long_bracket(body, level).unwrap_or(body.len());
            lex.bump(2 + level + length);
            return false;
        }
    }
    let line = rest.find('\n').unwrap_or(rest.len());
    let marker = rest[..line].trim_end() == "@protect";
    lex.bump(line);
    marker
}

/// Lexes Lua source into tokens with byte spans. Comments are dropped, except protect markers.
pub fn lex(source: &str) -> Result<Vec<(Token, std::ops::Range<usize>)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(Token::Comment(true)) => tokens.push((Token::Protect, lexer.span())),
            Ok(Token::Comment(false)) => {}
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                let span = lexer.span();
                return Err(LexError {
                    position: span.start,
                    snippet: source[span].to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, thiserror::Error)]
#[error("lex error at byte {position}: unexpected '{snippet}'")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_local_assignment() {
        assert_eq!(
            kinds("local x = 0x1F .. 'a\\'b'"),
            vec![
                Token::Local,
                Token::Name("x".into()),
                Token::Assign,
                Token::Number("0x1F".into()),
                Token::DotDot,
                Token::String("'a\\'b'".into()),
            ]
        );
    }

    #[test]
    fn long_strings_and_comments() {
        let tokens = kinds("--[==[ skipped ]] still ]==] x = [[a\n]] -- tail\n--@protect\ny");
        assert_eq!(
            tokens,
            vec![
                Token::Name("x".into()),
                Token::Assign,
                Token::String("[[a\n]]".into()),
                Token::Protect,
                Token::Name("y".into()),
            ]
        );
    }

    #[test]
    fn dots_are_longest_match() {
        assert_eq!(
            kinds("a...b..c.d"),
            vec![
                Token::Name("a".into()),
                Token::Ellipsis,
                Token::Name("b".into()),
                Token::DotDot,
                Token::Name("c".into()),
                Token::Dot,
                Token::Name("d".into()),
            ]
        );
    }

    #[test]
    fn stray_character_is_reported() {
        let err = lex("x = $").unwrap_err();
        assert_eq!(err.position, 4);
    }
}
