use log::debug;
use regex::RegexBuilder;
use std::cmp::Ordering;
use std::iter::Peekable;
use std::slice::Iter;
use std::str::Chars;

use crate::variables::{is_number, render_condition_literal, replace_vars, VariableLookup};
use crate::{ExecutionError, Result};

/// Evaluates an `<esi:when test="...">` expression.
///
/// Variables are substituted first, then the expression is lexed, parsed and evaluated.
/// Anything malformed evaluates to `false`.
pub fn evaluate_condition(raw_expr: &str, lookup: &dyn VariableLookup) -> bool {
    match try_evaluate_condition(raw_expr, lookup) {
        Ok(result) => result,
        Err(err) => {
            debug!("condition `{raw_expr}` is false: {err}");
            false
        }
    }
}

pub fn try_evaluate_condition(raw_expr: &str, lookup: &dyn VariableLookup) -> Result<bool> {
    let expr = replace_vars(raw_expr, lookup, render_condition_literal);
    let tokens = lex_expr(&expr)?;
    let ast = parse(&tokens)?;
    eval_expr(&ast)
}

fn eval_expr(expr: &Expr) -> Result<bool> {
    match expr {
        Expr::Comparison(c) => compare(&c.left, c.operator, &c.right),
        Expr::Not(inner) => Ok(!eval_expr(inner)?),
        Expr::Chain(first, rest) => {
            // Applied left to right. `|` after a true value settles the chain and
            // `&` after a false value skips its operand.
            let mut acc = eval_expr(first)?;
            for (logical, next) in rest {
                match logical {
                    Logical::Or if acc => return Ok(true),
                    Logical::And if !acc => {}
                    _ => acc = eval_expr(next)?,
                }
            }
            Ok(acc)
        }
    }
}

fn compare(left: &Operand, operator: Operator, right: &Operand) -> Result<bool> {
    let ordering = || -> Result<Ordering> {
        let (l, r) = (left.text(), right.text());
        if is_number(l) && is_number(r) {
            let (Ok(l), Ok(r)) = (l.parse::<f64>(), r.parse::<f64>()) else {
                return Err(ExecutionError::ExpressionError(
                    "invalid number".to_string(),
                ));
            };
            l.partial_cmp(&r).ok_or_else(|| {
                ExecutionError::ExpressionError("numbers are not comparable".to_string())
            })
        } else {
            Ok(l.cmp(r))
        }
    };
    Ok(match operator {
        Operator::Matches => return matches_regex(left.text(), right),
        Operator::Equal => ordering()? == Ordering::Equal,
        Operator::NotEqual => ordering()? != Ordering::Equal,
        Operator::LessThan => ordering()? == Ordering::Less,
        Operator::LessOrEqual => ordering()? != Ordering::Greater,
        Operator::GreaterThan => ordering()? == Ordering::Greater,
        Operator::GreaterOrEqual => ordering()? != Ordering::Less,
    })
}

// The pattern operand is a `/pattern/flags` string literal.
fn matches_regex(subject: &str, pattern: &Operand) -> Result<bool> {
    let Operand::String(literal) = pattern else {
        return Err(ExecutionError::ExpressionError(
            "regular expression must be a string".to_string(),
        ));
    };
    let Some((body, flags)) = literal
        .strip_prefix('/')
        .and_then(|rest| rest.rsplit_once('/'))
    else {
        return Err(ExecutionError::ExpressionError(format!(
            "`{literal}` is not a /pattern/flags literal"
        )));
    };

    let mut builder = RegexBuilder::new(body);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            other => {
                return Err(ExecutionError::ExpressionError(format!(
                    "unsupported regular expression flag `{other}`"
                )));
            }
        }
    }
    Ok(builder.build()?.is_match(subject))
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Comparison(Box<Comparison>),
    Not(Box<Expr>),
    Chain(Box<Expr>, Vec<(Logical, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
struct Comparison {
    left: Operand,
    operator: Operator,
    right: Operand,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(String),
    String(String),
}

impl Operand {
    fn text(&self) -> &str {
        match self {
            Self::Number(s) | Self::String(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Logical {
    And,
    Or,
}

fn parse(tokens: &[Token]) -> Result<Expr> {
    let mut cur = tokens.iter().peekable();

    let expr = parse_chain(&mut cur)?;
    if cur.peek().is_some() {
        return Err(ExecutionError::ExpressionError(
            "expected end of expression".to_string(),
        ));
    }
    Ok(expr)
}

fn parse_chain(cur: &mut Peekable<Iter<Token>>) -> Result<Expr> {
    let first = parse_unary(cur)?;
    let mut rest = Vec::new();
    loop {
        let logical = match cur.peek() {
            Some(&&Token::And) => Logical::And,
            Some(&&Token::Or) => Logical::Or,
            _ => break,
        };
        cur.next();
        rest.push((logical, parse_unary(cur)?));
    }
    if rest.is_empty() {
        Ok(first)
    } else {
        Ok(Expr::Chain(Box::new(first), rest))
    }
}

fn parse_unary(cur: &mut Peekable<Iter<Token>>) -> Result<Expr> {
    if cur.peek() == Some(&&Token::Not) {
        cur.next();
        return Ok(Expr::Not(Box::new(parse_unary(cur)?)));
    }
    parse_primary(cur)
}

fn parse_primary(cur: &mut Peekable<Iter<Token>>) -> Result<Expr> {
    match cur.next() {
        Some(Token::OpenParen) => {
            let inner = parse_chain(cur)?;
            match cur.next() {
                Some(Token::CloseParen) => Ok(inner),
                _ => Err(ExecutionError::ExpressionError(
                    "unmatched bracket".to_string(),
                )),
            }
        }
        Some(token) => {
            let left = parse_operand(Some(token))?;
            let operator = match cur.next() {
                Some(Token::Operator(op)) => *op,
                _ => {
                    return Err(ExecutionError::ExpressionError(
                        "expected comparison operator".to_string(),
                    ));
                }
            };
            let right = parse_operand(cur.next())?;
            Ok(Expr::Comparison(Box::new(Comparison {
                left,
                operator,
                right,
            })))
        }
        None => Err(ExecutionError::ExpressionError(
            "unexpected end of expression".to_string(),
        )),
    }
}

fn parse_operand(token: Option<&Token>) -> Result<Operand> {
    match token {
        Some(Token::Number(n)) => Ok(Operand::Number(n.clone())),
        Some(Token::String(s)) => Ok(Operand::String(s.clone())),
        Some(other) => Err(ExecutionError::ExpressionError(format!(
            "expected a literal, found {other:?}"
        ))),
        None => Err(ExecutionError::ExpressionError(
            "missing operand".to_string(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    String(String),
    Operator(Operator),
    Not,
    And,
    Or,
    OpenParen,
    CloseParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Matches,
}

fn lex_expr(expr: &str) -> Result<Vec<Token>> {
    let mut result = Vec::new();

    let mut cur = expr.chars().peekable();
    while let Some(&c) = cur.peek() {
        match c {
            '\'' => {
                cur.next();
                result.push(get_string(&mut cur)?);
            }
            '0'..='9' => {
                result.push(get_number(&mut cur)?);
            }
            '=' => {
                cur.next();
                match cur.next() {
                    Some('=') => result.push(Token::Operator(Operator::Equal)),
                    Some('~') => result.push(Token::Operator(Operator::Matches)),
                    _ => {
                        return Err(ExecutionError::ExpressionError(format!(
                            "stray `=` in `{expr}`"
                        )))
                    }
                }
            }
            '!' => {
                cur.next();
                if cur.next_if_eq(&'=').is_some() {
                    result.push(Token::Operator(Operator::NotEqual));
                } else {
                    result.push(Token::Not);
                }
            }
            '<' => {
                cur.next();
                if cur.next_if_eq(&'=').is_some() {
                    result.push(Token::Operator(Operator::LessOrEqual));
                } else {
                    result.push(Token::Operator(Operator::LessThan));
                }
            }
            '>' => {
                cur.next();
                if cur.next_if_eq(&'=').is_some() {
                    result.push(Token::Operator(Operator::GreaterOrEqual));
                } else {
                    result.push(Token::Operator(Operator::GreaterThan));
                }
            }
            '&' => {
                cur.next();
                cur.next_if_eq(&'&');
                result.push(Token::And);
            }
            '|' => {
                cur.next();
                cur.next_if_eq(&'|');
                result.push(Token::Or);
            }
            '(' => {
                cur.next();
                result.push(Token::OpenParen);
            }
            ')' => {
                cur.next();
                result.push(Token::CloseParen);
            }
            c if c.is_whitespace() => {
                cur.next();
            }
            _ => {
                return Err(ExecutionError::ExpressionError(format!(
                    "unexpected `{c}` in `{expr}`"
                )))
            }
        }
    }

    Ok(result)
}

fn get_number(cur: &mut Peekable<Chars>) -> Result<Token> {
    let mut buf = String::new();
    while let Some(c) = cur.next_if(char::is_ascii_digit) {
        buf.push(c);
    }
    if cur.next_if_eq(&'.').is_some() {
        buf.push('.');
        let before = buf.len();
        while let Some(c) = cur.next_if(char::is_ascii_digit) {
            buf.push(c);
        }
        if buf.len() == before {
            return Err(ExecutionError::ExpressionError(
                "invalid number".to_string(),
            ));
        }
    }
    Ok(Token::Number(buf))
}

fn get_string(cur: &mut Peekable<Chars>) -> Result<Token> {
    let mut buf = String::new();
    loop {
        match cur.next() {
            Some('\'') => return Ok(Token::String(buf)),
            Some('\\') => match cur.next() {
                Some(c @ ('\'' | '"' | '\\')) => buf.push(c),
                Some(c) => {
                    buf.push('\\');
                    buf.push(c);
                }
                None => break,
            },
            Some(c) => buf.push(c),
            None => break,
        }
    }
    Err(ExecutionError::ExpressionError(
        "unexpected eof while parsing string".to_string(),
    ))
}
