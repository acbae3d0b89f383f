//! Expression grammar shared by breakpoint conditions, log-point templates,
//! `evaluate` requests and `setVariable` coercion.
//!
//! Expressions are evaluated against a frame's namespaces: locals shadow
//! globals, matching the scoping rules of the script runtime.

use chumsky::prelude::{choice, end, just, none_of, recursive};
use chumsky::{extra, error::Rich, IterParser, Parser, text};
use indexmap::IndexMap;

use crate::debugger::error::Error;
use crate::runtime::{Namespace, Value};

type Err<'a> = extra::Err<Rich<'a, char>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    ListDisplay(Vec<Expr>),
    MapDisplay(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
}

fn keyword<'a>(word: &'static str) -> impl Parser<'a, &'a str, &'a str, Err<'a>> + Clone {
    text::ascii::ident()
        .filter(move |s: &&str| *s == word)
        .padded()
}

fn number<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> + Clone {
    text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .map(|s: &str| {
            if s.contains('.') {
                Expr::Literal(Value::Float(s.parse().unwrap_or(f64::NAN)))
            } else {
                match s.parse::<i64>() {
                    Ok(i) => Expr::Literal(Value::Int(i)),
                    Err(_) => Expr::Literal(Value::Float(s.parse().unwrap_or(f64::NAN))),
                }
            }
        })
        .padded()
        .labelled("number")
}

fn string_literal<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    just('"')
        .ignore_then(none_of('"').repeated().collect::<String>())
        .then_ignore(just('"'))
        .padded()
        .labelled("string")
}

/// Parser for the full expression grammar.
pub fn parser<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> {
    recursive(|expr| {
        let name_or_keyword = text::ascii::ident()
            .map(|s: &str| match s {
                "none" | "None" => Expr::Literal(Value::None),
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                other => Expr::Name(other.to_string()),
            })
            .padded();

        let list = expr
            .clone()
            .separated_by(just(',').padded())
            .allow_trailing()
            .collect::<Vec<Expr>>()
            .delimited_by(just('[').padded(), just(']').padded())
            .map(Expr::ListDisplay);

        let map = string_literal()
            .then_ignore(just(':').padded())
            .then(expr.clone())
            .separated_by(just(',').padded())
            .allow_trailing()
            .collect::<Vec<(String, Expr)>>()
            .delimited_by(just('{').padded(), just('}').padded())
            .map(Expr::MapDisplay);

        let parens = expr
            .clone()
            .delimited_by(just('(').padded(), just(')').padded());

        let atom = choice((
            number(),
            string_literal().map(|s| Expr::Literal(Value::Str(s))),
            list,
            map,
            parens,
            name_or_keyword,
        ))
        .boxed();

        // Postfix: indexing and field access bind tightest.
        #[derive(Clone)]
        enum Post {
            Index(Expr),
            Field(String),
        }

        let postfix = atom
            .foldl(
                choice((
                    expr.clone()
                        .delimited_by(just('[').padded(), just(']').padded())
                        .map(Post::Index),
                    just('.')
                        .ignore_then(text::ascii::ident().map(|s: &str| s.to_string()))
                        .map(Post::Field),
                ))
                .repeated(),
                |acc, post| match post {
                    Post::Index(idx) => Expr::Index(Box::new(acc), Box::new(idx)),
                    Post::Field(field) => Expr::Field(Box::new(acc), field),
                },
            )
            .padded()
            .boxed();

        let unary = choice((
            just('-')
                .padded()
                .ignore_then(postfix.clone())
                .map(|e| Expr::Unary(UnaryOp::Neg, Box::new(e))),
            keyword("not")
                .ignore_then(postfix.clone())
                .map(|e| Expr::Unary(UnaryOp::Not, Box::new(e))),
            postfix,
        ))
        .boxed();

        let product = unary
            .clone()
            .foldl(
                choice((
                    just('*').padded().to(BinOp::Mul),
                    just('/').padded().to(BinOp::Div),
                    just('%').padded().to(BinOp::Mod),
                ))
                .then(unary)
                .repeated(),
                |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                choice((
                    just('+').padded().to(BinOp::Add),
                    just('-').padded().to(BinOp::Sub),
                ))
                .then(product)
                .repeated(),
                |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            )
            .boxed();

        let comparison = sum
            .clone()
            .then(
                choice((
                    just("==").padded().to(BinOp::Eq),
                    just("!=").padded().to(BinOp::Ne),
                    just("<=").padded().to(BinOp::Le),
                    just(">=").padded().to(BinOp::Ge),
                    just('<').padded().to(BinOp::Lt),
                    just('>').padded().to(BinOp::Gt),
                ))
                .then(sum)
                .or_not(),
            )
            .map(|(lhs, tail)| match tail {
                Some((op, rhs)) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
                None => lhs,
            })
            .boxed();

        let conjunction = comparison
            .clone()
            .foldl(
                keyword("and").to(BinOp::And).then(comparison).repeated(),
                |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            )
            .boxed();

        conjunction
            .clone()
            .foldl(
                keyword("or").to(BinOp::Or).then(conjunction).repeated(),
                |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
            )
            .boxed()
    })
}

/// Parse an expression string, mapping parser diagnostics onto [`Error::Eval`].
pub fn parse(input: &str) -> Result<Expr, Error> {
    parser()
        .then_ignore(end())
        .parse(input.trim())
        .into_result()
        .map_err(|errs| {
            let rendered = errs
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "invalid expression".to_string());
            Error::Eval(format!("parse error in `{}`: {rendered}", input.trim()))
        })
}

/// Evaluate `expr` with locals shadowing globals.
pub fn evaluate(expr: &Expr, locals: &Namespace, globals: &Namespace) -> Result<Value, Error> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => locals
            .get(name)
            .or_else(|| globals.get(name))
            .cloned()
            .ok_or_else(|| Error::Eval(format!("name `{name}` is not defined"))),
        Expr::ListDisplay(items) => {
            let values = items
                .iter()
                .map(|e| evaluate(e, locals, globals))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(values))
        }
        Expr::MapDisplay(entries) => {
            let mut map = IndexMap::new();
            for (key, e) in entries {
                map.insert(key.clone(), evaluate(e, locals, globals)?);
            }
            Ok(Value::Map(map))
        }
        Expr::Unary(op, inner) => {
            let v = evaluate(inner, locals, globals)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                UnaryOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(Error::Eval(format!(
                        "bad operand type for unary -: {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary(BinOp::And, lhs, rhs) => {
            let l = evaluate(lhs, locals, globals)?;
            if !l.is_truthy() {
                return Ok(l);
            }
            evaluate(rhs, locals, globals)
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            let l = evaluate(lhs, locals, globals)?;
            if l.is_truthy() {
                return Ok(l);
            }
            evaluate(rhs, locals, globals)
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = evaluate(lhs, locals, globals)?;
            let r = evaluate(rhs, locals, globals)?;
            binary(*op, l, r)
        }
        Expr::Index(target, index) => {
            let t = evaluate(target, locals, globals)?;
            let i = evaluate(index, locals, globals)?;
            index_value(&t, &i)
        }
        Expr::Field(target, field) => {
            let t = evaluate(target, locals, globals)?;
            field_value(&t, field)
        }
    }
}

/// Parse and evaluate in one step.
pub fn evaluate_str(input: &str, locals: &Namespace, globals: &Namespace) -> Result<Value, Error> {
    let expr = parse(input)?;
    evaluate(&expr, locals, globals)
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, Error> {
    use BinOp::*;
    match op {
        Add => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => numeric(op, a, b, |x, y| x + y),
        },
        Sub => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(b))),
            (a, b) => numeric(op, a, b, |x, y| x - y),
        },
        Mul => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(b))),
            (a, b) => numeric(op, a, b, |x, y| x * y),
        },
        Div => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(Error::Eval("division by zero".into())),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a / b)),
            (a, b) => numeric(op, a, b, |x, y| x / y),
        },
        Mod => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(Error::Eval("modulo by zero".into())),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.rem_euclid(b))),
            (a, b) => numeric(op, a, b, |x, y| x % y),
        },
        Eq => Ok(Value::Bool(values_equal(&l, &r))),
        Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        Lt | Le | Gt | Ge => compare(op, &l, &r),
        And | Or => unreachable!("short-circuit ops handled by the caller"),
    }
}

fn numeric(
    op: BinOp,
    l: Value,
    r: Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, Error> {
    let (a, b) = match (as_float(&l), as_float(&r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(Error::Eval(format!(
                "unsupported operand types for {op:?}: {} and {}",
                l.type_name(),
                r.type_name()
            )))
        }
    };
    Ok(Value::Float(f(a, b)))
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (as_float(l), as_float(r)) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare(op: BinOp, l: &Value, r: &Value) -> Result<Value, Error> {
    let ord = match (l, r) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => match (as_float(l), as_float(r)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let Some(ord) = ord else {
        return Err(Error::Eval(format!(
            "`{}` and `{}` are not orderable",
            l.type_name(),
            r.type_name()
        )));
    };
    let result = match op {
        BinOp::Lt => ord.is_lt(),
        BinOp::Le => ord.is_le(),
        BinOp::Gt => ord.is_gt(),
        BinOp::Ge => ord.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn index_value(target: &Value, index: &Value) -> Result<Value, Error> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len())?;
            Ok(items[idx].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        (Value::Map(items), Value::Str(key)) => items
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("key `{key}` not found"))),
        (t, i) => Err(Error::Eval(format!(
            "cannot index {} with {}",
            t.type_name(),
            i.type_name()
        ))),
    }
}

fn normalize_index(i: i64, len: usize) -> Result<usize, Error> {
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        return Err(Error::Eval(format!("index {i} out of range (len {len})")));
    }
    Ok(idx as usize)
}

fn field_value(target: &Value, field: &str) -> Result<Value, Error> {
    match target {
        Value::Object { fields, .. } => fields
            .get(field)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("object has no field `{field}`"))),
        Value::Map(items) => items
            .get(field)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("key `{field}` not found"))),
        other => Err(Error::Eval(format!(
            "{} has no fields",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(input: &str) -> Result<Value, Error> {
        let mut locals = Namespace::new();
        locals.insert("x".to_string(), Value::Int(10));
        locals.insert("y".to_string(), Value::Int(20));
        locals.insert("name".to_string(), Value::Str("dapper".into()));
        locals.insert(
            "items".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        );
        let mut fields = IndexMap::new();
        fields.insert("size".to_string(), Value::Int(7));
        locals.insert(
            "obj".to_string(),
            Value::Object { class: "Box".into(), fields },
        );
        let mut globals = Namespace::new();
        globals.insert("limit".to_string(), Value::Int(100));
        globals.insert("x".to_string(), Value::Int(-1));
        evaluate_str(input, &locals, &globals)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::Int(9));
        assert_eq!(eval("10 % 3").unwrap(), Value::Int(1));
        assert_eq!(eval("-x").unwrap(), Value::Int(-10));
        assert_eq!(eval("1.5 + 1").unwrap(), Value::Float(2.5));
    }

    #[test]
    fn test_locals_shadow_globals() {
        assert_eq!(eval("x").unwrap(), Value::Int(10));
        assert_eq!(eval("limit").unwrap(), Value::Int(100));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("x > 100").unwrap(), Value::Bool(false));
        assert_eq!(eval("x >= 10 and y == 20").unwrap(), Value::Bool(true));
        assert_eq!(eval("x > 100 or y > 100").unwrap(), Value::Bool(false));
        assert_eq!(eval("not x").unwrap(), Value::Bool(false));
        assert_eq!(eval("x != y").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_indexing_and_fields() {
        assert_eq!(eval("items[0]").unwrap(), Value::Int(1));
        assert_eq!(eval("items[-1]").unwrap(), Value::Int(3));
        assert_eq!(eval("obj.size").unwrap(), Value::Int(7));
        assert_eq!(eval("name + \"!\"").unwrap(), Value::Str("dapper!".into()));
        assert!(eval("items[9]").is_err());
    }

    #[test]
    fn test_undefined_name_errors() {
        let err = eval("missing + 1").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("none").unwrap(), Value::None);
        assert_eq!(eval("true").unwrap(), Value::Bool(true));
        assert_eq!(
            eval("[1, 2]").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(eval("{\"a\": 1}[\"a\"]").unwrap(), Value::Int(1));
    }
}
