//! Minimal f-string splitting (spec §4.2 "a minimal f-string form", §4.4
//! "f-strings: compiled as a sequence of string literals and
//! `FORMAT_VALUE` opcodes").
//!
//! This module only splits the literal text surrounding `{expr}` from the
//! expression source; the expression source is handed back to the parser to
//! be lexed and parsed like any other expression.

#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Literal(String),
    Expr {
        source: String,
        conversion: Option<char>,
        format_spec: Option<String>,
    },
}

pub fn split(text: &str) -> Result<Vec<Segment>, String> {
    let mut out = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                if !literal.is_empty() {
                    out.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let mut depth = 1usize;
                let mut body = String::new();
                loop {
                    match chars.next() {
                        None => return Err("unterminated f-string expression".into()),
                        Some('{') => {
                            depth += 1;
                            body.push('{');
                        }
                        Some('}') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            body.push('}');
                        }
                        Some(c) => body.push(c),
                    }
                }
                let (expr_part, format_spec) = split_format_spec(&body);
                let (expr_part, conversion) = split_conversion(expr_part);
                out.push(Segment::Expr {
                    source: expr_part.trim().to_string(),
                    conversion,
                    format_spec,
                });
            }
            '}' => return Err("single '}' is not allowed in an f-string".into()),
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    Ok(out)
}

/// Splits a trailing `:format_spec`, respecting bracket nesting so a dict or
/// slice inside the expression doesn't get mistaken for the separator.
fn split_format_spec(body: &str) -> (&str, Option<String>) {
    let mut depth = 0i32;
    for (i, c) in body.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth == 0 => {
                return (&body[..i], Some(body[i + 1..].to_string()));
            }
            _ => {}
        }
    }
    (body, None)
}

fn split_conversion(body: &str) -> (&str, Option<char>) {
    if let Some(idx) = body.rfind('!') {
        let tail = &body[idx + 1..];
        if tail.len() == 1 {
            let c = tail.chars().next().unwrap();
            if matches!(c, 'r' | 's' | 'a') {
                return (&body[..idx], Some(c));
            }
        }
    }
    (body, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_only() {
        assert_eq!(split("hello").unwrap(), vec![Segment::Literal("hello".into())]);
    }

    #[test]
    fn simple_expr() {
        let segs = split("x={x}!").unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::Literal("x=".into()),
                Segment::Expr {
                    source: "x".into(),
                    conversion: None,
                    format_spec: None
                },
                Segment::Literal("!".into()),
            ]
        );
    }

    #[test]
    fn conversion_and_spec() {
        let segs = split("{x!r:>10}").unwrap();
        assert_eq!(
            segs,
            vec![Segment::Expr {
                source: "x".into(),
                conversion: Some('r'),
                format_spec: Some(">10".into()),
            }]
        );
    }

    #[test]
    fn doubled_braces() {
        assert_eq!(split("{{literal}}").unwrap(), vec![Segment::Literal("{literal}".into())]);
    }
}
