//! Recursive-descent parser: tokens to AST (spec §4.3).

use crate::ast::*;
use crate::error::{ParseError, ParseErrorType};
use crate::lexer::Lexer;
use crate::token::{Spanned, Tok};
use protopython_common::Location;

pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    source_lines: Vec<String>,
}

type PResult<T> = Result<T, ParseError>;

pub fn parse_module(source: &str) -> PResult<Module> {
    let mut parser = Parser::new(source)?;
    parser.parse_module_body()
}

pub fn parse_expression(source: &str) -> PResult<Expr> {
    let mut parser = Parser::new(source)?;
    let expr = parser.parse_testlist()?;
    Ok(expr)
}

impl Parser {
    fn new(source: &str) -> PResult<Self> {
        let mut tokens = Vec::new();
        for tok in Lexer::new(source) {
            tokens.push(tok.map_err(ParseError::from)?);
        }
        Ok(Parser {
            tokens,
            pos: 0,
            source_lines: source.lines().map(|s| s.to_string()).collect(),
        })
    }

    fn cur(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn cur_loc(&self) -> Location {
        self.tokens[self.pos.min(self.tokens.len() - 1)].location
    }

    fn line_text(&self, loc: Location) -> String {
        self.source_lines
            .get((loc.row() as usize).saturating_sub(1))
            .cloned()
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Tok {
        let tok = self.cur().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, msg: impl Into<String>) -> ParseError {
        let loc = self.cur_loc();
        ParseError::new(ParseErrorType::InvalidSyntax(msg.into()), loc, self.line_text(loc))
    }

    fn expect(&mut self, tok: &Tok) -> PResult<()> {
        if self.cur() == tok {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", tok, self.cur())))
        }
    }

    fn at(&self, tok: &Tok) -> bool {
        self.cur() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_name(&mut self) -> PResult<Ident> {
        match self.advance() {
            Tok::Name(n) => Ok(n),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    // ---- module / blocks ----

    fn parse_module_body(&mut self) -> PResult<Module> {
        let mut body = Vec::new();
        while !self.at(&Tok::EndOfFile) {
            if self.eat(&Tok::Newline) {
                continue;
            }
            self.parse_statement_into(&mut body)?;
        }
        Ok(Module { body })
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&Tok::Colon)?;
        if self.eat(&Tok::Newline) {
            self.expect(&Tok::Indent)?;
            let mut stmts = Vec::new();
            while !self.at(&Tok::Dedent) {
                if self.eat(&Tok::Newline) {
                    continue;
                }
                self.parse_statement_into(&mut stmts)?;
            }
            self.expect(&Tok::Dedent)?;
            Ok(stmts)
        } else {
            // Simple single-line suite: `if x: y; z`
            self.parse_simple_stmt_line()
        }
    }

    // ---- statements ----

    /// Parses one logical line and appends the statement(s) it produces to
    /// `out` — a compound statement contributes exactly one, a simple-stmt
    /// line may contribute several (`;`-separated).
    fn parse_statement_into(&mut self, out: &mut Vec<Stmt>) -> PResult<()> {
        match self.cur() {
            Tok::If => out.push(self.parse_if()?),
            Tok::While => out.push(self.parse_while()?),
            Tok::For => out.push(self.parse_for(false)?),
            Tok::Try => out.push(self.parse_try()?),
            Tok::With => out.push(self.parse_with(false)?),
            Tok::Def => out.push(self.parse_funcdef(Vec::new(), false)?),
            Tok::Class => out.push(self.parse_classdef(Vec::new())?),
            Tok::At => out.push(self.parse_decorated()?),
            Tok::Name(n) if n == "async" => out.push(self.parse_async()?),
            _ => out.extend(self.parse_simple_stmt_line()?),
        }
        Ok(())
    }

    fn parse_async(&mut self) -> PResult<Stmt> {
        self.advance(); // `async` (lexed as Name("async"))
        match self.cur() {
            Tok::Def => self.parse_funcdef(Vec::new(), true),
            Tok::For => self.parse_for(true),
            Tok::With => self.parse_with(true),
            _ => Err(self.error("expected 'def', 'for' or 'with' after 'async'")),
        }
    }

    /// Parses one or more `;`-separated small statements on a single
    /// logical line, consuming the trailing NEWLINE (or being at EOF/DEDENT
    /// for a simple-suite one-liner).
    fn parse_simple_stmt_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut out = vec![self.parse_small_stmt()?];
        while self.eat(&Tok::Semi) {
            if matches!(self.cur(), Tok::Newline | Tok::EndOfFile | Tok::Dedent) {
                break;
            }
            out.push(self.parse_small_stmt()?);
        }
        if matches!(self.cur(), Tok::Newline) {
            self.advance();
        }
        Ok(out)
    }

    fn parse_small_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.cur_loc();
        let kind = match self.cur().clone() {
            Tok::Pass => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Break => {
                self.advance();
                StmtKind::Break
            }
            Tok::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Tok::Return => {
                self.advance();
                let value = if matches!(self.cur(), Tok::Newline | Tok::Semi | Tok::EndOfFile) {
                    None
                } else {
                    Some(self.parse_testlist()?)
                };
                StmtKind::Return(value)
            }
            Tok::Raise => {
                self.advance();
                if matches!(self.cur(), Tok::Newline | Tok::Semi | Tok::EndOfFile) {
                    StmtKind::Raise { exc: None, cause: None }
                } else {
                    let exc = self.parse_expr()?;
                    let cause = if self.eat(&Tok::From) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    StmtKind::Raise { exc: Some(exc), cause }
                }
            }
            Tok::Global => {
                self.advance();
                StmtKind::Global(self.parse_name_list()?)
            }
            Tok::Nonlocal => {
                self.advance();
                StmtKind::Nonlocal(self.parse_name_list()?)
            }
            Tok::Del => {
                self.advance();
                let mut targets = vec![self.parse_expr()?];
                while self.eat(&Tok::Comma) {
                    if matches!(self.cur(), Tok::Newline | Tok::Semi | Tok::EndOfFile) {
                        break;
                    }
                    targets.push(self.parse_expr()?);
                }
                StmtKind::Delete(targets)
            }
            Tok::Assert => {
                self.advance();
                let test = self.parse_expr()?;
                let msg = if self.eat(&Tok::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Tok::Import => {
                self.advance();
                StmtKind::Import(self.parse_alias_list()?)
            }
            Tok::From => {
                self.advance();
                let mut level = 0;
                while self.eat(&Tok::Dot) {
                    level += 1;
                }
                let module = if self.at(&Tok::Import) {
                    None
                } else {
                    Some(self.parse_dotted_name()?)
                };
                self.expect(&Tok::Import)?;
                let names = if self.eat(&Tok::Star) {
                    vec![Alias { name: "*".into(), asname: None }]
                } else if self.eat(&Tok::Lpar) {
                    let names = self.parse_alias_list()?;
                    self.expect(&Tok::Rpar)?;
                    names
                } else {
                    self.parse_alias_list()?
                };
                StmtKind::ImportFrom { module, names, level }
            }
            _ => return self.parse_expr_or_assign_stmt(),
        };
        Ok(Stmt { location: loc, kind })
    }

    fn parse_name_list(&mut self) -> PResult<Vec<Ident>> {
        let mut names = vec![self.expect_name()?];
        while self.eat(&Tok::Comma) {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn parse_dotted_name(&mut self) -> PResult<Ident> {
        let mut name = self.expect_name()?;
        while self.eat(&Tok::Dot) {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_alias_list(&mut self) -> PResult<Vec<Alias>> {
        let mut out = vec![self.parse_alias()?];
        while self.eat(&Tok::Comma) {
            out.push(self.parse_alias()?);
        }
        Ok(out)
    }

    fn parse_alias(&mut self) -> PResult<Alias> {
        let name = self.parse_dotted_name()?;
        let asname = if self.eat(&Tok::As) {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn parse_expr_or_assign_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.cur_loc();
        let first = self.parse_testlist_star()?;
        if let Some(op) = self.try_aug_assign_op() {
            let value = self.parse_testlist()?;
            return Ok(Stmt {
                location: loc,
                kind: StmtKind::AugAssign { target: first, op, value },
            });
        }
        if self.eat(&Tok::Colon) {
            let annotation = self.parse_expr()?;
            let value = if self.eat(&Tok::Equal) {
                Some(self.parse_testlist()?)
            } else {
                None
            };
            return Ok(Stmt {
                location: loc,
                kind: StmtKind::AnnAssign { target: first, annotation, value },
            });
        }
        if self.eat(&Tok::Equal) {
            let mut targets = vec![first];
            let mut value = self.parse_testlist_star()?;
            while self.eat(&Tok::Equal) {
                targets.push(value);
                value = self.parse_testlist_star()?;
            }
            return Ok(Stmt {
                location: loc,
                kind: StmtKind::Assign { targets, value },
            });
        }
        Ok(Stmt {
            location: loc,
            kind: StmtKind::Expr(first),
        })
    }

    fn try_aug_assign_op(&mut self) -> Option<Operator> {
        let op = match self.cur() {
            Tok::PlusEqual => Operator::Add,
            Tok::MinusEqual => Operator::Sub,
            Tok::StarEqual => Operator::Mult,
            Tok::SlashEqual => Operator::Div,
            Tok::DoubleSlashEqual => Operator::FloorDiv,
            Tok::PercentEqual => Operator::Mod,
            Tok::DoubleStarEqual => Operator::Pow,
            Tok::LShiftEqual => Operator::LShift,
            Tok::RShiftEqual => Operator::RShift,
            Tok::AmperEqual => Operator::BitAnd,
            Tok::VBarEqual => Operator::BitOr,
            Tok::CircumflexEqual => Operator::BitXor,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::If)?;
        let test = self.parse_expr()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Tok::Elif) {
            self.pos -= 1; // unconsume, reuse parse_if by re-tagging as If
            self.tokens[self.pos].tok = Tok::If;
            vec![self.parse_if()?]
        } else if self.eat(&Tok::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            location: loc,
            kind: StmtKind::If { test, body, orelse },
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::While)?;
        let test = self.parse_expr()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Tok::Else) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt {
            location: loc,
            kind: StmtKind::While { test, body, orelse },
        })
    }

    fn parse_for(&mut self, is_async: bool) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::For)?;
        let target = self.parse_target_list()?;
        self.expect(&Tok::In)?;
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Tok::Else) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt {
            location: loc,
            kind: StmtKind::For { target, iter, body, orelse, is_async },
        })
    }

    fn parse_target_list(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let mut elts = vec![self.parse_target()?];
        let mut was_tuple = false;
        while self.eat(&Tok::Comma) {
            was_tuple = true;
            if self.at(&Tok::In) {
                break;
            }
            elts.push(self.parse_target()?);
        }
        if was_tuple {
            Ok(Expr::new(loc, ExprKind::Tuple(elts)))
        } else {
            Ok(elts.into_iter().next().unwrap())
        }
    }

    fn parse_target(&mut self) -> PResult<Expr> {
        if self.eat(&Tok::Star) {
            let loc = self.cur_loc();
            let inner = self.parse_or_test()?;
            return Ok(Expr::new(loc, ExprKind::Starred(Box::new(inner))));
        }
        self.parse_or_test()
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::Try)?;
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.at(&Tok::Except) {
            let hloc = self.cur_loc();
            self.advance();
            let typ = if self.at(&Tok::Colon) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            let name = if self.eat(&Tok::As) { Some(self.expect_name()?) } else { None };
            let hbody = self.parse_block()?;
            handlers.push(ExceptHandler { location: hloc, typ, name, body: hbody });
        }
        let orelse = if self.eat(&Tok::Else) { self.parse_block()? } else { Vec::new() };
        let finalbody = if self.eat(&Tok::Finally) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt {
            location: loc,
            kind: StmtKind::Try { body, handlers, orelse, finalbody },
        })
    }

    fn parse_with(&mut self, is_async: bool) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::With)?;
        let mut items = vec![self.parse_with_item()?];
        while self.eat(&Tok::Comma) {
            items.push(self.parse_with_item()?);
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            location: loc,
            kind: StmtKind::With { items, body, is_async },
        })
    }

    fn parse_with_item(&mut self) -> PResult<WithItem> {
        let context_expr = self.parse_expr()?;
        let optional_vars = if self.eat(&Tok::As) { Some(self.parse_target()?) } else { None };
        Ok(WithItem { context_expr, optional_vars })
    }

    fn parse_decorated(&mut self) -> PResult<Stmt> {
        let mut decorators = Vec::new();
        while self.eat(&Tok::At) {
            decorators.push(self.parse_expr()?);
            if matches!(self.cur(), Tok::Newline) {
                self.advance();
            }
        }
        match self.cur() {
            Tok::Def => self.parse_funcdef(decorators, false),
            Tok::Class => self.parse_classdef(decorators),
            Tok::Name(n) if n == "async" => {
                self.advance();
                self.parse_funcdef(decorators, true)
            }
            _ => Err(self.error("expected function or class definition after decorator")),
        }
    }

    fn parse_funcdef(&mut self, decorators: Vec<Expr>, is_async: bool) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::Def)?;
        let name = self.expect_name()?;
        self.expect(&Tok::Lpar)?;
        let params = self.parse_params(Tok::Rpar)?;
        self.expect(&Tok::Rpar)?;
        let returns = if self.eat(&Tok::Arrow) { Some(self.parse_expr()?) } else { None };
        let body = self.parse_block()?;
        Ok(Stmt {
            location: loc,
            kind: StmtKind::FunctionDef { name, params, body, decorators, returns, is_async },
        })
    }

    fn parse_params(&mut self, end: Tok) -> PResult<Params> {
        let mut params = Params::default();
        let mut seen_star = false;
        let mut seen_slash_pending_move = false;
        let mut plain_args: Vec<Arg> = Vec::new();
        while !self.at(&end) {
            if self.eat(&Tok::Star) {
                seen_star = true;
                if matches!(self.cur(), Tok::Comma) || self.at(&end) {
                    // bare `*` marker
                } else {
                    params.vararg = Some(self.parse_arg()?);
                }
            } else if self.eat(&Tok::DoubleStar) {
                params.kwarg = Some(self.parse_arg()?);
            } else if self.eat(&Tok::Slash) {
                seen_slash_pending_move = true;
                params.posonlyargs.append(&mut plain_args);
            } else {
                let arg = self.parse_arg()?;
                let default = if self.eat(&Tok::Equal) { Some(self.parse_expr()?) } else { None };
                if seen_star {
                    params.kwonlyargs.push(arg);
                    params.kw_defaults.push(default);
                } else {
                    plain_args.push(arg);
                    if let Some(d) = default {
                        params.defaults.push(d);
                    }
                }
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        let _ = seen_slash_pending_move;
        params.args.append(&mut plain_args);
        Ok(params)
    }

    fn parse_arg(&mut self) -> PResult<Arg> {
        let name = self.expect_name()?;
        let annotation = if self.eat(&Tok::Colon) { Some(self.parse_expr()?) } else { None };
        Ok(Arg { name, annotation })
    }

    fn parse_classdef(&mut self, decorators: Vec<Expr>) -> PResult<Stmt> {
        let loc = self.cur_loc();
        self.expect(&Tok::Class)?;
        let name = self.expect_name()?;
        let mut bases = Vec::new();
        let mut keywords = Vec::new();
        if self.eat(&Tok::Lpar) {
            while !self.at(&Tok::Rpar) {
                if let Tok::Name(n) = self.cur().clone() {
                    if self.peek_is_equal_after_name() {
                        self.advance();
                        self.advance();
                        keywords.push((Some(n), self.parse_expr()?));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        continue;
                    }
                }
                bases.push(self.parse_expr()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::Rpar)?;
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            location: loc,
            kind: StmtKind::ClassDef { name, bases, keywords, body, decorators },
        })
    }

    fn peek_is_equal_after_name(&self) -> bool {
        self.tokens.get(self.pos + 1).map(|t| t.tok == Tok::Equal).unwrap_or(false)
    }

    // ---- expressions ----

    fn parse_testlist(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let first = self.parse_expr()?;
        if self.at(&Tok::Comma) {
            let mut elts = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at_expr_end() {
                    break;
                }
                elts.push(self.parse_expr()?);
            }
            Ok(Expr::new(loc, ExprKind::Tuple(elts)))
        } else {
            Ok(first)
        }
    }

    fn parse_testlist_star(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let first = self.parse_star_or_expr()?;
        if self.at(&Tok::Comma) {
            let mut elts = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at_expr_end() || self.at(&Tok::Equal) {
                    break;
                }
                elts.push(self.parse_star_or_expr()?);
            }
            Ok(Expr::new(loc, ExprKind::Tuple(elts)))
        } else {
            Ok(first)
        }
    }

    fn parse_star_or_expr(&mut self) -> PResult<Expr> {
        if self.at(&Tok::Star) {
            let loc = self.cur_loc();
            self.advance();
            let inner = self.parse_or_test()?;
            return Ok(Expr::new(loc, ExprKind::Starred(Box::new(inner))));
        }
        self.parse_expr()
    }

    fn at_expr_end(&self) -> bool {
        matches!(
            self.cur(),
            Tok::Newline
                | Tok::EndOfFile
                | Tok::Semi
                | Tok::Colon
                | Tok::Rpar
                | Tok::Rsqb
                | Tok::Rbrace
                | Tok::Equal
                | Tok::In
        )
    }

    /// `test`: conditional expression, lambda, or-test.
    fn parse_expr(&mut self) -> PResult<Expr> {
        if self.at(&Tok::Lambda) {
            return self.parse_lambda();
        }
        let loc = self.cur_loc();
        let body = self.parse_or_test()?;
        if self.eat(&Tok::If) {
            let test = self.parse_or_test()?;
            self.expect(&Tok::Else)?;
            let orelse = self.parse_expr()?;
            return Ok(Expr::new(
                loc,
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
            ));
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        self.expect(&Tok::Lambda)?;
        let params = self.parse_params(Tok::Colon)?;
        self.expect(&Tok::Colon)?;
        let body = self.parse_expr()?;
        Ok(Expr::new(loc, ExprKind::Lambda { params, body: Box::new(body) }))
    }

    fn parse_or_test(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let mut values = vec![self.parse_and_test()?];
        while self.eat(&Tok::Or) {
            values.push(self.parse_and_test()?);
        }
        if values.len() == 1 {
            Ok(values.into_iter().next().unwrap())
        } else {
            Ok(Expr::new(loc, ExprKind::BoolOp { op: BoolOpKind::Or, values }))
        }
    }

    fn parse_and_test(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let mut values = vec![self.parse_not_test()?];
        while self.eat(&Tok::And) {
            values.push(self.parse_not_test()?);
        }
        if values.len() == 1 {
            Ok(values.into_iter().next().unwrap())
        } else {
            Ok(Expr::new(loc, ExprKind::BoolOp { op: BoolOpKind::And, values }))
        }
    }

    fn parse_not_test(&mut self) -> PResult<Expr> {
        if self.at(&Tok::Not) {
            let loc = self.cur_loc();
            self.advance();
            let operand = self.parse_not_test()?;
            Ok(Expr::new(loc, ExprKind::UnaryOp { op: UnaryOpKind::Not, operand: Box::new(operand) }))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = match self.cur() {
                Tok::Less => CmpOp::Lt,
                Tok::Greater => CmpOp::Gt,
                Tok::LessEqual => CmpOp::LtE,
                Tok::GreaterEqual => CmpOp::GtE,
                Tok::EqEqual => CmpOp::Eq,
                Tok::NotEqual => CmpOp::NotEq,
                Tok::In => CmpOp::In,
                Tok::Is => {
                    self.advance();
                    if self.eat(&Tok::Not) {
                        ops.push(CmpOp::IsNot);
                    } else {
                        ops.push(CmpOp::Is);
                    }
                    comparators.push(self.parse_bitor()?);
                    continue;
                }
                Tok::Not if self.peek_is(&Tok::In) => {
                    self.advance();
                    self.advance();
                    ops.push(CmpOp::NotIn);
                    comparators.push(self.parse_bitor()?);
                    continue;
                }
                _ => break,
            };
            self.advance();
            ops.push(op);
            comparators.push(self.parse_bitor()?);
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::new(loc, ExprKind::Compare { left: Box::new(left), ops, comparators }))
        }
    }

    fn peek_is(&self, tok: &Tok) -> bool {
        self.tokens.get(self.pos + 1).map(|t| &t.tok == tok).unwrap_or(false)
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.parse_binop_left(&[(Tok::VBar, Operator::BitOr)], Self::parse_bitxor)
    }
    fn parse_bitxor(&mut self) -> PResult<Expr> {
        self.parse_binop_left(&[(Tok::Circumflex, Operator::BitXor)], Self::parse_bitand)
    }
    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.parse_binop_left(&[(Tok::Amper, Operator::BitAnd)], Self::parse_shift)
    }
    fn parse_shift(&mut self) -> PResult<Expr> {
        self.parse_binop_left(&[(Tok::LShift, Operator::LShift), (Tok::RShift, Operator::RShift)], Self::parse_arith)
    }
    fn parse_arith(&mut self) -> PResult<Expr> {
        self.parse_binop_left(&[(Tok::Plus, Operator::Add), (Tok::Minus, Operator::Sub)], Self::parse_term)
    }
    fn parse_term(&mut self) -> PResult<Expr> {
        self.parse_binop_left(
            &[
                (Tok::Star, Operator::Mult),
                (Tok::Slash, Operator::Div),
                (Tok::DoubleSlash, Operator::FloorDiv),
                (Tok::Percent, Operator::Mod),
                (Tok::At, Operator::Mult),
            ],
            Self::parse_factor,
        )
    }

    fn parse_binop_left(
        &mut self,
        ops: &[(Tok, Operator)],
        mut next: impl FnMut(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let loc = self.cur_loc();
        let mut left = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.at(tok) {
                    self.advance();
                    let right = next(self)?;
                    left = Expr::new(loc, ExprKind::BinOp { left: Box::new(left), op: *op, right: Box::new(right) });
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let op = match self.cur() {
            Tok::Plus => Some(UnaryOpKind::UAdd),
            Tok::Minus => Some(UnaryOpKind::USub),
            Tok::Tilde => Some(UnaryOpKind::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_factor()?;
            Ok(Expr::new(loc, ExprKind::UnaryOp { op, operand: Box::new(operand) }))
        } else {
            self.parse_power()
        }
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let base = self.parse_await_expr()?;
        if self.eat(&Tok::DoubleStar) {
            let exp = self.parse_factor()?;
            Ok(Expr::new(loc, ExprKind::BinOp { left: Box::new(base), op: Operator::Pow, right: Box::new(exp) }))
        } else {
            Ok(base)
        }
    }

    fn parse_await_expr(&mut self) -> PResult<Expr> {
        if let Tok::Name(n) = self.cur() {
            if n == "await" {
                let loc = self.cur_loc();
                self.advance();
                let operand = self.parse_unary_postfix()?;
                return Ok(Expr::new(loc, ExprKind::Await(Box::new(operand))));
            }
        }
        self.parse_unary_postfix()
    }

    fn parse_unary_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            let loc = self.cur_loc();
            if self.eat(&Tok::Dot) {
                let attr = self.expect_name()?;
                expr = Expr::new(loc, ExprKind::Attribute { value: Box::new(expr), attr });
            } else if self.eat(&Tok::Lpar) {
                let (args, keywords) = self.parse_call_args()?;
                self.expect(&Tok::Rpar)?;
                expr = Expr::new(loc, ExprKind::Call { func: Box::new(expr), args, keywords });
            } else if self.eat(&Tok::Lsqb) {
                let slice = self.parse_subscript()?;
                self.expect(&Tok::Rsqb)?;
                expr = Expr::new(loc, ExprKind::Subscript { value: Box::new(expr), slice: Box::new(slice) });
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> PResult<(Vec<Expr>, Vec<(Option<Ident>, Expr)>)> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        while !self.at(&Tok::Rpar) {
            if self.eat(&Tok::DoubleStar) {
                keywords.push((None, self.parse_expr()?));
            } else if self.at(&Tok::Star) {
                let loc = self.cur_loc();
                self.advance();
                let inner = self.parse_or_test()?;
                args.push(Expr::new(loc, ExprKind::Starred(Box::new(inner))));
            } else if let Tok::Name(n) = self.cur().clone() {
                if self.peek_is_equal_after_name() {
                    self.advance();
                    self.advance();
                    keywords.push((Some(n), self.parse_expr()?));
                } else {
                    args.push(self.parse_named_expr_or_genexp(&args)?);
                }
            } else {
                args.push(self.parse_named_expr_or_genexp(&args)?);
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn parse_named_expr_or_genexp(&mut self, existing: &[Expr]) -> PResult<Expr> {
        let loc = self.cur_loc();
        let expr = self.parse_expr()?;
        if self.at(&Tok::For) && existing.is_empty() {
            let generators = self.parse_comprehensions()?;
            return Ok(Expr::new(loc, ExprKind::GeneratorExp { elt: Box::new(expr), generators }));
        }
        Ok(expr)
    }

    fn parse_subscript(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        let parse_part = |s: &mut Self| -> PResult<Option<Expr>> {
            if matches!(s.cur(), Tok::Colon | Tok::Rsqb) {
                Ok(None)
            } else {
                Ok(Some(s.parse_expr()?))
            }
        };
        let lower = parse_part(self)?;
        if self.eat(&Tok::Colon) {
            let upper = parse_part(self)?;
            let step = if self.eat(&Tok::Colon) { parse_part(self)? } else { None };
            return Ok(Expr::new(
                loc,
                ExprKind::Slice {
                    lower: lower.map(Box::new),
                    upper: upper.map(Box::new),
                    step: step.map(Box::new),
                },
            ));
        }
        let first = lower.unwrap_or_else(|| Expr::new(loc, ExprKind::Constant(Constant::None)));
        if self.at(&Tok::Comma) {
            let mut elts = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at(&Tok::Rsqb) {
                    break;
                }
                elts.push(self.parse_expr()?);
            }
            Ok(Expr::new(loc, ExprKind::Tuple(elts)))
        } else {
            Ok(first)
        }
    }

    fn parse_comprehensions(&mut self) -> PResult<Vec<Comprehension>> {
        let mut out = Vec::new();
        while self.at(&Tok::For) || self.peek_async_for() {
            let is_async = self.eat_async_marker();
            self.expect(&Tok::For)?;
            let target = self.parse_target_list()?;
            self.expect(&Tok::In)?;
            let iter = self.parse_or_test()?;
            let mut ifs = Vec::new();
            while self.eat(&Tok::If) {
                ifs.push(self.parse_or_test()?);
            }
            out.push(Comprehension { target, iter, ifs, is_async });
        }
        Ok(out)
    }

    fn peek_async_for(&self) -> bool {
        matches!(self.cur(), Tok::Name(n) if n == "async") && self.peek_is(&Tok::For)
    }

    fn eat_async_marker(&mut self) -> bool {
        if matches!(self.cur(), Tok::Name(n) if n == "async") {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let loc = self.cur_loc();
        match self.cur().clone() {
            Tok::Int(v) => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Int(v))))
            }
            Tok::Float(v) => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Float(v))))
            }
            Tok::Str { .. } => self.parse_string_concat(loc),
            Tok::Bytes(_) => {
                let mut bytes = Vec::new();
                while let Tok::Bytes(b) = self.cur().clone() {
                    bytes.extend(b);
                    self.advance();
                }
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Bytes(bytes))))
            }
            Tok::None => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::None)))
            }
            Tok::True => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Bool(true))))
            }
            Tok::False => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Bool(false))))
            }
            Tok::Ellipsis => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Ellipsis)))
            }
            Tok::Name(n) => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Name(n)))
            }
            Tok::Yield => {
                self.advance();
                if self.eat(&Tok::From) {
                    let value = self.parse_expr()?;
                    Ok(Expr::new(loc, ExprKind::YieldFrom(Box::new(value))))
                } else if matches!(self.cur(), Tok::Newline | Tok::Rpar | Tok::EndOfFile | Tok::Semi) {
                    Ok(Expr::new(loc, ExprKind::Yield(None)))
                } else {
                    let value = self.parse_testlist()?;
                    Ok(Expr::new(loc, ExprKind::Yield(Some(Box::new(value)))))
                }
            }
            Tok::Lpar => self.parse_paren_atom(loc),
            Tok::Lsqb => self.parse_list_atom(loc),
            Tok::Lbrace => self.parse_brace_atom(loc),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_string_concat(&mut self, loc: Location) -> PResult<Expr> {
        // Adjacent string literals concatenate; if any participant is an
        // f-string the whole run becomes a JoinedStr.
        let mut parts: Vec<Expr> = Vec::new();
        let mut any_fstring = false;
        while let Tok::Str { value, is_fstring, .. } = self.cur().clone() {
            self.advance();
            if is_fstring {
                any_fstring = true;
                let segments = crate::fstring::split(&value).map_err(|msg| self.error(msg))?;
                for seg in segments {
                    match seg {
                        crate::fstring::Segment::Literal(s) => {
                            parts.push(Expr::new(loc, ExprKind::Constant(Constant::Str(s))))
                        }
                        crate::fstring::Segment::Expr { source, conversion, format_spec } => {
                            let inner = parse_expression(&source).map_err(|mut e| {
                                e.location = loc;
                                e
                            })?;
                            parts.push(Expr::new(
                                loc,
                                ExprKind::FormattedValue {
                                    value: Box::new(inner),
                                    conversion,
                                    format_spec: format_spec.map(|s| {
                                        Box::new(Expr::new(loc, ExprKind::Constant(Constant::Str(s))))
                                    }),
                                },
                            ));
                        }
                    }
                }
            } else {
                parts.push(Expr::new(loc, ExprKind::Constant(Constant::Str(value))));
            }
        }
        if any_fstring {
            Ok(Expr::new(loc, ExprKind::JoinedStr(parts)))
        } else if parts.len() == 1 {
            Ok(parts.into_iter().next().unwrap())
        } else {
            // Plain adjacent string literals: fold into one constant.
            let mut joined = String::new();
            for p in parts {
                if let ExprKind::Constant(Constant::Str(s)) = p.kind {
                    joined.push_str(&s);
                }
            }
            Ok(Expr::new(loc, ExprKind::Constant(Constant::Str(joined))))
        }
    }

    fn parse_paren_atom(&mut self, loc: Location) -> PResult<Expr> {
        self.expect(&Tok::Lpar)?;
        if self.eat(&Tok::Rpar) {
            return Ok(Expr::new(loc, ExprKind::Tuple(Vec::new())));
        }
        let first = self.parse_star_or_expr()?;
        if self.at(&Tok::For) {
            let generators = self.parse_comprehensions()?;
            self.expect(&Tok::Rpar)?;
            return Ok(Expr::new(loc, ExprKind::GeneratorExp { elt: Box::new(first), generators }));
        }
        if self.at(&Tok::Comma) {
            let mut elts = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at(&Tok::Rpar) {
                    break;
                }
                elts.push(self.parse_star_or_expr()?);
            }
            self.expect(&Tok::Rpar)?;
            return Ok(Expr::new(loc, ExprKind::Tuple(elts)));
        }
        self.expect(&Tok::Rpar)?;
        Ok(first)
    }

    fn parse_list_atom(&mut self, loc: Location) -> PResult<Expr> {
        self.expect(&Tok::Lsqb)?;
        if self.eat(&Tok::Rsqb) {
            return Ok(Expr::new(loc, ExprKind::List(Vec::new())));
        }
        let first = self.parse_star_or_expr()?;
        if self.at(&Tok::For) {
            let generators = self.parse_comprehensions()?;
            self.expect(&Tok::Rsqb)?;
            return Ok(Expr::new(loc, ExprKind::ListComp { elt: Box::new(first), generators }));
        }
        let mut elts = vec![first];
        while self.eat(&Tok::Comma) {
            if self.at(&Tok::Rsqb) {
                break;
            }
            elts.push(self.parse_star_or_expr()?);
        }
        self.expect(&Tok::Rsqb)?;
        Ok(Expr::new(loc, ExprKind::List(elts)))
    }

    fn parse_brace_atom(&mut self, loc: Location) -> PResult<Expr> {
        self.expect(&Tok::Lbrace)?;
        if self.eat(&Tok::Rbrace) {
            return Ok(Expr::new(loc, ExprKind::Dict { keys: Vec::new(), values: Vec::new() }));
        }
        if self.eat(&Tok::DoubleStar) {
            // dict unpacking: {**a, "k": v}
            let first_value = self.parse_or_test()?;
            let mut keys = vec![None];
            let mut values = vec![first_value];
            while self.eat(&Tok::Comma) {
                if self.at(&Tok::Rbrace) {
                    break;
                }
                if self.eat(&Tok::DoubleStar) {
                    keys.push(None);
                    values.push(self.parse_or_test()?);
                } else {
                    let k = self.parse_expr()?;
                    self.expect(&Tok::Colon)?;
                    let v = self.parse_expr()?;
                    keys.push(Some(k));
                    values.push(v);
                }
            }
            self.expect(&Tok::Rbrace)?;
            return Ok(Expr::new(loc, ExprKind::Dict { keys, values }));
        }
        let first = self.parse_star_or_expr()?;
        if self.eat(&Tok::Colon) {
            let first_value = self.parse_expr()?;
            if self.at(&Tok::For) {
                let generators = self.parse_comprehensions()?;
                self.expect(&Tok::Rbrace)?;
                return Ok(Expr::new(
                    loc,
                    ExprKind::DictComp { key: Box::new(first), value: Box::new(first_value), generators },
                ));
            }
            let mut keys = vec![Some(first)];
            let mut values = vec![first_value];
            while self.eat(&Tok::Comma) {
                if self.at(&Tok::Rbrace) {
                    break;
                }
                if self.eat(&Tok::DoubleStar) {
                    keys.push(None);
                    values.push(self.parse_or_test()?);
                    continue;
                }
                let k = self.parse_expr()?;
                self.expect(&Tok::Colon)?;
                let v = self.parse_expr()?;
                keys.push(Some(k));
                values.push(v);
            }
            self.expect(&Tok::Rbrace)?;
            return Ok(Expr::new(loc, ExprKind::Dict { keys, values }));
        }
        if self.at(&Tok::For) {
            let generators = self.parse_comprehensions()?;
            self.expect(&Tok::Rbrace)?;
            return Ok(Expr::new(loc, ExprKind::SetComp { elt: Box::new(first), generators }));
        }
        let mut elts = vec![first];
        while self.eat(&Tok::Comma) {
            if self.at(&Tok::Rbrace) {
                break;
            }
            elts.push(self.parse_star_or_expr()?);
        }
        self.expect(&Tok::Rbrace)?;
        Ok(Expr::new(loc, ExprKind::Set(elts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmts(src: &str) -> Vec<Stmt> {
        parse_module(src).unwrap().body
    }

    #[test]
    fn parses_assignment() {
        let body = stmts("x = 1 + 2\n");
        assert!(matches!(body[0].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn parses_fib() {
        let src = "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\n";
        let body = stmts(src);
        assert!(matches!(body[0].kind, StmtKind::FunctionDef { .. }));
    }

    #[test]
    fn parses_try_except() {
        let src = "try:\n    raise ValueError(\"x\")\nexcept ValueError as e:\n    print(e.args[0])\n";
        let body = stmts(src);
        assert!(matches!(body[0].kind, StmtKind::Try { .. }));
    }

    #[test]
    fn parses_generator_function() {
        let src = "def g():\n    yield 1\n    yield 2\n";
        let body = stmts(src);
        if let StmtKind::FunctionDef { body, .. } = &body[0].kind {
            assert_eq!(body.len(), 2);
        } else {
            panic!("expected function def");
        }
    }

    #[test]
    fn parses_comprehension() {
        let body = stmts("xs = [x * x for x in range(10) if x % 2 == 0]\n");
        assert!(matches!(body[0].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn parses_fstring() {
        let body = stmts("print(f\"{x!r:>10}\")\n");
        assert!(matches!(body[0].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn syntax_error_has_location() {
        let err = parse_module("def f(:\n    pass\n").unwrap_err();
        assert_eq!(err.location.row(), 1);
    }
}
