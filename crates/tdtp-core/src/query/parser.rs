//! TDTQL recursive-descent parser.
//!
//! Grammar (keywords case-insensitive):
//!
//! ```text
//! select_stmt := SELECT '*' FROM ident [ WHERE expr ]
//!                [ ORDER BY order (, order)* ] [ LIMIT n ] [ OFFSET n ]
//! expr        := or_expr
//! or_expr     := and_expr (OR and_expr)*
//! and_expr    := unary (AND unary)*
//! unary       := NOT unary | '(' expr ')' | predicate
//! predicate   := ident op value | ident [NOT] IN '(' value (, value)* ')'
//!              | ident [NOT] BETWEEN value AND value
//!              | ident IS [NOT] NULL
//!              | ident [NOT] LIKE string
//! ```
//!
//! Precedence: `NOT` over `AND` over `OR`. Errors carry the byte offset
//! of the offending token.

use crate::error::TdtpError;
use crate::query::ast::{CompareOp, Expr, Filter, OrderBy, SelectStatement, SortDirection};
use crate::query::lexer::{tokenize, Token, TokenKind};

/// Parse a TDTQL statement.
pub fn parse(input: &str) -> Result<SelectStatement, TdtpError> {
    let mut parser = Parser {
        tokens: tokenize(input),
        pos: 0,
    };
    let mut stmt = parser.select_stmt()?;
    parser.expect(TokenKind::Eof, "end of query")?;
    stmt.raw = input.trim().to_string();
    Ok(stmt)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn next(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn accept(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, TdtpError> {
        let token = self.peek().clone();
        if token.kind == kind {
            Ok(self.next())
        } else {
            Err(self.unexpected(&token, what))
        }
    }

    fn unexpected(&self, token: &Token, what: &str) -> TdtpError {
        let got = match token.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Illegal => format!("illegal input {:?}", token.literal),
            _ => format!("{:?}", token.literal),
        };
        TdtpError::Query(format!(
            "parse error at byte {}: expected {what}, got {got}",
            token.offset
        ))
    }

    fn select_stmt(&mut self) -> Result<SelectStatement, TdtpError> {
        self.expect(TokenKind::Select, "SELECT")?;
        self.expect(TokenKind::Star, "'*'")?;
        self.expect(TokenKind::From, "FROM")?;
        let table = self.expect(TokenKind::Ident, "table name")?.literal;
        let mut stmt = SelectStatement::new(table);

        if self.accept(TokenKind::Where) {
            stmt.where_expr = Some(self.expr()?);
        }
        if self.accept(TokenKind::Order) {
            self.expect(TokenKind::By, "BY")?;
            loop {
                stmt.order_by.push(self.order()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
        }
        if self.accept(TokenKind::Limit) {
            stmt.limit = Some(self.integer("LIMIT count")?);
        }
        if self.accept(TokenKind::Offset) {
            stmt.offset = Some(self.integer("OFFSET count")?);
        }
        Ok(stmt)
    }

    fn order(&mut self) -> Result<OrderBy, TdtpError> {
        let field = self.expect(TokenKind::Ident, "sort field")?.literal;
        let direction = if self.accept(TokenKind::Desc) {
            SortDirection::Desc
        } else {
            self.accept(TokenKind::Asc);
            SortDirection::Asc
        };
        Ok(OrderBy { field, direction })
    }

    fn integer(&mut self, what: &str) -> Result<u64, TdtpError> {
        let token = self.expect(TokenKind::Number, what)?;
        token.literal.parse::<u64>().map_err(|_| {
            TdtpError::Query(format!(
                "parse error at byte {}: {what} must be a non-negative integer, got {}",
                token.offset, token.literal
            ))
        })
    }

    fn expr(&mut self) -> Result<Expr, TdtpError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, TdtpError> {
        let mut children = vec![self.and_expr()?];
        while self.accept(TokenKind::Or) {
            children.push(self.and_expr()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::Or(children)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, TdtpError> {
        let mut children = vec![self.unary()?];
        while self.accept(TokenKind::And) {
            children.push(self.unary()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::And(children)
        })
    }

    fn unary(&mut self) -> Result<Expr, TdtpError> {
        if self.accept(TokenKind::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.accept(TokenKind::LParen) {
            let inner = self.expr()?;
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, TdtpError> {
        let field = self.expect(TokenKind::Ident, "field name")?.literal;
        let negated = self.accept(TokenKind::Not);
        let token = self.next();

        let filter = match token.kind {
            TokenKind::In => {
                self.expect(TokenKind::LParen, "'('")?;
                let mut values = vec![self.value("IN value")?];
                while self.accept(TokenKind::Comma) {
                    values.push(self.value("IN value")?);
                }
                self.expect(TokenKind::RParen, "')'")?;
                Filter {
                    field,
                    op: if negated { CompareOp::NotIn } else { CompareOp::In },
                    value: None,
                    value2: None,
                    values,
                }
            }
            TokenKind::Between => {
                let low = self.value("BETWEEN lower bound")?;
                self.expect(TokenKind::And, "AND")?;
                let high = self.value("BETWEEN upper bound")?;
                let filter = Filter {
                    field,
                    op: CompareOp::Between,
                    value: Some(low),
                    value2: Some(high),
                    values: Vec::new(),
                };
                return Ok(if negated {
                    Expr::Not(Box::new(Expr::Filter(filter)))
                } else {
                    Expr::Filter(filter)
                });
            }
            TokenKind::Like => {
                let pattern = self.expect(TokenKind::Str, "LIKE pattern string")?.literal;
                Filter::binary(
                    field,
                    if negated { CompareOp::NotLike } else { CompareOp::Like },
                    pattern,
                )
            }
            TokenKind::Is => {
                if negated {
                    return Err(self.unexpected(&token, "IN, BETWEEN or LIKE after NOT"));
                }
                let not_null = self.accept(TokenKind::Not);
                self.expect(TokenKind::Null, "NULL")?;
                Filter::unary(
                    field,
                    if not_null { CompareOp::IsNotNull } else { CompareOp::IsNull },
                )
            }
            kind if !negated => {
                let op = match kind {
                    TokenKind::Eq => CompareOp::Eq,
                    TokenKind::Ne => CompareOp::Ne,
                    TokenKind::Gt => CompareOp::Gt,
                    TokenKind::Gte => CompareOp::Gte,
                    TokenKind::Lt => CompareOp::Lt,
                    TokenKind::Lte => CompareOp::Lte,
                    _ => return Err(self.unexpected(&token, "comparison operator")),
                };
                Filter::binary(field, op, self.value("comparison value")?)
            }
            _ => return Err(self.unexpected(&token, "IN, BETWEEN or LIKE after NOT")),
        };
        Ok(Expr::Filter(filter))
    }

    fn value(&mut self, what: &str) -> Result<String, TdtpError> {
        let token = self.next();
        match token.kind {
            TokenKind::Number | TokenKind::Str => Ok(token.literal),
            _ => Err(self.unexpected(&token, what)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_select() {
        let stmt = parse("SELECT * FROM users").unwrap();
        assert_eq!(stmt.table, "users");
        assert!(stmt.where_expr.is_none());
        assert!(stmt.order_by.is_empty());
    }

    #[test]
    fn filters_ordering_pagination() {
        let stmt =
            parse("select * from Users where age > 30 order by name desc, id limit 10 offset 5")
                .unwrap();
        assert_eq!(stmt.table, "Users");
        assert_eq!(
            stmt.where_expr,
            Some(Expr::Filter(Filter::binary("age", CompareOp::Gt, "30")))
        );
        assert_eq!(stmt.order_by.len(), 2);
        assert_eq!(stmt.order_by[0].direction, SortDirection::Desc);
        assert_eq!(stmt.order_by[1].direction, SortDirection::Asc);
        assert_eq!(stmt.limit, Some(10));
        assert_eq!(stmt.offset, Some(5));
    }

    #[test]
    fn precedence_not_over_and_over_or() {
        let stmt = parse("SELECT * FROM t WHERE a = 1 OR b = 2 AND NOT c = 3").unwrap();
        let Expr::Or(children) = stmt.where_expr.unwrap() else {
            panic!("expected OR at the top");
        };
        assert_eq!(children.len(), 2);
        let Expr::And(and_children) = &children[1] else {
            panic!("expected AND under OR");
        };
        assert!(matches!(and_children[1], Expr::Not(_)));
    }

    #[test]
    fn grouping_parentheses() {
        let stmt = parse("SELECT * FROM t WHERE (a = 1 OR b = 2) AND c = 3").unwrap();
        let Expr::And(children) = stmt.where_expr.unwrap() else {
            panic!("expected AND at the top");
        };
        assert!(matches!(children[0], Expr::Or(_)));
    }

    #[test]
    fn predicate_forms() {
        let stmt = parse(
            "SELECT * FROM t WHERE a IN (1, 2, 3) AND b NOT IN ('x') AND c BETWEEN 1 AND 9 \
             AND d IS NULL AND e IS NOT NULL AND f LIKE 'pre%' AND g NOT LIKE '%suf'",
        )
        .unwrap();
        let Expr::And(children) = stmt.where_expr.unwrap() else {
            panic!("expected AND group");
        };
        let ops: Vec<CompareOp> = children
            .iter()
            .map(|c| match c {
                Expr::Filter(f) => f.op,
                _ => panic!("expected filters"),
            })
            .collect();
        assert_eq!(
            ops,
            vec![
                CompareOp::In,
                CompareOp::NotIn,
                CompareOp::Between,
                CompareOp::IsNull,
                CompareOp::IsNotNull,
                CompareOp::Like,
                CompareOp::NotLike,
            ]
        );
    }

    #[test]
    fn not_between_wraps_in_not() {
        let stmt = parse("SELECT * FROM t WHERE a NOT BETWEEN 1 AND 5").unwrap();
        assert!(matches!(stmt.where_expr, Some(Expr::Not(_))));
    }

    #[test]
    fn errors_carry_byte_offsets() {
        let err = parse("SELECT * FROM t WHERE age >").unwrap_err();
        assert!(err.to_string().contains("byte 27"), "{err}");

        let err = parse("SELECT * FROM t WHERE age # 1").unwrap_err();
        assert!(err.to_string().contains("illegal"), "{err}");
        assert!(err.to_string().contains("byte 26"), "{err}");
    }

    #[test]
    fn raw_text_is_preserved() {
        let text = "SELECT * FROM users WHERE age > 30";
        assert_eq!(parse(text).unwrap().raw, text);
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse("SELECT * FROM t WHERE a = 1 garbage").is_err());
    }
}
