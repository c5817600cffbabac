//! Expression and SELECT parsing: precedence-climbing recursive descent.

use crate::sql::ast::*;
use crate::sql::lexer::Token;
use crate::sql::parser::{ParseError, Parser};

impl Parser {
    /// Parse a SELECT. With `recovering` set, a malformed clause is
    /// recorded in `clause_errors` and parsing resumes at the next clause
    /// keyword; otherwise (subqueries) the first error propagates.
    pub(crate) fn parse_select(&mut self, recovering: bool) -> Result<Select, ParseError> {
        self.expect(&Token::Select)?;
        let distinct = self.eat(&Token::Distinct);

        let mut select = Select {
            distinct,
            columns: Vec::new(),
            from: None,
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        };

        match self.parse_select_columns() {
            Ok(columns) => select.columns = columns,
            Err(error) => self.recover_clause(recovering, error)?,
        }

        if self.eat(&Token::From) {
            match self.parse_from_and_joins() {
                Ok((from, joins)) => {
                    select.from = Some(from);
                    select.joins = joins;
                }
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        if self.eat(&Token::Where) {
            match self.parse_expr() {
                Ok(expr) => select.where_clause = Some(expr),
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        if self.eat(&Token::Group) {
            let parsed = self.expect(&Token::By).and_then(|_| self.parse_expr_list());
            match parsed {
                Ok(exprs) => select.group_by = exprs,
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        if self.eat(&Token::Having) {
            match self.parse_expr() {
                Ok(expr) => select.having = Some(expr),
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        if self.eat(&Token::Order) {
            let parsed = self.expect(&Token::By).and_then(|_| self.parse_order_by_items());
            match parsed {
                Ok(items) => select.order_by = items,
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        if self.eat(&Token::Limit) {
            match self.parse_expr() {
                Ok(expr) => select.limit = Some(expr),
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        if self.eat(&Token::Offset) {
            match self.parse_expr() {
                Ok(expr) => select.offset = Some(expr),
                Err(error) => self.recover_clause(recovering, error)?,
            }
        }

        Ok(select)
    }

    fn recover_clause(&mut self, recovering: bool, error: ParseError) -> Result<(), ParseError> {
        if recovering {
            self.clause_errors.push(error);
            self.resync_clause();
            Ok(())
        } else {
            Err(error)
        }
    }

    fn parse_select_columns(&mut self) -> Result<Vec<SelectColumn>, ParseError> {
        let mut columns = Vec::new();
        loop {
            if self.eat(&Token::Star) {
                columns.push(SelectColumn::Star);
            } else {
                let expr = self.parse_expr()?;
                let alias = self.parse_alias()?;
                columns.push(SelectColumn::Expr { expr, alias });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(columns)
    }

    /// `[AS] ident` alias, if present.
    fn parse_alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat(&Token::As) {
            return Ok(Some(self.expect_ident()?));
        }
        if matches!(self.peek(), Some(Token::Ident(_))) {
            return Ok(Some(self.expect_ident()?));
        }
        Ok(None)
    }

    fn parse_from_and_joins(&mut self) -> Result<(TableRef, Vec<Join>), ParseError> {
        let from = self.parse_table_ref()?;
        let mut joins = Vec::new();
        loop {
            let kind = match self.peek() {
                Some(Token::Join) | Some(Token::Inner) => JoinKind::Inner,
                Some(Token::Left) => JoinKind::Left,
                Some(Token::Right) => JoinKind::Right,
                Some(Token::Full) => JoinKind::Full,
                Some(Token::Cross) => JoinKind::Cross,
                _ => break,
            };
            if !self.eat(&Token::Join) {
                self.advance(); // INNER/LEFT/RIGHT/FULL/CROSS
                self.eat(&Token::Outer);
                self.expect(&Token::Join)?;
            }
            let table = self.parse_table_ref()?;
            let on = if kind == JoinKind::Cross {
                None
            } else {
                self.expect(&Token::On)?;
                Some(self.parse_expr()?)
            };
            joins.push(Join { kind, table, on });
        }
        Ok((from, joins))
    }

    fn parse_table_ref(&mut self) -> Result<TableRef, ParseError> {
        if self.eat(&Token::LParen) {
            // Derived table: subqueries in FROM require an alias.
            let select = self.parse_select(false)?;
            self.expect(&Token::RParen)?;
            self.eat(&Token::As);
            let alias = self.expect_ident()?;
            return Ok(TableRef::Subquery { select: Box::new(select), alias });
        }
        let name = self.expect_ident()?;
        let alias = self.parse_alias()?;
        Ok(TableRef::Table { name, alias })
    }

    fn parse_order_by_items(&mut self) -> Result<Vec<OrderByItem>, ParseError> {
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let descending = if self.eat(&Token::Desc) {
                true
            } else {
                self.eat(&Token::Asc);
                false
            };
            items.push(OrderByItem { expr, descending });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(items)
    }

    pub(crate) fn parse_expr_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = Vec::new();
        loop {
            exprs.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(exprs)
    }

    // --- Expressions, lowest to highest precedence ---

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary { left: Box::new(left), op: BinaryOp::Or, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::Binary { left: Box::new(left), op: BinaryOp::And, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_additive()?;

        let negated = if self.check(&Token::Not)
            && matches!(
                self.peek_second(),
                Some(Token::Between) | Some(Token::In) | Some(Token::Like)
            ) {
            self.advance();
            true
        } else {
            false
        };

        match self.peek() {
            Some(Token::Between) => {
                self.advance();
                let low = self.parse_additive()?;
                self.expect(&Token::And)?;
                let high = self.parse_additive()?;
                Ok(Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                })
            }
            Some(Token::In) => {
                self.advance();
                self.expect(&Token::LParen)?;
                if self.check(&Token::Select) {
                    let select = self.parse_select(false)?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::InSubquery {
                        expr: Box::new(left),
                        select: Box::new(select),
                        negated,
                    })
                } else {
                    let items = self.parse_expr_list()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::InList { expr: Box::new(left), items, negated })
                }
            }
            Some(Token::Like) => {
                self.advance();
                let pattern = self.parse_additive()?;
                Ok(Expr::Like { expr: Box::new(left), pattern: Box::new(pattern), negated })
            }
            Some(Token::Is) => {
                self.advance();
                let negated = self.eat(&Token::Not);
                self.expect(&Token::Null)?;
                Ok(Expr::IsNull { expr: Box::new(left), negated })
            }
            Some(Token::Eq) | Some(Token::NotEq) | Some(Token::Lt) | Some(Token::Le)
            | Some(Token::Gt) | Some(Token::Ge) => {
                let op = match self.advance() {
                    Some(Token::Eq) => BinaryOp::Eq,
                    Some(Token::NotEq) => BinaryOp::Ne,
                    Some(Token::Lt) => BinaryOp::Lt,
                    Some(Token::Le) => BinaryOp::Le,
                    Some(Token::Gt) => BinaryOp::Gt,
                    Some(Token::Ge) => BinaryOp::Ge,
                    _ => unreachable!("matched above"),
                };
                let right = self.parse_additive()?;
                Ok(Expr::Binary { left: Box::new(left), op, right: Box::new(right) })
            }
            _ => {
                if negated {
                    Err(self.error_here("expected BETWEEN, IN or LIKE after NOT"))
                } else {
                    Ok(left)
                }
            }
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            // Fold the common case of negated literals.
            return Ok(match operand {
                Expr::Literal(Literal::Integer(v)) => Expr::Literal(Literal::Integer(-v)),
                Expr::Literal(Literal::Real(v)) => Expr::Literal(Literal::Real(-v)),
                other => Expr::Unary { op: UnaryOp::Neg, operand: Box::new(other) },
            });
        }
        if self.eat(&Token::Plus) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Integer(_)) => {
                let Some(Token::Integer(v)) = self.advance() else { unreachable!() };
                Ok(Expr::Literal(Literal::Integer(v)))
            }
            Some(Token::Float(_)) => {
                let Some(Token::Float(v)) = self.advance() else { unreachable!() };
                Ok(Expr::Literal(Literal::Real(v)))
            }
            Some(Token::StringLit(_)) => {
                let Some(Token::StringLit(s)) = self.advance() else { unreachable!() };
                Ok(Expr::Literal(Literal::Text(s)))
            }
            Some(Token::BlobLit(_)) => {
                let Some(Token::BlobLit(bytes)) = self.advance() else { unreachable!() };
                Ok(Expr::Literal(Literal::Blob(bytes)))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(true)))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(false)))
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            Some(Token::Question) => {
                self.advance();
                let index = self.param_counter;
                self.param_counter += 1;
                Ok(Expr::Param(ParamRef::Positional(index)))
            }
            Some(Token::NamedParam(_)) => {
                let Some(Token::NamedParam(name)) = self.advance() else { unreachable!() };
                Ok(Expr::Param(ParamRef::Named(name)))
            }
            Some(Token::LParen) => {
                self.advance();
                if self.check(&Token::Select) {
                    let select = self.parse_select(false)?;
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Subquery(Box::new(select)));
                }
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Count) | Some(Token::Sum) | Some(Token::Avg) | Some(Token::Min)
            | Some(Token::Max) | Some(Token::GroupConcat) => self.parse_aggregate(),
            Some(Token::Ident(_)) => self.parse_ident_expr(),
            _ => Err(self.error_here("expected an expression")),
        }
    }

    fn parse_aggregate(&mut self) -> Result<Expr, ParseError> {
        let func = match self.advance() {
            Some(Token::Count) => AggFunc::Count,
            Some(Token::Sum) => AggFunc::Sum,
            Some(Token::Avg) => AggFunc::Avg,
            Some(Token::Min) => AggFunc::Min,
            Some(Token::Max) => AggFunc::Max,
            Some(Token::GroupConcat) => AggFunc::GroupConcat,
            _ => unreachable!("caller matched an aggregate keyword"),
        };
        self.expect(&Token::LParen)?;
        if func == AggFunc::Count && self.eat(&Token::Star) {
            self.expect(&Token::RParen)?;
            return Ok(Expr::Aggregate { func, arg: None, distinct: false });
        }
        let distinct = self.eat(&Token::Distinct);
        let arg = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        Ok(Expr::Aggregate { func, arg: Some(Box::new(arg)), distinct })
    }

    /// Identifier-led expression: column ref, qualified column, or
    /// scalar function call.
    fn parse_ident_expr(&mut self) -> Result<Expr, ParseError> {
        let name = self.expect_ident()?;
        if self.eat(&Token::LParen) {
            let mut args = Vec::new();
            if !self.check(&Token::RParen) {
                args = self.parse_expr_list()?;
            }
            self.expect(&Token::RParen)?;
            return Ok(Expr::Function { name: name.to_uppercase(), args });
        }
        if self.eat(&Token::Dot) {
            if self.eat(&Token::Star) {
                // `t.*` is only meaningful in a select list; surface it
                // as a column named "*" and let binding reject misuse.
                return Ok(Expr::Column { table: Some(name), name: "*".to_string() });
            }
            let column = self.expect_ident()?;
            return Ok(Expr::Column { table: Some(name), name: column });
        }
        Ok(Expr::Column { table: None, name })
    }
}
