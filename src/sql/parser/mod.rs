//! SQL parser: hand-written recursive descent over the token stream.
//!
//! The parser never fails the whole input. Each malformed region is
//! recorded as a `ParseError` (message, offending token, byte position),
//! a `Statement::Error` sentinel takes its place, and parsing resumes at
//! the next statement terminator or statement keyword. Inside a SELECT,
//! recovery is finer-grained: a bad clause resynchronizes at the next
//! clause keyword from a fixed resync set.

mod expr;

use crate::sql::ast::*;
use crate::sql::lexer::{tokenize, Token};
use crate::storage::EngineKind;
use crate::types::DataType;

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub token: Option<Token>,
    pub position: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.token {
            Some(token) => write!(f, "{} at byte {} (near {:?})", self.message, self.position, token),
            None => write!(f, "{} at byte {}", self.message, self.position),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub statements: Vec<Statement>,
    pub errors: Vec<ParseError>,
}

impl ParseOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// The single statement of a clean one-statement input.
    pub fn into_single(mut self) -> Result<Statement, ParseError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        match self.statements.len() {
            1 => Ok(self.statements.remove(0)),
            n => Err(ParseError {
                message: format!("expected one statement, found {n}"),
                token: None,
                position: 0,
            }),
        }
    }
}

/// Tokens that begin a statement; resynchronization stops at them.
const STATEMENT_START: &[Token] = &[
    Token::Create,
    Token::Drop,
    Token::Alter,
    Token::Insert,
    Token::Select,
    Token::Update,
    Token::Delete,
    Token::Vacuum,
    Token::Pragma,
    Token::Begin,
    Token::Commit,
    Token::Rollback,
];

/// Clause keywords a broken SELECT clause can resynchronize at.
pub(crate) const CLAUSE_RESYNC: &[Token] = &[
    Token::From,
    Token::Where,
    Token::Group,
    Token::Having,
    Token::Order,
    Token::Limit,
    Token::Offset,
    Token::Semicolon,
];

/// Parse a SQL script. Always returns an outcome; malformed regions
/// surface in `errors` with sentinel statements in their place.
pub fn parse_sql(input: &str) -> ParseOutcome {
    let (tokens, lex_error) = tokenize(input);
    let mut parser = Parser::new(tokens);
    let mut outcome = ParseOutcome::default();

    while parser.peek().is_some() {
        while parser.eat(&Token::Semicolon) {}
        if parser.peek().is_none() {
            break;
        }
        match parser.parse_statement() {
            Ok(statement) => {
                outcome.statements.push(statement);
                // A statement must end at `;` or EOF; anything else is
                // trailing garbage.
                if parser.peek().is_some() && !parser.check(&Token::Semicolon) {
                    outcome.errors.push(parser.error_here("unexpected trailing tokens"));
                    parser.resync_statement();
                }
            }
            Err(error) => {
                outcome.errors.push(error);
                outcome.statements.push(Statement::Error);
                parser.resync_statement();
            }
        }
        outcome.errors.append(&mut parser.clause_errors);
    }

    if let Some(lex) = lex_error {
        outcome.errors.push(ParseError {
            message: lex.message,
            token: None,
            position: lex.position,
        });
        if outcome.statements.is_empty() {
            outcome.statements.push(Statement::Error);
        }
    }
    outcome
}

pub(crate) struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    pub(crate) param_counter: usize,
    /// Errors recovered inside SELECT clauses.
    pub(crate) clause_errors: Vec<ParseError>,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Parser { tokens, pos: 0, param_counter: 0, clause_errors: Vec::new() }
    }

    pub(crate) fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    pub(crate) fn peek_second(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|(t, _)| t)
    }

    pub(crate) fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    pub(crate) fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume `token` if it is next.
    pub(crate) fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, p)| *p)
            .unwrap_or(0)
    }

    pub(crate) fn error_here(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            token: self.peek().cloned(),
            position: self.position(),
        }
    }

    pub(crate) fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error_here(&format!("expected {token:?}")))
        }
    }

    /// Identifier, also accepting keywords that double as names.
    pub(crate) fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let Some(Token::Ident(name)) = self.advance() else { unreachable!() };
                Ok(name)
            }
            Some(Token::Key) => {
                self.advance();
                Ok("key".to_string())
            }
            Some(Token::Storage) => {
                self.advance();
                Ok("storage".to_string())
            }
            Some(Token::Count) => {
                self.advance();
                Ok("count".to_string())
            }
            _ => Err(self.error_here("expected identifier")),
        }
    }

    /// Skip to the next statement boundary.
    fn resync_statement(&mut self) {
        while let Some(token) = self.peek() {
            if token == &Token::Semicolon {
                self.pos += 1;
                return;
            }
            if STATEMENT_START.contains(token) {
                return;
            }
            self.pos += 1;
        }
    }

    /// Skip to the next clause keyword (or statement boundary) within a
    /// SELECT.
    pub(crate) fn resync_clause(&mut self) {
        while let Some(token) = self.peek() {
            if CLAUSE_RESYNC.contains(token) || STATEMENT_START.contains(token) {
                return;
            }
            self.pos += 1;
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek() {
            Some(Token::Create) => self.parse_create(),
            Some(Token::Drop) => self.parse_drop(),
            Some(Token::Alter) => self.parse_alter(),
            Some(Token::Insert) => Ok(Statement::Insert(self.parse_insert()?)),
            Some(Token::Select) => {
                // Clause-level recovery: a bad clause lands in
                // `clause_errors` and the SELECT is still returned.
                let select = self.parse_select(true)?;
                Ok(Statement::Select(Box::new(select)))
            }
            Some(Token::Update) => Ok(Statement::Update(self.parse_update()?)),
            Some(Token::Delete) => Ok(Statement::Delete(self.parse_delete()?)),
            Some(Token::Vacuum) => self.parse_vacuum(),
            Some(Token::Pragma) => self.parse_pragma(),
            Some(Token::Begin) => {
                self.advance();
                Ok(Statement::Begin)
            }
            Some(Token::Commit) => {
                self.advance();
                Ok(Statement::Commit)
            }
            Some(Token::Rollback) => {
                self.advance();
                Ok(Statement::Rollback)
            }
            _ => Err(self.error_here("expected a statement")),
        }
    }

    fn parse_if_exists(&mut self) -> Result<bool, ParseError> {
        if self.eat(&Token::If) {
            self.expect(&Token::Exists)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_if_not_exists(&mut self) -> Result<bool, ParseError> {
        if self.eat(&Token::If) {
            self.expect(&Token::Not)?;
            self.expect(&Token::Exists)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_create(&mut self) -> Result<Statement, ParseError> {
        self.advance(); // CREATE
        match self.peek() {
            Some(Token::Table) => {
                self.advance();
                let if_not_exists = self.parse_if_not_exists()?;
                let mut create = self.parse_create_table()?;
                create.if_not_exists = if_not_exists;
                Ok(Statement::CreateTable(create))
            }
            Some(Token::Unique) => {
                self.advance();
                self.expect(&Token::Index)?;
                Ok(Statement::CreateIndex(self.parse_create_index(true)?))
            }
            Some(Token::Index) => {
                self.advance();
                Ok(Statement::CreateIndex(self.parse_create_index(false)?))
            }
            _ => Err(self.error_here("expected TABLE or INDEX after CREATE")),
        }
    }

    fn parse_create_table(&mut self) -> Result<CreateTable, ParseError> {
        let table_name = self.expect_ident()?;
        self.expect(&Token::LParen)?;

        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_column_spec()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;

        let storage = if self.eat(&Token::Storage) {
            self.expect(&Token::Eq)?;
            let name = self.expect_ident()?;
            Some(
                EngineKind::parse(&name)
                    .map_err(|_| self.error_here(&format!("unknown storage engine {name}")))?,
            )
        } else {
            None
        };

        Ok(CreateTable { table_name, columns, storage, if_not_exists: false })
    }

    fn parse_column_spec(&mut self) -> Result<ColumnSpec, ParseError> {
        let name = self.expect_ident()?;
        let data_type = self.parse_data_type()?;

        let mut spec = ColumnSpec {
            name,
            data_type,
            is_primary_key: false,
            auto: false,
            is_unique: false,
            not_null: false,
        };
        loop {
            match self.peek() {
                Some(Token::Primary) => {
                    self.advance();
                    self.expect(&Token::Key)?;
                    spec.is_primary_key = true;
                    spec.not_null = true;
                }
                Some(Token::Auto) => {
                    self.advance();
                    spec.auto = true;
                }
                Some(Token::Unique) => {
                    self.advance();
                    spec.is_unique = true;
                }
                Some(Token::Not) => {
                    self.advance();
                    self.expect(&Token::Null)?;
                    spec.not_null = true;
                }
                _ => break,
            }
        }
        Ok(spec)
    }

    pub(crate) fn parse_data_type(&mut self) -> Result<DataType, ParseError> {
        let data_type = match self.peek() {
            Some(Token::IntegerType) | Some(Token::LongType) => DataType::Integer,
            Some(Token::RealType) => DataType::Real,
            Some(Token::DecimalType) => DataType::Decimal,
            Some(Token::TextType) => DataType::Text,
            Some(Token::BooleanType) => DataType::Boolean,
            Some(Token::DateTimeType) => DataType::DateTime,
            Some(Token::BlobType) => DataType::Blob,
            Some(Token::UlidType) => DataType::Ulid,
            Some(Token::GuidType) => DataType::Guid,
            _ => return Err(self.error_here("expected a column type")),
        };
        self.advance();
        // Optional ignored length, e.g. TEXT(255).
        if self.eat(&Token::LParen) {
            while !self.check(&Token::RParen) && self.peek().is_some() {
                self.advance();
            }
            self.expect(&Token::RParen)?;
        }
        Ok(data_type)
    }

    fn parse_create_index(&mut self, is_unique: bool) -> Result<CreateIndex, ParseError> {
        let if_not_exists = self.parse_if_not_exists()?;
        let index_name = self.expect_ident()?;
        self.expect(&Token::On)?;
        let table_name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let column_name = self.expect_ident()?;
        self.expect(&Token::RParen)?;
        Ok(CreateIndex { index_name, table_name, column_name, is_unique, if_not_exists })
    }

    fn parse_drop(&mut self) -> Result<Statement, ParseError> {
        self.advance(); // DROP
        match self.peek() {
            Some(Token::Table) => {
                self.advance();
                let if_exists = self.parse_if_exists()?;
                let table_name = self.expect_ident()?;
                Ok(Statement::DropTable(DropTable { table_name, if_exists }))
            }
            Some(Token::Index) => {
                self.advance();
                let if_exists = self.parse_if_exists()?;
                let index_name = self.expect_ident()?;
                Ok(Statement::DropIndex(DropIndex { index_name, if_exists }))
            }
            _ => Err(self.error_here("expected TABLE or INDEX after DROP")),
        }
    }

    fn parse_alter(&mut self) -> Result<Statement, ParseError> {
        self.advance(); // ALTER
        self.expect(&Token::Table)?;
        let table_name = self.expect_ident()?;
        self.expect(&Token::Rename)?;
        self.expect(&Token::To)?;
        let new_name = self.expect_ident()?;
        Ok(Statement::AlterTableRename(AlterTableRename { table_name, new_name }))
    }

    fn parse_insert(&mut self) -> Result<Insert, ParseError> {
        self.advance(); // INSERT
        self.expect(&Token::Into)?;
        let table_name = self.expect_ident()?;

        let columns = if self.eat(&Token::LParen) {
            let mut names = Vec::new();
            loop {
                names.push(self.expect_ident()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            Some(names)
        } else {
            None
        };

        self.expect(&Token::Values)?;
        let mut rows = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let mut values = Vec::new();
            if !self.check(&Token::RParen) {
                loop {
                    values.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen)?;
            rows.push(values);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(Insert { table_name, columns, rows })
    }

    fn parse_update(&mut self) -> Result<Update, ParseError> {
        self.advance(); // UPDATE
        let table_name = self.expect_ident()?;
        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_ident()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_expr()?;
            assignments.push((column, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        let where_clause = if self.eat(&Token::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Update { table_name, assignments, where_clause })
    }

    fn parse_delete(&mut self) -> Result<Delete, ParseError> {
        self.advance(); // DELETE
        self.expect(&Token::From)?;
        let table_name = self.expect_ident()?;
        let where_clause = if self.eat(&Token::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Delete { table_name, where_clause })
    }

    fn parse_vacuum(&mut self) -> Result<Statement, ParseError> {
        self.advance(); // VACUUM
        let table = match self.peek() {
            Some(Token::Ident(_)) => Some(self.expect_ident()?),
            _ => None,
        };
        Ok(Statement::Vacuum(table))
    }

    fn parse_pragma(&mut self) -> Result<Statement, ParseError> {
        self.advance(); // PRAGMA
        let name = self.expect_ident()?;
        let arg = if self.eat(&Token::LParen) {
            let value = match self.advance() {
                Some(Token::Ident(s)) => s,
                Some(Token::StringLit(s)) => s,
                Some(Token::Integer(n)) => n.to_string(),
                _ => return Err(self.error_here("expected a PRAGMA argument")),
            };
            self.expect(&Token::RParen)?;
            Some(value)
        } else {
            None
        };
        Ok(Statement::Pragma(Pragma { name, arg }))
    }
}

#[cfg(test)]
#[cfg(test)]
mod tests;
