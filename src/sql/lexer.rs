//! SQL lexer (tokenizer) using nom.
//!
//! Keywords are case-insensitive; identifiers are case-preserving.
//! String literals use single quotes with `''` as the escape. Numeric
//! literals are culture-neutral (`.` decimal separator only). `--`
//! starts a line comment. Every token carries its byte offset in the
//! input for parser error reporting.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::value,
    IResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Create,
    Table,
    Drop,
    Alter,
    Rename,
    To,
    Index,
    Unique,
    On,
    If,
    Exists,
    Not,
    Insert,
    Into,
    Values,
    Select,
    From,
    Where,
    And,
    Or,
    Null,
    Is,
    In,
    Between,
    Like,
    Join,
    Inner,
    Left,
    Right,
    Full,
    Outer,
    Cross,
    Group,
    By,
    Having,
    Order,
    Asc,
    Desc,
    Limit,
    Offset,
    Update,
    Set,
    Delete,
    Vacuum,
    Pragma,
    Begin,
    Commit,
    Rollback,
    Primary,
    Key,
    Auto,
    Storage,
    As,
    Distinct,
    True,
    False,

    // Aggregate function keywords
    Count,
    Sum,
    Avg,
    Min,
    Max,
    GroupConcat,

    // Type keywords
    IntegerType,
    LongType,
    RealType,
    DecimalType,
    TextType,
    BooleanType,
    DateTimeType,
    BlobType,
    UlidType,
    GuidType,

    // Literals
    Integer(i64),
    Float(f64),
    StringLit(String),
    /// `X'68656c6c6f'` hex blob literal.
    BlobLit(Vec<u8>),

    Ident(String),
    /// `@name` named parameter.
    NamedParam(String),
    /// `?` positional parameter.
    Question,

    // Punctuation
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Where tokenization stopped on malformed input.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub position: usize,
    pub message: String,
}

fn keyword_or_ident(word: &str) -> Token {
    match word.to_ascii_uppercase().as_str() {
        "CREATE" => Token::Create,
        "TABLE" => Token::Table,
        "DROP" => Token::Drop,
        "ALTER" => Token::Alter,
        "RENAME" => Token::Rename,
        "TO" => Token::To,
        "INDEX" => Token::Index,
        "UNIQUE" => Token::Unique,
        "ON" => Token::On,
        "IF" => Token::If,
        "EXISTS" => Token::Exists,
        "NOT" => Token::Not,
        "INSERT" => Token::Insert,
        "INTO" => Token::Into,
        "VALUES" => Token::Values,
        "SELECT" => Token::Select,
        "FROM" => Token::From,
        "WHERE" => Token::Where,
        "AND" => Token::And,
        "OR" => Token::Or,
        "NULL" => Token::Null,
        "IS" => Token::Is,
        "IN" => Token::In,
        "BETWEEN" => Token::Between,
        "LIKE" => Token::Like,
        "JOIN" => Token::Join,
        "INNER" => Token::Inner,
        "LEFT" => Token::Left,
        "RIGHT" => Token::Right,
        "FULL" => Token::Full,
        "OUTER" => Token::Outer,
        "CROSS" => Token::Cross,
        "GROUP" => Token::Group,
        "BY" => Token::By,
        "HAVING" => Token::Having,
        "ORDER" => Token::Order,
        "ASC" => Token::Asc,
        "DESC" => Token::Desc,
        "LIMIT" => Token::Limit,
        "OFFSET" => Token::Offset,
        "UPDATE" => Token::Update,
        "SET" => Token::Set,
        "DELETE" => Token::Delete,
        "VACUUM" => Token::Vacuum,
        "PRAGMA" => Token::Pragma,
        "BEGIN" => Token::Begin,
        "COMMIT" => Token::Commit,
        "ROLLBACK" => Token::Rollback,
        "PRIMARY" => Token::Primary,
        "KEY" => Token::Key,
        "AUTO" => Token::Auto,
        "STORAGE" => Token::Storage,
        "AS" => Token::As,
        "DISTINCT" => Token::Distinct,
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        "COUNT" => Token::Count,
        "SUM" => Token::Sum,
        "AVG" => Token::Avg,
        "MIN" => Token::Min,
        "MAX" => Token::Max,
        "GROUP_CONCAT" => Token::GroupConcat,
        "INTEGER" | "INT" => Token::IntegerType,
        "LONG" | "BIGINT" => Token::LongType,
        "REAL" | "DOUBLE" | "FLOAT" => Token::RealType,
        "DECIMAL" | "NUMERIC" => Token::DecimalType,
        "TEXT" | "VARCHAR" => Token::TextType,
        "BOOLEAN" | "BOOL" => Token::BooleanType,
        "DATETIME" | "TIMESTAMP" => Token::DateTimeType,
        "BLOB" => Token::BlobType,
        "ULID" => Token::UlidType,
        "GUID" | "UUID" => Token::GuidType,
        _ => Token::Ident(word.to_string()),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn lex_word(input: &str) -> IResult<&str, Token> {
    let (rest, first) = take_while1(is_ident_start)(input)?;
    let (rest, tail) = take_while(is_ident_char)(rest)?;
    let word = format!("{first}{tail}");
    Ok((rest, keyword_or_ident(&word)))
}

fn lex_named_param(input: &str) -> IResult<&str, Token> {
    let (rest, _) = char('@')(input)?;
    let (rest, name) = take_while1(is_ident_char)(rest)?;
    Ok((rest, Token::NamedParam(name.to_string())))
}

/// Number: digits with an optional `.` fraction. A trailing `.` without
/// digits belongs to the number (e.g. `1.` is 1.0).
fn lex_number(input: &str) -> IResult<&str, Token> {
    let (rest, whole) = take_while1(|c: char| c.is_ascii_digit())(input)?;
    if let Some(after_dot) = rest.strip_prefix('.') {
        let (rest2, frac) = take_while(|c: char| c.is_ascii_digit())(after_dot)?;
        let text = format!("{whole}.{frac}");
        let parsed = text.parse::<f64>().map_err(|_| {
            nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))
        })?;
        return Ok((rest2, Token::Float(parsed)));
    }
    match whole.parse::<i64>() {
        Ok(v) => Ok((rest, Token::Integer(v))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

/// Single-quoted string with `''` escape.
fn lex_string(input: &str) -> IResult<&str, Token> {
    let (mut rest, _) = char('\'')(input)?;
    let mut out = String::new();
    loop {
        match rest.find('\'') {
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )));
            }
            Some(pos) => {
                out.push_str(&rest[..pos]);
                rest = &rest[pos + 1..];
                if let Some(tail) = rest.strip_prefix('\'') {
                    out.push('\'');
                    rest = tail;
                } else {
                    return Ok((rest, Token::StringLit(out)));
                }
            }
        }
    }
}

fn lex_operator(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::NotEq, tag("<>")),
        value(Token::NotEq, tag("!=")),
        value(Token::Le, tag("<=")),
        value(Token::Ge, tag(">=")),
        value(Token::Lt, tag("<")),
        value(Token::Gt, tag(">")),
        value(Token::Eq, tag("=")),
        value(Token::LParen, tag("(")),
        value(Token::RParen, tag(")")),
        value(Token::Comma, tag(",")),
        value(Token::Semicolon, tag(";")),
        value(Token::Dot, tag(".")),
        value(Token::Star, tag("*")),
        value(Token::Plus, tag("+")),
        value(Token::Minus, tag("-")),
        value(Token::Slash, tag("/")),
        value(Token::Percent, tag("%")),
        value(Token::Question, tag("?")),
    ))(input)
}

/// `X'...'` hex blob literal.
fn lex_blob(input: &str) -> IResult<&str, Token> {
    let rest = input
        .strip_prefix('X')
        .or_else(|| input.strip_prefix('x'))
        .ok_or_else(|| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Tag)))?;
    let (rest, literal) = lex_string(rest)?;
    let Token::StringLit(hex) = literal else { unreachable!() };
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        )));
    }
    let bytes = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            u8::from_str_radix(std::str::from_utf8(pair).expect("ascii hex"), 16)
                .expect("validated hex digits")
        })
        .collect();
    Ok((rest, Token::BlobLit(bytes)))
}

fn next_token(input: &str) -> IResult<&str, Token> {
    alt((lex_blob, lex_string, lex_number, lex_named_param, lex_word, lex_operator))(input)
}

/// Tokenize `input`. Returns every token recognized before the first
/// malformed byte, plus the error if one occurred — the parser records it
/// and recovers rather than refusing the whole input.
pub fn tokenize(input: &str) -> (Vec<(Token, usize)>, Option<LexError>) {
    let total = input.len();
    let mut tokens = Vec::new();
    let mut rest = input;

    loop {
        // Skip whitespace and `--` comments.
        loop {
            let trimmed = rest.trim_start();
            if let Some(comment) = trimmed.strip_prefix("--") {
                rest = match comment.find('\n') {
                    Some(pos) => &comment[pos + 1..],
                    None => "",
                };
            } else {
                rest = trimmed;
                break;
            }
        }
        if rest.is_empty() {
            return (tokens, None);
        }

        let position = total - rest.len();
        match next_token(rest) {
            Ok((remaining, token)) => {
                tokens.push((token, position));
                rest = remaining;
            }
            Err(_) => {
                let bad = rest.chars().next().unwrap_or('?');
                return (
                    tokens,
                    Some(LexError {
                        position,
                        message: format!("unexpected character '{bad}'"),
                    }),
                );
            }
        }
    }
}
