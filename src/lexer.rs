//! Tokenizer for the source language.
//!
//! The [`Lexer`] is stateful: every call to [`Lexer::next_token`] consumes one token
//! from the front of the remaining input, and [`Lexer::peek_token`] gives the
//! compiler its one-token lookahead. Individual token shapes are recognised with
//! small `nom` parsers; the lexer itself only decides what a failed recognition
//! means.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace1, not_line_ending, satisfy},
    combinator::{map, not, recognize, value},
    multi::many0_count,
    sequence::{delimited, pair, terminated},
};
use std::fmt;

use crate::value::NumberType;
use crate::{Error, LexError, Span};

/// Reserved words. `and` and `or` are not keywords; the compiler recognises them
/// by name in operator position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    If,
    Let,
    Letrec,
    Lambda,
    Begin,
    Car,
    Cdr,
    Cons,
    Consp,
    Define,
    DefineMacro,
    Null,
    Quote,
}

impl Keyword {
    pub fn from_name(name: &str) -> Option<Keyword> {
        Some(match name {
            "if" => Keyword::If,
            "let" => Keyword::Let,
            "letrec" => Keyword::Letrec,
            "lambda" => Keyword::Lambda,
            "begin" => Keyword::Begin,
            "car" => Keyword::Car,
            "cdr" => Keyword::Cdr,
            "cons" => Keyword::Cons,
            "consp" => Keyword::Consp,
            "define" => Keyword::Define,
            "define-macro" => Keyword::DefineMacro,
            "null" => Keyword::Null,
            "quote" => Keyword::Quote,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Keyword::If => "if",
            Keyword::Let => "let",
            Keyword::Letrec => "letrec",
            Keyword::Lambda => "lambda",
            Keyword::Begin => "begin",
            Keyword::Car => "car",
            Keyword::Cdr => "cdr",
            Keyword::Cons => "cons",
            Keyword::Consp => "consp",
            Keyword::Define => "define",
            Keyword::DefineMacro => "define-macro",
            Keyword::Null => "null",
            Keyword::Quote => "quote",
        }
    }
}

/// Single- and double-character operator symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(NumberType),
    Identifier(String),
    String(String),
    Boolean(bool),
    Keyword(Keyword),
    Operator(Operator),
    LeftParen,
    RightParen,
    /// `'`
    Quote,
    /// `` ` ``
    Backquote,
    /// `,`
    Comma,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Identifier(name) => write!(f, "identifier '{name}'"),
            TokenKind::String(s) => write!(f, "string \"{s}\""),
            TokenKind::Boolean(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            TokenKind::Keyword(k) => write!(f, "keyword '{}'", k.name()),
            TokenKind::Operator(o) => write!(f, "operator '{}'", o.symbol()),
            TokenKind::LeftParen => write!(f, "'('"),
            TokenKind::RightParen => write!(f, "')'"),
            TokenKind::Quote => write!(f, "'''"),
            TokenKind::Backquote => write!(f, "'`'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Raw recognition result, before keyword lookup and number conversion
#[derive(Debug, Clone)]
enum Lexeme<'a> {
    Digits(&'a str),
    Word(&'a str),
    Text(&'a str),
    Fixed(TokenKind),
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '?' | '!' | '*')
}

/// Whitespace, plus `;` line comments when enabled
fn trivia(input: &str, handle_comments: bool) -> &str {
    let result: IResult<&str, usize> = if handle_comments {
        many0_count(alt((
            multispace1,
            recognize(pair(char(';'), not_line_ending)),
        )))
        .parse(input)
    } else {
        many0_count(multispace1).parse(input)
    };
    match result {
        Ok((rest, _)) => rest,
        Err(_) => input,
    }
}

fn word(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        take_while(is_identifier_char),
    ))
    .parse(input)
}

fn generated_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(char('!'), take_while1(is_identifier_char))).parse(input)
}

/// String literal without escape processing
fn string_literal(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c| c != '"'), char('"')).parse(input)
}

fn boolean(input: &str) -> IResult<&str, bool> {
    terminated(
        alt((value(true, tag("#t")), value(false, tag("#f")))),
        not(satisfy(is_identifier_char)),
    )
    .parse(input)
}

fn punctuation(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::LeftParen, char('(')),
        value(TokenKind::RightParen, char(')')),
        value(TokenKind::Quote, char('\'')),
        value(TokenKind::Backquote, char('`')),
        value(TokenKind::Comma, char(',')),
        value(TokenKind::Operator(Operator::Le), tag("<=")),
        value(TokenKind::Operator(Operator::Ge), tag(">=")),
        value(TokenKind::Operator(Operator::Ne), tag("!=")),
        value(TokenKind::Operator(Operator::Lt), char('<')),
        value(TokenKind::Operator(Operator::Gt), char('>')),
        value(TokenKind::Operator(Operator::Eq), char('=')),
        value(TokenKind::Operator(Operator::Add), char('+')),
        value(TokenKind::Operator(Operator::Sub), char('-')),
        value(TokenKind::Operator(Operator::Mul), char('*')),
        value(TokenKind::Operator(Operator::Div), char('/')),
    ))
    .parse(input)
}

fn lexeme(input: &str, allow_generated: bool) -> IResult<&str, Lexeme<'_>> {
    let result = alt((
        map(digit1, Lexeme::Digits),
        map(word, Lexeme::Word),
        map(string_literal, Lexeme::Text),
        map(boolean, |b| Lexeme::Fixed(TokenKind::Boolean(b))),
        map(punctuation, Lexeme::Fixed),
    ))
    .parse(input);

    match result {
        Err(nom::Err::Error(_)) if allow_generated => {
            map(generated_identifier, Lexeme::Word).parse(input)
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct Lexer<'a> {
    source: &'a str,
    rest: &'a str,
    handle_comments: bool,
    allow_generated_identifiers: bool,
    peeked: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            rest: source,
            handle_comments: true,
            allow_generated_identifiers: false,
            peeked: None,
        }
    }

    /// Skip `;` line comments along with whitespace (on by default)
    pub fn handle_comments(mut self, enabled: bool) -> Self {
        self.handle_comments = enabled;
        self
    }

    /// Accept identifiers starting with `!`, which only machine-generated names use
    pub fn allow_generated_identifiers(mut self, enabled: bool) -> Self {
        self.allow_generated_identifiers = enabled;
        self
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    /// Byte offset of the first unconsumed character
    pub fn offset(&self) -> usize {
        match &self.peeked {
            Some(token) => token.span.start,
            None => self.source.len() - self.rest.len(),
        }
    }

    /// Consume and return the next token. Returns [`TokenKind::Eof`] once the input
    /// is exhausted, however often it is called.
    pub fn next_token(&mut self) -> Result<Token, Error> {
        match self.peeked.take() {
            Some(token) => Ok(token),
            None => self.scan(),
        }
    }

    /// Look at the next token without consuming it
    pub fn peek_token(&mut self) -> Result<&Token, Error> {
        let token = match self.peeked.take() {
            Some(token) => token,
            None => self.scan()?,
        };
        Ok(self.peeked.insert(token))
    }

    /// Every remaining token, ending with [`TokenKind::Eof`]
    pub fn tokenize(&mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn position(&self) -> usize {
        self.source.len() - self.rest.len()
    }

    fn scan(&mut self) -> Result<Token, Error> {
        self.rest = trivia(self.rest, self.handle_comments);
        let start = self.position();

        if self.rest.is_empty() {
            return Ok(Token {
                kind: TokenKind::Eof,
                span: Span::new(start, start),
            });
        }

        let (rest, lexeme) = match lexeme(self.rest, self.allow_generated_identifiers) {
            Ok(result) => result,
            Err(_) => return Err(self.diagnose(start).into()),
        };

        let kind = match lexeme {
            Lexeme::Digits(digits) => match digits.parse::<NumberType>() {
                Ok(n) => TokenKind::Number(n),
                Err(_) => {
                    return Err(LexError::NumberOverflow {
                        text: digits.to_owned(),
                        offset: start,
                    }
                    .into());
                }
            },
            Lexeme::Word(name) => match Keyword::from_name(name) {
                Some(keyword) => TokenKind::Keyword(keyword),
                None => TokenKind::Identifier(name.to_owned()),
            },
            Lexeme::Text(text) => TokenKind::String(text.to_owned()),
            Lexeme::Fixed(kind) => kind,
        };

        self.rest = rest;
        Ok(Token {
            kind,
            span: Span::new(start, self.position()),
        })
    }

    /// Explain why no token could be recognised at `offset`
    fn diagnose(&self, offset: usize) -> LexError {
        match self.rest.chars().next() {
            Some('"') => LexError::UnterminatedString { offset },
            Some('#') => LexError::InvalidHash { offset },
            Some(found) => LexError::UnexpectedChar { found, offset },
            // scan() returns Eof before getting here
            None => LexError::UnexpectedChar {
                found: '\0',
                offset,
            },
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[derive(Debug)]
    enum LexTestResult {
        Tokens(Vec<TokenKind>),   // Lexing should succeed with these kinds (Eof implied)
        SpecificError(&'static str), // Lexing should fail with error containing this string
    }
    use LexTestResult::*;

    fn ident(name: &str) -> TokenKind {
        TokenKind::Identifier(name.to_owned())
    }

    fn kw(keyword: Keyword) -> TokenKind {
        TokenKind::Keyword(keyword)
    }

    fn oper(operator: Operator) -> TokenKind {
        TokenKind::Operator(operator)
    }

    fn run_lex_tests(test_cases: Vec<(&str, LexTestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let test_id = format!("Lex test #{} ({input:?})", i + 1);
            let result = Lexer::new(input).tokenize();

            match (result, expected) {
                (Ok(tokens), Tokens(kinds)) => {
                    let mut expected_kinds = kinds.clone();
                    expected_kinds.push(TokenKind::Eof);
                    let actual: Vec<TokenKind> = tokens.into_iter().map(|t| t.kind).collect();
                    assert_eq!(actual, expected_kinds, "{test_id}: token mismatch");
                }
                (Err(err), SpecificError(text)) => {
                    let msg = format!("{err}");
                    assert!(msg.contains(text), "{test_id}: error '{msg}' should contain '{text}'");
                }
                (Ok(tokens), SpecificError(text)) => {
                    panic!("{test_id}: expected error containing '{text}', got {tokens:?}");
                }
                (Err(err), Tokens(_)) => panic!("{test_id}: unexpected error {err}"),
            }
        }
    }

    #[test]
    fn test_lexer_comprehensive() {
        let test_cases = vec![
            // ===== NUMBERS =====
            ("42", Tokens(vec![TokenKind::Number(42)])),
            ("0", Tokens(vec![TokenKind::Number(0)])),
            ("007", Tokens(vec![TokenKind::Number(7)])),
            ("9223372036854775807", Tokens(vec![TokenKind::Number(i64::MAX)])),
            ("9223372036854775808", SpecificError("does not fit")),
            // Greedy digits, then whatever follows
            ("12ab", Tokens(vec![TokenKind::Number(12), ident("ab")])),
            // A leading minus is an operator, not a sign
            ("-5", Tokens(vec![oper(Operator::Sub), TokenKind::Number(5)])),
            // ===== IDENTIFIERS AND KEYWORDS =====
            ("foo", Tokens(vec![ident("foo")])),
            ("fact-iter", Tokens(vec![ident("fact-iter")])),
            ("null? x_1 set! a*b", Tokens(vec![
                ident("null?"),
                ident("x_1"),
                ident("set!"),
                ident("a*b"),
            ])),
            ("and or", Tokens(vec![ident("and"), ident("or")])),
            ("if let letrec lambda begin", Tokens(vec![
                kw(Keyword::If),
                kw(Keyword::Let),
                kw(Keyword::Letrec),
                kw(Keyword::Lambda),
                kw(Keyword::Begin),
            ])),
            ("car cdr cons consp null", Tokens(vec![
                kw(Keyword::Car),
                kw(Keyword::Cdr),
                kw(Keyword::Cons),
                kw(Keyword::Consp),
                kw(Keyword::Null),
            ])),
            ("define define-macro quote", Tokens(vec![
                kw(Keyword::Define),
                kw(Keyword::DefineMacro),
                kw(Keyword::Quote),
            ])),
            // Keywords only match whole words
            ("iffy lets", Tokens(vec![ident("iffy"), ident("lets")])),
            // ===== STRINGS =====
            ("\"hello world\"", Tokens(vec![TokenKind::String("hello world".to_owned())])),
            ("\"\"", Tokens(vec![TokenKind::String(String::new())])),
            // No escape processing
            (r#""a\nb""#, Tokens(vec![TokenKind::String("a\\nb".to_owned())])),
            ("\"open", SpecificError("unterminated string")),
            // ===== BOOLEANS =====
            ("#t #f", Tokens(vec![TokenKind::Boolean(true), TokenKind::Boolean(false)])),
            ("(#t)", Tokens(vec![
                TokenKind::LeftParen,
                TokenKind::Boolean(true),
                TokenKind::RightParen,
            ])),
            ("#true", SpecificError("invalid '#' literal")),
            ("#x1", SpecificError("invalid '#' literal")),
            // ===== PUNCTUATION =====
            ("()'`,", Tokens(vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::Quote,
                TokenKind::Backquote,
                TokenKind::Comma,
            ])),
            ("+ - * / = != < <= > >=", Tokens(vec![
                oper(Operator::Add),
                oper(Operator::Sub),
                oper(Operator::Mul),
                oper(Operator::Div),
                oper(Operator::Eq),
                oper(Operator::Ne),
                oper(Operator::Lt),
                oper(Operator::Le),
                oper(Operator::Gt),
                oper(Operator::Ge),
            ])),
            ("<=>", Tokens(vec![oper(Operator::Le), oper(Operator::Gt)])),
            // ===== WHITESPACE AND COMMENTS =====
            ("", Tokens(vec![])),
            ("  \t\n ", Tokens(vec![])),
            ("( +\n1\t2 )", Tokens(vec![
                TokenKind::LeftParen,
                oper(Operator::Add),
                TokenKind::Number(1),
                TokenKind::Number(2),
                TokenKind::RightParen,
            ])),
            ("; comment\n42 ; trailing", Tokens(vec![TokenKind::Number(42)])),
            // ===== UNRECOGNISED CHARACTERS =====
            ("@", SpecificError("unrecognized character '@' at offset 0")),
            ("(a [b])", SpecificError("unrecognized character '['")),
            ("!foo", SpecificError("unrecognized character '!'")),
            ("x . y", SpecificError("unrecognized character '.'")),
        ];

        run_lex_tests(test_cases);
    }

    #[test]
    fn test_generated_identifiers_need_opt_in() {
        let tokens = Lexer::new("(!g1 != x)")
            .allow_generated_identifiers(true)
            .tokenize()
            .unwrap();
        let kinds: Vec<TokenKind> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LeftParen,
                ident("!g1"),
                oper(Operator::Ne),
                ident("x"),
                TokenKind::RightParen,
                TokenKind::Eof,
            ]
        );

        assert!(Lexer::new("!g1").tokenize().is_err());
        // A lone bang is never a token
        assert!(
            Lexer::new("! x")
                .allow_generated_identifiers(true)
                .tokenize()
                .is_err()
        );
    }

    #[test]
    fn test_comments_can_be_disabled() {
        let err = Lexer::new("; note\n1").handle_comments(false).tokenize();
        assert!(matches!(
            err,
            Err(Error::Lex(LexError::UnexpectedChar { found: ';', offset: 0 }))
        ));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut lexer = Lexer::new("(foo 1)");
        assert_eq!(lexer.peek_token().unwrap().kind, TokenKind::LeftParen);
        assert_eq!(lexer.peek_token().unwrap().kind, TokenKind::LeftParen);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::LeftParen);
        assert_eq!(lexer.next_token().unwrap().kind, ident("foo"));
        assert_eq!(lexer.offset(), 4);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Number(1));
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::RightParen);
        // Exhausted input keeps producing Eof
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_token_spans() {
        let tokens = Lexer::new("  (letrec \"ab\")").tokenize().unwrap();
        let spans: Vec<Span> = tokens.iter().map(|t| t.span).collect();
        assert_eq!(
            spans,
            vec![
                Span::new(2, 3),
                Span::new(3, 9),
                Span::new(10, 14),
                Span::new(14, 15),
                Span::new(15, 15),
            ]
        );
    }
}
