//! Lossless reader for OpenFOAM dictionary files.
//!
//! The parser never rewrites anything: it records the byte span of every
//! keyword and value item, so edits are applied by splicing a single span back
//! into the original text. Comments, blank lines and alignment survive untouched.

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }

    pub fn text(self, src: &str) -> &str {
        &src[self.start..self.end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Number,
    Str,
    Directive,
    Punct(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// One element of an entry's value.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Token(Token),
    List { items: Vec<Item>, span: Span },
    /// A `[ ... ]` dimension set, kept as raw text.
    Dimensions { span: Span },
    Dict { entries: Vec<Entry>, span: Span },
}

impl Item {
    pub fn span(&self) -> Span {
        match self {
            Item::Token(t) => t.span,
            Item::List { span, .. } | Item::Dimensions { span } | Item::Dict { span, .. } => *span,
        }
    }

    pub fn as_number(&self, src: &str) -> Option<f64> {
        match self {
            Item::Token(Token {
                kind: TokenKind::Number,
                span,
            }) => span.text(src).parse().ok(),
            _ => None,
        }
    }

    pub fn is_word(&self, src: &str, word: &str) -> bool {
        matches!(self, Item::Token(Token { kind: TokenKind::Word, span }) if span.text(src) == word)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Dict { entries: Vec<Entry>, close: Span },
    Value { items: Vec<Item>, terminator: Span },
    Directive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub keyword: String,
    pub keyword_span: Span,
    pub body: Body,
    pub span: Span,
}

impl Entry {
    pub fn entries(&self) -> Option<&[Entry]> {
        match &self.body {
            Body::Dict { entries, .. } => Some(entries),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[Item]> {
        match &self.body {
            Body::Value { items, .. } => Some(items),
            _ => None,
        }
    }
}

/// A parsed dictionary borrowing its source text.
#[derive(Debug, Clone)]
pub struct Dictionary<'a> {
    pub src: &'a str,
    pub entries: Vec<Entry>,
}

impl<'a> Dictionary<'a> {
    pub fn parse(src: &'a str) -> Result<Self, CodecError> {
        let tokens = Lexer::new(src).tokenize()?;
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
        };
        let (entries, _) = parser.entries(None)?;
        if !entries.iter().any(|e| !matches!(e.body, Body::Directive)) {
            return Err(CodecError::Parse {
                line: 1,
                message: "no dictionary entries found".into(),
            });
        }
        Ok(Self { src, entries })
    }

    /// Entries reached by following `path` through nested dictionaries.
    pub fn find_path(&self, path: &[&str]) -> Vec<&Entry> {
        let mut found = Vec::new();
        collect_path(&self.entries, path, &mut found);
        found
    }

    /// Every entry named `keyword`, at any depth, including dictionaries nested in lists.
    pub fn find_anywhere(&self, keyword: &str) -> Vec<&Entry> {
        let mut found = Vec::new();
        collect_anywhere(&self.entries, keyword, &mut found);
        found
    }

    pub fn line_of(&self, offset: usize) -> usize {
        line_of(self.src, offset)
    }
}

/// An `#include "file"` line, active or commented out with `//`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeLine {
    pub target: String,
    /// The `//` plus any blanks before `#include`, when commented out.
    pub marker: Option<Span>,
    /// From `#include` through the closing quote.
    pub directive: Span,
}

impl IncludeLine {
    pub fn is_active(&self) -> bool {
        self.marker.is_none()
    }
}

/// Every quoted `#include` line of `src`, including ones commented out with
/// a leading `//`.
///
/// Unlike [`Dictionary::parse`] this accepts any text around the includes,
/// such as the C++ headers of a solver.
pub fn include_lines(src: &str) -> Result<Vec<IncludeLine>, CodecError> {
    const DIRECTIVE: &str = "#include";
    let is_blank = |c: u8| c == b' ' || c == b'\t';
    let mut includes = Vec::new();
    let mut line_start = 0;
    for line in src.split_inclusive('\n') {
        let mut lexer = Lexer::new(src);
        lexer.pos = line_start;
        line_start += line.len();
        while lexer.peek(0).is_some_and(is_blank) {
            lexer.pos += 1;
        }
        let marker = if src[lexer.pos..].starts_with("//") {
            let start = lexer.pos;
            lexer.pos += 2;
            while lexer.peek(0).is_some_and(is_blank) {
                lexer.pos += 1;
            }
            Some(Span {
                start,
                end: lexer.pos,
            })
        } else {
            None
        };
        if !src[lexer.pos..].starts_with(DIRECTIVE) {
            continue;
        }
        let start = lexer.pos;
        lexer.pos += DIRECTIVE.len();
        while lexer.peek(0).is_some_and(is_blank) {
            lexer.pos += 1;
        }
        if lexer.peek(0) != Some(b'"') {
            continue;
        }
        let open = lexer.pos;
        lexer.string(open)?;
        includes.push(IncludeLine {
            target: src[open + 1..lexer.pos - 1].to_string(),
            marker,
            directive: Span {
                start,
                end: lexer.pos,
            },
        });
    }
    Ok(includes)
}

fn collect_path<'e>(entries: &'e [Entry], path: &[&str], out: &mut Vec<&'e Entry>) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    for entry in entries.iter().filter(|e| e.keyword == *head) {
        if rest.is_empty() {
            out.push(entry);
        } else if let Some(children) = entry.entries() {
            collect_path(children, rest, out);
        }
    }
}

fn collect_anywhere<'e>(entries: &'e [Entry], keyword: &str, out: &mut Vec<&'e Entry>) {
    for entry in entries {
        if entry.keyword == keyword {
            out.push(entry);
        }
        match &entry.body {
            Body::Dict { entries, .. } => collect_anywhere(entries, keyword, out),
            Body::Value { items, .. } => collect_in_items(items, keyword, out),
            Body::Directive => {}
        }
    }
}

fn collect_in_items<'e>(items: &'e [Item], keyword: &str, out: &mut Vec<&'e Entry>) {
    for item in items {
        match item {
            Item::Dict { entries, .. } => collect_anywhere(entries, keyword, out),
            Item::List { items, .. } => collect_in_items(items, keyword, out),
            _ => {}
        }
    }
}

fn is_keyword(word: &str) -> bool {
    word.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_' || c == '$')
}

pub(crate) fn line_of(src: &str, offset: usize) -> usize {
    src[..offset.min(src.len())].bytes().filter(|b| *b == b'\n').count() + 1
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> CodecError {
        CodecError::Parse {
            line: line_of(self.src, offset),
            message: message.into(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn tokenize(mut self) -> Result<Vec<Token>, CodecError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let Some(c) = self.peek(0) else {
                return Ok(tokens);
            };
            let start = self.pos;
            let kind = match c {
                b'{' | b'}' | b'(' | b')' | b'[' | b']' | b';' => {
                    self.pos += 1;
                    TokenKind::Punct(c)
                }
                b'"' => {
                    self.string(start)?;
                    TokenKind::Str
                }
                b'#' => {
                    while let Some(c) = self.peek(0) {
                        if c == b'\n' || c == b';' {
                            break;
                        }
                        self.pos += 1;
                    }
                    TokenKind::Directive
                }
                _ => self.word_or_number(start)?,
            };
            tokens.push(Token {
                kind,
                span: Span {
                    start,
                    end: self.pos,
                },
            });
        }
    }

    fn skip_trivia(&mut self) -> Result<(), CodecError> {
        loop {
            match (self.peek(0), self.peek(1)) {
                (Some(c), _) if c.is_ascii_whitespace() => self.pos += 1,
                (Some(b'/'), Some(b'/')) => {
                    while let Some(c) = self.peek(0) {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match (self.peek(0), self.peek(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.pos += 2;
                                break;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => return Err(self.error(start, "unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self, start: usize) -> Result<(), CodecError> {
        self.pos += 1;
        loop {
            match self.peek(0) {
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(_) => self.pos += 1,
                None => return Err(self.error(start, "unterminated string")),
            }
        }
    }

    /// Words may carry balanced parentheses, e.g. `div(phi,Ce)`.
    fn word_or_number(&mut self, start: usize) -> Result<TokenKind, CodecError> {
        let mut depth = 0usize;
        while let Some(c) = self.peek(0) {
            match c {
                b'(' if self.pos > start => depth += 1,
                b')' if depth > 0 => depth -= 1,
                b'(' | b')' | b'{' | b'}' | b'[' | b']' | b';' | b'"' => break,
                c if c.is_ascii_whitespace() && depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        if depth > 0 {
            return Err(self.error(start, "unbalanced parenthesis in word"));
        }
        let text = &self.src[start..self.pos];
        let numeric_start = matches!(text.as_bytes()[0], b'0'..=b'9' | b'-' | b'+' | b'.');
        if numeric_start && text.parse::<f64>().is_ok() {
            Ok(TokenKind::Number)
        } else {
            Ok(TokenKind::Word)
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> CodecError {
        CodecError::Parse {
            line: line_of(self.src, offset),
            message: message.into(),
        }
    }

    fn eof_offset(&self) -> usize {
        self.src.len()
    }

    /// Parse entries until EOF (`open == None`) or the `}` matching `open`.
    fn entries(&mut self, open: Option<Span>) -> Result<(Vec<Entry>, Option<Span>), CodecError> {
        let mut entries = Vec::new();
        loop {
            let Some(tok) = self.bump() else {
                return match open {
                    Some(span) => Err(self.error(span.start, "missing '}' for this block")),
                    None => Ok((entries, None)),
                };
            };
            match tok.kind {
                TokenKind::Punct(b'}') => {
                    return match open {
                        Some(_) => Ok((entries, Some(tok.span))),
                        None => Err(self.error(tok.span.start, "unmatched '}'")),
                    };
                }
                TokenKind::Punct(b';') => continue,
                TokenKind::Directive => entries.push(Entry {
                    keyword: tok.span.text(self.src).to_string(),
                    keyword_span: tok.span,
                    body: Body::Directive,
                    span: tok.span,
                }),
                TokenKind::Str => entries.push(self.entry(tok)?),
                TokenKind::Word if is_keyword(tok.span.text(self.src)) => {
                    entries.push(self.entry(tok)?)
                }
                TokenKind::Word | TokenKind::Number => {
                    return Err(self.error(
                        tok.span.start,
                        format!("expected a keyword, found `{}`", tok.span.text(self.src)),
                    ))
                }
                TokenKind::Punct(c) => {
                    return Err(self.error(
                        tok.span.start,
                        format!("expected a keyword, found '{}'", c as char),
                    ))
                }
            }
        }
    }

    fn entry(&mut self, keyword: Token) -> Result<Entry, CodecError> {
        let raw = keyword.span.text(self.src);
        let name = if keyword.kind == TokenKind::Str {
            raw.trim_matches('"').to_string()
        } else {
            raw.to_string()
        };
        if let Some(Token {
            kind: TokenKind::Punct(b'{'),
            span: open,
        }) = self.peek()
        {
            self.pos += 1;
            let (entries, close) = self.entries(Some(open))?;
            let close = close.unwrap_or(open);
            return Ok(Entry {
                keyword: name,
                keyword_span: keyword.span,
                body: Body::Dict { entries, close },
                span: keyword.span.to(close),
            });
        }
        let (items, terminator) = self.items(keyword.span, b';')?;
        Ok(Entry {
            keyword: name,
            keyword_span: keyword.span,
            body: Body::Value { items, terminator },
            span: keyword.span.to(terminator),
        })
    }

    /// Items up to the closing `terminator` (`;` or `)`), returning its span.
    fn items(&mut self, opener: Span, terminator: u8) -> Result<(Vec<Item>, Span), CodecError> {
        let mut items = Vec::new();
        loop {
            let Some(tok) = self.bump() else {
                let message = if terminator == b';' {
                    format!("missing ';' after `{}`", opener.text(self.src))
                } else {
                    "missing ')' for this list".to_string()
                };
                let offset = if terminator == b';' {
                    self.eof_offset()
                } else {
                    opener.start
                };
                return Err(self.error(offset, message));
            };
            match tok.kind {
                TokenKind::Punct(c) if c == terminator => return Ok((items, tok.span)),
                TokenKind::Punct(b'(') => {
                    let (children, close) = self.items(tok.span, b')')?;
                    items.push(Item::List {
                        items: children,
                        span: tok.span.to(close),
                    });
                }
                TokenKind::Punct(b'[') => {
                    let close = loop {
                        match self.bump() {
                            Some(Token {
                                kind: TokenKind::Punct(b']'),
                                span,
                            }) => break span,
                            Some(Token {
                                kind: TokenKind::Word | TokenKind::Number,
                                ..
                            }) => {}
                            Some(other) => {
                                return Err(self.error(
                                    other.span.start,
                                    "unexpected token in dimension set",
                                ))
                            }
                            None => return Err(self.error(tok.span.start, "missing ']'")),
                        }
                    };
                    items.push(Item::Dimensions {
                        span: tok.span.to(close),
                    });
                }
                TokenKind::Punct(b'{') => {
                    let (entries, close) = self.entries(Some(tok.span))?;
                    let close = close.unwrap_or(tok.span);
                    items.push(Item::Dict {
                        entries,
                        span: tok.span.to(close),
                    });
                }
                TokenKind::Punct(c) => {
                    let message = if terminator == b';' {
                        format!(
                            "unexpected '{}', missing ';' after `{}`?",
                            c as char,
                            opener.text(self.src)
                        )
                    } else {
                        format!("unexpected '{}' inside list", c as char)
                    };
                    return Err(self.error(tok.span.start, message));
                }
                _ => items.push(Item::Token(tok)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use rstest::rstest;

    const FV_SCHEMES: &str = indoc! {r#"
        /*--------------------------------*- C++ -*----------------------------------*\
          =========                 |
          \\      /  F ield         | OpenFOAM: The Open Source CFD Toolbox
        \*---------------------------------------------------------------------------*/
        FoamFile
        {
            version     2.0;
            format      ascii;
            class       dictionary;
            object      fvSchemes;
        }
        // * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * * //

        ddtSchemes
        {
            default         Euler;
        }

        divSchemes
        {
            default         none;
            div(phi,Ce)     bounded Gauss upwind;
        }
    "#};

    #[test]
    fn parses_nested_blocks() {
        let dict = Dictionary::parse(FV_SCHEMES).unwrap();
        let keywords: Vec<_> = dict.entries.iter().map(|e| e.keyword.as_str()).collect();
        assert_eq!(keywords, ["FoamFile", "ddtSchemes", "divSchemes"]);

        let div = dict.find_path(&["divSchemes", "div(phi,Ce)"]);
        assert_eq!(div.len(), 1);
        let items = div[0].items().unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_word(FV_SCHEMES, "bounded"));
    }

    #[test]
    fn lists_of_dictionaries_are_searchable() {
        let src = indoc! {"
            actions
            (
                {
                    name    solidPhase;
                    source  sphereToCell;
                    sourceInfo
                    {
                        centre  (0 0 0);
                        radius  40;
                    }
                }
            );
        "};
        let dict = Dictionary::parse(src).unwrap();
        let radius = dict.find_anywhere("radius");
        assert_eq!(radius.len(), 1);
        assert_eq!(radius[0].items().unwrap()[0].as_number(src), Some(40.0));
        assert!(dict.find_path(&["radius"]).is_empty());
    }

    #[test]
    fn dimension_sets_are_single_items() {
        let src = "Ds_value [0 2 -1 0 0 0 0] 1e-14;\n";
        let dict = Dictionary::parse(src).unwrap();
        let items = dict.entries[0].items().unwrap();
        assert!(matches!(items[0], Item::Dimensions { .. }));
        assert_eq!(items[0].span().text(src), "[0 2 -1 0 0 0 0]");
        assert_eq!(items[1].as_number(src), Some(1e-14));
    }

    #[test]
    fn directives_and_comments_are_tolerated() {
        let src = indoc! {r#"
            #include "initialConditions"
            /* block
               comment */
            endTime 10; // trailing
        "#};
        let dict = Dictionary::parse(src).unwrap();
        assert_eq!(dict.find_path(&["endTime"]).len(), 1);
    }

    #[test]
    fn include_lines_are_found_in_any_source() {
        let src = indoc! {r#"
            {
                #include "OCV_Gr.H"
                //#include "OCV_Si.H"
                //  #include "OCV_LFP.H"
                #include <cmath>
                Cs.correctBoundaryConditions();
            }
        "#};
        let includes = include_lines(src).unwrap();
        let found: Vec<_> = includes
            .iter()
            .map(|i| (i.target.as_str(), i.is_active()))
            .collect();
        assert_eq!(found, [("OCV_Gr.H", true), ("OCV_Si.H", false), ("OCV_LFP.H", false)]);
        assert_eq!(includes[0].directive.text(src), r#"#include "OCV_Gr.H""#);
        assert_eq!(includes[2].marker.map(|m| m.text(src)), Some("//  "));
    }

    #[rstest]
    #[case("a 1;\n}\n", 2, "unmatched")]
    #[case("block\n{\n    a 1;\n", 2, "missing '}'")]
    #[case("endTime 10\n", 2, "missing ';'")]
    #[case("1,2,3\n4,5,6\n", 1, "expected a keyword")]
    #[case("/* open\n", 1, "unterminated comment")]
    #[case("a \"oops;\n", 1, "unterminated string")]
    #[case("   \n// only a comment\n", 1, "no dictionary entries")]
    #[case("v (1 2 3;\n", 1, "unexpected ';'")]
    fn rejects_non_dictionaries(#[case] src: &str, #[case] line: usize, #[case] needle: &str) {
        match Dictionary::parse(src) {
            Err(CodecError::Parse { line: l, message }) => {
                assert_eq!(l, line, "{message}");
                assert!(message.contains(needle), "{message}");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
