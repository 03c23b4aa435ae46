// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use stratus::unstable::{unescape, Lexer, Source, TokenKind};

fn tokens(contents: &str) -> Result<Vec<(TokenKind, String)>> {
    let source = Source::from_contents("case.strat".to_string(), contents.to_string())?;
    let mut lexer = Lexer::new(&source);
    let mut out = vec![];
    loop {
        let tok = lexer.next_token()?;
        if tok.0 == TokenKind::Eof {
            return Ok(out);
        }
        out.push((tok.0.clone(), tok.1.text().to_string()));
    }
}

fn texts(contents: &str) -> Result<Vec<String>> {
    Ok(tokens(contents)?.into_iter().map(|(_, t)| t).collect())
}

#[test]
fn idents_and_symbols() -> Result<()> {
    let toks = tokens("resource bucket logs { name = x }")?;
    let kinds: Vec<TokenKind> = toks.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Ident,
            TokenKind::Ident,
            TokenKind::Ident,
            TokenKind::Symbol,
            TokenKind::Ident,
            TokenKind::Symbol,
            TokenKind::Ident,
            TokenKind::Symbol,
        ]
    );
    Ok(())
}

#[test]
fn two_char_symbols() -> Result<()> {
    assert_eq!(
        texts("== != <= >= && || = < >")?,
        vec!["==", "!=", "<=", ">=", "&&", "||", "=", "<", ">"]
    );
    Ok(())
}

#[test]
fn lone_ampersand_is_an_error() {
    assert!(tokens("a & b").is_err());
}

#[test]
fn string_span_excludes_quotes() -> Result<()> {
    let toks = tokens(r#" "hello" "#)?;
    assert_eq!(toks, vec![(TokenKind::String, "hello".to_string())]);
    Ok(())
}

#[test]
fn single_quoted_strings() -> Result<()> {
    let toks = tokens("'world'")?;
    assert_eq!(toks, vec![(TokenKind::String, "world".to_string())]);
    Ok(())
}

#[test]
fn string_escapes_are_kept_raw() -> Result<()> {
    let toks = tokens(r#""a\nb""#)?;
    assert_eq!(toks[0].1, r"a\nb");
    assert_eq!(unescape(&toks[0].1)?, "a\nb");
    Ok(())
}

#[test]
fn unicode_escape() -> Result<()> {
    assert_eq!(unescape(r"A")?, "A");
    assert!(unescape(r"\u00g1").is_err());
    Ok(())
}

#[test]
fn invalid_escape_is_an_error() {
    assert!(tokens(r#""a\qb""#).is_err());
}

#[test]
fn numbers() -> Result<()> {
    assert_eq!(texts("0 42 3.25 1e3")?, vec!["0", "42", "3.25", "1e3"]);
    Ok(())
}

#[test]
fn negative_number_literal() -> Result<()> {
    // A `-` directly followed by a digit is part of the literal.
    assert_eq!(texts("-3")?, vec!["-3"]);
    assert_eq!(texts("1 - 2")?, vec!["1", "-", "2"]);
    Ok(())
}

#[test]
fn comments_are_skipped() -> Result<()> {
    assert_eq!(texts("a # trailing comment\nb")?, vec!["a", "b"]);
    Ok(())
}

#[test]
fn unterminated_string_is_an_error() {
    assert!(tokens(r#""abc"#).is_err());
}
