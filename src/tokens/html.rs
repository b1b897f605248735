//! A flat HTML rendering of a token stream, for debugging and tests.
//!
//! This is not a tree builder. Tags are written in stream order exactly as they
//! appear, so unbalanced token streams produce unbalanced HTML.

use super::{Kv, KvValue, Token};
use core::fmt;

/// Renders a token stream as HTML.
pub fn to_html(tokens: &[Token]) -> String {
    let mut out = String::new();
    // Writing to a String never fails
    let _ = write_html(&mut out, tokens);
    out
}

/// Writes a token stream as HTML to `out`.
pub fn write_html<W: fmt::Write + ?Sized>(out: &mut W, tokens: &[Token]) -> fmt::Result {
    for token in tokens {
        match token {
            Token::Text(text) => out.write_str(&html_escape::encode_text(text))?,
            Token::TagStart(tag) => {
                write!(out, "<{}", tag.name)?;
                write_attrs(out, &tag.attribs)?;
                out.write_char('>')?;
            }
            Token::TagEnd(tag) => write!(out, "</{}>", tag.name)?,
            Token::SelfClosing(tag) => {
                write!(out, "<{}", tag.name)?;
                write_attrs(out, &tag.attribs)?;
                out.write_str("/>")?;
            }
            Token::Newline(_) => out.write_char('\n')?,
            Token::Comment(text, _) => write!(out, "<!--{text}-->")?,
            Token::EndOfInput(_) => {}
        }
    }
    Ok(())
}

/// Writes attributes. Attributes with an empty key are skipped.
fn write_attrs<W: fmt::Write + ?Sized>(out: &mut W, attribs: &[Kv]) -> fmt::Result {
    for kv in attribs {
        let key = kv.k.to_text();
        if key.is_empty() {
            continue;
        }
        let value = match &kv.v {
            KvValue::Str(value) => value.into(),
            KvValue::Tokens(tokens) => {
                let mut value = String::new();
                write_html(&mut value, tokens)?;
                value
            }
        };
        write!(
            out,
            " {key}=\"{}\"",
            html_escape::encode_double_quoted_attribute(&value)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::Tag;

    #[test]
    fn render() {
        let tokens = vec![
            Tag::new("p").with_attr("class", "a\"b").start(),
            "x < y".into(),
            Tag::new("br").self_closing(),
            Token::newline(None),
            Token::Comment(" c ".into(), Default::default()),
            Tag::new("p").end(),
            Token::eof(None),
        ];
        assert_eq!(
            to_html(&tokens),
            "<p class=\"a&quot;b\">x &lt; y<br/>\n<!-- c --></p>"
        );
    }
}
