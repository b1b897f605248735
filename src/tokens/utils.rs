//! Classification and conversion helpers for token sequences.

use super::{Kv, KvValue, Span, Token};
use indexmap::IndexMap;

/// HTML4 block tags. `video` is excluded because it is also an inline
/// element.
static BLOCK_TAGS: phf::Set<&str> = phf::phf_set! {
    "div", "p",
    "table", "tbody", "thead", "tfoot", "caption", "th", "tr", "td",
    "ul", "ol", "li", "dl", "dt", "dd",
    "h1", "h2", "h3", "h4", "h5", "h6", "hgroup",
    "article", "aside", "nav", "section", "footer", "header",
    "figure", "figcaption", "fieldset", "details", "blockquote",
    "hr", "button", "canvas", "center", "col", "colgroup", "embed",
    "map", "object", "pre", "progress",
};

/// Tags which open a block-tag scope.
static BLOCK_SCOPE_OPEN_TAGS: phf::Set<&str> = phf::phf_set! {
    "blockquote", "pre", "p",
    "h1", "h2", "h3", "h4", "h5", "h6",
    "ul", "ol", "li", "dl",
    "table", "tr",
};

/// Tags which close a block-tag scope.
static BLOCK_SCOPE_CLOSE_TAGS: phf::Set<&str> = phf::phf_set! { "td", "th" };

/// Tags which belong to a table.
static TABLE_TAGS: phf::Set<&str> = phf::phf_set! {
    "table", "tbody", "thead", "tfoot", "caption", "th", "tr", "td",
};

/// Void HTML5 tags.
pub static VOID_TAGS: phf::Set<&str> = phf::phf_set! {
    "area", "base", "br", "col", "embed", "hr", "img",
    "input", "link", "meta", "param", "source",
    "track", "wbr",
};

/// Returns true if `name` is a block-level tag.
#[inline]
pub fn is_block_tag(name: &str) -> bool {
    BLOCK_TAGS.contains(name)
}

/// Returns true if `name` opens a block-tag scope.
#[inline]
pub fn tag_opens_block_scope(name: &str) -> bool {
    BLOCK_SCOPE_OPEN_TAGS.contains(name)
}

/// Returns true if `name` closes a block-tag scope.
#[inline]
pub fn tag_closes_block_scope(name: &str) -> bool {
    BLOCK_SCOPE_CLOSE_TAGS.contains(name)
}

/// Returns true if the token is a table start or end tag.
#[inline]
pub fn is_table_tag(token: &Token) -> bool {
    matches!(token, Token::TagStart(tag) | Token::TagEnd(tag) if TABLE_TAGS.contains(tag.name.as_str()))
}

/// Returns true if the token is a tag written with HTML syntax.
#[inline]
pub fn is_html_tag(token: &Token) -> bool {
    token
        .tag()
        .is_some_and(|tag| tag.dp.stx == Some(super::Syntax::Html))
}

/// Returns true if the token is an unexpanded template.
#[inline]
pub fn is_template_token(token: &Token) -> bool {
    token.is_self_closing("template")
}

/// Returns true if the token is a link tag which is transparent to
/// start-of-line context (categories, redirects, and language links).
pub fn is_sol_transparent_link_tag(token: &Token) -> bool {
    token.name() == Some("link")
        && token.tag().is_some_and(|tag| {
            tag.attr("rel").is_some_and(|rel| {
                rel.to_text().split_ascii_whitespace().any(|rel| {
                    matches!(
                        rel,
                        "mw:PageProp/Category" | "mw:PageProp/redirect" | "mw:PageProp/Language"
                    )
                })
            })
        })
}

/// Returns true if the token is a behavior switch, either before or after
/// behavior switch processing.
pub fn is_behavior_switch(token: &Token) -> bool {
    match token {
        Token::SelfClosing(tag) if tag.name == "behavior-switch" => true,
        Token::SelfClosing(tag) if tag.name == "meta" => tag
            .attr("property")
            .is_some_and(|p| p.to_text().starts_with("mw:PageProp/")),
        _ => false,
    }
}

/// Returns true if the token does not affect start-of-line context.
pub fn is_sol_transparent(token: &Token) -> bool {
    match token {
        Token::Text(text) => text.chars().all(char::is_whitespace),
        Token::Comment(..) => true,
        _ if is_sol_transparent_link_tag(token) || is_behavior_switch(token) => true,
        Token::SelfClosing(tag) if tag.name == "meta" => {
            tag.dp.stx != Some(super::Syntax::Html)
        }
        _ => false,
    }
}

/// Returns true if the token is an empty line marker.
#[inline]
pub fn is_empty_line_meta(token: &Token) -> bool {
    matches!(token, Token::SelfClosing(tag)
        if tag.name == "meta" && tag.attr_str("typeof") == Some("mw:EmptyLine"))
}

/// Returns true if `ty` is an encapsulation `typeof` value which marks
/// content produced by a transclusion, template argument, or extension.
pub fn is_encapsulation_type(ty: &str) -> bool {
    ty == "mw:Transclusion" || ty == "mw:Param" || ty.starts_with("mw:Extension/")
}

/// Converts a token sequence to text, dropping comments, newlines, and any
/// non-text tokens.
///
/// An `mw:Entity` span with known source becomes that source, and its decoded
/// content is skipped.
pub fn tokens_to_string(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut in_entity = false;
    for token in tokens {
        match token {
            Token::TagEnd(tag) if in_entity && tag.name == "span" => in_entity = false,
            _ if in_entity => {}
            Token::Text(text) => out += text,
            Token::TagStart(tag)
                if tag.name == "span" && tag.attr_str("typeof") == Some("mw:Entity") =>
            {
                if let Some(src) = &tag.dp.src {
                    out += src;
                    in_entity = true;
                }
            }
            _ => {}
        }
    }
    out
}

/// Converts a token sequence to text until the first token which is not text,
/// a comment, or a newline. Returns the text and the index of the first
/// unconverted token, if any.
pub fn tokens_to_string_strict(tokens: &[Token]) -> (String, Option<usize>) {
    let mut out = String::new();
    for (index, token) in tokens.iter().enumerate() {
        match token {
            Token::Text(text) => out += text,
            Token::Comment(..) | Token::Newline(_) => {}
            _ => return (out, Some(index)),
        }
    }
    (out, None)
}

/// Converts a list of key-value pairs into an ordered map of lowercased keys
/// to text values. Later duplicate keys win.
pub fn kv_to_hash(kvs: &[Kv]) -> IndexMap<String, String> {
    let mut map = IndexMap::new();
    for kv in kvs {
        let key = kv.k.to_text().trim().to_lowercase();
        map.insert(key, kv.v.to_text().into_owned());
    }
    map
}

/// Moves the source ranges of every token (and every token nested in an
/// attribute) by `offset` bytes, or clears them if `offset` is `None`.
pub fn shift_tsr(tokens: &mut [Token], offset: Option<isize>) {
    if offset == Some(0) {
        return;
    }

    let shift = |span: Span| {
        offset.and_then(|offset| {
            Some(Span::new(
                span.start.checked_add_signed(offset)?,
                span.end.checked_add_signed(offset)?,
            ))
        })
    };

    for token in tokens {
        if let Some(dp) = token.dp_mut()
            && let Some(tsr) = dp.tsr
        {
            dp.tsr = shift(tsr);
        }

        if let Some(tag) = token.tag_mut() {
            for kv in &mut tag.attribs {
                for value in [&mut kv.k, &mut kv.v] {
                    if let KvValue::Tokens(tokens) = value {
                        shift_tsr(tokens, offset);
                    }
                }
                kv.src_offsets = kv.src_offsets.and_then(|offsets| {
                    Some(super::KvOffsets {
                        key: shift(offsets.key)?,
                        value: shift(offsets.value)?,
                    })
                });
            }
        }
    }
}

/// Removes a trailing end-of-input token.
#[inline]
pub fn strip_eof(tokens: &mut Vec<Token>) {
    if matches!(tokens.last(), Some(Token::EndOfInput(_))) {
        tokens.pop();
    }
}

/// Trims leading and trailing whitespace text and newlines from a token
/// sequence.
pub fn token_trim(mut tokens: Vec<Token>) -> Vec<Token> {
    for token in tokens.iter_mut() {
        match token {
            Token::Newline(_) => *token = Token::Text(String::new()),
            Token::Text(text) => {
                let trimmed = text.trim_start();
                let stop = !trimmed.is_empty();
                *text = trimmed.to_string();
                if stop {
                    break;
                }
            }
            _ => break,
        }
    }

    for token in tokens.iter_mut().rev() {
        match token {
            Token::Newline(_) => *token = Token::Text(String::new()),
            Token::Text(text) => {
                let trimmed = text.trim_end();
                let stop = !trimmed.is_empty();
                text.truncate(trimmed.len());
                if stop {
                    break;
                }
            }
            _ => break,
        }
    }

    tokens.retain(|token| !matches!(token, Token::Text(text) if text.is_empty()));
    tokens
}

/// Splits text at newlines into text and newline tokens. If `start` is given,
/// newline tokens get source ranges relative to it.
pub fn newlines_to_tokens(text: &str, start: Option<usize>) -> Vec<Token> {
    let mut out = Vec::new();
    let mut pos = start;
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !line.is_empty() {
            out.push(Token::Text(line.to_string()));
        }
        if lines.peek().is_some() {
            pos = pos.map(|pos| pos + line.len());
            out.push(Token::newline(pos.map(|pos| Span::new(pos, pos + 1))));
            pos = pos.map(|pos| pos + 1);
        }
    }
    out
}

/// Removes inclusion control tags from a token sequence, along with the
/// content of any `includeonly` sections.
pub fn strip_include_tokens(tokens: Vec<Token>) -> Vec<Token> {
    let mut include_only = false;
    tokens
        .into_iter()
        .filter(|token| match token.name() {
            Some("noinclude" | "onlyinclude") => false,
            Some("includeonly") => {
                include_only = matches!(token, Token::TagStart(_));
                false
            }
            _ => !include_only,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::Tag;

    #[test]
    fn sol_transparency() {
        assert!(is_sol_transparent(&" \t".into()));
        assert!(!is_sol_transparent(&" a".into()));
        assert!(is_sol_transparent(&Token::Comment(
            "x".into(),
            Default::default()
        )));
        let category = Tag::new("link")
            .with_attr("rel", "mw:PageProp/Category")
            .self_closing();
        assert!(is_sol_transparent(&category));
        assert!(is_sol_transparent(&Tag::new("behavior-switch").self_closing()));
        let mut html_meta = Tag::new("meta");
        html_meta.dp.stx = Some(crate::tokens::Syntax::Html);
        assert!(!is_sol_transparent(&html_meta.self_closing()));
        assert!(!is_sol_transparent(&Tag::new("b").start()));
    }

    #[test]
    fn trim() {
        let tokens = vec![
            " ".into(),
            Token::newline(None),
            " a ".into(),
            Tag::new("b").start(),
            " b ".into(),
            Token::newline(None),
        ];
        assert_eq!(
            token_trim(tokens),
            vec!["a ".into(), Tag::new("b").start(), " b".into()]
        );
    }

    #[test]
    fn entity_source_is_kept() {
        let mut entity = Tag::new("span").with_attr("typeof", "mw:Entity");
        entity.dp.src = Some("&amp;".into());
        let tokens = vec![
            "a ".into(),
            entity.start(),
            "&".into(),
            Tag::new("span").end(),
            " b".into(),
            Tag::new("span").start(),
            "c".into(),
            Tag::new("span").end(),
        ];
        assert_eq!(tokens_to_string(&tokens), "a &amp; bc");
    }

    #[test]
    fn shift_and_clear() {
        let mut tokens = vec![
            Token::newline(Some(Span::new(3, 4))),
            Tag::new("template")
                .with_attribs(vec![Kv::new("x", vec![Token::newline(Some(Span::new(1, 2)))])
                    .with_offsets(Some(crate::tokens::KvOffsets {
                        key: Span::new(1, 1),
                        value: Span::new(1, 2),
                    }))])
                .self_closing(),
        ];
        shift_tsr(&mut tokens, Some(2));
        assert_eq!(tokens[0].tsr(), Some(Span::new(5, 6)));
        let tag = tokens[1].tag().unwrap();
        assert_eq!(tag.attribs[0].v.tokens()[0].tsr(), Some(Span::new(3, 4)));
        assert_eq!(tag.attribs[0].src_offsets.unwrap().value, Span::new(3, 4));
        shift_tsr(&mut tokens, None);
        assert_eq!(tokens[0].tsr(), None);
        assert_eq!(tokens[1].tag().unwrap().attribs[0].src_offsets, None);
    }

    #[test]
    fn newline_split() {
        assert_eq!(
            newlines_to_tokens("a\nb\n", Some(10)),
            vec![
                "a".into(),
                Token::newline(Some(Span::new(11, 12))),
                "b".into(),
                Token::newline(Some(Span::new(13, 14))),
            ]
        );
    }

    #[test]
    fn include_stripping() {
        let tokens = vec![
            "a".into(),
            Tag::new("includeonly").start(),
            "b".into(),
            Tag::new("includeonly").end(),
            Tag::new("noinclude").start(),
            "c".into(),
        ];
        assert_eq!(strip_include_tokens(tokens), vec!["a".into(), "c".into()]);
    }
}
