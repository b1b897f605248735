//! Extension tags implemented natively: `<nowiki>`, `<pre>`, and `<poem>`.

use super::{ExtensionCall, ExtensionError};
use crate::{
    config::ExtensionTag,
    tokens::{Kv, Span, Syntax, Tag, Token},
};
use futures::{
    FutureExt as _,
    future::{LocalBoxFuture, ready},
};
use regex::Regex;
use std::sync::LazyLock;

/// A character reference.
static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);")
        .unwrap_or_else(|err| panic!("invalid entity pattern: {err}"))
});

/// Converts raw text to text tokens, decoding character references into
/// `mw:Entity` spans.
///
/// Source ranges are assigned from `start` when it is known.
fn text_to_tokens(text: &str, start: Option<usize>) -> Vec<Token> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in ENTITY.find_iter(text) {
        let decoded = html_escape::decode_html_entities(m.as_str());
        if decoded == m.as_str() {
            continue;
        }
        if last < m.start() {
            out.push(Token::from(&text[last..m.start()]));
        }
        let tsr = start.map(|start| Span::new(start + m.start(), start + m.end()));
        let mut span = Tag::new("span")
            .with_attr("typeof", "mw:Entity")
            .with_tsr(tsr);
        span.dp.src = Some(m.as_str().to_string());
        out.push(span.start());
        out.push(Token::Text(decoded.into_owned()));
        out.push(Tag::new("span").end());
        last = m.end();
    }
    if last < text.len() {
        out.push(Token::from(&text[last..]));
    }
    out
}

/// The attributes of a generated tag, in source order.
fn attribs(call: &ExtensionCall) -> Vec<Kv> {
    call.attrs
        .iter()
        .map(|(k, v)| Kv::new(k.as_str(), v.as_str()))
        .collect()
}

/// `<nowiki>`: the body is plain text.
pub struct NoWiki;

impl ExtensionTag for NoWiki {
    fn source_to_tokens(
        &self,
        call: ExtensionCall,
    ) -> LocalBoxFuture<'static, Result<Vec<Token>, ExtensionError>> {
        let body = call.body.unwrap_or_default();
        let tsr = call.src_offsets;
        let mut out = vec![
            Tag::new("span")
                .with_attr("typeof", "mw:Nowiki")
                .with_tsr(tsr.map(|tsr| Span::at(tsr.start)))
                .start(),
        ];
        out.extend(text_to_tokens(&body, tsr.map(|tsr| tsr.start)));
        out.push(
            Tag::new("span")
                .with_tsr(tsr.map(|tsr| Span::at(tsr.end)))
                .end(),
        );
        ready(Ok(out)).boxed_local()
    }
}

/// `<pre>`: a preformatted block whose body is plain text.
pub struct Pre;

impl ExtensionTag for Pre {
    fn source_to_tokens(
        &self,
        call: ExtensionCall,
    ) -> LocalBoxFuture<'static, Result<Vec<Token>, ExtensionError>> {
        let body = call.body.as_deref().unwrap_or_default();
        // A newline right after the start tag is not content
        let (body, offset) = match body.strip_prefix('\n') {
            Some(rest) => (rest, 1),
            None => (body, 0),
        };

        let mut start = Tag::new("pre").with_attribs(attribs(&call));
        start.dp.stx = Some(Syntax::Html);
        let mut out = vec![start.start()];
        out.extend(text_to_tokens(
            body,
            call.src_offsets.map(|tsr| tsr.start + offset),
        ));
        let mut end = Tag::new("pre");
        end.dp.stx = Some(Syntax::Html);
        out.push(end.end());
        ready(Ok(out)).boxed_local()
    }
}

/// `<poem>`: wikitext where line breaks are kept and leading spaces are
/// preserved.
pub struct Poem;

impl Poem {
    /// Rewrites the body so that each source line becomes one rendered line.
    fn prepare(body: &str) -> String {
        body.trim_matches('\n')
            .lines()
            .map(|line| {
                let content = line.trim_start_matches(' ');
                let indent = line.len() - content.len();
                let line = "&#160;".repeat(indent) + content;
                if line.starts_with("----") {
                    "<hr />".to_string()
                } else {
                    line
                }
            })
            .collect::<Vec<_>>()
            .join("<br />\n")
    }
}

impl ExtensionTag for Poem {
    fn source_to_tokens(
        &self,
        call: ExtensionCall,
    ) -> LocalBoxFuture<'static, Result<Vec<Token>, ExtensionError>> {
        async move {
            let text = Self::prepare(call.body.as_deref().unwrap_or_default());
            let content = call.process_wikitext(&text, None).await?;

            let mut div = Tag::new("div").with_attribs(attribs(&call));
            div.add_space_separated_attr("class", "poem");
            let mut out = vec![div.start()];
            out.extend(content);
            out.push(Tag::new("div").end());
            Ok(out)
        }
        .boxed_local()
    }
}
