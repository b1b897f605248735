//! Inclusion control: `<noinclude>`, `<includeonly>`, and `<onlyinclude>`.
//!
//! Outside of a transclusion, the tags become `meta` markers so the source
//! round-trips. Inside a transclusion, they decide which content survives.

use super::collector::{Collector, TokenCollector};
use crate::{
    pipeline::{Ctx, Options, Result, TokenHandler, Transform},
    tokens::{DataParsoid, Span, Tag, Token},
};

const NO_INCLUDE: &str = "mw:Includes/NoInclude";
const INCLUDE_ONLY: &str = "mw:Includes/IncludeOnly";
const ONLY_INCLUDE: &str = "mw:Includes/OnlyInclude";

/// Builds a marker for an inclusion control tag. The marker source is taken
/// from the frame source when the range is known, and from `src` otherwise.
fn build_meta(ctx: &Ctx<'_>, ty: &str, is_end: bool, tsr: Option<Span>, src: Option<&str>) -> Tag {
    let ty = if is_end {
        format!("{ty}/End")
    } else {
        ty.to_string()
    };
    let src = tsr
        .and_then(|tsr| tsr.slice(ctx.frame.src()))
        .or(src)
        .unwrap_or_default();
    Token::meta(ty).with_dp(DataParsoid {
        tsr,
        src: Some(src.to_string()),
        ..Default::default()
    })
}

/// Builds one marker which stands in for everything from `start` to `end`,
/// or to the end of the source if there is no end tag.
fn build_stripped_meta(ctx: &Ctx<'_>, ty: &str, start: &Token, end: Option<&Token>) -> Tag {
    let tsr = start.tsr().map(|start| {
        let end = end
            .and_then(Token::tsr)
            .map_or(ctx.frame.src().len(), |end| end.end);
        Span::new(start.start, end)
    });
    build_meta(ctx, ty, false, tsr, None)
}

/// Splits a collection into its start delimiter, content, and end delimiter.
fn split(mut collection: Vec<Token>) -> Option<(Token, Vec<Token>, Option<Token>)> {
    if collection.is_empty() {
        return None;
    }
    let start = collection.remove(0);
    let end = collection.pop();
    Some((start, collection, end))
}

/// Strips `<noinclude>` content from transclusions.
#[derive(Default)]
pub struct NoIncludeCollector;

impl Collector for NoIncludeCollector {
    const NAME: &'static str = "NoInclude";
    const TAG: &'static str = "noinclude";
    const TO_END: bool = true;
    const ACK_END: bool = true;

    fn transform(&mut self, ctx: &Ctx<'_>, collection: Vec<Token>) -> Vec<Token> {
        let Some((start, content, end)) = split(collection) else {
            return vec![];
        };

        match start {
            Token::TagEnd(_) => {
                return vec![build_meta(ctx, NO_INCLUDE, true, start.tsr(), None).self_closing()];
            }
            Token::SelfClosing(_) => {
                return if ctx.options.is_include {
                    vec![]
                } else {
                    vec![build_meta(ctx, NO_INCLUDE, false, start.tsr(), None).self_closing()]
                };
            }
            _ => {}
        }

        let eof = end.as_ref().filter(|end| matches!(end, Token::EndOfInput(_)));
        let mut tokens = vec![];
        if !ctx.options.is_include {
            tokens.push(build_meta(ctx, NO_INCLUDE, false, start.tsr(), None).self_closing());
            tokens.extend(content);
            if let Some(end) = end.as_ref().filter(|_| eof.is_none()) {
                tokens.push(build_meta(ctx, NO_INCLUDE, true, end.tsr(), None).self_closing());
            }
        } else if !ctx.options.in_template {
            let end = end.as_ref().filter(|_| eof.is_none());
            tokens.push(build_stripped_meta(ctx, NO_INCLUDE, &start, end).self_closing());
        }

        if let Some(eof) = eof {
            tokens.push(eof.clone());
        }
        tokens
    }
}

/// Strips `<includeonly>` content from everything except transclusions.
#[derive(Default)]
pub struct IncludeOnlyCollector;

impl IncludeOnlyCollector {
    /// Records the source of the start tag in the marker `data-mw`.
    fn add_src(mut meta: Tag, start: &Token) -> Tag {
        if let Some(src) = start.dp().and_then(|dp| dp.src.as_deref()) {
            meta.add_attr("data-mw", serde_json::json!({ "src": src }).to_string());
        }
        meta
    }
}

impl Collector for IncludeOnlyCollector {
    const NAME: &'static str = "IncludeOnly";
    const TAG: &'static str = "includeonly";
    const TO_END: bool = true;
    const ACK_END: bool = false;

    fn transform(&mut self, ctx: &Ctx<'_>, collection: Vec<Token>) -> Vec<Token> {
        let Some((start, content, end)) = split(collection) else {
            return vec![];
        };

        if matches!(start, Token::SelfClosing(_)) {
            return if ctx.options.is_include {
                vec![]
            } else {
                let meta = build_meta(ctx, INCLUDE_ONLY, false, start.tsr(), None);
                vec![Self::add_src(meta, &start).self_closing()]
            };
        }

        let eof = end.as_ref().filter(|end| matches!(end, Token::EndOfInput(_)));
        let end = end.as_ref().filter(|_| eof.is_none());
        let mut tokens = vec![];
        if ctx.options.is_include {
            tokens.extend(content);
        } else if !ctx.options.in_template {
            let meta = build_stripped_meta(ctx, INCLUDE_ONLY, &start, end);
            tokens.push(Self::add_src(meta, &start).self_closing());

            // The stripped marker covers the whole range, so the end marker
            // is zero-width.
            if let Some(end) = end {
                let tsr = end.tsr().map(|tsr| Span::at(tsr.end));
                tokens.push(build_meta(ctx, INCLUDE_ONLY, true, tsr, Some("")).self_closing());
            }
        }

        if let Some(eof) = eof {
            tokens.push(eof.clone());
        }
        tokens
    }
}

/// The `<noinclude>` handler.
pub type NoInclude = TokenCollector<NoIncludeCollector>;

/// The `<includeonly>` handler.
pub type IncludeOnly = TokenCollector<IncludeOnlyCollector>;

/// The `<onlyinclude>` handler.
///
/// When transcluding, a page with an `<onlyinclude>` section contributes only
/// what is inside its `<onlyinclude>` sections. Whether there is one is only
/// known at the end of input, so everything else is held until then.
#[derive(Default)]
pub struct OnlyInclude {
    /// The run is a transclusion.
    is_include: bool,
    /// Tokens outside of any `<onlyinclude>` section.
    accum: Vec<Token>,
    /// Inside an `<onlyinclude>` section.
    in_only_include: bool,
    /// At least one `<onlyinclude>` section was seen.
    found_only_include: bool,
}

impl OnlyInclude {
    /// Replaces an `<onlyinclude>` tag with a marker outside of
    /// transclusions.
    fn on_only_include(ctx: &Ctx<'_>, token: &Token) -> Token {
        let tsr = token.tsr();
        let src = if ctx.options.in_template {
            None
        } else {
            tsr.and_then(|tsr| tsr.slice(ctx.frame.src()))
                .or_else(|| token.dp().and_then(|dp| dp.src.as_deref()))
                .map(ToString::to_string)
        };
        let ty = if matches!(token, Token::TagEnd(_)) {
            format!("{ONLY_INCLUDE}/End")
        } else {
            ONLY_INCLUDE.to_string()
        };
        Token::meta(ty)
            .with_dp(DataParsoid {
                tsr,
                src,
                ..Default::default()
            })
            .self_closing()
    }
}

impl TokenHandler for OnlyInclude {
    fn name(&self) -> &'static str {
        "OnlyInclude"
    }

    fn reset_state(&mut self, options: &Options) {
        self.is_include = options.is_include;
        self.accum.clear();
        self.in_only_include = false;
        self.found_only_include = false;
    }

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(if !self.is_include && token.name() == Some("onlyinclude") {
            Transform::Replace(vec![Self::on_only_include(ctx, &token)])
        } else {
            Transform::Unchanged(token)
        })
    }

    fn on_any(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        if matches!(token, Token::EndOfInput(_)) {
            self.in_only_include = false;
            let mut out = if self.found_only_include {
                self.accum.clear();
                vec![]
            } else {
                core::mem::take(&mut self.accum)
            };
            self.found_only_include = false;
            out.push(token);
            return Ok(Transform::Replace(out));
        }

        if token.name() == Some("onlyinclude") {
            let is_end = matches!(token, Token::TagEnd(_));
            self.found_only_include = true;
            self.in_only_include = !self.in_only_include;
            let meta = build_meta(ctx, ONLY_INCLUDE, is_end, token.tsr(), None);
            return Ok(Transform::Replace(vec![meta.self_closing()]));
        }

        Ok(if self.in_only_include {
            Transform::Replace(vec![token])
        } else {
            self.accum.push(token);
            Transform::Replace(vec![])
        })
    }

    fn on_any_enabled(&self) -> bool {
        self.is_include
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{env_with, run_on_source};

    fn include() -> Options {
        Options {
            is_include: true,
            ..Default::default()
        }
    }

    fn metas(tokens: &[Token]) -> Vec<(String, Option<Span>, Option<String>)> {
        tokens
            .iter()
            .filter_map(|token| match token {
                Token::SelfClosing(tag) if tag.name == "meta" => Some((
                    tag.attr("typeof")?.to_text().into_owned(),
                    tag.dp.tsr,
                    tag.dp.src.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    fn texts(tokens: &[Token]) -> String {
        tokens.iter().filter_map(Token::as_text).collect()
    }

    #[test]
    fn noinclude_in_page_view() {
        let env = env_with(&[]);
        let src = "a<noinclude>b</noinclude>c";
        let tokens = run_on_source(&mut NoInclude::default(), &env, src, Options::default());
        assert_eq!(texts(&tokens), "abc");
        assert_eq!(
            metas(&tokens),
            vec![
                (
                    NO_INCLUDE.to_string(),
                    Some(Span::new(1, 12)),
                    Some("<noinclude>".to_string())
                ),
                (
                    format!("{NO_INCLUDE}/End"),
                    Some(Span::new(13, 25)),
                    Some("</noinclude>".to_string())
                ),
            ]
        );
        assert!(matches!(tokens.last(), Some(Token::EndOfInput(_))));
    }

    #[test]
    fn noinclude_when_transcluded() {
        let env = env_with(&[]);
        let src = "a<noinclude>b</noinclude>c";
        let tokens = run_on_source(&mut NoInclude::default(), &env, src, include());
        assert_eq!(texts(&tokens), "ac");
        assert_eq!(
            metas(&tokens),
            vec![(
                NO_INCLUDE.to_string(),
                Some(Span::new(1, 25)),
                Some("<noinclude>b</noinclude>".to_string())
            )]
        );

        let nested = Options {
            in_template: true,
            ..include()
        };
        let tokens = run_on_source(&mut NoInclude::default(), &env, src, nested);
        assert_eq!(texts(&tokens), "ac");
        assert!(metas(&tokens).is_empty());
    }

    #[test]
    fn unclosed_noinclude_runs_to_end() {
        let env = env_with(&[]);
        let src = "a<noinclude>b";
        let tokens = run_on_source(&mut NoInclude::default(), &env, src, include());
        assert_eq!(texts(&tokens), "a");
        assert_eq!(metas(&tokens)[0].1, Some(Span::new(1, 13)));
        assert!(matches!(tokens.last(), Some(Token::EndOfInput(_))));
    }

    #[test]
    fn stray_noinclude_end() {
        let env = env_with(&[]);
        let tokens = run_on_source(&mut NoInclude::default(), &env, "a</noinclude>", Options::default());
        assert_eq!(metas(&tokens)[0].0, format!("{NO_INCLUDE}/End"));
    }

    #[test]
    fn includeonly_in_page_view() {
        let env = env_with(&[]);
        let src = "a<includeonly>b</includeonly>c";
        let tokens = run_on_source(&mut IncludeOnly::default(), &env, src, Options::default());
        assert_eq!(texts(&tokens), "ac");
        assert_eq!(
            metas(&tokens),
            vec![
                (
                    INCLUDE_ONLY.to_string(),
                    Some(Span::new(1, 29)),
                    Some("<includeonly>b</includeonly>".to_string())
                ),
                (
                    format!("{INCLUDE_ONLY}/End"),
                    Some(Span::at(29)),
                    Some(String::new())
                ),
            ]
        );
        let Some(Token::SelfClosing(start)) = tokens.get(1) else {
            panic!("expected a marker, got {tokens:?}");
        };
        assert_eq!(
            start.attr_str("data-mw"),
            Some(r#"{"src":"<includeonly>"}"#)
        );
    }

    #[test]
    fn includeonly_when_transcluded() {
        let env = env_with(&[]);
        let src = "a<includeonly>b</includeonly>c";
        let tokens = run_on_source(&mut IncludeOnly::default(), &env, src, include());
        assert_eq!(texts(&tokens), "abc");
        assert!(metas(&tokens).is_empty());
    }

    #[test]
    fn onlyinclude_in_page_view() {
        let env = env_with(&[]);
        let src = "a<onlyinclude>b</onlyinclude>c";
        let tokens = run_on_source(&mut OnlyInclude::default(), &env, src, Options::default());
        assert_eq!(texts(&tokens), "abc");
        assert_eq!(
            metas(&tokens),
            vec![
                (
                    ONLY_INCLUDE.to_string(),
                    Some(Span::new(1, 14)),
                    Some("<onlyinclude>".to_string())
                ),
                (
                    format!("{ONLY_INCLUDE}/End"),
                    Some(Span::new(15, 29)),
                    Some("</onlyinclude>".to_string())
                ),
            ]
        );
    }

    #[test]
    fn onlyinclude_when_transcluded() {
        let env = env_with(&[]);
        let src = "a<onlyinclude>b</onlyinclude>c<onlyinclude>d</onlyinclude>e";
        let tokens = run_on_source(&mut OnlyInclude::default(), &env, src, include());
        assert_eq!(texts(&tokens), "bd");
        assert_eq!(metas(&tokens).len(), 4);
        assert!(matches!(tokens.last(), Some(Token::EndOfInput(_))));

        let tokens = run_on_source(&mut OnlyInclude::default(), &env, "a\nb", include());
        assert_eq!(texts(&tokens), "ab");
        assert_eq!(tokens.len(), 4);
    }
}
