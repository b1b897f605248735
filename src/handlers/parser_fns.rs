//! Natively implemented parser functions and variables.
//!
//! Each function receives the text after the colon in the target (already
//! expanded) and the remaining arguments (unexpanded). Branching functions
//! only expand the branch they take.

use crate::{
    pipeline::{Env, Frame, Input, Options, PipelineType, Result},
    title::{self, NS_MAIN, Title},
    tokens::{
        Kv, KvValue, Tag, Token,
        utils::{token_trim, tokens_to_string},
    },
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{borrow::Cow, rc::Rc};

/// Characters left alone by `urlencode`.
const URLENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Characters left alone in the `*E` variables, which produce title paths.
const TITLE_URL_SET: &AsciiSet = &URLENCODE_SET
    .remove(b'/')
    .remove(b':')
    .remove(b'(')
    .remove(b')')
    .remove(b'!')
    .remove(b'*')
    .remove(b',')
    .remove(b';')
    .remove(b'@')
    .remove(b'$')
    .remove(b'~');

/// The longest padding `padleft` and `padright` will produce.
const MAX_PAD_LENGTH: usize = 500;

/// The calling context of a parser function.
pub(super) struct PfContext {
    /// The parse environment.
    pub env: Rc<Env>,
    /// The frame the call appeared in.
    pub frame: Rc<Frame>,
    /// The options of the calling pipeline.
    pub options: Options,
}

impl PfContext {
    /// Expands `tokens` in the calling frame.
    pub async fn expand(&self, tokens: Vec<Token>) -> Result<Vec<Token>> {
        if tokens.iter().all(|token| matches!(token, Token::Text(_))) {
            return Ok(tokens);
        }

        let options = Options {
            in_template: true,
            attr_expansion: false,
            ..self.options.clone()
        };
        self.env
            .process_content(
                &self.frame,
                Input::Tokens(tokens),
                PipelineType::TokensToExpanded,
                options,
                false,
                None,
            )
            .await
    }

    /// Expands a value and converts it to trimmed text.
    async fn expand_text(&self, value: &KvValue) -> Result<String> {
        let tokens = self.expand(value.clone().into_tokens()).await?;
        Ok(tokens_to_string(&tokens).trim().to_string())
    }

    /// Expands a whole argument, rejoining named arguments into `k=v` form,
    /// and trims the result.
    async fn expand_arg(&self, arg: Option<&Kv>) -> Result<Vec<Token>> {
        let Some(arg) = arg else {
            return Ok(vec![]);
        };
        let tokens = if arg.k.is_empty() {
            arg.v.clone().into_tokens()
        } else {
            let mut tokens = arg.k.clone().into_tokens();
            tokens.push("=".into());
            tokens.extend(arg.v.clone().into_tokens());
            tokens
        };
        Ok(token_trim(self.expand(tokens).await?))
    }

    /// The title named by `text`, or the page being parsed if `text` is
    /// empty.
    fn title_or_page(&self, text: &str) -> Option<Cow<'_, Title>> {
        if text.is_empty() {
            Some(Cow::Borrowed(self.env.page()))
        } else {
            Title::new(text, NS_MAIN, self.env.config()).ok().map(Cow::Owned)
        }
    }
}

/// Calls the parser function or variable `name`.
///
/// Returns `None` if there is no implementation for `name`.
pub(super) async fn call(
    cx: &PfContext,
    name: &str,
    first: &str,
    args: &[Kv],
) -> Result<Option<Vec<Token>>> {
    let first = first.trim();
    let text = |text: String| -> Result<Option<Vec<Token>>> { Ok(Some(vec![Token::Text(text)])) };
    match name {
        "if" => {
            let branch = if first.is_empty() {
                args.get(1)
            } else {
                args.first()
            };
            cx.expand_arg(branch).await.map(Some)
        }
        "ifeq" => {
            if args.len() < 2 {
                return Ok(Some(vec![]));
            }
            let rhs = cx.expand_text(&args[0].v).await?;
            let branch = if loose_eq(first, &rhs) {
                args.get(1)
            } else {
                args.get(2)
            };
            cx.expand_arg(branch).await.map(Some)
        }
        "switch" => switch(cx, first, args).await.map(Some),
        "tag" => tag(cx, first, args).await.map(Some),
        "lc" => text(first.to_lowercase()),
        "uc" => text(first.to_uppercase()),
        "lcfirst" => text(title::lcfirst(first).into_owned()),
        "ucfirst" => text(title::ucfirst(first).into_owned()),
        "padleft" | "padright" => {
            let length = match args.first() {
                Some(arg) => cx.expand_text(&arg.v).await?.parse().unwrap_or(0),
                None => 0,
            };
            let padding = match args.get(1) {
                Some(arg) => cx.expand_text(&arg.v).await?,
                None => "0".into(),
            };
            text(pad(first, length, &padding, name == "padleft"))
        }
        "urlencode" => text(
            utf8_percent_encode(first, URLENCODE_SET)
                .to_string()
                .replace("%20", "+"),
        ),
        "anchorencode" => Ok(Some(anchor_encode(first))),
        "ns" | "nse" => {
            let config = cx.env.config();
            let ns = match first.parse::<i32>() {
                Ok(id) => config.namespace(id),
                Err(_) => config.namespace_by_name(first),
            };
            let ns_name = ns.map_or("", |ns| ns.name.as_str());
            text(if name == "nse" {
                title_url(ns_name)
            } else {
                ns_name.to_string()
            })
        }
        "pagename" | "pagenamee" | "fullpagename" | "fullpagenamee" | "namespace"
        | "namespacee" | "namespacenumber" | "subpagename" | "rootpagename"
        | "basepagename" | "talkpagename" => {
            let Some(title) = cx.title_or_page(first) else {
                return Ok(Some(vec![]));
            };
            let encode = matches!(name, "pagenamee" | "fullpagenamee" | "namespacee");
            let base = if encode { &name[..name.len() - 1] } else { name };
            let value = match base {
                "pagename" => title.text().to_string(),
                "fullpagename" => title.key().to_string(),
                "namespace" => title.namespace_text().to_string(),
                "namespacenumber" => title.namespace_id().to_string(),
                "subpagename" => title.subpage_text().to_string(),
                "rootpagename" => title.root_text().to_string(),
                "basepagename" => {
                    let text = title.text();
                    text.rsplit_once('/').map_or(text, |(base, _)| base).to_string()
                }
                _ => talk_page(cx, &title),
            };
            text(if encode { title_url(&value) } else { value })
        }
        "sitename" => text(cx.env.config().site_name.clone()),
        "contentlanguage" => text(cx.env.config().lang.clone()),
        "articlepath" => text(cx.env.config().article_path.clone()),
        "language" => text(first.to_string()),
        "equal" => text("=".into()),
        "defaultsort" | "displaytitle" => {
            let property = if name == "defaultsort" {
                "categorydefaultsort"
            } else {
                "displaytitle"
            };
            cx.env.set_page_prop(property, first);
            Ok(Some(vec![
                Tag::new("meta")
                    .with_attr("property", format!("mw:PageProp/{property}"))
                    .with_attr("content", first)
                    .self_closing(),
            ]))
        }
        _ => Ok(None),
    }
}

/// Compares two values numerically if both are numbers, or as text
/// otherwise.
fn loose_eq(lhs: &str, rhs: &str) -> bool {
    match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => lhs == rhs,
    }
}

/// `{{#switch:value|case1|case2=result|#default=default}}`
///
/// Unnamed cases fall through to the next named case. An unnamed last case
/// is the default when there is no explicit one.
async fn switch(cx: &PfContext, value: &str, args: &[Kv]) -> Result<Vec<Token>> {
    let mut fall_through = false;
    let mut default = None;
    for (index, arg) in args.iter().enumerate() {
        if arg.k.is_empty() {
            if index == args.len() - 1 && !fall_through {
                log::trace!("#switch: taking last unnamed case as default");
                return cx.expand_arg(Some(arg)).await;
            }
            if !fall_through && loose_eq(&cx.expand_text(&arg.v).await?, value) {
                fall_through = true;
            }
        } else {
            let key = cx.expand_text(&arg.k).await?;
            if fall_through || loose_eq(&key, value) {
                return Ok(token_trim(cx.expand(arg.v.clone().into_tokens()).await?));
            }
            if key == "#default" {
                default = Some(arg);
            }
        }
    }

    match default {
        Some(arg) => Ok(token_trim(cx.expand(arg.v.clone().into_tokens()).await?)),
        None => Ok(vec![]),
    }
}

/// `{{#tag:name|content|attr=value}}`, as a literal start and end tag pair.
async fn tag(cx: &PfContext, name: &str, args: &[Kv]) -> Result<Vec<Token>> {
    let name = name.to_lowercase();
    if name.is_empty() {
        return Ok(vec![]);
    }

    let mut content = None;
    let mut attribs = Vec::new();
    for arg in args {
        if arg.k.is_empty() {
            if content.is_none() {
                content = Some(cx.expand(arg.v.clone().into_tokens()).await?);
            }
        } else {
            let key = cx.expand_text(&arg.k).await?;
            let value = cx.expand_text(&arg.v).await?;
            let value = value
                .strip_prefix('"')
                .and_then(|value| value.strip_suffix('"'))
                .unwrap_or(&value);
            attribs.push(Kv::new(key, value));
        }
    }

    let mut out = vec![Tag::new(name.clone()).with_attribs(attribs).start()];
    out.extend(content.unwrap_or_default());
    out.push(Tag::new(name).end());
    Ok(out)
}

/// Pads `text` to `length` characters by repeating `padding`.
fn pad(text: &str, length: usize, padding: &str, left: bool) -> String {
    let length = length.min(MAX_PAD_LENGTH);
    let have = text.chars().count();
    if padding.is_empty() || have >= length {
        return text.to_string();
    }

    let fill = padding.chars().cycle().take(length - have).collect::<String>();
    if left {
        fill + text
    } else {
        format!("{text}{fill}")
    }
}

/// Converts text to a link fragment. Characters that would be read as
/// wikitext come out as entities.
fn anchor_encode(text: &str) -> Vec<Token> {
    let decoded = html_escape::decode_html_entities(text);
    let collapsed = decoded
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    let mut out = Vec::new();
    let mut plain = String::new();
    for c in collapsed.chars() {
        if matches!(c, '[' | ']' | '{' | '}' | '|') {
            if !plain.is_empty() {
                out.push(Token::Text(core::mem::take(&mut plain)));
            }
            let mut span = Token::meta("mw:Entity");
            span.name = "span".into();
            span.dp.src = Some(format!("&#x{:X};", u32::from(c)));
            out.push(span.start());
            out.push(Token::Text(c.to_string()));
            out.push(Tag::new("span").end());
        } else {
            plain.push(c);
        }
    }
    if !plain.is_empty() {
        out.push(Token::Text(plain));
    }
    out
}

/// Encodes a title for use in a URL path.
fn title_url(text: &str) -> String {
    utf8_percent_encode(&text.replace(' ', "_"), TITLE_URL_SET).to_string()
}

/// The full name of the talk page associated with `title`.
fn talk_page(cx: &PfContext, title: &Title) -> String {
    let id = title.namespace_id();
    let talk = if id >= NS_MAIN && id % 2 == 0 { id + 1 } else { id };
    match cx.env.config().namespace(talk) {
        Some(ns) if !ns.name.is_empty() => format!("{}:{}", ns.name, title.text()),
        _ => title.key().to_string(),
    }
}
