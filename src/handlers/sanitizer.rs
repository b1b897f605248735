//! Removal of unsafe HTML tags and attributes.
//!
//! Tags written as HTML in wikitext must be on the tag whitelist, or they
//! are turned back into their source text. Attributes must be on the
//! whitelist of their tag. Values of `style`, `id`, and URL attributes are
//! cleaned. Every dropped or changed attribute keeps its source value in the
//! shadow attributes of the token so it can be round-tripped.

use crate::{
    config::SiteConfig,
    pipeline::{Ctx, Options, Result, TokenHandler, Transform},
    tokens::{
        KvValue, Tag, Token,
        utils::{is_empty_line_meta, is_html_tag, tokens_to_string},
    },
};
use indexmap::IndexMap;
use regex::Regex;
use std::{borrow::Cow, sync::LazyLock};

/// HTML tags allowed in wikitext. Explicit `<a>` tags are forbidden.
static TAG_WHITELIST: phf::Set<&str> = phf::phf_set! {
    "abbr",
    "b", "bdi", "bdo", "big", "blockquote", "br",
    "caption", "center", "cite", "code",
    "data", "dd", "del", "dfn", "div", "dl", "dt",
    "em",
    "font",
    "h1", "h2", "h3", "h4", "h5", "h6", "hr",
    "i", "ins",
    "kbd",
    "li",
    "mark",
    "ol",
    "p", "pre",
    "q",
    "rb", "rp", "rt", "rtc", "ruby",
    "s", "samp", "small", "span", "strike", "strong", "sub", "sup",
    "table", "td", "th", "time", "tr", "tt",
    "u", "ul",
    "var",
    "wbr",
};

/// Tags whose end tag is never accepted.
static NO_END_TAG: phf::Set<&str> = phf::phf_set! { "br" };

/// Attributes allowed on most tags: core, WAI-ARIA, RDFa, and microdata.
static COMMON_ATTRS: phf::Set<&str> = phf::phf_set! {
    "id", "class", "lang", "dir", "title", "style",
    "aria-describedby", "aria-flowto", "aria-label", "aria-labelledby",
    "aria-owns", "role",
    "about", "property", "resource", "datatype", "typeof",
    "itemid", "itemprop", "itemref", "itemscope", "itemtype",
};

/// Tags which do not accept [`COMMON_ATTRS`].
static NO_COMMON_ATTRS: phf::Set<&str> = phf::phf_set! { "math", "meta", "link" };

/// Attributes allowed per tag, in addition to [`COMMON_ATTRS`].
static TAG_ATTRS: phf::Map<&str, &[&str]> = phf::phf_map! {
    "div" => &["align"],
    "center" => &[],
    "span" => &[],
    "h1" => &["align"],
    "h2" => &["align"],
    "h3" => &["align"],
    "h4" => &["align"],
    "h5" => &["align"],
    "h6" => &["align"],
    "bdo" => &[],
    "em" => &[],
    "strong" => &[],
    "cite" => &[],
    "dfn" => &[],
    "code" => &[],
    "samp" => &[],
    "kbd" => &[],
    "var" => &[],
    "abbr" => &[],
    "blockquote" => &["cite"],
    "q" => &["cite"],
    "sub" => &[],
    "sup" => &[],
    "p" => &["align"],
    "br" => &["clear"],
    "wbr" => &[],
    "pre" => &["width"],
    "ins" => &["cite", "datetime"],
    "del" => &["cite", "datetime"],
    "ul" => &["type"],
    "ol" => &["type", "start", "reversed"],
    "li" => &["type", "value"],
    "dl" => &[],
    "dd" => &[],
    "dt" => &[],
    "table" => &[
        "summary", "width", "border", "frame", "rules", "cellspacing",
        "cellpadding", "align", "bgcolor",
    ],
    "caption" => &["align"],
    "thead" => &[],
    "tfoot" => &[],
    "tbody" => &[],
    "colgroup" => &["span"],
    "col" => &["span"],
    "tr" => &["bgcolor", "align", "valign"],
    "td" => &[
        "abbr", "axis", "headers", "scope", "rowspan", "colspan", "nowrap",
        "width", "height", "bgcolor", "align", "valign",
    ],
    "th" => &[
        "abbr", "axis", "headers", "scope", "rowspan", "colspan", "nowrap",
        "width", "height", "bgcolor", "align", "valign",
    ],
    "a" => &["href", "rel", "rev"],
    "img" => &["alt", "src", "width", "height", "srcset"],
    "audio" => &["controls", "preload", "width", "height"],
    "video" => &["poster", "controls", "preload", "width", "height"],
    "source" => &["type", "src"],
    "track" => &["type", "src", "srclang", "kind", "label"],
    "tt" => &[],
    "b" => &[],
    "i" => &[],
    "big" => &[],
    "small" => &[],
    "strike" => &[],
    "s" => &[],
    "u" => &[],
    "font" => &["size", "color", "face"],
    "hr" => &["width"],
    "ruby" => &[],
    "rb" => &[],
    "rp" => &[],
    "rt" => &[],
    "rtc" => &[],
    "math" => &["class", "style", "id", "title"],
    "figure" => &[],
    "figure-inline" => &[],
    "figcaption" => &[],
    "bdi" => &[],
    "data" => &["value"],
    "time" => &["datetime"],
    "mark" => &[],
    "meta" => &["itemprop", "content"],
    "link" => &["itemprop", "href", "title"],
};

/// RDFa and microdata attributes, whose values may be URLs.
static MICRODATA_ATTRS: phf::Set<&str> = phf::phf_set! {
    "rel", "rev", "about", "property", "resource", "datatype", "typeof",
    "itemid", "itemprop", "itemref", "itemscope", "itemtype",
};

/// Compiles a regular expression which is known to be valid.
fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid pattern {pattern:?}: {err}"))
}

/// A valid attribute name.
static ATTR_NAME: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^[:_\p{L}\p{N}][:_.\-\p{L}\p{N}]*$"));

/// An XML namespace declaration.
static XMLNS_ATTR: LazyLock<Regex> = LazyLock::new(|| regex(r"^xmlns:[:A-Z_a-z\-.0-9]+$"));

/// A script URI.
static EVIL_URI: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(?i)(?:^|\s|\*/\s*)(?:javascript|vbscript)(?:[^\w]|$)"));

/// CSS which can run script or load external resources.
static INSECURE_CSS: LazyLock<Regex> = LazyLock::new(|| {
    regex(
        r"(?ix) expression
        | filter\s*:
        | accelerator\s*:
        | -o-link\s*:
        | -o-link-source\s*:
        | -o-replace\s*:
        | url\s*\(
        | image\s*\(
        | image-set\s*\(
        | attr\s*\([^)]+[\s,]+url
        | javascript\s*:",
    )
});

/// A CSS escape sequence or line continuation.
static CSS_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"\\(?:(\n|\r\n|\r|\x0c)|([0-9A-Fa-f]{1,6})[\x20\t\r\n\x0c]?|(.)|()$)")
});

/// A CSS value which is only a comment.
static CSS_SINGLE_COMMENT: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*/\*[^*/]*\*/\s*$"));

/// A character which is invalid in CSS.
static CSS_CONTROL_CHAR: LazyLock<Regex> =
    LazyLock::new(|| regex(r"[\x00-\x08\x0b\x0e-\x1f\x7f\x{fffd}]"));

/// An `s` followed by a mark which some browsers read as a second `s`.
static CSS_PROLONGED_S: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"(?i)s(?:\x{3031}|\x{309d}|\x{30fc}|\x{30fd}|\x{fe7c}|\x{fe7d}|\x{ff70})")
});

/// The parts of a URL: protocol, host, and path.
static URL_PARTS: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^((?:[a-zA-Z][^:/]*:)?(?://)?)([^/]+)(/?.*)"));

/// A percent-encoded IPv6 host.
static ENCODED_IPV6_HOST: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^%5B([0-9A-Fa-f:.]+)%5D((:\d+)?)$"));

/// Returns true if `attr` is allowed on `tag`.
fn is_allowed_attr(tag: &str, attr: &str) -> bool {
    TAG_ATTRS.get(tag).is_some_and(|extra| {
        extra.contains(&attr) || (!NO_COMMON_ATTRS.contains(tag) && COMMON_ATTRS.contains(attr))
    })
}

/// Returns true if `v` contains an `mw:` type.
fn has_mw_type(v: &str) -> bool {
    v.split_ascii_whitespace()
        .any(|ty| ty.len() > 3 && ty.starts_with("mw:"))
}

/// Returns true if the attribute was generated by the pipeline itself.
fn is_pipeline_attr(k: &str, v: &str, tag: &Tag) -> bool {
    (matches!(k, "typeof" | "property" | "rel") && has_mw_type(v))
        || (k == "about"
            && v.strip_prefix("#mwt")
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())))
        || (k == "content" && tag.attr("property").is_some_and(|p| has_mw_type(&p.to_text())))
}

/// Returns true if `k` is an allowed `data-` attribute.
fn is_data_attr(k: &str) -> bool {
    k.strip_prefix("data-")
        .is_some_and(|rest| !rest.starts_with("ooui") && !rest.contains(':'))
}

/// Escapes a value for use in an `id` attribute.
pub fn escape_id_for_attribute(id: &str) -> String {
    id.replace(' ', "_")
}

/// Removes invisible characters which could disguise a host name.
fn strip_idns(host: &str) -> String {
    host.chars()
        .filter(|c| {
            !matches!(c,
                '\t' | ' ' | '\u{ad}' | '\u{1806}' | '\u{200b}' | '\u{2060}' | '\u{feff}'
                | '\u{34f}' | '\u{180b}' | '\u{180c}' | '\u{180d}' | '\u{200c}' | '\u{200d}'
                | '\u{fe00}'..='\u{fe0f}')
        })
        .collect()
}

/// Cleans a URL, or returns `None` if its protocol is not allowed.
fn clean_url(config: &SiteConfig, href: &str) -> Option<String> {
    let Some(parts) = URL_PARTS.captures(href) else {
        return Some(href.to_string());
    };
    let proto = parts.get(1).map_or("", |m| m.as_str());
    if !proto.is_empty() && !config.has_valid_protocol(proto) {
        return None;
    }
    let mut host = strip_idns(parts.get(2).map_or("", |m| m.as_str()));
    if let Some(ipv6) = ENCODED_IPV6_HOST.captures(&host) {
        host = format!("[{}]{}", &ipv6[1], &ipv6[2]);
    }
    let path = parts.get(3).map_or("", |m| m.as_str());
    Some(format!("{proto}{host}{path}"))
}

/// Replaces each `/* ... */` comment with a space. Nested starts are part of
/// the outer comment.
fn replace_css_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        let Some(len) = rest[start + 2..].find("*/") else {
            break;
        };
        out += &rest[..start];
        out.push(' ');
        rest = &rest[start + 2 + len + 2..];
    }
    out += rest;
    out
}

/// Escapes the last quote character if the quotes are unbalanced.
fn escape_mismatched_quote(text: String, quote: char) -> String {
    if text.matches(quote).count() % 2 == 0 {
        return text;
    }
    match text.rfind(quote) {
        Some(index)
            if !text[index + 1..].contains(['\n', '\r', '\x0c']) =>
        {
            format!("{}\\{quote}{}", &text[..index], &text[index + 1..])
        }
        _ => text,
    }
}

/// Normalizes CSS into a form which can be checked for hostile input.
fn normalize_css(text: &str) -> String {
    let text = html_escape::decode_html_entities(text);

    let text = CSS_ESCAPE.replace_all(&text, |caps: &regex::Captures<'_>| {
        if caps.get(1).is_some() {
            return String::new();
        }
        let c = if let Some(hex) = caps.get(2) {
            u32::from_str_radix(hex.as_str(), 16)
                .ok()
                .and_then(char::from_u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER)
        } else if let Some(c) = caps.get(3) {
            c.as_str().chars().next().unwrap_or('\\')
        } else {
            '\\'
        };
        if matches!(c, '\n' | '"' | '\'' | '\\') {
            // Kept as an escape so it cannot end a string
            format!("\\{:x} ", u32::from(c))
        } else {
            c.to_string()
        }
    });

    // Fullwidth forms and other characters which some browsers read as ASCII
    let mut text = text
        .chars()
        .map(|c| match c {
            '\u{ff01}'..='\u{ff5a}' if c != '\u{ff3c}' => {
                char::from_u32(u32::from(c) - 0xfee0).unwrap_or(c)
            }
            '\u{280}' => 'r',
            '\u{274}' => 'n',
            '\u{207f}' => 'n',
            '\u{29f}' => 'l',
            '\u{26a}' => 'i',
            '\u{207d}' | '\u{208d}' => '(',
            c => c,
        })
        .collect::<String>();

    if !CSS_SINGLE_COMMENT.is_match(&text) {
        text = replace_css_comments(&text);
        if let Some(index) = text.find("/*") {
            text.truncate(index);
        }
    }

    let text = escape_mismatched_quote(text, '\'');
    let text = escape_mismatched_quote(text, '"');
    CSS_PROLONGED_S.replace_all(&text, "ss").into_owned()
}

/// Cleans a `style` attribute value.
pub fn check_css(text: &str) -> Cow<'static, str> {
    let text = normalize_css(text);
    if CSS_CONTROL_CHAR.is_match(&text) {
        "/* invalid control char */".into()
    } else if INSECURE_CSS.is_match(&text) {
        "/* insecure input */".into()
    } else {
        text.into()
    }
}

/// A sanitized attribute: the new value, or `None` if it was dropped, then
/// the source value and the source key.
type SanitizedAttr = (Option<String>, String, String);

/// Removes unsafe tags and attributes.
#[derive(Default)]
pub struct Sanitizer {
    /// The content is part of a template expansion, so source ranges are
    /// not available.
    in_template: bool,
}

impl Sanitizer {
    /// Sanitizes the attributes of a start or self-closing tag.
    fn sanitize_tag_attrs(config: &SiteConfig, tag: &Tag) -> IndexMap<String, SanitizedAttr> {
        let mut out = IndexMap::<String, SanitizedAttr>::new();
        for kv in &tag.attribs {
            let k = kv.k.to_text();
            let v = match &kv.v {
                KvValue::Str(v) => v.clone(),
                KvValue::Tokens(tokens) => tokens_to_string(tokens),
            };
            let orig_k = kv.ksrc.clone().unwrap_or_else(|| k.to_string());
            let orig_v = kv.vsrc.clone().unwrap_or_else(|| v.clone());
            let k = k.to_lowercase();
            let is_pipeline = is_pipeline_attr(&k, &v, tag);

            if !is_pipeline {
                if !ATTR_NAME.is_match(&k) {
                    out.insert(k, (None, orig_v, orig_k));
                    continue;
                }

                if XMLNS_ATTR.is_match(&k) {
                    let v = (!EVIL_URI.is_match(&v)).then_some(v);
                    out.insert(k, (v, orig_v, orig_k));
                    continue;
                }

                if !is_data_attr(&k) && !is_allowed_attr(&tag.name, &k) {
                    out.insert(k, (None, orig_v, orig_k));
                    continue;
                }
            }

            let v = match k.as_str() {
                "style" => check_css(&v).into_owned(),
                "id" => escape_id_for_attribute(&v),
                _ => v,
            };

            if MICRODATA_ATTRS.contains(k.as_str()) && EVIL_URI.is_match(&v) {
                // Pipeline types survive, everything else goes
                let v = is_pipeline.then(|| {
                    orig_v
                        .split_ascii_whitespace()
                        .filter(|ty| {
                            ty.strip_prefix("mw:")
                                .and_then(|rest| rest.chars().next())
                                .is_some_and(|c| c.is_alphanumeric() || c == '_')
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                });
                out.insert(k, (v, orig_v, orig_k));
                continue;
            }

            if matches!(k.as_str(), "href" | "src" | "poster") {
                let href = clean_url(config, &v);
                if href.as_deref() != Some(v.as_str()) {
                    out.insert(k, (href, orig_v, orig_k));
                    continue;
                }
            }

            // Later duplicates win, in the position of the first
            out.insert(k, (Some(v), orig_v, orig_k));
        }
        out
    }

    /// Converts a tag which is not allowed back to text.
    fn tag_to_text(&self, ctx: &Ctx<'_>, token: &Token) -> Token {
        let Some(tag) = token.tag() else {
            return token.clone();
        };

        if !self.in_template
            && let Some(tsr) = tag.dp.tsr
            && let Some(src) = ctx.frame.src().get(tsr.start..tsr.end)
        {
            return Token::from(src);
        }

        // Without a source range, whitespace is not kept
        let text = match token {
            Token::TagEnd(_) => format!("</{}>", tag.name),
            _ => {
                let mut text = format!("<{}", tag.name);
                for kv in &tag.attribs {
                    text += &format!(" {}='{}'", kv.k.to_text(), kv.v.to_text());
                }
                if matches!(token, Token::SelfClosing(_)) {
                    text += " /";
                }
                text + ">"
            }
        };
        Token::Text(text)
    }

    /// Sanitizes one token.
    fn sanitize_token(&self, ctx: &Ctx<'_>, mut token: Token) -> Token {
        let Some(tag) = token.tag() else {
            return token;
        };

        if is_html_tag(&token)
            && (!TAG_WHITELIST.contains(tag.name.as_str())
                || (matches!(token, Token::TagEnd(_)) && NO_END_TAG.contains(tag.name.as_str())))
        {
            log::debug!("converting disallowed tag <{}> to text", tag.name);
            return self.tag_to_text(ctx, &token);
        }

        if tag.attribs.is_empty() {
            return token;
        }

        if matches!(token, Token::TagEnd(_)) {
            if let Some(tag) = token.tag_mut() {
                tag.attribs.clear();
            }
            return token;
        }

        let attrs = Self::sanitize_tag_attrs(ctx.env.config(), tag);
        if let Some(tag) = token.tag_mut() {
            tag.attribs.clear();
            for (k, (v, orig_v, orig_k)) in attrs {
                if let Some(v) = v {
                    tag.add_attr(&k, v.clone());
                    tag.set_shadow_info(&k, Some(v), orig_v);
                } else {
                    log::trace!("dropping attribute {orig_k:?} from <{}>", tag.name);
                    tag.set_shadow_info(&orig_k, None, orig_v);
                }
            }
        }
        token
    }
}

impl TokenHandler for Sanitizer {
    fn name(&self) -> &'static str {
        "Sanitizer"
    }

    fn reset_state(&mut self, options: &Options) {
        self.in_template = options.in_template;
    }

    fn on_any(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        if is_empty_line_meta(&token) {
            return Ok(Transform::Unchanged(token));
        }
        Ok(Transform::Unchanged(self.sanitize_token(ctx, token)))
    }

    fn on_any_enabled(&self) -> bool {
        true
    }
}
