//! The token model shared by the tokenizer and every token handler.
//!
//! Tokens are a flat sequence. Text runs and tags intermix freely in the same
//! vector, and handlers see the stream one token at a time.

pub use codemap::Span;
pub use data_mw::{
    AttrKey, AttrValue, DataMw, ExpandedAttr, ExtBody, MwError, Param, ParamInfo, ParamKey, Part,
    TemplateInfo, Target,
};
use serde::Serialize;
use std::borrow::Cow;

mod codemap;
mod data_mw;
pub mod html;
pub mod utils;

/// The syntax that produced a token, when it is not the default for its tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Syntax {
    /// Literal HTML syntax, e.g. `<b>` instead of `'''`.
    Html,
    /// A table cell or list item sharing a line with its predecessor, e.g.
    /// `|a||b` or `;dt:dd`.
    Row,
    /// A piped construct, e.g. `[[a|b]]`.
    Piped,
    /// A magic link or magic word.
    Magic,
}

/// Build-time data which handlers use to talk to each other.
///
/// None of this survives to the output. [`Token::strip_build_data`] clears it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tmp {
    /// The token was produced by retokenizing text in the stream patcher.
    pub reparsed: bool,
    /// The extension output is HTML and should not be paragraph wrapped.
    pub is_html_ext: bool,
    /// The original wikitext of a templated attribute whose expansion
    /// contained a newline.
    pub unwrapped_wt: Option<String>,
    /// The tag name of the first wikitext construct inside a templated
    /// attribute (e.g. `table` for `{{tpl}}|` cells).
    pub first_wikitext_node: Option<String>,
    /// The offsets of the source which produced a template expansion.
    pub tpl_src_offsets: Option<Span>,
    /// The two characters of text immediately before a quote marker.
    pub preceding_2chars: Option<String>,
}

/// Round-trip metadata for a token.
///
/// Everything except [`DataParsoid::tmp`] may be persisted by a serializer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataParsoid {
    /// The tag source range in the source wikitext, or `None` if the token is
    /// synthetic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsr: Option<Span>,
    /// The original source of an encapsulated construct.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// The syntax that produced the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stx: Option<Syntax>,
    /// The start tag was inserted by a handler and has no source.
    #[serde(skip_serializing_if = "is_false")]
    pub auto_inserted_start: bool,
    /// The end tag was inserted by a handler and has no source.
    #[serde(skip_serializing_if = "is_false")]
    pub auto_inserted_end: bool,
    /// The widths of the start and end tags of an extension tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_widths: Option<(usize, usize)>,
    /// Template parameter infos for encapsulated transclusions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pi: Option<Vec<ParamInfo>>,
    /// Normalised attribute values, keyed by attribute name.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub a: Vec<(String, Option<String>)>,
    /// Source attribute values, keyed by attribute name.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sa: Vec<(String, String)>,
    /// Build-time data.
    #[serde(skip)]
    pub tmp: Tmp,
}

#[inline]
#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl DataParsoid {
    /// Creates new metadata with the given source range.
    #[inline]
    pub fn with_tsr(tsr: Span) -> Self {
        Self {
            tsr: Some(tsr),
            ..Default::default()
        }
    }
}

/// The source offsets of a key-value pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct KvOffsets {
    /// The key span.
    pub key: Span,
    /// The value span.
    pub value: Span,
}

impl KvOffsets {
    /// The span of the whole pair.
    #[inline]
    pub fn span(&self) -> Span {
        self.key.merge(self.value)
    }

    /// Moves both spans by `offset` bytes.
    #[inline]
    pub fn shift(self, offset: usize) -> Self {
        Self {
            key: self.key.shift(offset),
            value: self.value.shift(offset),
        }
    }
}

/// A key or value of an attribute.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KvValue {
    /// A fully expanded string.
    Str(String),
    /// Unexpanded or partially expanded markup.
    Tokens(Vec<Token>),
}

impl Default for KvValue {
    fn default() -> Self {
        Self::Str(String::new())
    }
}

impl KvValue {
    /// Returns the value as a string slice if it is a plain string, or a
    /// single text token.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::Str(s) => Some(s),
            KvValue::Tokens(tokens) => match tokens.as_slice() {
                [] => Some(""),
                [Token::Text(s)] => Some(s),
                _ => None,
            },
        }
    }

    /// Returns the text content of the value, dropping any non-text tokens.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            KvValue::Str(s) => Cow::Borrowed(s),
            KvValue::Tokens(tokens) => utils::tokens_to_string(tokens).into(),
        }
    }

    /// Returns true if the value contains markup which needs expansion.
    pub fn is_templated(&self) -> bool {
        match self {
            KvValue::Str(_) => false,
            KvValue::Tokens(tokens) => {
                tokens.len() > 1 || matches!(tokens.first(), Some(t) if !matches!(t, Token::Text(_)))
            }
        }
    }

    /// Returns true if the value is an empty string or empty token list.
    pub fn is_empty(&self) -> bool {
        match self {
            KvValue::Str(s) => s.is_empty(),
            KvValue::Tokens(tokens) => tokens.is_empty(),
        }
    }

    /// Converts the value into a token list.
    pub fn into_tokens(self) -> Vec<Token> {
        match self {
            KvValue::Str(s) if s.is_empty() => vec![],
            KvValue::Str(s) => vec![Token::Text(s)],
            KvValue::Tokens(tokens) => tokens,
        }
    }

    /// Returns the value as a token slice. Plain strings have no tokens.
    pub fn tokens(&self) -> &[Token] {
        match self {
            KvValue::Str(_) => &[],
            KvValue::Tokens(tokens) => tokens,
        }
    }
}

impl From<&str> for KvValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KvValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<Token>> for KvValue {
    fn from(value: Vec<Token>) -> Self {
        Self::Tokens(value)
    }
}

/// A tag attribute, or a template argument.
///
/// Keys and values may contain markup (a template inside an attribute value,
/// for example). They are fully expanded only after attribute expansion.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kv {
    /// The key.
    pub k: KvValue,
    /// The value.
    pub v: KvValue,
    /// The key source, when it differs from the key text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ksrc: Option<String>,
    /// The value source, when it differs from the value text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsrc: Option<String>,
    /// The source offsets of the key and value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_offsets: Option<KvOffsets>,
}

impl Kv {
    /// Creates a new key-value pair.
    pub fn new(k: impl Into<KvValue>, v: impl Into<KvValue>) -> Self {
        Self {
            k: k.into(),
            v: v.into(),
            ..Default::default()
        }
    }

    /// Sets the source offsets of the pair.
    #[must_use]
    pub fn with_offsets(mut self, src_offsets: Option<KvOffsets>) -> Self {
        self.src_offsets = src_offsets;
        self
    }

    /// Returns true if the key matches `name`, ignoring ASCII case.
    #[inline]
    fn key_is(&self, name: &str) -> bool {
        self.k.as_str().is_some_and(|k| k.eq_ignore_ascii_case(name))
    }
}

/// A start, end, or self-closing tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Tag {
    /// The tag name.
    pub name: String,
    /// The ordered attribute list.
    pub attribs: Vec<Kv>,
    /// Round-trip metadata.
    #[serde(rename = "dataParsoid")]
    pub dp: DataParsoid,
    /// The editable metadata for encapsulated content.
    #[serde(rename = "dataMw", skip_serializing_if = "Option::is_none")]
    pub data_mw: Option<Box<DataMw>>,
}

impl Tag {
    /// Creates a new tag with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attr(mut self, k: impl Into<KvValue>, v: impl Into<KvValue>) -> Self {
        self.attribs.push(Kv::new(k, v));
        self
    }

    /// Replaces the attribute list.
    #[must_use]
    pub fn with_attribs(mut self, attribs: Vec<Kv>) -> Self {
        self.attribs = attribs;
        self
    }

    /// Replaces the round-trip metadata.
    #[must_use]
    pub fn with_dp(mut self, dp: DataParsoid) -> Self {
        self.dp = dp;
        self
    }

    /// Sets the tag source range.
    #[must_use]
    pub fn with_tsr(mut self, tsr: Option<Span>) -> Self {
        self.dp.tsr = tsr;
        self
    }

    /// Converts the tag into a start tag token.
    #[inline]
    pub fn start(self) -> Token {
        Token::TagStart(self)
    }

    /// Converts the tag into an end tag token.
    #[inline]
    pub fn end(self) -> Token {
        Token::TagEnd(self)
    }

    /// Converts the tag into a self-closing tag token.
    #[inline]
    pub fn self_closing(self) -> Token {
        Token::SelfClosing(self)
    }

    /// Gets the first attribute with the given name.
    pub fn attr(&self, name: &str) -> Option<&KvValue> {
        self.attribs.iter().find(|kv| kv.key_is(name)).map(|kv| &kv.v)
    }

    /// Gets the first attribute with the given name, if its value is a plain
    /// string.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(KvValue::as_str)
    }

    /// Returns true if an attribute with the given name exists.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attribs.iter().any(|kv| kv.key_is(name))
    }

    /// Sets the value of the last attribute with the given name, or adds a new
    /// attribute if none exists.
    pub fn set_attr(&mut self, name: &str, value: impl Into<KvValue>) {
        if let Some(kv) = self.attribs.iter_mut().rev().find(|kv| kv.key_is(name)) {
            kv.v = value.into();
        } else {
            self.attribs.push(Kv::new(name, value));
        }
    }

    /// Adds an attribute without checking for an existing one.
    pub fn add_attr(&mut self, name: &str, value: impl Into<KvValue>) {
        self.attribs.push(Kv::new(name, value));
    }

    /// Removes all attributes with the given name.
    pub fn remove_attr(&mut self, name: &str) {
        self.attribs.retain(|kv| !kv.key_is(name));
    }

    /// Appends `value` to a space-separated attribute such as `typeof`.
    pub fn add_space_separated_attr(&mut self, name: &str, value: &str) {
        if let Some(kv) = self.attribs.iter_mut().find(|kv| kv.key_is(name)) {
            let old = kv.v.to_text();
            kv.v = if old.is_empty() {
                value.into()
            } else {
                format!("{old} {value}").into()
            };
        } else {
            self.attribs.push(Kv::new(name, value));
        }
    }

    /// Returns true if the `typeof` attribute contains the given type.
    pub fn has_typeof(&self, ty: &str) -> bool {
        self.attr("typeof")
            .is_some_and(|v| v.to_text().split_ascii_whitespace().any(|t| t == ty))
    }

    /// Returns the first `typeof` value matching the predicate.
    pub fn typeof_matching(&self, pred: impl Fn(&str) -> bool) -> Option<String> {
        self.attr("typeof").and_then(|v| {
            v.to_text()
                .split_ascii_whitespace()
                .find(|t| pred(t))
                .map(ToString::to_string)
        })
    }

    /// Records the normalised and source values of an attribute, for
    /// attributes that were changed from their original wikitext.
    pub fn set_shadow_info(&mut self, name: &str, value: Option<String>, orig: String) {
        if value.as_deref() == Some(orig.as_str()) {
            return;
        }
        self.dp.a.push((name.to_string(), value));
        self.dp.sa.push((name.to_string(), orig));
    }
}

/// A wikitext token.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Token {
    /// A run of text.
    Text(String),
    /// A start tag.
    TagStart(Tag),
    /// An end tag.
    TagEnd(Tag),
    /// A self-closing tag. Synthetic `meta` markers use this variant too.
    SelfClosing(Tag),
    /// A newline.
    Newline(DataParsoid),
    /// An HTML comment.
    Comment(String, DataParsoid),
    /// The end of the input.
    EndOfInput(DataParsoid),
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::Text(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token::Text(value)
    }
}

impl Token {
    /// Creates a newline token.
    #[inline]
    pub fn newline(tsr: Option<Span>) -> Self {
        Token::Newline(DataParsoid {
            tsr,
            ..Default::default()
        })
    }

    /// Creates an end-of-input token.
    #[inline]
    pub fn eof(tsr: Option<Span>) -> Self {
        Token::EndOfInput(DataParsoid {
            tsr,
            ..Default::default()
        })
    }

    /// Creates a `meta` marker with the given `typeof`.
    pub fn meta(ty: impl Into<String>) -> Tag {
        Tag::new("meta").with_attr("typeof", ty.into())
    }

    /// Returns the tag, if this token is a tag.
    #[inline]
    pub fn tag(&self) -> Option<&Tag> {
        match self {
            Token::TagStart(tag) | Token::TagEnd(tag) | Token::SelfClosing(tag) => Some(tag),
            _ => None,
        }
    }

    /// Returns the tag mutably, if this token is a tag.
    #[inline]
    pub fn tag_mut(&mut self) -> Option<&mut Tag> {
        match self {
            Token::TagStart(tag) | Token::TagEnd(tag) | Token::SelfClosing(tag) => Some(tag),
            _ => None,
        }
    }

    /// Returns the tag name, if this token is a tag.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.tag().map(|tag| tag.name.as_str())
    }

    /// Returns true if this is a start tag with the given name.
    #[inline]
    pub fn is_start(&self, name: &str) -> bool {
        matches!(self, Token::TagStart(tag) if tag.name == name)
    }

    /// Returns true if this is an end tag with the given name.
    #[inline]
    pub fn is_end(&self, name: &str) -> bool {
        matches!(self, Token::TagEnd(tag) if tag.name == name)
    }

    /// Returns true if this is a self-closing tag with the given name.
    #[inline]
    pub fn is_self_closing(&self, name: &str) -> bool {
        matches!(self, Token::SelfClosing(tag) if tag.name == name)
    }

    /// Returns true if this is a `meta` marker with the given `typeof`.
    #[inline]
    pub fn is_meta(&self, ty: &str) -> bool {
        matches!(self, Token::SelfClosing(tag) if tag.name == "meta" && tag.has_typeof(ty))
    }

    /// Returns the text, if this token is text.
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Token::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the round-trip metadata, if this token has any.
    #[inline]
    pub fn dp(&self) -> Option<&DataParsoid> {
        match self {
            Token::Text(_) => None,
            Token::TagStart(tag) | Token::TagEnd(tag) | Token::SelfClosing(tag) => Some(&tag.dp),
            Token::Newline(dp) | Token::Comment(_, dp) | Token::EndOfInput(dp) => Some(dp),
        }
    }

    /// Returns the round-trip metadata mutably, if this token has any.
    #[inline]
    pub fn dp_mut(&mut self) -> Option<&mut DataParsoid> {
        match self {
            Token::Text(_) => None,
            Token::TagStart(tag) | Token::TagEnd(tag) | Token::SelfClosing(tag) => {
                Some(&mut tag.dp)
            }
            Token::Newline(dp) | Token::Comment(_, dp) | Token::EndOfInput(dp) => Some(dp),
        }
    }

    /// Returns the tag source range of the token, if it has one.
    #[inline]
    pub fn tsr(&self) -> Option<Span> {
        self.dp().and_then(|dp| dp.tsr)
    }

    /// Removes build-time data from this token and any nested tokens.
    pub fn strip_build_data(&mut self) {
        if let Some(dp) = self.dp_mut() {
            dp.tmp = Tmp::default();
        }
        if let Some(tag) = self.tag_mut() {
            for kv in &mut tag.attribs {
                for value in [&mut kv.k, &mut kv.v] {
                    if let KvValue::Tokens(tokens) = value {
                        tokens.iter_mut().for_each(Token::strip_build_data);
                    }
                }
            }
        }
    }

    /// Prepares the token for output by stripping build-time data and
    /// serializing any `data-mw` into an attribute.
    pub fn finalize(mut self) -> Result<Self, serde_json::Error> {
        self.strip_build_data();
        if let Some(tag) = self.tag_mut()
            && let Some(data_mw) = tag.data_mw.take()
        {
            let json = serde_json::to_string(&data_mw)?;
            tag.set_attr("data-mw", json);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_helpers() {
        let mut tag = Tag::new("div").with_attr("Class", "a");
        assert_eq!(tag.attr_str("class"), Some("a"));
        tag.set_attr("class", "b");
        assert_eq!(tag.attr_str("CLASS"), Some("b"));
        tag.add_space_separated_attr("typeof", "mw:Transclusion");
        tag.add_space_separated_attr("typeof", "mw:ExpandedAttrs");
        assert!(tag.has_typeof("mw:ExpandedAttrs"));
        assert_eq!(
            tag.attr_str("typeof"),
            Some("mw:Transclusion mw:ExpandedAttrs")
        );
        tag.remove_attr("class");
        assert!(!tag.has_attr("class"));
    }

    #[test]
    fn templated_values() {
        assert!(!KvValue::from("x").is_templated());
        assert!(!KvValue::Tokens(vec!["x".into()]).is_templated());
        assert!(KvValue::Tokens(vec![Tag::new("template").self_closing()]).is_templated());
        assert!(KvValue::Tokens(vec!["a".into(), "b".into()]).is_templated());
    }

    #[test]
    fn finalize_strips_tmp_and_serializes_data_mw() {
        let mut tag = Token::meta("mw:Transclusion");
        tag.dp.tmp.is_html_ext = true;
        tag.data_mw = Some(Box::new(DataMw {
            errors: vec![MwError {
                key: "k".into(),
                message: "m".into(),
                params: vec![],
            }],
            ..Default::default()
        }));
        let token = tag.self_closing().finalize().unwrap();
        let tag = token.tag().unwrap();
        assert_eq!(tag.dp.tmp, Tmp::default());
        assert_eq!(
            tag.attr_str("data-mw"),
            Some(r#"{"errors":[{"key":"k","message":"m"}]}"#)
        );
    }
}
