//! The editable metadata of encapsulated content.
//!
//! The key names here are an external contract with editing clients, so they
//! are spelled out with explicit renames instead of relying on a blanket case
//! conversion.

use super::Span;
use indexmap::IndexMap;
use serde::Serialize;

/// The `data-mw` payload of an encapsulation start marker or an element with
/// expanded attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DataMw {
    /// The extension tag name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The extension tag attributes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<IndexMap<String, String>>,
    /// The extension tag body. Absent for self-closed extension tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<ExtBody>,
    /// The transclusion parts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    /// The original and expanded forms of templated attributes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attribs: Vec<ExpandedAttr>,
    /// Errors encountered while expanding the content.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<MwError>,
}

/// An extension tag body.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtBody {
    /// The raw source between the start and end tags.
    pub extsrc: String,
}

/// One part of a transclusion.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Part {
    /// Literal wikitext between adjacent transclusions.
    Text(String),
    /// A template or parser function.
    Template {
        /// The template.
        template: TemplateInfo,
    },
    /// A template argument.
    TemplateArg {
        /// The argument.
        templatearg: TemplateInfo,
    },
}

/// The target and parameters of a transclusion.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TemplateInfo {
    /// The transclusion target.
    pub target: Target,
    /// Parameters in source order, keyed by name or position.
    pub params: IndexMap<String, Param>,
    /// The index of this part within the transclusion.
    pub i: usize,
}

/// A transclusion target.
///
/// Exactly one of `href` or `function` is set, except for template arguments
/// which have neither.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Target {
    /// The target wikitext.
    pub wt: String,
    /// The resolved template page link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// The parser function name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// A transclusion parameter.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Param {
    /// The key source, when it differs from the normalised key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ParamKey>,
    /// The value wikitext.
    pub wt: String,
    /// The value rendered as HTML.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// The source of a parameter key.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParamKey {
    /// The key wikitext.
    pub wt: String,
}

/// Whitespace and naming information for one transclusion parameter, kept in
/// round-trip data so that the serializer can restore the original spacing.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParamInfo {
    /// The normalised key.
    pub k: String,
    /// Whether the parameter was explicitly named in the source.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub named: bool,
    /// Whitespace around the key and value: before key, after key, before
    /// value, after value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spc: Option<[String; 4]>,
}

/// The original and expanded forms of one attribute.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExpandedAttr(pub AttrKey, pub AttrValue);

/// The key half of an expanded attribute.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AttrKey {
    /// The expanded key text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txt: Option<String>,
    /// The expanded key as HTML, when the key itself was templated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// The key source offsets.
    #[serde(rename = "srcOffsets", skip_serializing_if = "Option::is_none")]
    pub src_offsets: Option<Span>,
    /// The key is only part of a template's output and cannot be edited on
    /// its own.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub uneditable: bool,
}

/// The value half of an expanded attribute.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AttrValue {
    /// The expanded value as HTML.
    pub html: String,
    /// The value source offsets.
    #[serde(rename = "srcOffsets", skip_serializing_if = "Option::is_none")]
    pub src_offsets: Option<Span>,
    /// The value is only part of a template's output and cannot be edited on
    /// its own.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub uneditable: bool,
}

/// An error recorded on encapsulated content.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MwError {
    /// The message key.
    pub key: String,
    /// The fallback message text.
    pub message: String,
    /// Message parameters.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}
