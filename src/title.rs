//! Types and functions for parsing and formatting MediaWiki title strings.

use crate::config::SiteConfig;
use html_escape::decode_html_entities;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use std::borrow::Cow;

/// The special namespace ID used for direct links to media files.
pub const NS_MEDIA: i32 = -2;
/// The special namespace ID used for dynamic pages.
pub const NS_SPECIAL: i32 = -1;
/// The main namespace ID.
pub const NS_MAIN: i32 = 0;
/// The talk namespace ID.
pub const NS_TALK: i32 = 1;
/// The user namespace ID.
pub const NS_USER: i32 = 2;
/// The project namespace ID.
pub const NS_PROJECT: i32 = 4;
/// The file namespace ID.
pub const NS_FILE: i32 = 6;
/// The system namespace ID.
pub const NS_MEDIAWIKI: i32 = 8;
/// The template namespace ID.
pub const NS_TEMPLATE: i32 = 10;
/// The help namespace ID.
pub const NS_HELP: i32 = 12;
/// The category namespace ID.
pub const NS_CATEGORY: i32 = 14;

/// The title casing strategy for a namespace.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum NamespaceCase {
    /// The first letter of the title is capitalised.
    #[default]
    FirstLetter,
    /// The title is case-sensitive.
    CaseSensitive,
}

/// An article namespace.
#[derive(Clone, Debug, Deserialize, Eq)]
pub struct Namespace {
    /// The namespace ID.
    pub id: i32,
    /// The display name of the namespace.
    pub name: String,
    /// The canonical name of the namespace.
    ///
    /// For example, the canonical 'Project' namespace, present on all MW
    /// installations, is normally given a display name matching the name of the
    /// wiki.
    #[serde(default)]
    pub canonical: Option<String>,
    /// The case folding strategy for titles in the namespace.
    #[serde(default)]
    pub case: NamespaceCase,
    /// Named aliases for the namespace.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Namespace {
    /// Creates a first-letter namespace whose canonical name is its name.
    pub fn new(id: i32, name: &str, aliases: &[&str]) -> Self {
        Self {
            id,
            name: name.into(),
            canonical: (!name.is_empty()).then(|| name.into()),
            case: NamespaceCase::FirstLetter,
            aliases: aliases.iter().map(|alias| (*alias).into()).collect(),
        }
    }

    /// Returns true if this is a talk namespace.
    #[inline]
    pub const fn is_talk(&self) -> bool {
        self.id > NS_MAIN && self.id % 2 == 1
    }

    /// Returns true if `name` is the name, canonical name, or an alias of this
    /// namespace. `name` must already be normalised.
    pub fn is_named(&self, name: &str) -> bool {
        let eq = |other: &str| unicase::UniCase::new(other) == unicase::UniCase::new(name);
        eq(&self.name)
            || self.canonical.as_deref().is_some_and(eq)
            || self.aliases.iter().any(|alias| eq(alias))
    }
}

/// A title parsing error.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TitleError {
    /// The title has no page name.
    #[error("empty title")]
    Empty,
    /// The title contains a character which is not allowed in titles.
    #[error("illegal character {0:?} in title")]
    IllegalChar(char),
    /// The title is a relative path.
    #[error("relative path in title")]
    Relative,
}

/// A normalised article title.
#[derive(Clone, Debug, Eq)]
pub struct Title {
    /// The namespace ID of the title.
    ns: i32,

    /// The location of the namespace delimiter in the title, if one exists.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    ///          ^
    /// ```
    ns_delimiter: Option<usize>,

    /// The location of the fragment delimiter in the title, if one exists.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    ///                         ^
    /// ```
    fragment_delimiter: Option<usize>,

    /// The full title text.
    text: String,
}

impl PartialEq for Title {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Title {
    /// Creates a new [`Title`] from a title string and default namespace.
    ///
    /// A leading colon forces the main namespace. In MediaWiki, this is like
    /// `newFromText`.
    pub fn new(text: &str, default_ns: i32, config: &SiteConfig) -> Result<Self, TitleError> {
        let text = normalize(text);
        let (forced_main, text) = match text.strip_prefix(':') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, &*text),
        };

        let (ns, text) = match text.split_once(':') {
            Some((lhs, rhs)) if !forced_main => match config.namespace_by_name(lhs.trim_end()) {
                Some(ns) => (ns, rhs.trim_start()),
                None => (config.namespace_or_main(default_ns), text),
            },
            _ => (
                config.namespace_or_main(if forced_main { NS_MAIN } else { default_ns }),
                text,
            ),
        };

        let (text, fragment) = text
            .split_once('#')
            .map_or((text, None), |(text, frag)| (text.trim_end(), Some(frag)));

        if text.is_empty() {
            return Err(TitleError::Empty);
        }
        if let Some(c) = text.chars().find(|c| is_illegal(*c)) {
            return Err(TitleError::IllegalChar(c));
        }
        if text == "." || text == ".." || text.starts_with("./") || text.starts_with("../") {
            return Err(TitleError::Relative);
        }

        Ok(Self::from_parts(ns, text, fragment))
    }

    /// Creates a title from a known namespace plus text parts.
    fn from_parts(namespace: &Namespace, title: &str, fragment: Option<&str>) -> Self {
        let mut text = String::with_capacity(namespace.name.len() + title.len() + 1);

        let ns_delimiter = (!namespace.name.is_empty()).then(|| {
            text += &namespace.name;
            text.push(':');
            text.len() - 1
        });

        if namespace.case == NamespaceCase::FirstLetter {
            text += &ucfirst(title);
        } else {
            text += title;
        }

        let fragment_delimiter = fragment.map(|fragment| {
            let fragment_delimiter = text.len();
            text.push('#');
            text += &normalize(fragment);
            fragment_delimiter
        });

        Self {
            ns: namespace.id,
            ns_delimiter,
            fragment_delimiter,
            text,
        }
    }

    /// The namespace ID of the title.
    #[inline]
    pub fn namespace_id(&self) -> i32 {
        self.ns
    }

    /// The namespace part of the title.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    /// ^^^^^^^^^
    /// ```
    pub fn namespace_text(&self) -> &str {
        &self.text[..self.ns_delimiter.unwrap_or(0)]
    }

    /// The title without its fragment.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    /// ^^^^^^^^^^^^^^^^^^^^^^^^
    /// ```
    pub fn key(&self) -> &str {
        &self.text[..self.fragment_delimiter.unwrap_or(self.text.len())]
    }

    /// The path of the page.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    ///           ^^^^^^^^^^^^^^
    /// ```
    pub fn text(&self) -> &str {
        let start_at = self.ns_delimiter.map_or(0, |d| d + 1);
        let end_at = self.fragment_delimiter.unwrap_or(self.text.len());
        &self.text[start_at..end_at]
    }

    /// The page fragment.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    ///                          ^^^^^^^^
    /// ```
    pub fn fragment(&self) -> &str {
        let start_at = self.fragment_delimiter.map_or(self.text.len(), |d| d + 1);
        &self.text[start_at..]
    }

    /// The root path of the page.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    ///           ^^^^^
    /// ```
    pub fn root_text(&self) -> &str {
        let text = self.text();
        text.split_once('/').map_or(text, |(root, _)| root)
    }

    /// The subpage path of the page.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    ///                     ^^^^
    /// ```
    pub fn subpage_text(&self) -> &str {
        let text = self.text();
        text.rsplit_once('/').map_or(text, |(_, sub)| sub)
    }

    /// The full text of the title.
    ///
    /// ```text
    /// Namespace:Title/Sub/Page#Fragment
    /// ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^
    /// ```
    pub fn full_text(&self) -> &str {
        &self.text
    }

    /// Resolves a subpage target relative to this title.
    ///
    /// `/Sub` and `./Sub` name a subpage of this title, and each leading
    /// `../` climbs one level up. Other targets are returned unchanged.
    /// Returns `None` if the target climbs above the root page.
    ///
    /// ```text
    /// A/B/C + ../D  => A/B/D
    /// A/B/C + /D    => A/B/C/D
    /// ```
    pub fn resolve_relative<'a>(&self, target: &'a str) -> Option<Cow<'a, str>> {
        let base = self.key();
        let up = target.len() - target.trim_start_matches("../").len();
        let resolved = if up > 0 {
            let levels = up / 3;
            let bits = base.split('/').collect::<Vec<_>>();
            if bits[0].is_empty() || bits.len() <= levels {
                return None;
            }
            let mut resolved = bits[..bits.len() - levels].join("/");
            let rest = &target[up..];
            if !rest.is_empty() {
                resolved.push('/');
                resolved += rest;
            }
            resolved
        } else if let Some(sub) = target.strip_prefix("./") {
            format!("{base}/{sub}")
        } else if target.starts_with('/') {
            format!("{base}{target}")
        } else {
            return Some(Cow::Borrowed(target));
        };
        Some(Cow::Owned(resolved.trim_end_matches('/').to_string()))
    }

    /// The relative link to the page, e.g. `./Template:Foo_bar`.
    pub fn href(&self) -> String {
        format!(
            "./{}",
            utf8_percent_encode(&self.key().replace(' ', "_"), HREF_ENCODE_SET)
        )
    }
}

impl core::fmt::Display for Title {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}

/// Characters which are escaped in page hrefs.
const HREF_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Returns true if `c` can never appear in a title.
fn is_illegal(c: char) -> bool {
    matches!(c, '<' | '>' | '[' | ']' | '{' | '|' | '}' | '\u{fffd}') || c.is_control()
}

/// Uppercases the first character of `text`.
pub fn ucfirst(text: &str) -> Cow<'_, str> {
    match text.chars().next() {
        Some(first) if first.is_lowercase() => {
            Cow::Owned(format!("{}{}", first.to_uppercase(), &text[first.len_utf8()..]))
        }
        _ => Cow::Borrowed(text),
    }
}

/// Lowercases the first character of `text`.
pub fn lcfirst(text: &str) -> Cow<'_, str> {
    match text.chars().next() {
        Some(first) if first.is_uppercase() => {
            Cow::Owned(format!("{}{}", first.to_lowercase(), &text[first.len_utf8()..]))
        }
        _ => Cow::Borrowed(text),
    }
}

/// Returns true if the given character `c` is a bidirectional text control
/// character.
fn bidi(c: char) -> bool {
    ('\u{200e}'..='\u{200f}').contains(&c) || ('\u{202a}'..='\u{202e}').contains(&c)
}

/// Normalises a title text part by decoding HTML entities and converting
/// runs of whitespace + underscore to a single space character.
pub fn normalize(text: &str) -> Cow<'_, str> {
    let decoded = decode_html_entities(text);
    let mut out = String::new();
    let mut flushed = 0;
    let mut iter = decoded.char_indices().peekable();

    while let Some((index, c)) = iter.next() {
        // Peek to avoid switching to owned-mode when encountering a single
        // space
        if trimmable(c) && (c != ' ' || matches!(iter.peek(), Some((_, c)) if trimmable(*c))) {
            // Non-space whitespace + underscores are converted to space and
            // runs of whitespace are collapsed into a single character
            while iter.next_if(|(_, c)| trimmable(*c)).is_some() {}

            // This acts like `trim`, not emitting a space at the start
            // (`index == 0`) or end (`peek().is_none()`) of the text.
            if let Some((next_index, _)) = iter.peek() {
                out += &decoded[flushed..index];
                flushed = *next_index;
                // Bidi markers get stripped because “Sometimes they slip
                // into cut-n-pasted page titles”
                if index != 0 && spacelike(c) {
                    out.push(' ');
                }
            }
        }
    }

    if flushed == 0 {
        match decoded {
            Cow::Borrowed(b) => Cow::Borrowed(b.trim_matches(trimmable)),
            Cow::Owned(o) => Cow::Owned(o.trim_matches(trimmable).to_string()),
        }
    } else {
        out += decoded[flushed..].trim_end_matches(trimmable);
        Cow::Owned(out.to_string())
    }
}

/// Returns true if the character `c` is considered like whitespace in title
/// text.
fn spacelike(c: char) -> bool {
    c == '_' || c.is_whitespace()
}

/// Returns true if the character `c` is trimmable in title text.
fn trimmable(c: char) -> bool {
    bidi(c) || spacelike(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(super::normalize("A b"), Cow::Borrowed("A b"));
        assert_eq!(super::normalize("A_b"), "A b");
        assert_eq!(super::normalize("A_______b"), "A b");
        assert_eq!(super::normalize("A__  __b"), "A b");
        assert_eq!(super::normalize("A  b"), "A b");
        assert_eq!(super::normalize("   A b   "), Cow::Borrowed("A b"));
        assert_eq!(super::normalize(" \t A b"), Cow::Borrowed("A b"));
        assert_eq!(super::normalize("A b   "), Cow::Borrowed("A b"));
        assert_eq!(super::normalize("\u{200e}A b   \u{202e}"), "A b");
    }

    #[test]
    fn namespaces() {
        let config = SiteConfig::default();
        let title = Title::new("foo_bar", NS_TEMPLATE, &config).unwrap();
        assert_eq!(title.full_text(), "Template:Foo bar");
        assert_eq!(title.namespace_id(), NS_TEMPLATE);
        assert_eq!(title.text(), "Foo bar");
        assert_eq!(title.href(), "./Template:Foo_bar");

        let title = Title::new("tm:x", NS_MAIN, &config).unwrap();
        assert_eq!(title.full_text(), "Template:X");

        let title = Title::new(":Main Page", NS_TEMPLATE, &config).unwrap();
        assert_eq!(title.namespace_id(), NS_MAIN);
        assert_eq!(title.full_text(), "Main Page");

        let title = Title::new("Help:A/b/c#Frag", NS_MAIN, &config).unwrap();
        assert_eq!(title.key(), "Help:A/b/c");
        assert_eq!(title.namespace_text(), "Help");
        assert_eq!(title.root_text(), "A");
        assert_eq!(title.subpage_text(), "c");
        assert_eq!(title.fragment(), "Frag");

        let title = Title::new("Unknown:x", NS_TEMPLATE, &config).unwrap();
        assert_eq!(title.full_text(), "Template:Unknown:x");
    }

    #[test]
    fn invalid() {
        let config = SiteConfig::default();
        assert_eq!(Title::new("", NS_TEMPLATE, &config), Err(TitleError::Empty));
        assert_eq!(
            Title::new("Template:", NS_MAIN, &config),
            Err(TitleError::Empty)
        );
        assert_eq!(
            Title::new("a{b", NS_TEMPLATE, &config),
            Err(TitleError::IllegalChar('{'))
        );
        assert_eq!(
            Title::new("../x", NS_MAIN, &config),
            Err(TitleError::Relative)
        );
    }

    #[test]
    fn relative_targets() {
        let config = SiteConfig::default();
        let page = Title::new("User:A/B/C", NS_MAIN, &config).unwrap();
        assert_eq!(page.resolve_relative("Foo").as_deref(), Some("Foo"));
        assert_eq!(page.resolve_relative("/D").as_deref(), Some("User:A/B/C/D"));
        assert_eq!(page.resolve_relative("./D/").as_deref(), Some("User:A/B/C/D"));
        assert_eq!(page.resolve_relative("../D").as_deref(), Some("User:A/B/D"));
        assert_eq!(page.resolve_relative("../../").as_deref(), Some("User:A"));
        assert_eq!(page.resolve_relative("../../../D"), None);

        let root = Title::new("A", NS_MAIN, &config).unwrap();
        assert_eq!(root.resolve_relative("../D"), None);
    }

    #[test]
    fn first_letter() {
        assert_eq!(ucfirst("éa"), "Éa");
        assert_eq!(lcfirst("ABC"), "aBC");
        assert_eq!(ucfirst(""), "");
    }
}
