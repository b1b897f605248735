//! A wikitext tokenizer covering the constructs the token handlers operate
//! on.
//!
//! The tokenizer is stateless apart from the site tables it is built from, so
//! one instance can be shared by every pipeline of a parse.

use crate::{
    config::SiteConfig,
    tokens::{Kv, Token},
};
use std::collections::HashSet;

mod grammar;
#[cfg(test)]
mod tests;

/// A tokenizer error.
pub type TokenizeError = peg::error::ParseError<peg::str::LineCol>;

/// The grammar production to start tokenizing from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StartRule {
    /// A complete document. The output ends with an end-of-input token.
    Start,
    /// A single table start tag, `{|` and its attributes.
    TableStartTag,
    /// A single list item line.
    ListItem,
    /// A run of HTML-style attributes. The output is a single self-closing
    /// `attributes` tag which carries the attributes.
    GenericNewlineAttributes,
}

/// A source of tokens.
pub trait Tokenizer {
    /// Tokenizes `src` starting from the given production. If `sol` is true,
    /// the input is considered to begin at the start of a line.
    fn tokenize(&self, src: &str, rule: StartRule, sol: bool) -> Result<Vec<Token>, TokenizeError>;

    /// Tokenizes `src` as a run of attributes.
    fn tokenize_attributes(&self, src: &str) -> Result<Vec<Kv>, TokenizeError> {
        let mut tokens = self.tokenize(src, StartRule::GenericNewlineAttributes, false)?;
        Ok(match tokens.pop() {
            Some(Token::SelfClosing(tag)) => tag.attribs,
            _ => Vec::new(),
        })
    }
}

/// The bundled PEG tokenizer.
#[derive(Debug, Default)]
pub struct PegTokenizer {
    /// Lowercased names of registered extension tags.
    extension_tags: HashSet<String>,
    /// Uppercased behavior switch words, without underscores.
    behavior_switches: HashSet<String>,
    /// Lowercased local names and aliases of the category namespace.
    category_prefixes: Vec<String>,
}

impl PegTokenizer {
    /// Creates a tokenizer for the given site.
    pub fn new(config: &SiteConfig) -> Self {
        Self {
            extension_tags: config
                .extension_tag_names()
                .map(str::to_ascii_lowercase)
                .collect(),
            behavior_switches: config
                .behavior_switches
                .iter()
                .map(|word| word.to_uppercase())
                .collect(),
            category_prefixes: config
                .namespace_names(crate::title::NS_CATEGORY)
                .map(str::to_lowercase)
                .collect(),
        }
    }

    /// Returns true if `name` is a registered extension tag.
    #[inline]
    fn is_extension_tag(&self, name: &str) -> bool {
        self.extension_tags.contains(&name.to_ascii_lowercase())
    }

    /// Returns true if `word` is a behavior switch, e.g. `NOTOC`.
    #[inline]
    fn is_behavior_switch(&self, word: &str) -> bool {
        self.behavior_switches.contains(&word.to_uppercase())
    }

    /// If `target` is a category link target, returns the part after the
    /// namespace prefix.
    fn category_name<'a>(&self, target: &'a str) -> Option<&'a str> {
        let (prefix, name) = target.split_once(':')?;
        let prefix = prefix.trim().to_lowercase().replace('_', " ");
        self.category_prefixes
            .iter()
            .any(|p| *p == prefix)
            .then_some(name)
    }
}

impl Tokenizer for PegTokenizer {
    fn tokenize(&self, src: &str, rule: StartRule, sol: bool) -> Result<Vec<Token>, TokenizeError> {
        let state = grammar::State {
            tokenizer: self,
            sol,
        };
        log::trace!("tokenizing {rule:?} ({} bytes, sol: {sol})", src.len());
        match rule {
            StartRule::Start => grammar::wikitext::start(src, &state),
            StartRule::TableStartTag => grammar::wikitext::table_start_tag_only(src, &state),
            StartRule::ListItem => grammar::wikitext::list_item_only(src, &state),
            StartRule::GenericNewlineAttributes => {
                grammar::wikitext::generic_newline_attributes(src, &state).map(|attribs| {
                    vec![
                        crate::tokens::Tag::new("attributes")
                            .with_attribs(attribs)
                            .self_closing(),
                    ]
                })
            }
        }
    }
}
