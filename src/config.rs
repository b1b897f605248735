//! MediaWiki site configuration.
//!
//! Wikitext documents are not self-encapsulated and cannot be parsed without
//! out-of-band configuration data. The defaults here mirror a stock English
//! language installation. Other installations can be described with JSON (see
//! [`SiteConfig::from_json`]).

use crate::{
    handlers::{ExtensionCall, ExtensionError, extension_tags},
    title::{NS_CATEGORY, NS_MAIN, Namespace},
    tokens::Token,
};
use core::fmt;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use schnellru::{ByLength, LruMap};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    rc::Rc,
    sync::LazyLock,
};

/// A natively implemented extension tag, e.g. `<nowiki>`.
pub trait ExtensionTag {
    /// Converts the extension tag to tokens. An empty token list drops the
    /// tag from the output.
    fn source_to_tokens(
        &self,
        call: ExtensionCall,
    ) -> LocalBoxFuture<'static, Result<Vec<Token>, ExtensionError>>;
}

/// Parse resource limits.
///
/// Exceeding any limit aborts the parse with
/// [`Error::ResourceLimitExceeded`](crate::pipeline::Error::ResourceLimitExceeded).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Limits {
    /// The maximum template expansion depth.
    pub max_depth: usize,
    /// The maximum number of transclusions in one parse.
    pub max_transclusions: usize,
    /// The maximum number of list items in one parse.
    pub max_list_items: usize,
    /// The maximum number of table cells in one parse.
    pub max_table_cells: usize,
    /// The maximum number of tokens produced by the tokenizer in one parse.
    pub max_tokens: usize,
    /// The maximum size of the source wikitext, in bytes.
    pub max_wikitext_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: 40,
            max_transclusions: 10_000,
            max_list_items: 30_000,
            max_table_cells: 30_000,
            max_tokens: 1_000_000,
            max_wikitext_size: 1_000_000,
        }
    }
}

/// Function hooks enabled by default, lowercased. Hooks which must be called
/// with a `#` include it.
static FUNCTION_HOOKS: phf::Set<&str> = phf::phf_set! {
    "#if", "#ifeq", "#switch", "#tag", "#language", "#ifexist", "#ifexpr",
    "#iferror", "#expr", "#time", "#invoke", "#titleparts", "#rel2abs",
    "ns", "nse", "urlencode", "lcfirst", "ucfirst", "lc", "uc", "localurl",
    "fullurl", "formatnum", "grammar", "gender", "plural", "padleft",
    "padright", "anchorencode", "defaultsort", "pagename", "pagenamee",
    "fullpagename", "fullpagenamee", "namespace", "namespacee", "subpagename",
    "rootpagename", "basepagename", "talkpagename", "displaytitle", "int",
    "special",
};

/// Variables enabled by default. Variables are case-sensitive.
static VARIABLES: phf::Set<&str> = phf::phf_set! {
    "!", "=", "SITENAME", "PAGENAME", "PAGENAMEE", "FULLPAGENAME",
    "FULLPAGENAMEE", "NAMESPACE", "NAMESPACEE", "NAMESPACENUMBER",
    "SUBPAGENAME", "ROOTPAGENAME", "BASEPAGENAME", "TALKPAGENAME",
    "CURRENTYEAR", "CURRENTMONTH", "CURRENTDAY", "CURRENTTIME",
    "CURRENTTIMESTAMP", "ARTICLEPATH", "SERVER", "SERVERNAME", "DIRECTIONMARK",
    "CONTENTLANGUAGE", "REVISIONID",
};

/// Behavior switch words enabled by default, without the surrounding
/// underscores.
const BEHAVIOR_SWITCHES: &[&str] = &[
    "NOTOC",
    "NOGALLERY",
    "FORCETOC",
    "TOC",
    "NOEDITSECTION",
    "NEWSECTIONLINK",
    "NONEWSECTIONLINK",
    "HIDDENCAT",
    "EXPECTUNUSEDCATEGORY",
    "INDEX",
    "NOINDEX",
    "STATICREDIRECT",
    "NOTITLECONVERT",
    "NOCONTENTCONVERT",
    "DISAMBIG",
];

/// URL protocols allowed in links by default, lowercased.
const URL_PROTOCOLS: &[&str] = &[
    "bitcoin:", "ftp://", "ftps://", "geo:", "git://", "gopher://", "http://",
    "https://", "irc://", "ircs://", "magnet:", "mailto:", "mms://", "news:",
    "nntp://", "redis://", "sftp://", "sip:", "sips:", "sms:", "ssh://",
    "svn://", "tel:", "telnet://", "urn:", "worldwind://", "xmpp:", "//",
];

/// The main namespace, used when a configuration has none.
static MAIN: LazyLock<Namespace> = LazyLock::new(|| Namespace::new(NS_MAIN, "", &[]));

/// Site specific configuration of a wiki.
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SiteConfig {
    /// The site name, for `{{SITENAME}}`.
    pub site_name: String,
    /// The article path, with `$1` standing in for the page title.
    pub article_path: String,
    /// The content language code.
    pub lang: String,
    /// Registered title namespaces.
    pub namespaces: Vec<Namespace>,
    /// Registered function hooks, lowercased.
    pub function_hooks: HashSet<String>,
    /// Registered variables.
    pub variables: HashSet<String>,
    /// Localised magic word aliases, lowercased, mapped to their canonical
    /// names.
    pub magic_word_aliases: HashMap<String, String>,
    /// Words that can appear between `__` and `__`.
    pub behavior_switches: Vec<String>,
    /// URL protocols allowed in links, lowercased.
    pub url_protocols: Vec<String>,
    /// Resource limits.
    pub limits: Limits,
    /// Registered native extension tags, keyed by lowercased tag name.
    #[serde(skip)]
    extension_tags: IndexMap<String, Rc<dyn ExtensionTag>>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        let mut config = Self {
            site_name: "Wikipedia".into(),
            article_path: "/wiki/$1".into(),
            lang: "en".into(),
            namespaces: vec![
                Namespace::new(-2, "Media", &[]),
                Namespace::new(-1, "Special", &[]),
                Namespace::new(NS_MAIN, "", &[]),
                Namespace::new(1, "Talk", &[]),
                Namespace::new(2, "User", &[]),
                Namespace::new(3, "User talk", &[]),
                Namespace::new(4, "Project", &["WP"]),
                Namespace::new(6, "File", &["Image"]),
                Namespace::new(8, "MediaWiki", &[]),
                Namespace::new(10, "Template", &["TM"]),
                Namespace::new(12, "Help", &[]),
                Namespace::new(NS_CATEGORY, "Category", &[]),
            ],
            function_hooks: FUNCTION_HOOKS.iter().map(|hook| (*hook).into()).collect(),
            variables: VARIABLES.iter().map(|var| (*var).into()).collect(),
            magic_word_aliases: HashMap::new(),
            behavior_switches: BEHAVIOR_SWITCHES.iter().map(|word| (*word).into()).collect(),
            url_protocols: URL_PROTOCOLS.iter().map(|proto| (*proto).into()).collect(),
            limits: Limits::default(),
            extension_tags: IndexMap::new(),
        };
        config.register_native_tags();
        config
    }
}

impl fmt::Debug for SiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteConfig")
            .field("site_name", &self.site_name)
            .field("lang", &self.lang)
            .field("namespaces", &self.namespaces.len())
            .field("extension_tags", &self.extension_tags.keys())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SiteConfig {
    /// Loads a configuration from JSON. Missing fields take their default
    /// values. The native extension tags are always registered.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config = serde_json::from_str::<Self>(json)?;
        if config.extension_tags.is_empty() {
            config.register_native_tags();
        }
        Ok(config)
    }

    /// Returns true if `url` starts with an allowed protocol.
    pub fn has_valid_protocol(&self, url: &str) -> bool {
        self.url_protocols.iter().any(|proto| {
            url.get(..proto.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(proto))
        })
    }

    /// Registers the extension tags implemented by this crate.
    fn register_native_tags(&mut self) {
        self.register_extension_tag("nowiki", Rc::new(extension_tags::NoWiki));
        self.register_extension_tag("pre", Rc::new(extension_tags::Pre));
        self.register_extension_tag("poem", Rc::new(extension_tags::Poem));
    }

    /// Finds the namespace with the given numeric ID.
    pub fn namespace(&self, id: i32) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.id == id)
    }

    /// Finds the namespace with the given numeric ID, or the main namespace
    /// if there is no such namespace.
    pub fn namespace_or_main(&self, id: i32) -> &Namespace {
        self.namespace(id)
            .or_else(|| self.namespace(NS_MAIN))
            .unwrap_or(&MAIN)
    }

    /// Finds the namespace with the given case-insensitive name. Searches the
    /// name, canonical name, and all aliases.
    pub fn namespace_by_name(&self, name: &str) -> Option<&Namespace> {
        let name = name.replace('_', " ");
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.namespaces.iter().find(|ns| ns.is_named(name))
    }

    /// Returns all names of the namespace with the given ID.
    pub fn namespace_names(&self, id: i32) -> impl Iterator<Item = &str> {
        self.namespace(id).into_iter().flat_map(|ns| {
            core::iter::once(ns.name.as_str())
                .chain(ns.canonical.as_deref())
                .chain(ns.aliases.iter().map(String::as_str))
        })
    }

    /// Returns the canonical name of a function hook, without any leading
    /// `#`, if `name` is a registered function hook or an alias of one.
    pub fn function_hook(&self, name: &str) -> Option<String> {
        let name = name.to_lowercase();
        if let Some(canonical) = self.magic_word_aliases.get(&name) {
            return Some(canonical.trim_start_matches('#').to_string());
        }
        self.function_hooks
            .contains(&name)
            .then(|| name.trim_start_matches('#').to_string())
    }

    /// Returns the canonical name of a variable, if `name` is a registered
    /// variable or an alias of one.
    pub fn variable(&self, name: &str) -> Option<String> {
        if self.variables.contains(name) {
            Some(name.to_lowercase())
        } else {
            self.magic_word_aliases
                .get(&name.to_lowercase())
                .filter(|canonical| self.variables.contains(canonical.to_uppercase().as_str()))
                .cloned()
        }
    }

    /// Returns true if `word` is `canonical` or one of its aliases.
    pub fn is_magic_word(&self, canonical: &str, word: &str) -> bool {
        let word = word.trim().to_lowercase();
        word == canonical || self.magic_word_aliases.get(&word).is_some_and(|c| c == canonical)
    }

    /// Finds the extension tag with the given name.
    pub fn extension_tag(&self, name: &str) -> Option<Rc<dyn ExtensionTag>> {
        self.extension_tags.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Returns the names of all registered extension tags.
    pub fn extension_tag_names(&self) -> impl Iterator<Item = &str> {
        self.extension_tags.keys().map(String::as_str)
    }

    /// Registers an extension tag, replacing any existing tag with the same
    /// name.
    pub fn register_extension_tag(&mut self, name: &str, tag: Rc<dyn ExtensionTag>) {
        self.extension_tags.insert(name.to_ascii_lowercase(), tag);
    }
}

/// A cache of site configurations, keyed by wiki ID.
///
/// The cache is owned by whatever long-lived object creates parse
/// environments.
pub struct ConfigCache {
    /// Cached configurations.
    map: LruMap<String, Rc<SiteConfig>, ByLength>,
}

impl ConfigCache {
    /// Creates a new cache holding at most `capacity` configurations.
    pub fn new(capacity: u32) -> Self {
        Self {
            map: LruMap::new(ByLength::new(capacity)),
        }
    }

    /// Returns the cached configuration for `wiki_id`, or creates and caches
    /// one with `load`.
    pub fn get_or_insert<E>(
        &mut self,
        wiki_id: &str,
        load: impl FnOnce() -> Result<SiteConfig, E>,
    ) -> Result<Rc<SiteConfig>, E> {
        if let Some(config) = self.map.get(wiki_id) {
            return Ok(Rc::clone(config));
        }
        log::debug!("loading site configuration for {wiki_id}");
        let config = Rc::new(load()?);
        self.map.insert(wiki_id.to_string(), Rc::clone(&config));
        Ok(config)
    }

    /// Removes all cached configurations.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// The number of cached configurations.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new(16)
    }
}
