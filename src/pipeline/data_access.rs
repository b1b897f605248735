//! Template source retrieval.

use crate::title::Title;
use futures::{FutureExt as _, future::LocalBoxFuture};
use std::{collections::HashMap, fs, io, path::Path};

/// A template fetch error.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// A source of template wikitext.
pub trait DataAccess {
    /// Fetches the wikitext of the given page. A page which does not exist is
    /// `Ok(None)`.
    fn fetch_template(&self, title: &Title)
    -> LocalBoxFuture<'static, Result<Option<String>, FetchError>>;
}

/// An in-memory page store.
#[derive(Debug, Default)]
pub struct MemoryDataAccess {
    /// Page wikitext keyed by title key.
    pages: HashMap<String, String>,
}

impl MemoryDataAccess {
    /// Adds or replaces a page.
    pub fn insert(&mut self, title: &Title, wikitext: impl Into<String>) {
        self.pages.insert(title.key().to_string(), wikitext.into());
    }

    /// Loads every `*.wiki` file in `dir`. File stems are page titles, and
    /// titles without a namespace prefix are placed in `default_ns`.
    pub fn from_dir(
        dir: &Path,
        default_ns: i32,
        config: &crate::config::SiteConfig,
    ) -> Result<Self, FetchError> {
        let mut store = Self::default();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "wiki") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Title::new(stem, default_ns, config) {
                Ok(title) => {
                    log::debug!("loading '{title}' from {}", path.display());
                    store.insert(&title, fs::read_to_string(&path)?);
                }
                Err(err) => log::warn!("skipping {}: {err}", path.display()),
            }
        }
        Ok(store)
    }

    /// The number of stored pages.
    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if there are no stored pages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl DataAccess for MemoryDataAccess {
    fn fetch_template(
        &self,
        title: &Title,
    ) -> LocalBoxFuture<'static, Result<Option<String>, FetchError>> {
        let page = self.pages.get(title.key()).cloned();
        async move { Ok(page) }.boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SiteConfig, title::NS_TEMPLATE};
    use futures::executor::block_on;

    #[test]
    fn memory_store() {
        let config = SiteConfig::default();
        let mut store = MemoryDataAccess::default();
        store.insert(&Title::new("Template:Echo", 0, &config).unwrap(), "{{{1}}}");
        let title = Title::new("echo", NS_TEMPLATE, &config).unwrap();
        assert_eq!(
            block_on(store.fetch_template(&title)).unwrap().as_deref(),
            Some("{{{1}}}")
        );
        let missing = Title::new("Nope", NS_TEMPLATE, &config).unwrap();
        assert!(block_on(store.fetch_template(&missing)).unwrap().is_none());
    }
}
