//! The parse environment.

use super::{
    DataAccess, Error, Frame, Input, Options, PendingTokens, Pipeline, PipelineType, Result,
};
use crate::{
    config::SiteConfig,
    title::{Title, TitleError},
    tokenizer::{PegTokenizer, Tokenizer},
    tokens::{Span, Token},
};
use core::{cell::{Cell, RefCell}, fmt};
use futures::{
    FutureExt as _,
    future::{LocalBoxFuture, Shared},
};
use indexmap::IndexMap;
use std::{collections::HashMap, rc::Rc};

/// The maximum number of idle pipelines kept per pipeline type and options.
const MAX_IDLE_PIPELINES: usize = 100;

/// A shared, de-duplicated template fetch.
type SharedFetch = Shared<LocalBoxFuture<'static, Option<Rc<str>>>>;

/// A metered parse resource.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Resource {
    /// Template and parser function calls.
    Transclusions,
    /// List items.
    ListItems,
    /// Table cells.
    TableCells,
    /// Tokenizer output.
    Tokens,
    /// Source wikitext bytes.
    WikitextSize,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transclusions => "transclusion",
            Self::ListItems => "listItem",
            Self::TableCells => "tableCell",
            Self::Tokens => "token",
            Self::WikitextSize => "wikitextSize",
        })
    }
}

/// Per-parse state shared by every pipeline of the parse.
///
/// Nothing in here outlives the parse or is shared with another parse.
pub struct Env {
    /// The site configuration.
    config: Rc<SiteConfig>,
    /// The tokenizer.
    tokenizer: Rc<dyn Tokenizer>,
    /// The template source.
    data_access: Rc<dyn DataAccess>,
    /// The title of the page being parsed.
    page: Title,
    /// The next about id.
    next_about: Cell<usize>,
    /// Idle pipelines.
    pipelines: RefCell<HashMap<(PipelineType, Options), Vec<Pipeline>>>,
    /// Fetched or in-flight template sources, keyed by title.
    transclusions: RefCell<HashMap<String, SharedFetch>>,
    /// The number of fetches actually sent to the data source.
    fetches: Cell<usize>,
    /// Extension output keyed by extension source.
    extension_cache: RefCell<HashMap<String, Vec<Token>>>,
    /// Page properties set by parser functions.
    page_props: RefCell<IndexMap<String, String>>,
    /// Consumed resources.
    usage: RefCell<HashMap<Resource, usize>>,
}

impl Env {
    /// Creates an environment for parsing the page `page` with the bundled
    /// tokenizer.
    pub fn new(
        config: Rc<SiteConfig>,
        data_access: Rc<dyn DataAccess>,
        page: &str,
    ) -> Result<Rc<Self>, TitleError> {
        let tokenizer = Rc::new(PegTokenizer::new(&config));
        Self::with_tokenizer(config, data_access, tokenizer, page)
    }

    /// Creates an environment with a custom tokenizer.
    pub fn with_tokenizer(
        config: Rc<SiteConfig>,
        data_access: Rc<dyn DataAccess>,
        tokenizer: Rc<dyn Tokenizer>,
        page: &str,
    ) -> Result<Rc<Self>, TitleError> {
        let page = Title::new(page, crate::title::NS_MAIN, &config)?;
        Ok(Rc::new(Self {
            config,
            tokenizer,
            data_access,
            page,
            next_about: Cell::new(1),
            pipelines: <_>::default(),
            transclusions: <_>::default(),
            fetches: Cell::new(0),
            extension_cache: <_>::default(),
            page_props: <_>::default(),
            usage: <_>::default(),
        }))
    }

    /// The site configuration.
    #[inline]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// The tokenizer.
    #[inline]
    pub fn tokenizer(&self) -> &dyn Tokenizer {
        &*self.tokenizer
    }

    /// The title of the page being parsed.
    #[inline]
    pub fn page(&self) -> &Title {
        &self.page
    }

    /// Creates a new about id, e.g. `#mwt1`.
    pub fn new_about_id(&self) -> String {
        let id = self.next_about.get();
        self.next_about.set(id + 1);
        format!("#mwt{id}")
    }

    /// Consumes `amount` of `resource`.
    pub fn bump(&self, resource: Resource, amount: usize) -> Result {
        let limits = &self.config.limits;
        let limit = match resource {
            Resource::Transclusions => limits.max_transclusions,
            Resource::ListItems => limits.max_list_items,
            Resource::TableCells => limits.max_table_cells,
            Resource::Tokens => limits.max_tokens,
            Resource::WikitextSize => limits.max_wikitext_size,
        };
        let mut usage = self.usage.borrow_mut();
        let used = usage.entry(resource).or_default();
        *used += amount;
        if *used > limit {
            log::warn!("{resource} limit {limit} exceeded");
            Err(Error::ResourceLimitExceeded { resource, limit })
        } else {
            Ok(())
        }
    }

    /// Fetches the source of a page. Concurrent and repeated requests for the
    /// same page share one fetch. Fetch errors are logged and treated as a
    /// missing page.
    pub fn fetch_template(&self, title: &Title) -> SharedFetch {
        let mut transclusions = self.transclusions.borrow_mut();
        transclusions
            .entry(title.key().to_string())
            .or_insert_with(|| {
                self.fetches.set(self.fetches.get() + 1);
                let fetch = self.data_access.fetch_template(title);
                let name = title.key().to_string();
                async move {
                    match fetch.await {
                        Ok(source) => source.map(Rc::from),
                        Err(err) => {
                            log::warn!("failed to fetch '{name}': {err}");
                            None
                        }
                    }
                }
                .boxed_local()
                .shared()
            })
            .clone()
    }

    /// The number of fetches sent to the data source.
    #[inline]
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }

    /// Returns the cached output of the extension with the given source.
    pub fn cached_extension(&self, src: &str) -> Option<Vec<Token>> {
        self.extension_cache.borrow().get(src).cloned()
    }

    /// Caches the output of the extension with the given source.
    pub fn cache_extension(&self, src: &str, tokens: &[Token]) {
        self.extension_cache
            .borrow_mut()
            .insert(src.to_string(), tokens.to_vec());
    }

    /// Sets a page property.
    pub fn set_page_prop(&self, name: &str, value: impl Into<String>) {
        self.page_props
            .borrow_mut()
            .insert(name.to_string(), value.into());
    }

    /// Gets a page property.
    pub fn page_prop(&self, name: &str) -> Option<String> {
        self.page_props.borrow().get(name).cloned()
    }

    /// Parses the page source into final tokens.
    pub async fn parse(self: &Rc<Self>, src: &str, options: Options) -> Result<Vec<Token>> {
        self.bump(Resource::WikitextSize, src.len())?;
        let frame = Frame::new_root(self.page.clone(), src);
        self.process_content(
            &frame,
            Input::Wikitext(src.to_string()),
            PipelineType::FullDocument,
            options,
            true,
            None,
        )
        .await
    }

    /// Runs `input` through a pooled pipeline.
    pub fn process_content(
        self: &Rc<Self>,
        frame: &Rc<Frame>,
        input: Input,
        ty: PipelineType,
        options: Options,
        sol: bool,
        src_offsets: Option<Span>,
    ) -> PendingTokens {
        let env = Rc::clone(self);
        let frame = Rc::clone(frame);
        async move {
            let key = (ty, options);
            let pipeline = env.take_pipeline(&key);
            let mut pipeline = scopeguard::guard(pipeline, |pipeline| {
                env.return_pipeline(key, pipeline);
            });
            pipeline.run(&env, &frame, input, sol, src_offsets).await
        }
        .boxed_local()
    }

    /// Takes a pipeline from the pool, or makes a new one.
    fn take_pipeline(&self, key: &(PipelineType, Options)) -> Pipeline {
        let pooled = self
            .pipelines
            .borrow_mut()
            .get_mut(key)
            .and_then(Vec::pop);
        if let Some(mut pipeline) = pooled {
            pipeline.reset();
            pipeline
        } else {
            log::trace!("new {} pipeline: {:?}", key.0.media_type(), key.1);
            Pipeline::new(key.0, key.1.clone())
        }
    }

    /// Returns a pipeline to the pool.
    fn return_pipeline(&self, key: (PipelineType, Options), pipeline: Pipeline) {
        let mut pipelines = self.pipelines.borrow_mut();
        let idle = pipelines.entry(key).or_default();
        if idle.len() < MAX_IDLE_PIPELINES {
            idle.push(pipeline);
        }
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("page", &self.page)
            .field("next_about", &self.next_about)
            .field("fetches", &self.fetches)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipeline::MemoryDataAccess, title::NS_TEMPLATE};
    use futures::{executor::block_on, future::join};

    fn env_with(pages: &[(&str, &str)]) -> Rc<Env> {
        let config = SiteConfig::default();
        let mut store = MemoryDataAccess::default();
        for (title, text) in pages {
            store.insert(&Title::new(title, NS_TEMPLATE, &config).unwrap(), *text);
        }
        Env::new(Rc::new(config), Rc::new(store), "Main Page").unwrap()
    }

    #[test]
    fn about_ids() {
        let env = env_with(&[]);
        assert_eq!(env.new_about_id(), "#mwt1");
        assert_eq!(env.new_about_id(), "#mwt2");
    }

    #[test]
    fn fetches_are_shared() {
        let env = env_with(&[("Foo", "foo")]);
        let title = Title::new("Foo", NS_TEMPLATE, env.config()).unwrap();
        let (a, b) = block_on(join(env.fetch_template(&title), env.fetch_template(&title)));
        assert_eq!(a.as_deref(), Some("foo"));
        assert_eq!(b.as_deref(), Some("foo"));
        assert_eq!(block_on(env.fetch_template(&title)).as_deref(), Some("foo"));
        assert_eq!(env.fetch_count(), 1);

        let missing = Title::new("Bar", NS_TEMPLATE, env.config()).unwrap();
        assert!(block_on(env.fetch_template(&missing)).is_none());
        assert_eq!(env.fetch_count(), 2);
    }

    #[test]
    fn resource_limits() {
        let env = env_with(&[]);
        let limit = env.config().limits.max_list_items;
        assert!(env.bump(Resource::ListItems, limit).is_ok());
        let err = env.bump(Resource::ListItems, 1).unwrap_err();
        assert!(err.is_payload_too_large());
        assert_eq!(
            err.to_string(),
            format!("wt2html: exceeded max resource use: listItem (limit {limit})")
        );
    }

    #[test]
    fn pipelines_are_reused() {
        let env = env_with(&[]);
        let frame = Frame::new_root(env.page().clone(), "");
        for _ in 0..3 {
            block_on(env.process_content(
                &frame,
                "x".into(),
                PipelineType::ExpandedTokens,
                Options::default(),
                true,
                None,
            ))
            .unwrap();
        }
        let pipelines = env.pipelines.borrow();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines.values().next().map(Vec::len), Some(1));
    }
}
