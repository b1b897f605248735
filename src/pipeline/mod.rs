//! Token transform pipelines.
//!
//! A pipeline is a tokenizer followed by up to three stages of token handlers.
//! Every handler sees the whole output of the handler before it. Asynchronous
//! handler output (template expansion, mostly) is resolved between handlers,
//! so each handler always works on a complete, ordered token sequence.

use crate::{
    handlers::{
        AttributeExpander, ExtensionHandler, IncludeOnly, ListHandler, NoInclude, OnlyInclude,
        ParagraphWrapper, PreHandler, QuoteTransformer, Sanitizer, TemplateHandler,
        TokenStreamPatcher,
    },
    tokenizer::{StartRule, TokenizeError},
    tokens::{Span, Token, utils::shift_tsr},
};
pub use chunk::{Accumulator, Chunk};
pub use data_access::{DataAccess, FetchError, MemoryDataAccess};
pub use env::{Env, Resource};
pub use frame::{Frame, FrameError};
pub use handler::{Ctx, PendingTokens, TokenHandler, Traced, Transform};
use std::rc::Rc;

mod chunk;
mod data_access;
mod env;
mod frame;
mod handler;

/// A pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parse resource limit was exceeded.
    #[error("wt2html: exceeded max resource use: {resource} (limit {limit})")]
    ResourceLimitExceeded {
        /// The exhausted resource.
        resource: Resource,
        /// The configured limit.
        limit: usize,
    },

    /// The tokenizer rejected its input.
    #[error("tokenizer error: {0}")]
    Tokenize(#[from] TokenizeError),

    /// Serializing `data-mw` failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if the error means the input was too large to process.
    #[inline]
    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, Self::ResourceLimitExceeded { .. })
    }
}

/// The standard result type used by all fallible pipeline functions.
pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The kind of pipeline to run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipelineType {
    /// Wikitext to final tokens: tokenizer and all three stages.
    FullDocument,
    /// Wikitext to expanded tokens: tokenizer, stages 1 and 2.
    ExpandedTokens,
    /// Tokens to expanded tokens: stages 1 and 2.
    TokensToExpanded,
    /// Expanded tokens to final tokens: stage 3.
    ExpandedToFinal,
}

impl PipelineType {
    /// The media type name of the pipeline recipe.
    pub fn media_type(self) -> &'static str {
        match self {
            Self::FullDocument => "text/x-mediawiki/full",
            Self::ExpandedTokens => "text/x-mediawiki",
            Self::TokensToExpanded => "tokens/x-mediawiki",
            Self::ExpandedToFinal => "tokens/x-mediawiki/expanded",
        }
    }

    /// Returns true if the pipeline runs the expansion stages.
    #[inline]
    fn expands(self) -> bool {
        !matches!(self, Self::ExpandedToFinal)
    }

    /// Returns true if the pipeline runs the line-oriented final stage.
    #[inline]
    fn finalizes(self) -> bool {
        matches!(self, Self::FullDocument | Self::ExpandedToFinal)
    }
}

/// Options which select a pipeline from the pool. Handlers read them when
/// their state is reset.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Options {
    /// Expand templates and extensions. When false, transclusions are
    /// reconstructed as text.
    pub expand_templates: bool,
    /// The content is (part of) a template expansion, so encapsulation is
    /// left to the outermost transclusion.
    pub in_template: bool,
    /// The content is being transcluded, which changes how inclusion control
    /// tags behave.
    pub is_include: bool,
    /// The extension tag whose content is being processed, if any.
    pub ext_tag: Option<String>,
    /// The content is inline, so no paragraphs are added.
    pub inline_context: bool,
    /// The content is an attribute value.
    pub attr_expansion: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            expand_templates: true,
            in_template: false,
            is_include: false,
            ext_tag: None,
            inline_context: false,
            attr_expansion: false,
        }
    }
}

/// The input to a pipeline.
#[derive(Clone, Debug)]
pub enum Input {
    /// Wikitext, which is tokenized first.
    Wikitext(String),
    /// Tokens, which skip the tokenizer.
    Tokens(Vec<Token>),
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Wikitext(value.to_string())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Wikitext(value)
    }
}

impl From<Vec<Token>> for Input {
    fn from(value: Vec<Token>) -> Self {
        Self::Tokens(value)
    }
}

/// A reusable chain of token handlers.
pub struct Pipeline {
    /// The recipe this pipeline was built from.
    ty: PipelineType,
    /// The options the handlers were last reset with.
    options: Options,
    /// The handlers, in rank order.
    handlers: Vec<Box<dyn TokenHandler>>,
}

impl Pipeline {
    /// Creates a new pipeline of the given type.
    pub fn new(ty: PipelineType, options: Options) -> Self {
        let mut handlers = Vec::<Box<dyn TokenHandler>>::new();
        if ty.expands() {
            handlers.push(Box::new(Traced::new(OnlyInclude::default())));
            handlers.push(Box::new(Traced::new(IncludeOnly::default())));
            handlers.push(Box::new(Traced::new(NoInclude::default())));
            handlers.push(Box::new(Traced::new(TemplateHandler::default())));
            handlers.push(Box::new(Traced::new(ExtensionHandler::default())));
            handlers.push(Box::new(Traced::new(AttributeExpander::default())));
        }
        if ty.finalizes() {
            handlers.push(Box::new(Traced::new(TokenStreamPatcher::default())));
            handlers.push(Box::new(Traced::new(PreHandler::default())));
            handlers.push(Box::new(Traced::new(QuoteTransformer::default())));
            handlers.push(Box::new(Traced::new(ListHandler::default())));
            handlers.push(Box::new(Traced::new(Sanitizer::default())));
            handlers.push(Box::new(Traced::new(ParagraphWrapper::default())));
        }
        let mut pipeline = Self {
            ty,
            options,
            handlers,
        };
        pipeline.reset();
        pipeline
    }

    /// The type of this pipeline.
    #[inline]
    pub fn ty(&self) -> PipelineType {
        self.ty
    }

    /// Resets the state of every handler.
    pub fn reset(&mut self) {
        for handler in &mut self.handlers {
            handler.reset_state(&self.options);
        }
    }

    /// Runs the pipeline to completion.
    ///
    /// Wikitext input is tokenized first and its source ranges are moved to
    /// start at `src_offsets`. Handlers flush their buffers at the end of
    /// input, so token input without an end-of-input token gets one for the
    /// duration of the run.
    pub async fn run(
        &mut self,
        env: &Rc<Env>,
        frame: &Rc<Frame>,
        input: Input,
        sol: bool,
        src_offsets: Option<Span>,
    ) -> Result<Vec<Token>> {
        log::debug!(
            "running {} pipeline at depth {} for '{}'",
            self.ty.media_type(),
            frame.depth(),
            frame.title()
        );

        let mut added_eof = false;
        let mut tokens = match input {
            Input::Wikitext(text) => {
                let mut tokens = env.tokenizer().tokenize(&text, StartRule::Start, sol)?;
                env.bump(Resource::Tokens, tokens.len())?;
                if let Some(offsets) = src_offsets {
                    shift_tsr(&mut tokens, isize::try_from(offsets.start).ok());
                }
                tokens
            }
            Input::Tokens(mut tokens) => {
                if !matches!(tokens.last(), Some(Token::EndOfInput(_))) {
                    tokens.push(Token::eof(None));
                    added_eof = true;
                }
                tokens
            }
        };
        for handler in &mut self.handlers {
            if handler.is_disabled() {
                continue;
            }
            let ctx = Ctx {
                env,
                frame,
                options: &self.options,
                sol,
                src_offsets,
            };
            let chunks = handler.process(&ctx, tokens)?;
            tokens = Accumulator::from(chunks).resolve().await?;
        }

        if added_eof {
            crate::tokens::utils::strip_eof(&mut tokens);
        }

        Ok(tokens)
    }
}
