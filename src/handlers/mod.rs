//! Token handlers.
//!
//! Stage 1 handles inclusion control tags, stage 2 expands templates,
//! extensions, and attributes, and stage 3 does the line-oriented work that
//! needs the fully expanded token stream.

pub use attributes::AttributeExpander;
pub use extension::{ExtensionCall, ExtensionError, ExtensionHandler};
pub use include::{IncludeOnly, NoInclude, OnlyInclude};
pub use lists::ListHandler;
pub use paragraphs::ParagraphWrapper;
pub use patcher::TokenStreamPatcher;
pub use pre::PreHandler;
pub use quotes::QuoteTransformer;
pub use sanitizer::Sanitizer;
pub use template::TemplateHandler;

mod attributes;
mod collector;
mod encapsulator;
mod extension;
pub mod extension_tags;
mod include;
mod lists;
mod paragraphs;
mod parser_fns;
mod patcher;
mod pre;
mod quotes;
mod sanitizer;
mod template;
