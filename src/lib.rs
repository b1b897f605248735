//! A token transform pipeline which turns MediaWiki wikitext into a flat
//! stream of tokens with enough source information to reproduce the original
//! wikitext.
//!
//! The entry point is [`pipeline::Env::parse`]. An [`Env`](pipeline::Env)
//! holds everything one parse shares: the [site configuration](config), the
//! [tokenizer], the template source, and a pool of reusable pipelines.

pub mod config;
pub mod handlers;
pub mod pipeline;
pub mod title;
pub mod tokenizer;
pub mod tokens;

#[cfg(test)]
mod tests;

pub use config::SiteConfig;
pub use pipeline::{Env, Options, PipelineType};
pub use tokens::Token;
