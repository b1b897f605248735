//! The token handler contract.

use super::{Accumulator, Chunk, Env, Frame, Options, Result};
use crate::tokens::{Span, Token};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Tokens which are not available yet.
pub type PendingTokens = LocalBoxFuture<'static, Result<Vec<Token>>>;

/// The result of handling one token.
pub enum Transform {
    /// Emit the token as is. If the handler has `on_any` enabled, the token
    /// is offered to it first.
    Unchanged(Token),
    /// Emit these tokens in place of the token.
    Replace(Vec<Token>),
    /// Emit the eventual result in place of the token.
    Pending(PendingTokens),
}

impl From<Vec<Token>> for Transform {
    #[inline]
    fn from(tokens: Vec<Token>) -> Self {
        Self::Replace(tokens)
    }
}

/// Everything a handler can see about the run it is part of.
pub struct Ctx<'a> {
    /// The parse environment.
    pub env: &'a Rc<Env>,
    /// The frame the content belongs to.
    pub frame: &'a Rc<Frame>,
    /// The pipeline options.
    pub options: &'a Options,
    /// Whether the input started at the start of a line.
    pub sol: bool,
    /// The source range of the input, for nested runs.
    pub src_offsets: Option<Span>,
}

/// A token stream transformer.
///
/// The default [`process`](Self::process) dispatches each token by kind to
/// one of the `on_*` methods. Text and comments only ever reach
/// [`on_any`](Self::on_any).
pub trait TokenHandler {
    /// The handler name, for logging.
    fn name(&self) -> &'static str;

    /// Clears all handler state before a run.
    fn reset_state(&mut self, options: &Options);

    /// Returns true if the handler should be skipped for this run.
    fn is_disabled(&self) -> bool {
        false
    }

    /// Handles a start, end, or self-closing tag.
    fn on_tag(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(Transform::Unchanged(token))
    }

    /// Handles a newline.
    fn on_newline(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(Transform::Unchanged(token))
    }

    /// Handles the end of input.
    fn on_end(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(Transform::Unchanged(token))
    }

    /// Handles any token the kind-specific method left unchanged.
    fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(Transform::Unchanged(token))
    }

    /// Returns true if unchanged tokens are offered to
    /// [`on_any`](Self::on_any).
    fn on_any_enabled(&self) -> bool {
        false
    }

    /// Transforms a whole token sequence.
    fn process(&mut self, ctx: &Ctx<'_>, tokens: Vec<Token>) -> Result<Vec<Chunk>> {
        let mut out = Accumulator::default();
        for token in tokens {
            let transform = if token.tag().is_some() {
                self.on_tag(ctx, token)?
            } else if matches!(token, Token::Newline(_)) {
                self.on_newline(ctx, token)?
            } else if matches!(token, Token::EndOfInput(_)) {
                self.on_end(ctx, token)?
            } else {
                Transform::Unchanged(token)
            };

            let transform = match transform {
                Transform::Unchanged(token) if self.on_any_enabled() => self.on_any(ctx, token)?,
                transform => transform,
            };

            match transform {
                Transform::Unchanged(token) => out.push(token),
                Transform::Replace(tokens) => out.extend(tokens),
                Transform::Pending(pending) => out.push_pending(pending),
            }
        }
        Ok(out.into_chunks())
    }
}

/// A handler decorator which traces every token in and out.
pub struct Traced<H>(H);

impl<H: TokenHandler> Traced<H> {
    /// Wraps a handler.
    #[inline]
    pub fn new(handler: H) -> Self {
        Self(handler)
    }
}

impl<H: TokenHandler> TokenHandler for Traced<H> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn reset_state(&mut self, options: &Options) {
        self.0.reset_state(options);
    }

    fn is_disabled(&self) -> bool {
        self.0.is_disabled()
    }

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        self.0.on_tag(ctx, token)
    }

    fn on_newline(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        self.0.on_newline(ctx, token)
    }

    fn on_end(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        self.0.on_end(ctx, token)
    }

    fn on_any(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        self.0.on_any(ctx, token)
    }

    fn on_any_enabled(&self) -> bool {
        self.0.on_any_enabled()
    }

    fn process(&mut self, ctx: &Ctx<'_>, tokens: Vec<Token>) -> Result<Vec<Chunk>> {
        let name = self.0.name();
        if log::log_enabled!(log::Level::Trace) {
            for token in &tokens {
                log::trace!("{name} <- {token:?}");
            }
        }
        let chunks = self.0.process(ctx, tokens)?;
        if log::log_enabled!(log::Level::Trace) {
            for chunk in &chunks {
                match chunk {
                    Chunk::Tokens(tokens) => {
                        for token in tokens {
                            log::trace!("{name} -> {token:?}");
                        }
                    }
                    Chunk::Pending(_) => log::trace!("{name} -> (pending)"),
                }
            }
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::Tag;

    /// Upper-cases text, replaces `b` tags with `strong`, and counts
    /// newlines.
    #[derive(Default)]
    struct Shout {
        newlines: usize,
        any: bool,
    }

    impl TokenHandler for Shout {
        fn name(&self) -> &'static str {
            "Shout"
        }

        fn reset_state(&mut self, _options: &Options) {
            self.newlines = 0;
            self.any = true;
        }

        fn on_tag(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
            Ok(match token {
                Token::TagStart(tag) if tag.name == "b" => {
                    Transform::Replace(vec![Tag::new("strong").start()])
                }
                token => Transform::Unchanged(token),
            })
        }

        fn on_newline(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
            self.newlines += 1;
            Ok(Transform::Unchanged(token))
        }

        fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
            Ok(match token {
                Token::Text(text) => Transform::Replace(vec![text.to_uppercase().into()]),
                token => Transform::Unchanged(token),
            })
        }

        fn on_any_enabled(&self) -> bool {
            self.any
        }
    }

    #[test]
    fn dispatch() {
        let env = crate::pipeline::Env::new(
            Rc::new(crate::config::SiteConfig::default()),
            Rc::new(crate::pipeline::MemoryDataAccess::default()),
            "Main Page",
        )
        .unwrap();
        let frame = Frame::new_root(env.page().clone(), "");
        let options = Options::default();
        let ctx = Ctx {
            env: &env,
            frame: &frame,
            options: &options,
            sol: true,
            src_offsets: None,
        };

        let mut handler = Traced::new(Shout::default());
        handler.reset_state(&options);
        let chunks = handler
            .process(
                &ctx,
                vec![
                    Tag::new("b").start(),
                    "a".into(),
                    Token::newline(None),
                    Tag::new("b").end(),
                ],
            )
            .unwrap();
        let tokens = futures::executor::block_on(Accumulator::from(chunks).resolve()).unwrap();
        assert_eq!(
            tokens,
            vec![
                Tag::new("strong").start(),
                "A".into(),
                Token::newline(None),
                Tag::new("b").end(),
            ]
        );
        assert_eq!(handler.0.newlines, 1);
    }
}
