//! Collection of the tokens between a start tag and its end tag.

use crate::{
    pipeline::{Ctx, Options, Result, TokenHandler, Transform},
    tokens::Token,
};

/// The configuration and transformation of a [`TokenCollector`].
pub trait Collector {
    /// The handler name, for logging.
    const NAME: &'static str;
    /// The name of the delimiting tag.
    const TAG: &'static str;
    /// If true, a missing end tag is treated as if it were at the end of
    /// input.
    const TO_END: bool;
    /// If true, stray end tags are transformed too.
    const ACK_END: bool;

    /// Transforms a collection.
    ///
    /// The collection starts with the start delimiter and, except for stray
    /// end tags, finishes with the end delimiter or end-of-input token. A
    /// self-closing delimiter is passed as both the start and the end.
    fn transform(&mut self, ctx: &Ctx<'_>, collection: Vec<Token>) -> Vec<Token>;
}

/// A handler which collects everything between a start tag and its matching
/// end tag and hands it to a [`Collector`] in one piece.
///
/// Collections nest. A start delimiter inside an open collection opens a new
/// scope, and each end delimiter closes the innermost one.
#[derive(Default)]
pub struct TokenCollector<C> {
    /// The collection transformer.
    collector: C,
    /// The open collections, outermost first.
    scopes: Vec<Vec<Token>>,
}

impl<C: Collector> TokenCollector<C> {
    /// Handles a delimiter: a start, end, or self-closing tag named
    /// [`Collector::TAG`], or the end of input while collecting.
    fn on_delimiter(&mut self, ctx: &Ctx<'_>, token: Token) -> Transform {
        match token {
            Token::TagStart(_) => {
                if self.scopes.is_empty() {
                    log::debug!("{}: starting collection on {token:?}", C::NAME);
                }
                self.scopes.push(vec![token]);
                Transform::Replace(vec![])
            }
            Token::SelfClosing(_) => {
                Transform::Replace(self.collector.transform(ctx, vec![token.clone(), token]))
            }
            token => {
                if let Some(mut active) = self.scopes.pop() {
                    log::debug!("{}: finishing collection on {token:?}", C::NAME);
                    if matches!(token, Token::TagEnd(_)) {
                        active.push(token);
                        return Transform::Replace(self.collector.transform(ctx, active));
                    }

                    let eof = token.clone();
                    let mut all = self.scopes.drain(..).flatten().collect::<Vec<_>>();
                    all.extend(active);
                    all.push(token);
                    let mut out = if C::TO_END {
                        self.collector.transform(ctx, all)
                    } else {
                        all
                    };
                    if !matches!(out.last(), Some(Token::EndOfInput(_))) {
                        log::error!("{}: handler dropped the end of input", C::NAME);
                        out.push(eof);
                    }
                    Transform::Replace(out)
                } else if C::ACK_END {
                    Transform::Replace(self.collector.transform(ctx, vec![token]))
                } else {
                    Transform::Replace(vec![token])
                }
            }
        }
    }
}

impl<C: Collector> TokenHandler for TokenCollector<C> {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn reset_state(&mut self, _options: &Options) {
        self.scopes.clear();
    }

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(if token.name() == Some(C::TAG) {
            self.on_delimiter(ctx, token)
        } else {
            Transform::Unchanged(token)
        })
    }

    fn on_end(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(if self.scopes.is_empty() {
            Transform::Unchanged(token)
        } else {
            self.on_delimiter(ctx, token)
        })
    }

    fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(if let Some(scope) = self.scopes.last_mut() {
            scope.push(token);
            Transform::Replace(vec![])
        } else {
            Transform::Unchanged(token)
        })
    }

    fn on_any_enabled(&self) -> bool {
        !self.scopes.is_empty()
    }
}
