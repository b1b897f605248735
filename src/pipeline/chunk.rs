//! Ordered accumulation of synchronous and asynchronous handler output.

use super::{PendingTokens, Result};
use crate::tokens::Token;
use futures::future::{self, Either};

/// A run of handler output.
pub enum Chunk {
    /// Tokens which are ready.
    Tokens(Vec<Token>),
    /// Tokens which will be ready once the future resolves.
    Pending(PendingTokens),
}

/// Collects handler output in source order.
///
/// Ready tokens are appended to the last ready chunk. Each pending result
/// starts a new chunk so that whatever follows it stays behind it.
#[derive(Default)]
pub struct Accumulator {
    chunks: Vec<Chunk>,
}

impl Accumulator {
    /// Appends a ready token.
    pub fn push(&mut self, token: Token) {
        if let Some(Chunk::Tokens(tokens)) = self.chunks.last_mut() {
            tokens.push(token);
        } else {
            self.chunks.push(Chunk::Tokens(vec![token]));
        }
    }

    /// Appends ready tokens.
    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) {
        let mut tokens = tokens.into_iter().peekable();
        if tokens.peek().is_none() {
            return;
        }
        if let Some(Chunk::Tokens(last)) = self.chunks.last_mut() {
            last.extend(tokens);
        } else {
            self.chunks.push(Chunk::Tokens(tokens.collect()));
        }
    }

    /// Appends a pending result.
    pub fn push_pending(&mut self, pending: PendingTokens) {
        self.chunks.push(Chunk::Pending(pending));
    }

    /// Returns true if any chunk is still pending.
    pub fn is_pending(&self) -> bool {
        self.chunks
            .iter()
            .any(|chunk| matches!(chunk, Chunk::Pending(_)))
    }

    /// Returns the collected chunks.
    #[inline]
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    /// Waits for every pending chunk and concatenates all chunks in order.
    ///
    /// Pending chunks make progress concurrently. The first error wins.
    pub async fn resolve(self) -> Result<Vec<Token>> {
        let parts = future::try_join_all(self.chunks.into_iter().map(|chunk| match chunk {
            Chunk::Tokens(tokens) => Either::Left(future::ok(tokens)),
            Chunk::Pending(pending) => Either::Right(pending),
        }))
        .await?;
        Ok(parts.into_iter().flatten().collect())
    }
}

impl From<Vec<Chunk>> for Accumulator {
    fn from(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt as _, executor::block_on};

    #[test]
    fn order_is_kept() {
        let mut accum = Accumulator::default();
        accum.push("a".into());
        accum.push_pending(async { Ok(vec!["b".into(), "c".into()]) }.boxed_local());
        accum.push("d".into());
        accum.extend(vec!["e".into()]);
        accum.push_pending(async { Ok(vec![]) }.boxed_local());
        accum.extend(vec![]);
        assert!(accum.is_pending());
        assert_eq!(accum.chunks.len(), 4);

        let tokens = block_on(accum.resolve()).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::from("a"),
                "b".into(),
                "c".into(),
                "d".into(),
                "e".into()
            ]
        );
    }
}
