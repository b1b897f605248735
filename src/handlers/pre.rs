//! Indent-pre: lines starting with a space become preformatted blocks.

use crate::{
    pipeline::{Ctx, Options, Result, TokenHandler, Transform},
    tokens::{
        Span, Tag, Token,
        utils::{is_block_tag, is_html_tag, is_sol_transparent, is_table_tag},
    },
};

/// The line state of the pre handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// At the start of a line, before any content.
    Sol,
    /// The line started with a space, but nothing else has been seen yet.
    Pre,
    /// Collecting the content of an indent-pre line.
    PreCollect,
    /// After a collected line, waiting to see whether the next line
    /// continues the block.
    MultilinePre,
    /// The rest of the line cannot start an indent-pre.
    Ignore,
}

/// Wraps runs of space-indented lines in `pre` tags.
///
/// An indent-pre never starts inside or in front of a block tag, so
/// collection aborts as soon as one shows up and the collected tokens are
/// released as they were.
#[derive(Default)]
pub struct PreHandler {
    /// The handler is off for inline content.
    disabled: bool,
    /// The current state.
    state: Option<State>,
    /// Whether unchanged tokens are routed to `on_any`.
    any_enabled: bool,
    /// The newline ending the last collected line.
    last_nl: Option<Token>,
    /// Where the `pre` starts in the source, if that is known.
    pre_tsr: Option<usize>,
    /// Tokens of completed pre lines, or sol-transparent tokens at the start
    /// of a line.
    tokens: Vec<Token>,
    /// Tokens of the line being collected.
    current_line: Vec<Token>,
    /// The space which started the first pre line.
    pre_ws: Option<Token>,
    /// The space which started a continuation line.
    multiline_pre_ws: Option<Token>,
    /// Sol-transparent tokens seen after the leading space.
    sol_transparent: Vec<Token>,
}

impl PreHandler {
    /// The current state.
    #[inline]
    fn state(&self) -> State {
        self.state.unwrap_or(State::Sol)
    }

    /// Resets to the start of a line.
    fn reset(&mut self) {
        self.state = Some(State::Sol);
        self.last_nl = None;
        // The first line has no newline to take this from
        self.pre_tsr = Some(0);
        self.tokens.clear();
        self.current_line.clear();
        self.pre_ws = None;
        self.multiline_pre_ws = None;
        self.sol_transparent.clear();
        self.any_enabled = true;
    }

    fn move_to_ignore_state(&mut self) {
        self.any_enabled = false;
        self.state = Some(State::Ignore);
    }

    /// Appends the pending newline, if any, to `out`.
    fn pop_last_nl(last_nl: &mut Option<Token>, out: &mut Vec<Token>) {
        out.extend(last_nl.take());
    }

    /// Moves the collected line into the pre content.
    fn reset_current_line(&mut self) {
        if !self.current_line.is_empty() {
            self.tokens.append(&mut self.current_line);
            // The continuation line is part of the pre now, so its space is
            // consumed
            self.multiline_pre_ws = None;
        }
    }

    /// Releases everything buffered without a `pre`, followed by `token`.
    fn get_result_and_reset(&mut self, token: Token) -> Vec<Token> {
        Self::pop_last_nl(&mut self.last_nl, &mut self.tokens);
        let mut out = core::mem::take(&mut self.tokens);
        out.extend(self.pre_ws.take());
        out.append(&mut self.sol_transparent);
        out.push(token);
        self.multiline_pre_ws = None;
        out
    }

    /// Wraps the collected lines in a `pre` and releases them, followed by
    /// `token`.
    fn process_pre(&mut self, token: Option<Token>) -> Vec<Token> {
        let mut out = Vec::new();
        if !self.tokens.is_empty() {
            let tsr = self.pre_tsr.map(|start| Span::new(start, start + 1));
            out.push(Tag::new("pre").with_tsr(tsr).start());
            out.append(&mut self.tokens);
            out.push(Tag::new("pre").end());
        }
        out.extend(self.multiline_pre_ws.take());
        Self::pop_last_nl(&mut self.last_nl, &mut out);
        out.append(&mut self.sol_transparent);
        out.extend(token);
        out
    }

    /// Finishes the pre collected so far because a block tag showed up, and
    /// releases the current line as plain content.
    fn encountered_block_while_collecting(&mut self, token: Token) -> Vec<Token> {
        let multiline_pre_ws = self.multiline_pre_ws.take();
        let mut out = Vec::new();

        if !self.tokens.is_empty() {
            let mut i = self.tokens.len() - 1;
            while i > 0 && is_sol_transparent(&self.tokens[i]) {
                i -= 1;
            }
            let mut sol_tokens = self.tokens.split_off(i);
            if matches!(sol_tokens.first(), Some(Token::Newline(_))) {
                self.last_nl = Some(sol_tokens.remove(0));
            } else {
                log::warn!("pre content before a block does not end with a newline");
            }
            out = self.process_pre(None);
            out.append(&mut sol_tokens);
        }

        out.extend(self.pre_ws.take().or(multiline_pre_ws));
        self.reset_current_line();
        out.extend(self.get_result_and_reset(token));
        out
    }

    /// Advances the source position of the pending `pre` past a
    /// sol-transparent token.
    fn update_pre_tsr(&mut self, token: &Token) {
        self.pre_tsr = match token {
            Token::Comment(text, dp) => dp
                .tsr
                .map(|tsr| tsr.end)
                .or_else(|| self.pre_tsr.map(|tsr| tsr + text.len() + 7)),
            Token::Text(text) => self.pre_tsr.map(|tsr| tsr + text.len()),
            // A meta has no width that can be known here
            _ => None,
        };
    }

    /// Handles a content token.
    fn on_content(&mut self, token: Token) -> Vec<Token> {
        match self.state() {
            State::Sol => {
                if let Token::Text(text) = &token
                    && let Some(rest) = text.strip_prefix(' ')
                {
                    let rest = rest.to_string();
                    let mut out = core::mem::take(&mut self.tokens);
                    self.pre_ws = Some(Token::from(" "));
                    self.state = Some(State::Pre);
                    if !rest.is_empty() {
                        out.extend(self.on_content(Token::Text(rest)));
                    }
                    out
                } else if is_sol_transparent(&token) {
                    self.update_pre_tsr(&token);
                    self.tokens.push(token);
                    vec![]
                } else {
                    let out = self.get_result_and_reset(token);
                    self.move_to_ignore_state();
                    out
                }
            }
            State::Pre => {
                if is_sol_transparent(&token) {
                    self.sol_transparent.push(token);
                    vec![]
                } else if is_table_tag(&token)
                    || (is_html_tag(&token) && token.name().is_some_and(is_block_tag))
                {
                    let out = self.get_result_and_reset(token);
                    self.move_to_ignore_state();
                    out
                } else {
                    self.current_line = core::mem::take(&mut self.sol_transparent);
                    self.current_line.push(token);
                    self.state = Some(State::PreCollect);
                    vec![]
                }
            }
            State::PreCollect => {
                if token.tag().is_some() && token.name().is_some_and(is_block_tag) {
                    let out = self.encountered_block_while_collecting(token);
                    self.move_to_ignore_state();
                    out
                } else {
                    self.current_line.push(token);
                    vec![]
                }
            }
            State::MultilinePre => {
                if let Token::Text(text) = &token
                    && let Some(rest) = text.strip_prefix(' ')
                {
                    let rest = rest.to_string();
                    Self::pop_last_nl(&mut self.last_nl, &mut self.tokens);
                    self.state = Some(State::PreCollect);
                    self.pre_ws = None;
                    self.tokens.append(&mut self.sol_transparent);
                    self.multiline_pre_ws = Some(Token::from(" "));
                    if rest.is_empty() {
                        vec![]
                    } else {
                        self.on_content(Token::Text(rest))
                    }
                } else if is_sol_transparent(&token) {
                    self.sol_transparent.push(token);
                    vec![]
                } else {
                    let out = self.process_pre(Some(token));
                    self.move_to_ignore_state();
                    out
                }
            }
            State::Ignore => {
                log::error!("pre handler saw content while ignoring the line");
                vec![token]
            }
        }
    }
}

impl TokenHandler for PreHandler {
    fn name(&self) -> &'static str {
        "PreHandler"
    }

    fn reset_state(&mut self, options: &Options) {
        self.disabled = options.inline_context;
        self.reset();
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn on_newline(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let nl_end = token.tsr().map(|tsr| tsr.end);
        let out = match self.state() {
            State::Sol | State::Pre => {
                let out = self.get_result_and_reset(token);
                self.state = Some(State::Sol);
                out
            }
            State::PreCollect => {
                self.reset_current_line();
                self.last_nl = Some(token);
                self.state = Some(State::MultilinePre);
                return Ok(Transform::Replace(vec![]));
            }
            State::MultilinePre => {
                self.pre_ws = None;
                self.multiline_pre_ws = None;
                let out = self.process_pre(Some(token));
                self.state = Some(State::Sol);
                out
            }
            State::Ignore => {
                self.reset();
                vec![token]
            }
        };
        // Any pre on the next line starts right after this newline
        self.pre_tsr = nl_end;
        Ok(Transform::Replace(out))
    }

    fn on_end(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        if !self.any_enabled {
            return Ok(Transform::Unchanged(token));
        }
        let out = match self.state() {
            State::PreCollect | State::MultilinePre => {
                self.pre_ws = None;
                self.multiline_pre_ws = None;
                self.reset_current_line();
                self.process_pre(Some(token))
            }
            _ => self.get_result_and_reset(token),
        };
        self.reset();
        Ok(Transform::Replace(out))
    }

    fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(Transform::Replace(self.on_content(token)))
    }

    fn on_any_enabled(&self) -> bool {
        self.any_enabled
    }
}
