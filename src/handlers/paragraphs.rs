//! Paragraph wrapping.
//!
//! Lines of inline content are wrapped in `<p>` tags the same way the legacy
//! block level pass does it, and runs of blank lines become paragraph breaks
//! and `<br>` tags.
//!
//! Tokens are held in three buffers, which are always emitted in this order:
//!
//! 1. `token_buffer`: tokens of completed lines;
//! 2. `nl_ws_tokens`: newlines and sol-transparent tokens seen since the last
//!    line with content;
//! 3. `line.tokens`: tokens of the current line.
//!
//! `new_line_count` is only non-zero while there are pending newlines in
//! `nl_ws_tokens`. Once it is clear where a paragraph must open or close, the
//! buffers are collapsed and emitted.

use crate::{
    pipeline::{Ctx, Options, Result, TokenHandler, Transform},
    tokens::{
        Tag, Token,
        utils::{is_empty_line_meta, is_html_tag, is_sol_transparent},
    },
};
use std::{collections::VecDeque, mem};

/// Tags which start a block when they are encountered as start or
/// self-closing tags, and end one as end tags.
static BLOCK_TAG: phf::Set<&str> = phf::phf_set! {
    "dl", "h1", "h2", "h3", "h4", "h5", "h6", "ol", "p", "pre", "table", "ul"
};

/// Tags which end a block when they are encountered as start tags, and start
/// one as end tags.
static ANTI_BLOCK_TAG: phf::Set<&str> = phf::phf_set! { "td", "th" };

/// Tags which always suppress paragraph wrapping of their line.
static ALWAYS_TAG: phf::Set<&str> = phf::phf_set! {
    "caption", "dd", "dt", "li", "tr"
};

/// Tags which never suppress paragraph wrapping after them.
static NEVER_TAG: phf::Set<&str> = phf::phf_set! {
    "blockquote", "center", "div", "figure", "hr"
};

/// The line currently being accumulated.
#[derive(Debug, Default)]
struct Line {
    /// Tokens of the line.
    tokens: Vec<Token>,
    /// The line has content which would go into a paragraph.
    has_wrappable_tokens: bool,
    /// The line opens a block.
    open_match: bool,
    /// The line closes a block.
    close_match: bool,
}

/// The `typeof` of a transclusion meta, if `token` is one.
fn transclusion_type(token: &Token) -> Option<&str> {
    match token {
        Token::SelfClosing(tag) if tag.name == "meta" => tag
            .attr_str("typeof")
            .filter(|ty| ty.starts_with("mw:Transclusion")),
        _ => None,
    }
}

/// Returns true if `token` can stay outside of a paragraph.
fn is_outside_paragraph(token: &Token) -> bool {
    is_sol_transparent(token) || matches!(token, Token::Newline(_))
}

/// Wraps lines of inline content in paragraphs.
#[derive(Debug, Default)]
pub struct ParagraphWrapper {
    /// Wrapping is off for this run.
    disabled: bool,
    /// Inside an indent-pre.
    in_pre: bool,
    /// A `<p>` was emitted and not closed yet.
    has_open_p_tag: bool,
    /// Inside a block element, according to the flags of the last line.
    in_block_elem: bool,
    /// Inside a `<blockquote>`.
    in_blockquote: bool,
    /// An indent-pre was turned back into a space, so its end tag must be
    /// swallowed.
    undo_indent_pre: bool,
    /// Tokens of completed lines.
    token_buffer: Vec<Token>,
    /// Pending newlines and sol-transparent tokens.
    nl_ws_tokens: VecDeque<Token>,
    /// The number of newlines in `nl_ws_tokens`.
    new_line_count: usize,
    /// The current line.
    line: Line,
}

impl ParagraphWrapper {
    /// Clears all state except the disabled flag.
    fn reset(&mut self) {
        self.reset_buffers();
        self.reset_line();
        self.has_open_p_tag = false;
        self.in_pre = false;
        self.in_block_elem = false;
        self.in_blockquote = false;
        self.undo_indent_pre = false;
    }

    /// Clears the completed line and pending newline buffers.
    fn reset_buffers(&mut self) {
        self.token_buffer.clear();
        self.nl_ws_tokens.clear();
        self.new_line_count = 0;
    }

    /// Starts a new line, carrying the block state of the last one forward.
    fn reset_line(&mut self) {
        if self.line.open_match || self.line.close_match {
            self.in_block_elem = !self.line.close_match;
        }
        self.line = Line::default();
    }

    /// Moves everything before the first pending newline into `out` and
    /// returns the newline.
    fn discard_one_nl(&mut self, out: &mut Vec<Token>) -> Option<Token> {
        while let Some(token) = self.nl_ws_tokens.pop_front() {
            if matches!(token, Token::Newline(_)) {
                return Some(token);
            }
            out.push(token);
        }
        None
    }

    /// Inserts a `<p>` before the first wrappable token of `out`. Tokens
    /// before it stay outside, and so does a whole leading transclusion.
    fn open_p_tag(&mut self, out: &mut Vec<Token>) {
        if self.has_open_p_tag {
            return;
        }

        let mut index = out.len();
        let mut tpl_start = None;
        for (i, token) in out.iter().enumerate() {
            if let Some(ty) = transclusion_type(token) {
                tpl_start = (ty == "mw:Transclusion").then_some(i);
                continue;
            }
            if !is_outside_paragraph(token) {
                index = i;
                break;
            }
        }

        out.insert(tpl_start.unwrap_or(index), Tag::new("p").start());
        self.has_open_p_tag = true;
    }

    /// Inserts a `</p>` after the last wrappable token of `out`. Tokens after
    /// it stay outside, and so does a whole trailing transclusion.
    fn close_open_p_tag(&mut self, out: &mut Vec<Token>) {
        if !self.has_open_p_tag {
            return;
        }

        let mut last = None;
        let mut tpl_end = None;
        for (i, token) in out.iter().enumerate().rev() {
            if let Some(ty) = transclusion_type(token) {
                tpl_end = (ty != "mw:Transclusion").then_some(i);
                continue;
            }
            if !is_outside_paragraph(token) {
                last = Some(i);
                break;
            }
        }

        let index = tpl_end.or(last).map_or(0, |i| i + 1);
        out.insert(index, Tag::new("p").end());
        self.has_open_p_tag = false;
    }

    /// Emits completed lines and pending newlines, converting blank lines to
    /// paragraph breaks and `<br>` tags.
    fn process_pending_nls(&mut self) -> Vec<Token> {
        let mut out = mem::take(&mut self.token_buffer);
        let mut count = self.new_line_count;

        log::trace!("p-wrap: {count} pending newlines");

        if count >= 2 && !self.in_block_elem {
            self.close_open_p_tag(&mut out);

            // The first newline is emitted as is
            let nl = self.discard_one_nl(&mut out);
            out.extend(nl);
            count -= 1;

            let remainder = count % 2;
            while count > 0 {
                let nl = self.discard_one_nl(&mut out);
                if count % 2 == remainder {
                    if self.has_open_p_tag {
                        out.push(Tag::new("p").end());
                        self.has_open_p_tag = false;
                    }
                    if count > 1 {
                        out.push(Tag::new("p").start());
                        self.has_open_p_tag = true;
                    }
                } else {
                    out.push(Tag::new("br").self_closing());
                }
                out.extend(nl);
                count -= 1;
            }
        }

        if self.line.open_match || self.line.close_match {
            self.close_open_p_tag(&mut out);
            if count == 1 {
                let nl = self.discard_one_nl(&mut out);
                out.extend(nl);
            }
        }

        out.extend(self.nl_ws_tokens.drain(..));
        self.reset_buffers();
        out
    }

    /// Emits pending output and adds `token` to the current line, which is
    /// also emitted if `flush_line` is set.
    fn process_buffers(&mut self, token: Token, flush_line: bool) -> Vec<Token> {
        let mut out = self.process_pending_nls();
        self.line.tokens.push(token);
        if flush_line {
            out.append(&mut self.line.tokens);
            self.reset_line();
        }
        out
    }

    /// Emits completed lines and sol-transparent tokens when there are no
    /// pending newlines.
    fn flush_buffers(&mut self) -> Vec<Token> {
        if self.new_line_count > 0 {
            log::warn!(
                "p-wrap: flushing with {} pending newlines: {:?}",
                self.new_line_count,
                self.nl_ws_tokens
            );
        }
        let mut out = mem::take(&mut self.token_buffer);
        out.extend(self.nl_ws_tokens.drain(..));
        self.reset_buffers();
        out
    }

    /// Ends the current line.
    fn on_new_line_or_eof(&mut self, token: Token) -> Transform {
        let mut tokens = mem::take(&mut self.line.tokens);
        if self.line.open_match || self.line.close_match {
            self.close_open_p_tag(&mut tokens);
        } else if !self.in_block_elem && !self.has_open_p_tag && self.line.has_wrappable_tokens {
            self.open_p_tag(&mut tokens);
        }

        if self.new_line_count > 0 && !tokens.is_empty() {
            log::warn!(
                "p-wrap: line with {} pending newlines: {tokens:?}",
                self.new_line_count
            );
        }

        self.token_buffer.append(&mut tokens);

        if matches!(token, Token::EndOfInput(_)) {
            self.nl_ws_tokens.push_back(token);
            let mut buffer = mem::take(&mut self.token_buffer);
            self.close_open_p_tag(&mut buffer);
            self.token_buffer = buffer;
            let out = self.process_pending_nls();
            self.reset();
            Transform::Replace(out)
        } else {
            self.reset_line();
            self.new_line_count += 1;
            self.nl_ws_tokens.push_back(token);
            Transform::Replace(vec![])
        }
    }

    /// Handles a token which does not affect block context.
    fn on_sol_transparent(&mut self, token: Token) -> Transform {
        match self.new_line_count {
            0 => {
                self.line.tokens.push(token);
                Transform::Replace(self.flush_buffers())
            }
            1 => {
                // The single newline cannot end a paragraph yet, so it and
                // the current line join the completed lines
                self.token_buffer.extend(self.nl_ws_tokens.drain(..));
                self.token_buffer.append(&mut self.line.tokens);
                self.new_line_count = 0;
                self.reset_line();
                self.line.tokens.push(token);
                Transform::Replace(vec![])
            }
            _ => Transform::Replace(self.process_buffers(token, false)),
        }
    }

    /// Updates the block flags of the current line for a tag.
    fn match_block_tag(&mut self, token: &Token) {
        let Some(name) = token.name() else {
            return;
        };
        let is_end = matches!(token, Token::TagEnd(_));
        if (BLOCK_TAG.contains(name) && !is_end)
            || (ANTI_BLOCK_TAG.contains(name) && is_end)
            || ALWAYS_TAG.contains(name)
        {
            self.line.open_match = true;
        }
        if (BLOCK_TAG.contains(name) && is_end)
            || (ANTI_BLOCK_TAG.contains(name) && !is_end)
            || NEVER_TAG.contains(name)
        {
            self.line.close_match = true;
        }
        if name == "blockquote" {
            self.in_blockquote = !is_end;
        }
    }
}

impl TokenHandler for ParagraphWrapper {
    fn name(&self) -> &'static str {
        "ParagraphWrapper"
    }

    fn reset_state(&mut self, options: &Options) {
        self.reset();
        self.disabled = options.inline_context;
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn on_newline(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(if self.in_pre {
            Transform::Unchanged(token)
        } else {
            self.on_new_line_or_eof(token)
        })
    }

    fn on_end(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(self.on_new_line_or_eof(token))
    }

    fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let is_indent_pre = token.name() == Some("pre") && !is_html_tag(&token);

        if is_indent_pre && matches!(token, Token::TagStart(_)) {
            return Ok(if self.in_block_elem || self.in_blockquote {
                log::debug!("p-wrap: undoing indent-pre inside a block");
                self.undo_indent_pre = true;
                self.line.tokens.push(" ".into());
                Transform::Replace(vec![])
            } else {
                self.in_pre = true;
                // Closes any open paragraph at the end of the line
                self.line.open_match = true;
                Transform::Replace(self.process_buffers(token, true))
            });
        }

        if is_indent_pre && matches!(token, Token::TagEnd(_)) {
            return Ok(if self.undo_indent_pre || (self.in_block_elem && !self.in_pre) {
                self.undo_indent_pre = false;
                Transform::Replace(vec![])
            } else {
                self.in_pre = false;
                self.line.close_match = true;
                Transform::Replace(vec![token])
            });
        }

        if self.in_pre || matches!(token, Token::EndOfInput(_)) {
            return Ok(Transform::Replace(vec![token]));
        }

        let is_blank = match &token {
            Token::Text(text) => text.bytes().all(|b| b == b' ' || b == b'\t'),
            Token::Comment(..) => true,
            _ => is_empty_line_meta(&token),
        };
        if is_blank {
            return Ok(if self.new_line_count == 0 {
                self.line.tokens.push(token);
                Transform::Replace(self.flush_buffers())
            } else {
                self.nl_ws_tokens.push_back(token);
                Transform::Replace(vec![])
            });
        }

        // `<style>` neither opens nor closes a paragraph
        if token.tag().is_some() && (is_sol_transparent(&token) || token.name() == Some("style")) {
            return Ok(self.on_sol_transparent(token));
        }

        self.match_block_tag(&token);
        self.line.has_wrappable_tokens = true;
        Ok(Transform::Replace(self.process_buffers(token, false)))
    }

    fn on_any_enabled(&self) -> bool {
        true
    }
}
