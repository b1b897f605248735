//! Conversion of list item tokens into nested HTML lists.

use crate::{
    pipeline::{Ctx, Options, Resource, Result, TokenHandler, Transform},
    tokens::{
        DataParsoid, Span, Syntax, Tag, Token,
        utils::{is_block_tag, is_sol_transparent},
    },
};

/// Returns the list and item tag names for a bullet character.
fn containers(bullet: u8) -> Option<(&'static str, &'static str)> {
    Some(match bullet {
        b'*' => ("ul", "li"),
        b'#' => ("ol", "li"),
        b';' => ("dl", "dt"),
        b':' => ("dl", "dd"),
        _ => return None,
    })
}

/// Returns true if `a` and `b` are a `dt` and a `dd` bullet, in either
/// order.
#[inline]
fn is_dt_dd(a: u8, b: u8) -> bool {
    matches!((a, b), (b';', b':') | (b':', b';'))
}

/// List state for one table nesting level.
#[derive(Debug)]
struct ListFrame {
    /// The last line had no list item, so the next non-list content ends
    /// the lists.
    at_eol: bool,
    /// The newline which ended the last list line.
    nl: Option<Token>,
    /// Sol-transparent tokens held until it is known whether the list
    /// continues.
    sol_tokens: Vec<Token>,
    /// The bullets of the previous list item.
    bstack: Vec<u8>,
    /// The names of the open list and item tags, outermost first.
    end_tags: Vec<&'static str>,
    /// The number of block tags opened inside the lists.
    num_open_block_tags: usize,
    /// The number of tags opened on the current line.
    num_open_tags: usize,
}

impl Default for ListFrame {
    fn default() -> Self {
        Self {
            at_eol: true,
            nl: None,
            sol_tokens: Vec::new(),
            bstack: Vec::new(),
            end_tags: Vec::new(),
            num_open_block_tags: 0,
            num_open_tags: 0,
        }
    }
}

impl ListFrame {
    /// Closes the `n` innermost list levels.
    fn pop_tags(&mut self, n: usize) -> Vec<Token> {
        let mut out = Vec::with_capacity(n * 2);
        for _ in 0..n {
            // The item, then its list
            out.extend(self.end_tags.pop().map(|name| Tag::new(name).end()));
            out.extend(self.end_tags.pop().map(|name| Tag::new(name).end()));
        }
        out
    }

    /// Opens a new list level.
    fn push_list(
        &mut self,
        (list, item): (&'static str, &'static str),
        list_dp: DataParsoid,
        item_dp: DataParsoid,
    ) -> [Token; 2] {
        self.end_tags.push(list);
        self.end_tags.push(item);
        [
            Tag::new(list).with_dp(list_dp).start(),
            Tag::new(item).with_dp(item_dp).start(),
        ]
    }
}

/// Converts `listItem` tokens into `ul`, `ol`, and `dl` lists.
///
/// A table opened inside a list starts an independent list context, which
/// is discarded when the table closes.
#[derive(Default)]
pub struct ListHandler {
    /// List contexts suspended by an open table, outermost first.
    frames: Vec<ListFrame>,
    /// The active list context.
    current: Option<ListFrame>,
    /// Tables opened inside a suspended list context, outside of any list.
    nested_table_count: usize,
    /// Whether unchanged tokens are routed to `on_any`.
    any_enabled: bool,
}

impl ListHandler {
    /// Closes every list in the active context.
    fn close_frame(&mut self) -> Vec<Token> {
        let Some(mut frame) = self.current.take() else {
            return vec![];
        };
        let mut out = frame.pop_tags(frame.bstack.len());
        out.append(&mut frame.sol_tokens);
        out.extend(frame.nl.take());
        out
    }

    /// Closes every list in the active context, followed by `token`.
    fn close_lists(&mut self, token: Token) -> Vec<Token> {
        log::trace!("closing all lists on {token:?}");
        let mut out = self.close_frame();
        out.push(token);
        if self.frames.is_empty() {
            self.any_enabled = false;
        }
        out
    }

    /// Handles a list item.
    fn on_list_item(&mut self, ctx: &Ctx<'_>, tag: Tag) -> Result<Transform> {
        ctx.env.bump(Resource::ListItems, 1)?;
        self.any_enabled = true;
        let bullets = tag.attr_str("bullets").unwrap_or_default().as_bytes().to_vec();

        if let Some(frame) = &self.current {
            // A colon inside an open tag cannot start a list item
            if bullets.last() == Some(&b':') && frame.num_open_tags > 0 {
                return Ok(Transform::Replace(vec![Token::from(":")]));
            }
        } else {
            self.current = Some(ListFrame::default());
        }

        let frame = self.current.get_or_insert_with(ListFrame::default);
        Ok(Transform::Replace(Self::do_list_item(frame, bullets, &tag)))
    }

    /// Converts one list item, given the bullets of the previous item in the
    /// frame, into the tags which close and open the right list levels.
    fn do_list_item(frame: &mut ListFrame, bn: Vec<u8>, tag: &Tag) -> Vec<Token> {
        let bs = core::mem::take(&mut frame.bstack);
        let prefix_len = bs.iter().zip(&bn).take_while(|(a, b)| a == b).count();
        let make_dp = |k: usize, j: usize| DataParsoid {
            tsr: tag
                .dp
                .tsr
                .map(|tsr| Span::new(tsr.start + k, tsr.start + j)),
            ..tag.dp.clone()
        };

        log::trace!(
            "list item: {:?} -> {:?}",
            String::from_utf8_lossy(&bs),
            String::from_utf8_lossy(&bn)
        );

        let mut out;
        if prefix_len == bs.len() && bn.len() == bs.len() {
            // Same types, same level: only the item changes
            //
            // **a
            // **b
            let item = frame.end_tags.pop().unwrap_or("li");
            frame.end_tags.push(item);
            out = vec![Tag::new(item).end()];
            out.append(&mut frame.sol_tokens);
            out.extend(frame.nl.take());
            out.push(Tag::new(item).with_dp(make_dp(0, bn.len())).start());
        } else {
            let mut prefix_correction = 0;
            out = core::mem::take(&mut frame.sol_tokens);
            if bs.len() > prefix_len
                && bn.len() > prefix_len
                && is_dt_dd(bs[prefix_len], bn[prefix_len])
            {
                // A dt becomes a dd or the other way around, without
                // touching the outer levels
                //
                // ;a:b
                // ;a
                // :b
                out.extend(frame.pop_tags(bs.len() - prefix_len - 1));
                let new_name = containers(bn[prefix_len]).map_or("dd", |(_, item)| item);
                let end = frame.end_tags.pop();
                frame.end_tags.push(new_name);

                // The dd of a single-line `;a:b` has only the colon as its
                // source
                let dp = if tag.dp.stx == Some(Syntax::Row) {
                    make_dp(0, 1)
                } else {
                    make_dp(0, prefix_len + 1)
                };
                out.extend(end.map(|name| Tag::new(name).end()));
                out.extend(frame.nl.take());
                out.push(Tag::new(new_name).with_dp(dp).start());
                prefix_correction = 1;
            } else {
                out.extend(frame.pop_tags(bs.len() - prefix_len));
                out.extend(frame.nl.take());
                if prefix_len > 0 && bn.len() == prefix_len {
                    let item = frame.end_tags.pop().unwrap_or("li");
                    out.push(Tag::new(item).end());
                    out.push(Tag::new(item).with_dp(make_dp(0, bn.len())).start());
                    frame.end_tags.push(item);
                }
            }

            // The first new level carries the shared prefix as its source,
            // and each deeper level one bullet
            //
            // **a
            // ****b
            for i in prefix_len + prefix_correction..bn.len() {
                let Some(container) = containers(bn[i]) else {
                    log::error!("unknown list bullet {:?}", char::from(bn[i]));
                    continue;
                };
                let (list_dp, item_dp) = if i == prefix_len {
                    (make_dp(0, 0), make_dp(0, i + 1))
                } else {
                    (make_dp(i, i), make_dp(i, i + 1))
                };
                out.extend(frame.push_list(container, list_dp, item_dp));
            }
        }

        frame.bstack = bn;
        frame.sol_tokens.clear();
        frame.nl = None;
        frame.at_eol = false;
        out
    }
}

impl TokenHandler for ListHandler {
    fn name(&self) -> &'static str {
        "ListHandler"
    }

    fn reset_state(&mut self, _options: &Options) {
        self.frames.clear();
        self.current = None;
        self.nested_table_count = 0;
        self.any_enabled = false;
    }

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        match token {
            Token::TagStart(tag) if tag.name == "listItem" => self.on_list_item(ctx, tag),
            token => Ok(Transform::Unchanged(token)),
        }
    }

    fn on_end(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        if !self.any_enabled {
            return Ok(Transform::Unchanged(token));
        }
        // Lists suspended by unclosed tables are closed too
        let mut out = self.close_frame();
        while let Some(frame) = self.frames.pop() {
            self.current = Some(frame);
            out.extend(self.close_frame());
        }
        out.push(token);
        self.reset_state(&Options::default());
        Ok(Transform::Replace(out))
    }

    fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let Some(frame) = self.current.as_mut() else {
            // In a table inside a list, outside of any list of its own
            match &token {
                Token::TagEnd(tag) if tag.name == "table" => {
                    if self.nested_table_count == 0 {
                        self.current = self.frames.pop();
                    } else {
                        self.nested_table_count -= 1;
                    }
                }
                Token::TagStart(tag) if tag.name == "table" => self.nested_table_count += 1,
                _ => {}
            }
            return Ok(Transform::Unchanged(token));
        };

        // Tables push a frame and stay balanced, so they are not counted
        match &token {
            Token::TagStart(tag) if tag.name != "table" => frame.num_open_tags += 1,
            Token::TagEnd(_) if frame.num_open_tags > 0 => frame.num_open_tags -= 1,
            _ => {}
        }

        if let Token::TagEnd(tag) = &token {
            if tag.name == "table" {
                let out = self.close_lists(token);
                self.current = self.frames.pop();
                return Ok(Transform::Replace(out));
            } else if is_block_tag(&tag.name) {
                if frame.num_open_block_tags == 0 {
                    // An unbalanced block end tag ends the lists
                    return Ok(Transform::Replace(self.close_lists(token)));
                }
                frame.num_open_block_tags -= 1;
                return Ok(Transform::Unchanged(token));
            }
        }

        if frame.at_eol {
            return Ok(Transform::Replace(
                if !matches!(token, Token::Newline(_)) && is_sol_transparent(&token) {
                    // Wait to see whether another list item follows
                    frame.sol_tokens.extend(frame.nl.take());
                    frame.sol_tokens.push(token);
                    vec![]
                } else {
                    self.close_lists(token)
                },
            ));
        }

        match &token {
            Token::Newline(_) => {
                frame.at_eol = true;
                frame.nl = Some(token);
                // Tags do not hide colons past the end of the line
                frame.num_open_tags = 0;
                return Ok(Transform::Replace(vec![]));
            }
            Token::TagStart(tag) if tag.name == "table" => {
                if let Some(frame) = self.current.take() {
                    self.frames.push(frame);
                }
            }
            Token::TagStart(tag) if is_block_tag(&tag.name) => frame.num_open_block_tags += 1,
            _ => {}
        }
        Ok(Transform::Unchanged(token))
    }

    fn on_any_enabled(&self) -> bool {
        self.any_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::testing::{env_with, run_on_source},
        tokens::html::to_html,
    };

    fn lists(src: &str) -> Vec<Token> {
        let env = env_with(&[]);
        run_on_source(&mut ListHandler::default(), &env, src, Options::default())
    }

    fn html(src: &str) -> String {
        to_html(&lists(src))
    }

    #[test]
    fn siblings() {
        assert_eq!(html("*a\n*b"), "<ul><li>a</li>\n<li>b</li></ul>");
        assert_eq!(html("#a\n#b"), "<ol><li>a</li>\n<li>b</li></ol>");
    }

    #[test]
    fn nesting() {
        let tokens = lists("**a\n****b\n**c");
        assert_eq!(
            to_html(&tokens),
            "<ul><li><ul><li>a\n<ul><li><ul><li>b</li></ul></li></ul>\n</li><li>c</li></ul></li></ul>"
        );

        // The first level opened on the second line covers the shared prefix
        let opened = tokens
            .iter()
            .filter(|token| token.is_start("li"))
            .map(Token::tsr)
            .collect::<Vec<_>>();
        assert_eq!(
            opened,
            vec![
                Some(Span::new(0, 1)),
                Some(Span::new(1, 2)),
                Some(Span::new(4, 7)),
                Some(Span::new(7, 8)),
                Some(Span::new(10, 12)),
            ]
        );
    }

    #[test]
    fn dt_dd() {
        let tokens = lists(";a:b");
        assert_eq!(to_html(&tokens), "<dl><dt>a</dt><dd>b</dd></dl>");
        let dd = tokens.iter().find(|token| token.is_start("dd")).unwrap();
        assert_eq!(dd.tsr(), Some(Span::new(2, 3)));

        assert_eq!(html(";a\n:b"), "<dl><dt>a</dt>\n<dd>b</dd></dl>");
    }

    #[test]
    fn colon_inside_tag() {
        assert_eq!(html(";a<b>x:y"), "<dl><dt>a<b>x:y</dt></dl>");
    }

    #[test]
    fn ends_on_plain_line() {
        assert_eq!(html("*a\nb"), "<ul><li>a</li></ul>\nb");
    }

    #[test]
    fn sol_transparent_tokens_are_held() {
        assert_eq!(
            html("*a\n<!--c-->*b"),
            "<ul><li>a</li>\n<!--c--><li>b</li></ul>"
        );
    }

    #[test]
    fn unbalanced_block_end_closes_lists() {
        assert_eq!(html("*a</div>b"), "<ul><li>a</li></ul></div>b");
    }

    #[test]
    fn table_starts_new_context() {
        assert_eq!(
            html("*a<table>\n*b\n</table>\n*c"),
            "<ul><li>a<table>\n<ul><li>b</li></ul>\n</table></li>\n<li>c</li></ul>"
        );
    }

    #[test]
    fn list_item_limit() {
        let mut config = crate::config::SiteConfig::default();
        config.limits.max_list_items = 2;
        let env = crate::pipeline::Env::new(
            std::rc::Rc::new(config),
            std::rc::Rc::new(crate::pipeline::MemoryDataAccess::default()),
            "Main Page",
        )
        .unwrap();
        let err = futures::executor::block_on(
            env.parse("*a\n*b\n*c", Options::default()),
        )
        .unwrap_err();
        assert!(err.is_payload_too_large());
    }
}
