//! Repairs for token sequences which only become meaningful once templates
//! and extensions have been expanded.
//!
//! Expanded content is spliced into the document without being tokenized in
//! its final context, so a `{|` from a template can arrive as text at the
//! start of a line, and a table cell can arrive with no table around it.

use crate::{
    pipeline::{Ctx, Options, Resource, Result, TokenHandler, Transform},
    tokenizer::StartRule,
    tokens::{
        Syntax, Tag, Token,
        utils::{is_html_tag, shift_tsr, strip_eof},
    },
};

/// Fixes up table and list syntax in expanded content, and tunnels empty
/// lines in front of category links.
#[derive(Default)]
pub struct TokenStreamPatcher {
    /// Whether the content is the document itself.
    at_top_level: bool,
    /// The source position of the current token, if known.
    src_offset: Option<usize>,
    /// Whether the current token is at the start of a line.
    sol: bool,
    /// Newlines and whitespace held back in case a category link follows.
    token_buf: Vec<Token>,
    /// The number of open wikitext tables.
    wiki_table_nesting: usize,
    /// The name of the last table cell converted to text, whose
    /// `mw:TSRMarker` should be dropped.
    last_converted_table_cell: Option<String>,
}

impl TokenStreamPatcher {
    fn reset(&mut self) {
        self.src_offset = Some(0);
        self.sol = true;
        self.token_buf.clear();
        self.wiki_table_nesting = 0;
        self.last_converted_table_cell = None;
    }

    fn clear_sol(&mut self) {
        self.src_offset = None;
        self.sol = false;
    }

    /// Tokenizes `text` with `rule` as though it started at the current
    /// source position.
    fn retokenize(&self, ctx: &Ctx<'_>, text: &str, rule: StartRule) -> Option<Vec<Token>> {
        match ctx.env.tokenizer().tokenize(text, rule, true) {
            Ok(mut tokens) => {
                strip_eof(&mut tokens);
                shift_tsr(
                    &mut tokens,
                    self.src_offset.and_then(|offset| isize::try_from(offset).ok()),
                );
                for token in &mut tokens {
                    if let Some(dp) = token.dp_mut() {
                        dp.tmp.reparsed = true;
                    }
                }
                Some(tokens)
            }
            Err(err) => {
                log::error!("failed to retokenize {text:?} as {rule:?}: {err}");
                None
            }
        }
    }

    /// Converts a table token found outside of a table back to text.
    fn convert_token_to_string(ctx: &Ctx<'_>, token: Token) -> Vec<Token> {
        let Some(tag) = token.tag() else {
            return vec![token];
        };

        if let Some(tsr) = tag.dp.tsr
            && tsr.end > tsr.start
            && let Some(src) = ctx.frame.src().get(tsr.start..tsr.end)
        {
            // Not at the start of a line, so the pipe cannot become a cell
            // again
            return match ctx.env.tokenizer().tokenize(src, StartRule::Start, false) {
                Ok(mut tokens) => {
                    strip_eof(&mut tokens);
                    shift_tsr(&mut tokens, isize::try_from(tsr.start).ok());
                    tokens
                }
                Err(err) => {
                    log::error!("failed to retokenize {src:?}: {err}");
                    vec![Token::from(src)]
                }
            };
        }

        if tag.dp.auto_inserted_start && tag.dp.auto_inserted_end {
            return vec![];
        }

        let is_start = matches!(token, Token::TagStart(_));
        let text = match (is_start, tag.name.as_str()) {
            (true, "td") => "|",
            (true, "th") => "!",
            (true, "tr") => "|-",
            (true, "caption") => "|+",
            (false, "caption") => return vec![],
            (false, "table") if matches!(token, Token::TagEnd(_)) => "|}",
            _ => return vec![token],
        };
        vec![Token::from(text)]
    }

    fn on_text(&mut self, ctx: &Ctx<'_>, text: String) -> Result<Transform> {
        let is_space = text.chars().all(char::is_whitespace);

        // Whitespace between buffered newlines is buffered too
        if !self.token_buf.is_empty() && is_space {
            self.token_buf.push(Token::Text(text));
            return Ok(Transform::Replace(vec![]));
        }

        let mut out = None;
        if self.sol && self.at_top_level && text.starts_with("{|") {
            if let Some(tokens) = self.retokenize(ctx, &text, StartRule::TableStartTag) {
                self.wiki_table_nesting += 1;
                self.last_converted_table_cell = None;
                out = Some(tokens);
            } else {
                self.clear_sol();
            }
        } else if self.sol && self.at_top_level && text.starts_with(['*', '#', ':', ';']) {
            out = self.retokenize(ctx, &text, StartRule::ListItem);
            self.clear_sol();
        } else if self.sol && is_space {
            self.src_offset = self.src_offset.map(|offset| offset + text.len());
        } else {
            self.clear_sol();
        }

        Ok(Transform::Replace(
            self.flush(out.unwrap_or_else(|| vec![Token::Text(text)])),
        ))
    }

    /// Replaces the buffered newlines and whitespace in front of a category
    /// link with `mw:EmptyLine` metas. A buffered transclusion meta stays
    /// where it is.
    fn tunnel_empty_lines(&mut self) -> Vec<Token> {
        let buf = core::mem::take(&mut self.token_buf);
        if buf.is_empty() {
            return buf;
        }

        let empty_line = |tokens: &[Token]| {
            let src = tokens
                .iter()
                .map(|token| match token {
                    Token::Text(text) => text.as_str(),
                    _ => "\n",
                })
                .collect::<String>();
            let mut meta = Token::meta("mw:EmptyLine");
            meta.dp.src = Some(src);
            meta.self_closing()
        };

        let i = buf
            .iter()
            .position(|token| matches!(token, Token::SelfClosing(_)))
            .unwrap_or(buf.len());
        let mut out = vec![empty_line(&buf[..i])];
        if i < buf.len() {
            out.push(buf[i].clone());
            if i + 1 < buf.len() {
                out.push(empty_line(&buf[i + 1..]));
            }
        }
        out
    }

    fn on_self_closing(&mut self, tag: Tag) -> Vec<Token> {
        if tag.name == "meta" && tag.dp.stx != Some(Syntax::Html) {
            // Metas do not change the start of line state
            self.src_offset = tag.dp.tsr.map(|tsr| tsr.end);
            let ty = tag.attr_str("typeof");
            if ty == Some("mw:TSRMarker")
                && self.last_converted_table_cell.is_some()
                && self.last_converted_table_cell.as_deref() == tag.attr_str("data-etag")
            {
                self.last_converted_table_cell = None;
                return vec![];
            } else if !self.token_buf.is_empty() && ty == Some("mw:Transclusion") {
                // A category link may still follow
                self.token_buf.push(tag.self_closing());
                return vec![];
            }
            vec![tag.self_closing()]
        } else if tag.name == "link" && tag.attr_str("rel") == Some("mw:PageProp/Category") {
            let mut out = self.tunnel_empty_lines();
            out.push(tag.self_closing());
            self.clear_sol();
            out
        } else {
            self.clear_sol();
            vec![tag.self_closing()]
        }
    }

    fn on_start_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Vec<Token>> {
        let mut out = vec![];
        match token.name() {
            Some(name) if self.at_top_level && !is_html_tag(&token) => {
                if name == "table" {
                    self.last_converted_table_cell = None;
                    self.wiki_table_nesting += 1;
                    out.push(token);
                } else if matches!(name, "td" | "th" | "tr" | "caption") {
                    if self.wiki_table_nesting == 0 {
                        if matches!(name, "td" | "th") {
                            self.last_converted_table_cell = Some(name.to_string());
                        }
                        out = Self::convert_token_to_string(ctx, token);
                    } else {
                        if matches!(name, "td" | "th") {
                            ctx.env.bump(Resource::TableCells, 1)?;
                        }
                        self.last_converted_table_cell = None;
                        out.push(token);
                    }
                } else {
                    out.push(token);
                }
            }
            _ => out.push(token),
        }
        self.clear_sol();
        Ok(out)
    }

    fn on_end_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Vec<Token> {
        let mut out = vec![];
        match token.name() {
            Some(name) if self.at_top_level && !is_html_tag(&token) => {
                if self.wiki_table_nesting > 0 {
                    if name == "table" {
                        self.last_converted_table_cell = None;
                        self.wiki_table_nesting -= 1;
                    }
                    out.push(token);
                } else if matches!(name, "table" | "caption") {
                    out = Self::convert_token_to_string(ctx, token);
                } else {
                    out.push(token);
                }
            }
            _ => out.push(token),
        }
        self.clear_sol();
        out
    }

    /// Emits the buffered tokens ahead of `tokens`.
    fn flush(&mut self, tokens: Vec<Token>) -> Vec<Token> {
        if self.token_buf.is_empty() {
            tokens
        } else {
            let mut out = core::mem::take(&mut self.token_buf);
            out.extend(tokens);
            out
        }
    }
}

impl TokenHandler for TokenStreamPatcher {
    fn name(&self) -> &'static str {
        "TokenStreamPatcher"
    }

    fn reset_state(&mut self, options: &Options) {
        self.at_top_level = !options.in_template && options.ext_tag.is_none();
        self.reset();
    }

    fn on_newline(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        self.src_offset = token.tsr().map(|tsr| tsr.end);
        self.sol = true;
        self.token_buf.push(token);
        Ok(Transform::Replace(vec![]))
    }

    fn on_end(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let out = self.on_any(ctx, token);
        self.reset();
        out
    }

    fn on_any(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let out = match token {
            Token::Text(text) => return self.on_text(ctx, text),
            Token::Comment(..) => {
                // Comments do not change the start of line state
                self.src_offset = token.tsr().map(|tsr| tsr.end);
                vec![token]
            }
            Token::SelfClosing(tag) => self.on_self_closing(tag),
            token @ Token::TagStart(_) => self.on_start_tag(ctx, token)?,
            token @ Token::TagEnd(_) => self.on_end_tag(ctx, token),
            token => vec![token],
        };
        Ok(Transform::Replace(self.flush(out)))
    }

    fn on_any_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::testing::{env_with, run_handler, run_on_source},
        tokens::html::to_html,
    };

    fn patch(src: &str) -> Vec<Token> {
        let env = env_with(&[]);
        run_on_source(&mut TokenStreamPatcher::default(), &env, src, Options::default())
    }

    fn patch_tokens(tokens: Vec<Token>) -> Vec<Token> {
        let env = env_with(&[]);
        run_handler(
            &mut TokenStreamPatcher::default(),
            &env,
            "",
            tokens,
            Options::default(),
        )
    }

    #[test]
    fn cell_outside_table() {
        let tokens = patch("a\n|b");
        assert_eq!(to_html(&tokens), "a\n|b");
        assert!(!tokens.iter().any(|token| token.is_meta("mw:TSRMarker")));
    }

    #[test]
    fn table_is_untouched() {
        let tokens = patch("{|\n|x\n|}");
        assert!(tokens[0].is_start("table"));
        assert_eq!(
            tokens.iter().filter(|token| token.is_start("table")).count(),
            1
        );
        assert!(tokens.iter().any(|token| token.is_start("td")));
        assert!(tokens.iter().any(|token| token.is_end("table")));
    }

    #[test]
    fn stray_table_end() {
        let tokens = patch_tokens(vec![Tag::new("table").end(), Token::eof(None)]);
        assert_eq!(to_html(&tokens), "|}");
    }

    #[test]
    fn table_start_in_text() {
        let tokens = patch_tokens(vec![Token::from("{| class=\"x\""), Token::eof(None)]);
        let table = tokens
            .iter()
            .find(|token| token.is_start("table"))
            .and_then(Token::tag)
            .unwrap();
        assert_eq!(table.attr_str("class"), Some("x"));
        assert!(table.dp.tmp.reparsed);
    }

    #[test]
    fn list_item_in_text() {
        let tokens = patch_tokens(vec![Token::from("*a"), Token::eof(None)]);
        let item = tokens
            .iter()
            .find(|token| token.is_start("listItem"))
            .and_then(Token::tag)
            .unwrap();
        assert_eq!(item.attr_str("bullets"), Some("*"));
        assert!(tokens.contains(&Token::from("a")));
    }

    #[test]
    fn text_mid_line_is_kept() {
        let tokens = patch_tokens(vec![
            Token::from("x"),
            Token::from("*a"),
            Token::eof(None),
        ]);
        assert_eq!(to_html(&tokens), "x*a");
    }

    #[test]
    fn empty_lines_before_category() {
        let category = Tag::new("link")
            .with_attr("rel", "mw:PageProp/Category")
            .self_closing();
        let tokens = patch_tokens(vec![
            Token::from("a"),
            Token::newline(None),
            Token::newline(None),
            Token::from(" "),
            category.clone(),
            Token::eof(None),
        ]);
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0], Token::from("a"));
        assert!(tokens[1].is_meta("mw:EmptyLine"));
        assert_eq!(tokens[1].dp().and_then(|dp| dp.src.as_deref()), Some("\n\n "));
        assert_eq!(tokens[2], category);
    }

    #[test]
    fn buffered_newlines_are_released() {
        assert_eq!(to_html(&patch("a\n\nb")), "a\n\nb");
    }

    #[test]
    fn table_cells_are_limited() {
        use crate::{
            config::SiteConfig,
            pipeline::{Env, MemoryDataAccess},
        };
        use std::rc::Rc;

        let mut config = SiteConfig::default();
        config.limits.max_table_cells = 1;
        let env = Env::new(
            Rc::new(config),
            Rc::new(MemoryDataAccess::default()),
            "Main Page",
        )
        .unwrap();
        let err = futures::executor::block_on(env.parse("{|\n|a||b\n|}", Options::default()))
            .unwrap_err();
        assert!(err.is_payload_too_large(), "{err}");
    }
}
