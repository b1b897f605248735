//! Conversion of apostrophe runs into bold and italic tags, one line at a
//! time.

use crate::{
    pipeline::{Ctx, Options, Result, TokenHandler, Transform},
    tokens::{Span, Syntax, Tag, Token},
};

/// The open bold and italic state of a line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Nothing open.
    None,
    /// Bold open.
    B,
    /// Italic open.
    I,
    /// Bold, then italic, open.
    BI,
    /// Italic, then bold, open.
    IB,
    /// A five-apostrophe run opened both, in an order that is not known yet.
    Both,
}

/// A bold or italic tag to emit in place of a quote marker.
#[derive(Clone, Copy)]
enum Q {
    Open(&'static str),
    Close(&'static str),
}

/// The position of a tag in the chunk buffer.
type Position = (usize, usize);

/// Converts `mw-quote` markers into `b` and `i` tags using the same
/// disambiguation rules as the legacy parser.
///
/// The line is buffered as alternating chunks of ordinary tokens and single
/// quote markers. At the end of the line the markers are balanced and
/// converted, and the whole line is released.
#[derive(Default)]
pub struct QuoteTransformer {
    /// The completed chunks of the current line. Odd chunks hold exactly one
    /// quote marker.
    chunks: Vec<Vec<Token>>,
    /// The chunk being accumulated.
    current: Vec<Token>,
    /// The most recent unclosed `b` start tag.
    last_b: Option<Position>,
    /// The most recent unclosed `i` start tag.
    last_i: Option<Position>,
    /// A quote marker was seen on the current line.
    active: bool,
}

impl QuoteTransformer {
    /// Finishes the current chunk.
    fn start_new_chunk(&mut self) {
        self.chunks.push(core::mem::take(&mut self.current));
    }

    /// Handles a quote marker.
    fn on_quote(&mut self, token: Token) -> Transform {
        self.active = true;
        self.start_new_chunk();
        self.current.push(token);
        self.start_new_chunk();
        Transform::Replace(vec![])
    }

    /// The length of the quote marker in chunk `index`.
    fn quote_len(&self, index: usize) -> usize {
        self.chunks[index]
            .first()
            .and_then(Token::tag)
            .and_then(|tag| tag.attr_str("value"))
            .map_or(0, str::len)
    }

    /// Resolves the quotes of the buffered line and releases it, followed by
    /// `token`.
    fn process_quotes(&mut self, token: Token) -> Transform {
        if !self.active {
            return Transform::Unchanged(token);
        }

        let (mut italics, mut bolds) = (0, 0);
        for index in (1..self.chunks.len()).step_by(2) {
            match self.quote_len(index) {
                2 => italics += 1,
                3 => bolds += 1,
                5 => {
                    italics += 1;
                    bolds += 1;
                }
                len => log::error!("quote marker of length {len}"),
            }
        }

        if italics % 2 == 1 && bolds % 2 == 1 {
            self.balance();
        }
        self.convert_quotes_to_tags();

        self.current.push(token);
        self.start_new_chunk();
        let out = self.chunks.drain(..).flatten().collect();
        self.reset();
        Transform::Replace(out)
    }

    /// Converts one bold marker into an apostrophe plus an italic marker so
    /// that bolds and italics are both even. A bold after a single-letter
    /// word wins, then one after a longer word, then one after a space.
    fn balance(&mut self) {
        let mut first_single_letter_word = None;
        let mut first_multi_letter_word = None;
        let mut first_space = None;
        for index in (1..self.chunks.len()).step_by(2) {
            if self.quote_len(index) != 3 {
                continue;
            }
            let preceding = self.chunks[index]
                .first()
                .and_then(Token::dp)
                .and_then(|dp| dp.tmp.preceding_2chars.as_deref())
                .unwrap_or_default();
            let mut chars = preceding.chars().rev();
            let last = chars.next();
            let second_to_last = chars.next();

            if last == Some(' ') {
                first_space.get_or_insert(index);
            } else if second_to_last == Some(' ') {
                first_single_letter_word = Some(index);
                break;
            } else {
                first_multi_letter_word.get_or_insert(index);
            }
        }

        // There may be no candidate at all, e.g. one five-apostrophe run
        if let Some(index) = first_single_letter_word
            .or(first_multi_letter_word)
            .or(first_space)
        {
            self.convert_bold(index);
        }
    }

    /// Turns the bold marker in chunk `index` into a literal apostrophe and
    /// an italic marker.
    fn convert_bold(&mut self, index: usize) {
        log::trace!("converting bold marker {index} to italic");
        self.chunks[index - 1].push(Token::from("'"));
        let tsr = self.chunks[index][0]
            .tsr()
            .map(|tsr| Span::new(tsr.start + 1, tsr.end));
        self.chunks[index] = vec![
            Tag::new("mw-quote")
                .with_attr("value", "''")
                .with_tsr(tsr)
                .self_closing(),
        ];
    }

    /// Replaces every quote marker with tags using the legacy parser's state
    /// machine, then closes whatever is still open at the end of the line.
    fn convert_quotes_to_tags(&mut self) {
        use Q::{Close, Open};

        let mut last_both = 0;
        let mut state = State::None;
        for index in (1..self.chunks.len()).step_by(2) {
            state = match (self.quote_len(index), state) {
                (2, State::I) => {
                    self.quote_to_tag(index, &[Close("i")], false);
                    State::None
                }
                (2, State::BI) => {
                    self.quote_to_tag(index, &[Close("i")], false);
                    State::B
                }
                (2, State::IB) => {
                    self.quote_to_tag(index, &[Close("b"), Close("i"), Open("b")], true);
                    State::B
                }
                (2, State::Both) => {
                    self.quote_to_tag(last_both, &[Open("b"), Open("i")], false);
                    self.quote_to_tag(index, &[Close("i")], false);
                    State::B
                }
                (2, state) => {
                    self.quote_to_tag(index, &[Open("i")], false);
                    if state == State::B {
                        State::BI
                    } else {
                        State::I
                    }
                }
                (3, State::B) => {
                    self.quote_to_tag(index, &[Close("b")], false);
                    State::None
                }
                (3, State::IB) => {
                    self.quote_to_tag(index, &[Close("b")], false);
                    State::I
                }
                (3, State::BI) => {
                    self.quote_to_tag(index, &[Close("i"), Close("b"), Open("i")], true);
                    State::I
                }
                (3, State::Both) => {
                    self.quote_to_tag(last_both, &[Open("i"), Open("b")], false);
                    self.quote_to_tag(index, &[Close("b")], false);
                    State::I
                }
                (3, state) => {
                    self.quote_to_tag(index, &[Open("b")], false);
                    if state == State::I {
                        State::IB
                    } else {
                        State::B
                    }
                }
                (5, State::B) => {
                    self.quote_to_tag(index, &[Close("b"), Open("i")], false);
                    State::I
                }
                (5, State::I) => {
                    self.quote_to_tag(index, &[Close("i"), Open("b")], false);
                    State::B
                }
                (5, State::BI) => {
                    self.quote_to_tag(index, &[Close("i"), Close("b")], false);
                    State::None
                }
                (5, State::IB) => {
                    self.quote_to_tag(index, &[Close("b"), Close("i")], false);
                    State::None
                }
                (5, State::Both) => {
                    self.quote_to_tag(last_both, &[Open("i"), Open("b")], false);
                    self.quote_to_tag(index, &[Close("b"), Close("i")], false);
                    State::None
                }
                (5, State::None) => {
                    last_both = index;
                    State::Both
                }
                (_, state) => state,
            };
        }

        // Order matters here
        if state == State::Both {
            self.quote_to_tag(last_both, &[Open("b"), Open("i")], false);
            state = State::BI;
        }
        if matches!(state, State::B | State::IB) {
            self.auto_close("b");
        }
        if matches!(state, State::I | State::BI | State::IB) {
            self.auto_close("i");
        }
        if state == State::BI {
            self.auto_close("b");
        }
    }

    /// Appends an end tag for `name` to the line and marks its start tag as
    /// having an inserted end.
    fn auto_close(&mut self, name: &'static str) {
        self.current.push(Tag::new(name).end());
        self.mark_auto_inserted_end(name);
    }

    /// Marks the open `name` tag as closed by an inserted end tag.
    fn mark_auto_inserted_end(&mut self, name: &str) {
        let last = if name == "b" { self.last_b } else { self.last_i };
        if let Some((chunk, offset)) = last
            && let Some(dp) = self.chunks[chunk]
                .get_mut(offset)
                .and_then(Token::dp_mut)
        {
            dp.auto_inserted_end = true;
        }
    }

    /// Replaces the quote marker in chunk `index` with `tags`.
    ///
    /// The marker source is divided between the tags: three bytes for each
    /// `b` and two for each `i`. For the misnested cases (`bogus_two`) the
    /// first tag closes the previously open tag without source, and the
    /// third tag reopens it without source.
    fn quote_to_tag(&mut self, index: usize, tags: &[Q], bogus_two: bool) {
        let tsr = self.chunks[index].first().and_then(Token::tsr);
        let mut pos = tsr.map(|tsr| tsr.start);
        let mut result = Vec::with_capacity(tags.len());
        for (i, &q) in tags.iter().enumerate() {
            let name = match q {
                Q::Open(name) | Q::Close(name) => name,
            };
            let mut tag = Tag::new(name);
            if let Some(start) = pos {
                if i == 0 && bogus_two {
                    self.mark_auto_inserted_end(name);
                } else if i == 2 && bogus_two {
                    tag.dp.auto_inserted_start = true;
                } else {
                    let width = if name == "b" { 3 } else { 2 };
                    tag.dp.tsr = Some(Span::new(start, start + width));
                    pos = Some(start + width);
                }
            }

            let last = match q {
                Q::Open(_) => Some((index, i)),
                Q::Close(_) => None,
            };
            if name == "b" {
                self.last_b = last;
            } else {
                self.last_i = last;
            }

            result.push(match q {
                Q::Open(_) => tag.start(),
                Q::Close(_) => tag.end(),
            });
        }

        if let (Some(pos), Some(tsr)) = (pos, tsr)
            && pos != tsr.end
        {
            log::warn!("quote tags cover {}..{pos}, not {tsr:?}", tsr.start);
        }
        self.chunks[index] = result;
    }

    /// Clears the line state.
    fn reset(&mut self) {
        self.chunks.clear();
        self.current.clear();
        self.last_b = None;
        self.last_i = None;
        self.active = false;
    }
}

impl TokenHandler for QuoteTransformer {
    fn name(&self) -> &'static str {
        "QuoteTransformer"
    }

    fn reset_state(&mut self, _options: &Options) {
        self.reset();
    }

    fn on_tag(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(match &token {
            Token::SelfClosing(tag) if tag.name == "mw-quote" => self.on_quote(token),
            // Wikitext table cells end the line for quote purposes
            Token::TagStart(tag)
                if matches!(tag.name.as_str(), "td" | "th") && tag.dp.stx != Some(Syntax::Html) =>
            {
                self.process_quotes(token)
            }
            _ => Transform::Unchanged(token),
        })
    }

    fn on_newline(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(self.process_quotes(token))
    }

    fn on_end(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        Ok(self.process_quotes(token))
    }

    fn on_any(&mut self, _ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        self.current.push(token);
        Ok(Transform::Replace(vec![]))
    }

    fn on_any_enabled(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::testing::{env_with, run_on_source},
        tokens::html::to_html,
    };

    fn quotes(src: &str) -> Vec<Token> {
        let env = env_with(&[]);
        run_on_source(
            &mut QuoteTransformer::default(),
            &env,
            src,
            Options::default(),
        )
    }

    fn html(src: &str) -> String {
        to_html(&quotes(src))
    }

    #[test]
    fn simple() {
        assert_eq!(html("''a'' '''b'''"), "<i>a</i> <b>b</b>");
        assert_eq!(html("'''''a'''''"), "<i><b>a</b></i>");
        assert_eq!(html("'''''a''' b''"), "<i><b>a</b> b</i>");
        assert_eq!(html("'''''a'' b'''"), "<b><i>a</i> b</b>");
    }

    #[test]
    fn unclosed_at_end_of_line() {
        let tokens = quotes("''a\nb");
        assert_eq!(to_html(&tokens), "<i>a</i>\nb");
        let open = tokens[0].dp().unwrap();
        assert!(open.auto_inserted_end);
        assert_eq!(open.tsr, Some(Span::new(0, 2)));
        assert_eq!(tokens[2].tsr(), None);
    }

    #[test]
    fn misnested() {
        let tokens = quotes("''a'''b''c'''");
        assert_eq!(to_html(&tokens), "<i>a<b>b</b></i><b>c</b>");
        // the bogus close and reopen of the bold have no source
        let reopen = tokens
            .iter()
            .filter(|token| token.is_start("b"))
            .nth(1)
            .unwrap();
        assert!(reopen.dp().unwrap().auto_inserted_start);
        assert_eq!(reopen.tsr(), None);
    }

    #[test]
    fn disambiguation_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(html("'''a'' b'''"), "<b>a<i> b</i></b><i></i>");
        }
    }

    #[test]
    fn single_letter_word_wins() {
        assert_eq!(
            html("x '''y'' a b'''c'''"),
            "x <b>y<i> a b'</i>c</b>"
        );
    }

    #[test]
    fn multi_letter_word_beats_space() {
        assert_eq!(
            html("a '''b'' cd'''e'''"),
            "a <b>b<i> cd'</i>e</b>"
        );
    }

    #[test]
    fn converted_bold_tsr() {
        let tokens = quotes("a b'''c''");
        assert_eq!(to_html(&tokens), "a b'<i>c</i>");
        let i = tokens.iter().find(|token| token.is_start("i")).unwrap();
        assert_eq!(i.tsr(), Some(Span::new(4, 6)));
    }

    #[test]
    fn html_cells_do_not_end_the_line() {
        let env = env_with(&[]);
        let tokens = run_on_source(
            &mut QuoteTransformer::default(),
            &env,
            "''a<td>b''",
            Options::default(),
        );
        assert_eq!(to_html(&tokens), "<i>a<td>b</i>");
    }
}
