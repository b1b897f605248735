//! A parsing expression grammar for Wikitext documents.
//!
//! This grammar converts the Wikitext document into the flat token stream
//! which the token handlers process. Templates, template arguments, and
//! extension tags come out as single unexpanded tokens.

// Clippy: Most of the arguments are hidden. It is not possible to apply
// this annotation directly to the parser because rust-peg does not understand
// it.
#![allow(clippy::too_many_arguments)]

// This code is heavily adapted from the Parsoid grammar at
// <https://github.com/wikimedia/mediawiki-services-parsoid>
//
// The upstream copyright is:
//
// SPDX-License-Identifier: GPL-2.0-or-later

use super::PegTokenizer;
use crate::tokens::{
    DataMw, DataParsoid, ExtBody, Kv, KvOffsets, KvValue, Span, Syntax, Tag, Token,
    utils::VOID_TAGS,
};
use core::iter;
use peg::RuleResult;

/// Per-call tokenizer state.
pub(super) struct State<'a> {
    /// The tokenizer, for site tables.
    pub tokenizer: &'a PegTokenizer,
    /// Whether the input starts at the start of a line.
    pub sol: bool,
}

peg::parser! { pub(super) grammar wikitext(state: &State<'_>) for str {
    /// The top-level start rule.
    pub rule start() -> Vec<Token>
    = ctx:({ Context::default() })
      t:tlb(&ctx)*
      n:newline_token()*
      end:position!()
    {
        let mut tokens = reduce(t.into_iter().flatten().chain(n));
        tokens.push(Token::eof(Some(Span::at(end))));
        tokens
    }

    /// A lone table start tag, used to reprocess text which turned out to be
    /// at the start of a line.
    pub rule table_start_tag_only() -> Vec<Token>
    = ctx:({ Context::default() })
      t:table_start_tag(&ctx)
    { t }

    /// A lone list item, used to reprocess text which turned out to be at the
    /// start of a line.
    pub rule list_item_only() -> Vec<Token>
    = ctx:({ Context::default() })
      t:list_item(&ctx)
    { t }

    /// A run of attributes, used to reparse expanded attribute text.
    pub rule generic_newline_attributes() -> Vec<Kv>
    = ctx:({ Context::default() })
      t:generic_newline_attribute(&ctx)*
      space_or_newline_or_solidus()*
    { t }

    ////////////////
    // Block flow //
    ////////////////

    /// A document is a sequence of top-level blocks.
    rule tlb(ctx: &Context) -> Vec<Token>
    = !eof()
      t:block(ctx)
    { t }

    /// The actual content of a top-level block.
    rule block(ctx: &Context) -> Vec<Token>
    = sol_block_line(ctx)
    / inlineline(ctx)
    / progressing_sol()

    /// A block item that is anchored to the start of a line (headings, list
    /// items, horizontal rules, tables).
    rule sol_block_line(ctx: &Context) -> Vec<Token>
    = s:sol()
      bl:block_line(ctx)
    { reduce(s.into_iter().chain(bl)) }

    /// A start of line which is not followed by a block item. Every
    /// alternative consumes input, or repetitions of `block` would never end.
    rule progressing_sol() -> Vec<Token>
    = p:newline_token()
      st:sol_transparent()*
    { reduce(iter::once(p).chain(st)) }
    / input_start()
      st:sol_transparent()+
    { reduce(st) }

    rule block_line(ctx: &Context) -> Vec<Token>
    = heading(ctx)
    / list_item(ctx)
    / hr()
    / &[' ' | '\t' | '<' | '{' | '|' | '!'] t:table_line(ctx) { t }

    //////////////
    // Headings //
    //////////////

    rule heading(ctx: &Context) -> Vec<Token>
    = &"="
      start:position!()
      s:$("="+)
      c:inlineline(&ctx.with_h())?
      e:$("="+)
      end:position!()
      spc:(t:$(space()+) { Token::from(t) } / comment())*
      &eolf()
    {? heading_tokens(start, s.len(), c, e.len(), end, spc) }

    ////////////////
    // List items //
    ////////////////

    rule list_item(ctx: &Context) -> Vec<Token>
    = dtdd(ctx)
    / li(ctx)

    rule li(ctx: &Context) -> Vec<Token>
    = start:position!()
      bullets:$(list_char()+)
      c:inlineline(ctx)?
      &(eolf() / inline_breaks(ctx))
    { list_item_tokens(bullets, Span::new(start, start + bullets.len()), None, c) }

    rule dtdd(ctx: &Context) -> Vec<Token>
    = start:position!()
      bullets:$((!(";" !list_char()) list_char())* ";")
      c:inlineline(&ctx.with_colon())?
      colon:position!()
      ":"
      d:inlineline(ctx)?
      &eolf()
    {
        let mut dd_bullets = bullets.to_string();
        dd_bullets.pop();
        dd_bullets.push(':');
        let mut tokens = list_item_tokens(bullets, Span::new(start, start + bullets.len()), None, c);
        tokens.extend(list_item_tokens(&dd_bullets, Span::new(colon, colon + 1), Some(Syntax::Row), d));
        tokens
    }

    rule list_char() = ['*' | '#' | ':' | ';']

    rule hr() -> Vec<Token>
    = start:position!()
      "----" "-"*
      end:position!()
    { vec![Tag::new("hr").with_tsr(Some(Span::new(start, end))).self_closing()] }

    ////////////
    // Tables //
    ////////////

    rule table_line(ctx: &Context) -> Vec<Token>
    = sc:space_or_comment()*
      t:(
          table_start_tag(ctx)
        / table_content_line(&ctx.with_table())
        / t:table_end_tag() { vec![t] }
      )
    { reduce(sc.into_iter().chain(t)) }

    rule table_start_tag(ctx: &Context) -> Vec<Token>
    = start:position!()
      "{" pipe()
      attributes:table_attributes(&ctx.without_table())
      space()*
      end:position!()
    {
        vec![Tag::new("table")
            .with_attribs(attributes)
            .with_tsr(Some(Span::new(start, end)))
            .start()]
    }

    rule table_content_line(ctx: &Context) -> Vec<Token>
    = table_heading_tags(&ctx.with_table_head())
    / t:table_row_tag(ctx) { vec![t] }
    / table_data_tags(ctx)
    / table_caption_tag(ctx)

    rule table_caption_tag(ctx: &Context) -> Vec<Token>
    = start:position!()
      pipe() "+"
      attributes:row_syntax_table_attrs(ctx)?
      tag_end:position!()
      content:inlineline(ctx)?
      end:position!()
    { table_cell_tokens("caption", attributes, Span::new(start, tag_end), end, content, false) }

    rule table_row_tag(ctx: &Context) -> Token
    = start:position!()
      pipe() "-"+
      attributes:table_attributes(&ctx.without_table())
      space()*
      end:position!()
    {
        Tag::new("tr")
            .with_attribs(attributes)
            .with_tsr(Some(Span::new(start, end)))
            .start()
    }

    rule table_heading_tags(ctx: &Context) -> Vec<Token>
    = first:table_cell(ctx, "th", <"!">, false)
      rest:table_cell(ctx, "th", <("!!" / pipe_pipe())>, true)*
    { reduce(first.into_iter().chain(rest.into_iter().flatten())) }

    rule table_data_tags(ctx: &Context) -> Vec<Token>
    = first:table_cell(ctx, "td", <pipe() !['+' | '-']>, false)
      rest:table_cell(ctx, "td", <pipe_pipe()>, true)*
    { reduce(first.into_iter().chain(rest.into_iter().flatten())) }

    rule table_cell(ctx: &Context, name: &'static str, delimiter: rule<()>, row: bool) -> Vec<Token>
    = start:position!()
      delimiter()
      !"}"
      attributes:row_syntax_table_attrs(ctx)?
      tag_end:position!()
      content:inlineline(ctx)?
      end:position!()
    { table_cell_tokens(name, attributes, Span::new(start, tag_end), end, content, row) }

    rule row_syntax_table_attrs(ctx: &Context) -> Vec<Kv>
    = attributes:table_attributes(&ctx.with_table_cell_attrs())
      space()*
      pipe() !pipe()
    { attributes }

    rule table_end_tag() -> Token
    = start:position!()
      pipe() "}"
      end:position!()
    { Tag::new("table").with_tsr(Some(Span::new(start, end))).end() }

    rule pipe() = "|" / "{{!}}"

    rule pipe_pipe() -> () = ("||" / "{{!}}{{!}}") { }

    /////////////////
    // Inline flow //
    /////////////////

    rule inlineline(ctx: &Context) -> Vec<Token>
    = t:(
          t:$(text_char()+) { vec![Token::from(t)] }
        / !inline_breaks(ctx) t:inlineline_element(ctx) { t }
      )+
    { reduce(t.into_iter().flatten()) }

    rule inlineline_element(ctx: &Context) -> Vec<Token>
    = inline_element(ctx)
    / !newline() c:$([_]) { vec![Token::from(c)] }

    rule inline_element(ctx: &Context) -> Vec<Token>
    = &"<" t:angle_bracket_markup(ctx) { t }
    / &"{" t:template_param_or_template(ctx) { t }
    / &"[[" t:wikilink(ctx) { t }
    / &"'" t:quote() { t }
    / &"&" t:htmlentity() { t }
    / &"__" t:behavior_switch() { vec![t] }

    rule angle_bracket_markup(ctx: &Context) -> Vec<Token>
    = t:comment() { vec![t] }
    / t:include_tag() { vec![t] }
    / t:extension_tag(ctx) { vec![t] }
    / t:html_tag(ctx) { vec![t] }

    ////////////
    // Quotes //
    ////////////

    rule quote() -> Vec<Token>
    = start:position!()
      quotes:$("''" "'"*)
      tokens:#{|input, pos| RuleResult::Matched(pos, quote_tokens(input, start, quotes))}
    { tokens }

    ///////////////
    // Templates //
    ///////////////

    rule template_param_or_template(ctx: &Context) -> Vec<Token>
    = &"{{"
      t:(
          &("{{" &("{{{"+ !"{") template_param(ctx))
          t:(template(ctx) / broken_template())
          { vec![t] }
        / p:$("{" &("{{{"+ !"{"))?
          t:template_param(ctx)
          { reduce(p.map(Token::from).into_iter().chain(iter::once(t))) }
        / p:$("{" &("{{" !"{"))?
          t:template(ctx)
          { reduce(p.map(Token::from).into_iter().chain(iter::once(t))) }
        / t:broken_template() { vec![t] }
      )
    { t }

    rule broken_template() -> Token
    = "{{"
    { Token::from("{{") }

    rule template(ctx: &Context) -> Token
    = ctx:({ ctx.with_prod_kind(ProdKind::Template) })
      start:position!()
      "{{"
      nl_comment_space()*
      target_start:position!()
      target:template_target(&ctx)
      target_end:position!()
      params:(
          nl_comment_space()*
          "|"
          t:(template_arg_empty() / template_arg(&ctx))
          { t }
      )*
      nl_comment_space()*
      inline_breaks(&ctx)
      "}}"
      src:src_from(start)
    {
        template_token(
            "template",
            target,
            Span::new(target_start, target_end),
            params,
            src,
            start,
        )
    }
    / t:$("{{" space_or_newline()* "}}")
    { Token::from(t) }

    rule template_param(ctx: &Context) -> Token
    = ctx:({ ctx.with_prod_kind(ProdKind::Template) })
      start:position!()
      "{{{"
      target_start:position!()
      target:template_target(&ctx)?
      target_end:position!()
      params:(
          nl_comment_space()*
          "|"
          value_start:position!()
          t:(
              t:nl_comment_space()* &("|" / "}}}") { t }
            / template_arg_value(&ctx)
          )
          value_end:position!()
          {
              Kv::new("", into_value(t)).with_offsets(Some(KvOffsets {
                  key: Span::at(value_start),
                  value: Span::new(value_start, value_end),
              }))
          }
      )*
      nl_comment_space()*
      inline_breaks(&ctx)
      "}}}"
      src:src_from(start)
    {
        template_token(
            "templatearg",
            target.unwrap_or_default(),
            Span::new(target_start, target_end),
            params,
            src,
            start,
        )
    }

    rule template_target(ctx: &Context) -> Vec<Token>
    = ctx:({
          ctx.without_equal()
              .without_table()
              .with_template_arg()
              .without_table_cell_attrs()
      })
      t:(
          !inline_breaks(&ctx) t:inlineline(&ctx) { t }
        / t:newline_token() { vec![t] }
      )+
    { reduce(t.into_iter().flatten()) }

    rule template_arg_empty() -> Kv
    = start:position!()
      t:nl_comment_space()*
      end:position!()
      &("|" / "}}")
    {
        Kv::new("", into_value(t)).with_offsets(Some(KvOffsets {
            key: Span::at(start),
            value: Span::new(start, end),
        }))
    }

    rule template_arg(ctx: &Context) -> Kv
    = start:position!()
      name:template_arg_name(ctx)
      key_end:position!()
      value:(
          "="
          value_start:position!()
          space()*
          v:template_arg_value(ctx)?
          { (value_start, v.unwrap_or_default()) }
      )?
      end:position!()
    {
        match value {
            Some((value_start, v)) => Kv::new(into_value(name), into_value(v)).with_offsets(Some(KvOffsets {
                key: Span::new(start, key_end),
                value: Span::new(value_start, end),
            })),
            None => Kv::new("", into_value(name)).with_offsets(Some(KvOffsets {
                key: Span::at(start),
                value: Span::new(start, end),
            })),
        }
    }

    rule template_arg_name(ctx: &Context) -> Vec<Token>
    = template_arg_text(&ctx.with_equal())
    / &"=" { vec![] }

    rule template_arg_value(ctx: &Context) -> Vec<Token>
    = template_arg_text(&ctx.without_equal())

    rule template_arg_text(ctx: &Context) -> Vec<Token>
    = ctx:({
          ctx.without_table()
              .with_template_arg()
              .without_table_cell_attrs()
      })
      t:(
          nested_block(&ctx)
        / t:newline_token() { vec![t] }
      )+
    { reduce(t.into_iter().flatten()) }

    rule nested_block(ctx: &Context) -> Vec<Token>
    = !inline_breaks(ctx)
      t:block(ctx)
    { t }

    ///////////////
    // Wikilinks //
    ///////////////

    rule wikilink(ctx: &Context) -> Vec<Token>
    = ctx:({ ctx.with_prod_kind(ProdKind::Link).without_equal() })
      start:position!()
      "[["
      target:$(wikilink_target_char()+)
      target_end:position!()
      content:("|" c:inlineline(&ctx.with_linkdesc())? { c.unwrap_or_default() })*
      "]]"
      src:src_from(start)
    {? wikilink_tokens(state.tokenizer, target, content, start, target_end, src) }

    rule wikilink_target_char()
    = [^ '|' | '[' | ']' | '{' | '}' | '<' | '>' | '\r' | '\n']

    //////////////////////
    // Behavior switches //
    //////////////////////

    rule behavior_switch() -> Token
    = start:position!()
      "__" word:$(['a'..='z' | 'A'..='Z' | '0'..='9']+) "__"
      src:src_from(start)
    {?
        if state.tokenizer.is_behavior_switch(word) {
            Ok(behavior_switch_token(word, src, start))
        } else {
            Err("behavior switch")
        }
    }

    //////////////////////
    // Comments and tags //
    //////////////////////

    rule comment() -> Token
    = start:position!()
      "<!--"
      c:$((!"-->" [_])*)
      ("-->" / eof())
      end:position!()
    { Token::Comment(c.to_string(), DataParsoid::with_tsr(Span::new(start, end))) }

    rule include_tag() -> Token
    = start:position!()
      "<" close:"/"?
      name:$(tag_name())
      &assert(is_include_tag(name), "include tag")
      [^ '>']*
      ">"
      src:src_from(start)
    { include_token(name, close.is_some(), src, start) }

    rule extension_tag(ctx: &Context) -> Token
    = t:xmlish_tag(ctx)
      &assert(!t.close && state.tokenizer.is_extension_tag(t.name), "extension tag")
      token:#{|input, pos| extension_token(input, pos, t)}
    { token }

    rule html_tag(ctx: &Context) -> Token
    = t:xmlish_tag(ctx)
    { html_token(t) }

    rule xmlish_tag(ctx: &Context) -> XmlTag<'input>
    = start:position!()
      "<" close:"/"?
      name:$(tag_name())
      attributes:generic_newline_attribute(
          &ctx.without_equal().without_table().without_table_cell_attrs()
      )*
      space_or_newline_or_solidus()*
      self_close:"/"?
      space()*
      ">"
      end:position!()
    {
        XmlTag {
            name,
            close: close.is_some(),
            self_close: self_close.is_some(),
            attributes,
            span: Span::new(start, end),
        }
    }

    rule tag_name()
    = ['a'..='z' | 'A'..='Z'] [^ '\t' | '\n' | '\x0b' | '\x0c' | '\r' | ' ' | '/' | '>' | '<' | '\0']*

    ////////////////
    // Attributes //
    ////////////////

    rule generic_newline_attribute(ctx: &Context) -> Kv
    = space_or_newline_or_solidus()*
      name_start:position!()
      name:attribute_name(ctx, false)
      name_src:src_from(name_start)
      value:(
          space_or_newline()*
          "="
          space_or_newline()*
          v:generic_attribute_value(ctx)
          { v }
      )?
    { make_kv(name, name_start, name_src, value) }

    rule table_attributes(ctx: &Context) -> Vec<Kv>
    = t:(
          t:table_attribute(ctx) { Some(t) }
        / space()* ['\0' | '/' | '=' | '>'] { None }
      )*
    { t.into_iter().flatten().collect() }

    rule table_attribute(ctx: &Context) -> Kv
    = space()*
      name_start:position!()
      name:attribute_name(ctx, true)
      name_src:src_from(name_start)
      value:(
          space()*
          "="
          space()*
          v:table_attribute_value(ctx)
          { v }
      )?
    { make_kv(name, name_start, name_src, value) }

    rule attribute_name(ctx: &Context, table: bool) -> Vec<Token>
    = first:(
          t:$(['"' | '\'' | '=']) { vec![Token::from(t)] }
        / attribute_name_piece(ctx, table)
      )
      rest:attribute_name_piece(ctx, table)*
    { reduce(first.into_iter().chain(rest.into_iter().flatten())) }

    rule attribute_name_piece(ctx: &Context, table: bool) -> Vec<Token>
    = t:$([c if is_attribute_name_char(c, table)]+) { vec![Token::from(t)] }
    / !inline_breaks(ctx)
      t:(
          directive(ctx)
        / t:$(!(space_or_newline() / ['\0' | '/' | '=' | '>' | '<']) [_]) { vec![Token::from(t)] }
      )
    { t }

    rule generic_attribute_value(ctx: &Context) -> RawValue<'input>
    = q:['"' | '\'']
      start:position!()
      t:attribute_value_text(ctx, Some(q), false)
      src:src_from(start)
      ([c if c == q] / &("/"? ">"))
    { RawValue { tokens: t, start, src } }
    / start:position!()
      t:attribute_value_text(ctx, None, false)
      src:src_from(start)
      &(space_or_newline() / eof() / "/"? ">")
    { RawValue { tokens: t, start, src } }

    rule table_attribute_value(ctx: &Context) -> RawValue<'input>
    = q:['"' | '\'']
      start:position!()
      t:attribute_value_text(ctx, Some(q), true)
      src:src_from(start)
      ([c if c == q] / &("!!" / ['|' | '\r' | '\n']))
    { RawValue { tokens: t, start, src } }
    / start:position!()
      t:attribute_value_text(ctx, None, true)
      src:src_from(start)
      &(space_or_newline() / eof() / "!!" / "|")
    { RawValue { tokens: t, start, src } }

    rule attribute_value_text(ctx: &Context, quote: Option<char>, table: bool) -> Vec<Token>
    = t:(
          t:$([c if is_attribute_value_char(c, quote, table)]+) { vec![Token::from(t)] }
        / !inline_breaks(ctx)
          !"/>"
          t:(
              directive(ctx)
            / t:htmlentity_text() { vec![t] }
            / t:$([c if is_attribute_value_special(c, table)]) { vec![Token::from(t)] }
          )
          { t }
      )*
    { reduce(t.into_iter().flatten()) }

    /// Markup which is allowed inside attribute names and values.
    rule directive(ctx: &Context) -> Vec<Token>
    = t:comment() { vec![t] }
    / t:include_tag() { vec![t] }
    / t:extension_tag(ctx) { vec![t] }
    / &"{" t:template_param_or_template(ctx) { t }

    //////////////
    // Entities //
    //////////////

    rule htmlentity() -> Vec<Token>
    = start:position!()
      m:$("&" ['#' | '0'..='9' | 'a'..='z' | 'A'..='Z']+ ";")
      end:position!()
    { entity_tokens(m, Span::new(start, end)) }

    rule htmlentity_text() -> Token
    = m:$("&" ['#' | '0'..='9' | 'a'..='z' | 'A'..='Z']+ ";")
    { Token::Text(html_escape::decode_html_entities(m).into_owned()) }

    //////////////////////
    // Start of line //
    //////////////////////

    rule sol() -> Vec<Token>
    = p:sol_prefix()
      st:sol_transparent()*
    { reduce(p.into_iter().chain(st)) }

    rule sol_prefix() -> Option<Token>
    = t:newline_token() { Some(t) }
    / input_start() { None }

    /// The start of an input which begins at the start of a line.
    rule input_start()
    = pos:position!()
      {? if pos == 0 && state.sol { Ok(()) } else { Err("start of line") } }

    rule sol_transparent() -> Token
    = comment()
    / include_tag()
    / behavior_switch()

    ///////////////////
    // Miscellaneous //
    ///////////////////

    rule newline_token() -> Token
    = start:position!()
      newline()
      end:position!()
    { Token::newline(Some(Span::new(start, end))) }

    rule space_or_comment() -> Token
    = t:$(space()) { Token::from(t) }
    / comment()

    rule nl_comment_space() -> Token
    = newline_token()
    / space_or_comment()

    rule text_char() = [c if !STOP_CHARS.contains(c)]

    rule space() = [' ' | '\t']

    rule space_or_newline() = [' ' | '\t' | '\n' | '\r' | '\x0c']

    rule space_or_newline_or_solidus() = space_or_newline() / "/" !">"

    rule newline() = "\n" / "\r\n"

    rule eolf() = newline() / eof()

    rule eof() = ![_]

    rule inline_breaks(ctx: &Context)
    = &['=' | '|' | '!' | '{' | '}' | ':' | '\r' | '\n' | '[' | ']']
      #{|input, pos| inline_breaks(input, pos, ctx)}

    /// Slices the input from `start` to the current position.
    rule src_from(start: usize) -> &'input str
    = #{|input, pos| RuleResult::Matched(pos, &input[start..pos])}

    rule assert(cond: bool, msg: &'static str)
    = {? if cond { Ok(()) } else { Err(msg) } }
}}

/// Characters which may start markup, and so end a plain text run.
const STOP_CHARS: &str = "\x7f'<[{\n\r:;]}|!=&_";

/// Tags which control what is included when a page is transcluded.
fn is_include_tag(name: &str) -> bool {
    ["noinclude", "includeonly", "onlyinclude"]
        .iter()
        .any(|tag| tag.eq_ignore_ascii_case(name))
}

#[inline]
fn is_attribute_name_char(c: char, table: bool) -> bool {
    !(c.is_ascii_whitespace()
        || matches!(
            c,
            '\0' | '/' | '=' | '>' | '<' | '&' | '{' | '}' | '!' | '|' | '\x7f'
        )
        || (table && c == '['))
}

#[inline]
fn is_attribute_value_char(c: char, quote: Option<char>, table: bool) -> bool {
    match c {
        '{' | '}' | '&' | '<' | '|' | '/' | '!' | '[' | '\x7f' => false,
        '>' => table,
        '\r' | '\n' => !table && quote.is_some(),
        c if quote.is_none() && c.is_ascii_whitespace() => false,
        c => Some(c) != quote,
    }
}

#[inline]
fn is_attribute_value_special(c: char, table: bool) -> bool {
    match c {
        '{' | '}' | '&' | '<' | '/' | '!' | '[' => true,
        '|' => !table,
        _ => false,
    }
}

/// A parsed XML-like tag which has not yet been classified.
struct XmlTag<'a> {
    name: &'a str,
    close: bool,
    self_close: bool,
    attributes: Vec<Kv>,
    span: Span,
}

/// An attribute value along with its source.
struct RawValue<'a> {
    tokens: Vec<Token>,
    start: usize,
    src: &'a str,
}

/// The kind of production which is currently being parsed, for inline
/// terminator handling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ProdKind {
    /// A wikilink.
    Link,
    /// A template or template argument.
    Template,
}

/// Parser context information required for correct handling of inline
/// terminators (via `inline_breaks`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
struct Context {
    /// In a production where a `:` is an inline terminator.
    colon: bool,
    /// In a production where `=` is an inline terminator.
    equal: bool,
    /// In a block heading.
    h: bool,
    /// In a wikilink argument.
    linkdesc: bool,
    /// In a container item.
    prod_kind: Option<ProdKind>,
    /// In a table.
    table: bool,
    /// In a table cell attribute.
    table_cell_attrs: bool,
    /// In a table heading cell.
    table_head: bool,
    /// In a template argument.
    template_arg: bool,
}

impl Context {
    /// Makes `:` an inline terminator.
    fn with_colon(&self) -> Self {
        let mut this = self.clone();
        this.colon = true;
        this
    }

    /// Makes `=` an inline terminator.
    fn with_equal(&self) -> Self {
        let mut this = self.clone();
        this.equal = true;
        this
    }

    /// Makes `=` *not* an inline terminator.
    fn without_equal(&self) -> Self {
        let mut this = self.clone();
        this.equal = false;
        this
    }

    /// Makes a heading end an inline terminator.
    fn with_h(&self) -> Self {
        let mut this = self.clone();
        this.h = true;
        this
    }

    /// Makes `|` an inline terminator for wikilink arguments.
    fn with_linkdesc(&self) -> Self {
        let mut this = self.clone();
        this.linkdesc = true;
        this
    }

    /// Sets the kind of the current container production.
    fn with_prod_kind(&self, kind: ProdKind) -> Self {
        let mut this = self.clone();
        this.prod_kind = Some(kind);
        this
    }

    /// Makes table cell delimiters inline terminators.
    fn with_table(&self) -> Self {
        let mut this = self.clone();
        this.table = true;
        this
    }

    /// Makes table cell delimiters *not* inline terminators.
    fn without_table(&self) -> Self {
        let mut this = self.clone();
        this.table = false;
        this
    }

    /// Makes the end of table cell attributes an inline terminator.
    fn with_table_cell_attrs(&self) -> Self {
        let mut this = self.clone();
        this.table_cell_attrs = true;
        this
    }

    /// Makes the end of table cell attributes *not* an inline terminator.
    fn without_table_cell_attrs(&self) -> Self {
        let mut this = self.clone();
        this.table_cell_attrs = false;
        this
    }

    /// Makes `!!` an inline terminator.
    fn with_table_head(&self) -> Self {
        let mut this = self.clone();
        this.table_head = true;
        this
    }

    /// Makes `|` an inline terminator for template arguments.
    fn with_template_arg(&self) -> Self {
        let mut this = self.clone();
        this.template_arg = true;
        this
    }
}

/// Returns a match if the input at `pos` is a terminator for the inline
/// production currently being parsed.
fn inline_breaks(input: &str, pos: usize, ctx: &Context) -> RuleResult<()> {
    let rest = &input[pos..];
    let mut iter = rest.chars();
    let Some(c) = iter.next() else {
        return RuleResult::Failed;
    };
    let next = iter.next();
    let at_terminator = match c {
        // `{{t|k=v}}`
        //       ^
        '=' => ctx.equal || (ctx.h && heading_end(&rest[1..])),
        // `{{a|b|c}}`, `[[a|b|c]]`, `{| ... k="v"| ...`
        //       ^          ^                   ^
        '|' => {
            ctx.template_arg
                || ctx.table_cell_attrs
                || ctx.linkdesc
                || (ctx.table && (matches!(next, Some('|' | '}')) || rest.starts_with("|{{!}}")))
        }
        // `{| ! h !! h2 ...`
        //         ^
        '!' => ctx.table_head && ctx.prod_kind != Some(ProdKind::Template) && next == Some('!'),
        // `{| d {{!}}{{!}} d2 ...`
        //       ^
        '{' => {
            (ctx.table_cell_attrs && rest.starts_with("{{!}}"))
                || (ctx.table
                    && (rest.starts_with("{{!}}{{!}}") || rest.starts_with("{{!}}|")))
        }
        // `{{a}}`
        //     ^
        '}' => ctx.prod_kind == Some(ProdKind::Template) && next == Some('}'),
        // `; dt : dd`
        //       ^
        ':' => ctx.colon && !ctx.linkdesc && ctx.prod_kind != Some(ProdKind::Template),
        '\r' | '\n' => {
            ctx.table
                && rest
                    .trim_start_matches(['\r', '\n'])
                    .trim_start()
                    .starts_with(['!', '|'])
        }
        // `{| ... k="v" [[link]] ...`
        //               ^
        '[' => ctx.table_cell_attrs && next == Some('['),
        // `[[a]]`
        //     ^
        ']' => ctx.prod_kind == Some(ProdKind::Link) && next == Some(']'),
        _ => false,
    };

    if at_terminator {
        RuleResult::Matched(pos, ())
    } else {
        RuleResult::Failed
    }
}

/// Returns true if `rest` is the remainder of a heading line after one `=`:
/// more `=`, then only whitespace and comments to the end of the line.
fn heading_end(rest: &str) -> bool {
    let mut rest = rest.trim_start_matches('=');
    loop {
        rest = rest.trim_start_matches([' ', '\t']);
        if let Some(after) = rest.strip_prefix("<!--") {
            match after.find("-->") {
                Some(end) => rest = &after[end + 3..],
                None => return true,
            }
        } else {
            break;
        }
    }
    rest.is_empty() || rest.starts_with(['\r', '\n'])
}

/// Finds the end tag `tag_name` in `input`. Returns the start position of the
/// end tag and the position after it.
fn find_end_tag(input: &str, tag_name: &str) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    let mut from = 0;
    while let Some(offset) = memchr::memmem::find(&bytes[from..], b"</") {
        let start = from + offset;
        let name_end = start + 2 + tag_name.len();
        if bytes
            .get(start + 2..name_end)
            .is_some_and(|name| name.eq_ignore_ascii_case(tag_name.as_bytes()))
        {
            let mut end = name_end;
            while bytes.get(end).is_some_and(u8::is_ascii_whitespace) {
                end += 1;
            }
            if bytes.get(end) == Some(&b'>') {
                return Some((start, end + 1));
            }
        }
        from = start + 2;
    }
    None
}

/// Merges adjacent text tokens and removes empty ones.
fn reduce(tokens: impl IntoIterator<Item = Token>) -> Vec<Token> {
    let mut out = Vec::<Token>::new();
    for token in tokens {
        match (out.last_mut(), token) {
            (_, Token::Text(text)) if text.is_empty() => {}
            (Some(Token::Text(last)), Token::Text(text)) => last.push_str(&text),
            (_, token) => out.push(token),
        }
    }
    out
}

/// Converts attribute or argument tokens into a value, collapsing plain text
/// into a string.
fn into_value(tokens: Vec<Token>) -> KvValue {
    if tokens.iter().all(|token| matches!(token, Token::Text(_))) {
        KvValue::Str(tokens.into_iter().filter_map(|token| match token {
            Token::Text(text) => Some(text),
            _ => None,
        }).collect())
    } else {
        KvValue::Tokens(tokens)
    }
}

/// Renames attributes which would otherwise collide with the attributes the
/// pipeline itself generates.
fn protect_attr(name: String) -> String {
    let lower = name.to_ascii_lowercase();
    if matches!(
        lower.as_str(),
        "about" | "data-object-id" | "property" | "rel" | "typeof"
    )
        || lower.starts_with("data-mw")
        || lower.starts_with("data-parsoid")
        || lower.starts_with("data-x")
    {
        format!("data-x-{name}")
    } else {
        name
    }
}

fn make_kv(name: Vec<Token>, name_start: usize, name_src: &str, value: Option<RawValue<'_>>) -> Kv {
    let key = Span::new(name_start, name_start + name_src.len());
    let k = match into_value(name) {
        KvValue::Str(name) => KvValue::Str(protect_attr(name)),
        k => k,
    };
    let ksrc = matches!(k, KvValue::Tokens(_)).then(|| name_src.to_string());
    let (v, vsrc, value_span) = match value {
        Some(value) => {
            let v = into_value(value.tokens);
            let vsrc = (v.as_str() != Some(value.src)).then(|| value.src.to_string());
            (
                v,
                vsrc,
                Span::new(value.start, value.start + value.src.len()),
            )
        }
        None => (KvValue::default(), None, Span::at(key.end)),
    };
    Kv {
        k,
        v,
        ksrc,
        vsrc,
        src_offsets: Some(KvOffsets {
            key,
            value: value_span,
        }),
    }
}

fn heading_tokens(
    start: usize,
    open: usize,
    content: Option<Vec<Token>>,
    close: usize,
    end: usize,
    trailing: Vec<Token>,
) -> Result<Vec<Token>, &'static str> {
    let content = content.ok_or("heading content")?;
    let level = open.min(close).min(6);
    let name = format!("h{level}");
    let mut tokens = vec![Tag::new(&name)
        .with_tsr(Some(Span::new(start, start + level)))
        .start()];
    if open > level {
        tokens.push(Token::Text("=".repeat(open - level)));
    }
    tokens.extend(content);
    if close > level {
        tokens.push(Token::Text("=".repeat(close - level)));
    }
    tokens.push(Tag::new(name).with_tsr(Some(Span::new(end - level, end))).end());
    tokens.extend(trailing);
    Ok(reduce(tokens))
}

fn list_item_tokens(
    bullets: &str,
    tsr: Span,
    stx: Option<Syntax>,
    content: Option<Vec<Token>>,
) -> Vec<Token> {
    let mut tag = Tag::new("listItem")
        .with_attr("bullets", bullets)
        .with_tsr(Some(tsr));
    tag.dp.stx = stx;
    iter::once(tag.start())
        .chain(content.into_iter().flatten())
        .collect()
}

/// Builds the tokens of one table cell or caption. Cells end with a marker
/// recording where the cell content ended; captions get a real end tag.
fn table_cell_tokens(
    name: &str,
    attributes: Option<Vec<Kv>>,
    tsr: Span,
    end: usize,
    content: Option<Vec<Token>>,
    row: bool,
) -> Vec<Token> {
    let mut tag = Tag::new(name)
        .with_attribs(attributes.unwrap_or_default())
        .with_tsr(Some(tsr));
    if row {
        tag.dp.stx = Some(Syntax::Row);
    }
    let mut tokens = vec![tag.start()];
    tokens.extend(content.into_iter().flatten());
    if name == "caption" {
        tokens.push(Tag::new(name).with_tsr(Some(Span::at(end))).end());
    } else {
        tokens.push(
            Token::meta("mw:TSRMarker")
                .with_attr("data-etag", name)
                .with_tsr(Some(Span::at(end)))
                .self_closing(),
        );
    }
    tokens
}

fn template_token(
    name: &str,
    target: Vec<Token>,
    target_span: Span,
    params: Vec<Kv>,
    src: &str,
    start: usize,
) -> Token {
    let mut attribs = Vec::with_capacity(params.len() + 1);
    attribs.push(Kv::new(into_value(target), "").with_offsets(Some(KvOffsets {
        key: target_span,
        value: Span::at(target_span.end),
    })));
    attribs.extend(params);
    Tag::new(name)
        .with_attribs(attribs)
        .with_dp(DataParsoid {
            tsr: Some(Span::new(start, start + src.len())),
            src: Some(src.to_string()),
            ..Default::default()
        })
        .self_closing()
}

/// Returns up to `count` characters of `input` ending at `pos`.
fn preceding_chars(input: &str, pos: usize, count: usize) -> &str {
    let before = &input[..pos];
    let start = before
        .char_indices()
        .rev()
        .nth(count - 1)
        .map_or(0, |(index, _)| index);
    &before[start..]
}

/// Builds the tokens for a run of apostrophes. Runs of four are an apostrophe
/// followed by bold; runs longer than five keep only the last five as
/// markup.
fn quote_tokens(input: &str, start: usize, quotes: &str) -> Vec<Token> {
    let plain = match quotes.len() {
        4 => 1,
        len if len > 5 => len - 5,
        _ => 0,
    };
    let at = start + plain;
    let mut tag = Tag::new("mw-quote")
        .with_attr("value", &quotes[plain..])
        .with_tsr(Some(Span::new(at, start + quotes.len())));
    tag.dp.tmp.preceding_2chars = Some(preceding_chars(input, at, 2).to_string());
    let mut tokens = Vec::with_capacity(2);
    if plain > 0 {
        tokens.push(Token::from(&quotes[..plain]));
    }
    tokens.push(tag.self_closing());
    tokens
}

fn entity_tokens(m: &str, tsr: Span) -> Vec<Token> {
    let decoded = html_escape::decode_html_entities(m);
    if decoded == m {
        return vec![Token::from(m)];
    }
    let mut span = Token::meta("mw:Entity").with_tsr(Some(tsr));
    span.name = "span".into();
    span.dp.src = Some(m.to_string());
    vec![
        span.start(),
        Token::Text(decoded.into_owned()),
        Tag::new("span").with_tsr(Some(Span::at(tsr.end))).end(),
    ]
}

fn behavior_switch_token(word: &str, src: &str, start: usize) -> Token {
    Tag::new("meta")
        .with_attr("property", format!("mw:PageProp/{}", word.to_lowercase()))
        .with_dp(DataParsoid {
            tsr: Some(Span::new(start, start + src.len())),
            src: Some(src.to_string()),
            ..Default::default()
        })
        .self_closing()
}

fn include_token(name: &str, close: bool, src: &str, start: usize) -> Token {
    let tag = Tag::new(name.to_ascii_lowercase()).with_dp(DataParsoid {
        tsr: Some(Span::new(start, start + src.len())),
        src: Some(src.to_string()),
        ..Default::default()
    });
    if close {
        tag.end()
    } else if src.ends_with("/>") {
        tag.self_closing()
    } else {
        tag.start()
    }
}

/// Finishes an extension tag by finding its end tag. If there is no end tag,
/// the start tag is just text.
fn extension_token(input: &str, pos: usize, tag: XmlTag<'_>) -> RuleResult<Token> {
    let name = tag.name.to_ascii_lowercase();
    let start_width = tag.span.len();
    let (end, body, end_width) = if tag.self_close {
        (pos, None, 0)
    } else if let Some((content_end, end)) = find_end_tag(&input[pos..], tag.name) {
        (
            pos + end,
            Some(input[pos..pos + content_end].to_string()),
            end - content_end,
        )
    } else {
        return RuleResult::Matched(pos, Token::from(&input[tag.span.into_range()]));
    };

    let token = Tag::new("extension")
        .with_attribs(tag.attributes)
        .with_dp(DataParsoid {
            tsr: Some(Span::new(tag.span.start, end)),
            src: Some(input[tag.span.start..end].to_string()),
            tag_widths: Some((start_width, end_width)),
            ..Default::default()
        });
    let mut token = token;
    token.data_mw = Some(Box::new(DataMw {
        name: Some(name),
        body: body.map(|extsrc| ExtBody { extsrc }),
        ..Default::default()
    }));
    RuleResult::Matched(end, token.self_closing())
}

fn html_token(tag: XmlTag<'_>) -> Token {
    let mut name = tag.name.to_ascii_lowercase();
    // `</br>` is treated as `<br>` by browsers
    let close = tag.close && name != "br";
    if tag.close && !close {
        name = "br".into();
    }
    let mut out = Tag::new(name)
        .with_attribs(tag.attributes)
        .with_tsr(Some(tag.span));
    out.dp.stx = Some(Syntax::Html);
    if close {
        out.end()
    } else if tag.self_close || VOID_TAGS.contains(out.name.as_str()) {
        out.self_closing()
    } else {
        out.start()
    }
}

/// Converts a link target into a relative page href.
fn link_href(target: &str) -> String {
    let target = crate::title::normalize(target.trim().trim_start_matches(':'));
    format!("./{}", crate::title::ucfirst(&target).replace(' ', "_"))
}

fn wikilink_tokens(
    tokenizer: &PegTokenizer,
    target: &str,
    content: Vec<Vec<Token>>,
    start: usize,
    target_end: usize,
    src: &str,
) -> Result<Vec<Token>, &'static str> {
    if target.trim().trim_start_matches(':').is_empty() {
        return Err("link target");
    }
    let end = start + src.len();

    if !target.trim_start().starts_with(':')
        && let Some(name) = tokenizer.category_name(target)
    {
        let mut href = link_href(&format!(
            "Category:{}",
            crate::title::ucfirst(&crate::title::normalize(name))
        ));
        if let Some(sort) = content.last() {
            let sort = crate::tokens::utils::tokens_to_string(sort);
            href = format!(
                "{href}#{}",
                percent_encoding::utf8_percent_encode(&sort, percent_encoding::NON_ALPHANUMERIC)
            );
        }
        return Ok(vec![Tag::new("link")
            .with_attr("rel", "mw:PageProp/Category")
            .with_attr("href", href)
            .with_dp(DataParsoid {
                tsr: Some(Span::new(start, end)),
                src: Some(src.to_string()),
                ..Default::default()
            })
            .self_closing()]);
    }

    let piped = !content.is_empty();
    let mut description = Vec::new();
    for (index, part) in content.into_iter().enumerate() {
        if index > 0 {
            description.push(Token::from("|"));
        }
        description.extend(part);
    }
    let description = reduce(description);

    let mut open = Tag::new("a")
        .with_attr("rel", "mw:WikiLink")
        .with_attr("href", link_href(target))
        .with_tsr(Some(Span::new(start, target_end + usize::from(piped))));
    if piped && !description.is_empty() {
        open.dp.stx = Some(Syntax::Piped);
    }

    let mut tokens = vec![open.start()];
    if description.is_empty() {
        tokens.push(Token::from(target.trim().trim_start_matches(':')));
    } else {
        tokens.extend(description);
    }
    tokens.push(Tag::new("a").with_tsr(Some(Span::new(end - 2, end))).end());
    Ok(tokens)
}
