// Yo dawg, we put a parser in your parser tests so you can parse while you test
// parsers.
//
// This code is heavily adapted from the Parsoid grammar at
// <https://github.com/wikimedia/mediawiki-services-parsoid>
// based on
// Git-Commit-ID: 9cc7fc706b727c392b53fe7fe571747901424065
//
// The upstream copyright is:
//
// SPDX-License-Identifier: GPL-2.0-or-later
// SPDX-FileCopyright: 2011-07-20 Brion Vibber <brion@pobox.com>

use serde_json::Value;
use std::{borrow::Cow, collections::HashMap};

pub(super) type Error = peg::error::ParseError<peg::str::LineCol>;

pub(super) struct Testfile<'input> {
    pub(super) chunks: Vec<Chunk<'input>>,
}

impl<'a> Testfile<'a> {
    pub(super) fn parse(code: &'a str) -> Result<Self, Error> {
        testfile::parse(code)
    }
}

pub(super) enum Chunk<'input> {
    Comment,
    Line,
    Article {
        title: &'input str,
        text: &'input str,
    },
    Test {
        name: &'input str,
        sections: HashMap<&'input str, SectionText<'input>>,
    },
}

pub(super) struct Section<'input> {
    pub name: &'input str,
    pub text: SectionText<'input>,
}

pub(super) enum SectionText<'input> {
    Text(Cow<'input, str>),
    Kv(HashMap<Cow<'input, str>, Value>),
}

impl SectionText<'_> {
    /// The section text, with the trailing newline which ends the last line
    /// of the section removed.
    pub(super) fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.strip_suffix('\n').unwrap_or(text)),
            Self::Kv(_) => None,
        }
    }

    pub(super) fn has_option(&self, name: &str) -> bool {
        matches!(self, Self::Kv(options) if options.contains_key(name))
    }
}

peg::parser! {grammar testfile() for str {
  pub rule parse() -> Testfile<'input>
  = comment_or_blank_line()*
    _version:format()?
    comment_or_blank_line()*
    _options:(sec:option_section() end_test() { sec })?
    chunks:chunk()+
  { Testfile { chunks } }

  rule format() -> &'input str
  = "!!" ws()? version() ws()+ v:$(['0'..='9']+) rest_of_line()
  { v }

  rule option_section() -> Section<'input>
  = start(<"options">) opts:option_list()?
  { Section { name: "options", text: SectionText::Kv(opts.unwrap_or_default()) } }

  rule option_list() -> HashMap<Cow<'input, str>, Value>
  = o:(t:an_option() (([' '|'\t'] / eol())+) { t })+
  { o.into_iter().collect() }

  rule chunk() -> Chunk<'input>
  = comment_or_blank_line()
  / article()
  / test()
    // Anything else between tests is ignored like a comment.
  / _l:line()
    { Chunk::Line }

  rule comment_or_blank_line() -> Chunk<'input>
  = comment()
  / ws()? _nl:eol()
  { Chunk::Line }

  rule comment() -> Chunk<'input>
  = "#"
    _text:rest_of_line()
  { Chunk::Comment }

  rule article() -> Chunk<'input>
  = start(<"article">)
    title:line()
    start(<"text">)
    text:text()
    end(<"article">)
  { Chunk::Article { title: title.trim(), text } }

  rule test() -> Chunk<'input>
  = start(<"test">)
    name:text()
    sections:(section() / option_section())*
    end_test()
  {
    let sections = sections.into_iter().map(|section| {
        (section.name, section.text)
    }).collect::<HashMap<_, _>>();
    Chunk::Test { name: name.trim(), sections }
  }

  /////////////
  // Section //
  /////////////

  rule section() -> Section<'input>
  = "!!" ws()?
    (!"test") (!"end") (!"options")
    name:$([^' '|'\t'|'\r'|'\n']+)
    rest_of_line()
    text:text()
  { Section { name, text: SectionText::Text(text.into()) } }

  // from PHP parser in tests/parser/parserTest.inc:parseOptions()
  //   foo
  //   foo=bar
  //   foo="bar baz"
  //   foo=[[bar baz]]
  //   foo={...json...}
  //   foo=bar,"baz quux",[[bat]]
  rule an_option() -> (Cow<'input, str>, Value)
  = k:option_name() v:option_value()?
  { (k.to_ascii_lowercase().into(), v.unwrap_or_default()) }

  rule option_name() -> &'input str
  = $([^' '|'\t'|'\n'|'='|'!']+)

  rule option_value() -> Value
  = ws()? "=" ws()? ovl:option_value_list()
  { ovl }

  rule option_value_list() -> Value
  = v:an_option_value() ++ (ws()? "," ws()?)
  {
    if v.len() == 1 {
      v.into_iter().next().unwrap_or_default()
    } else {
      Value::Array(v)
    }
  }

  rule an_option_value() -> Value
  = v:(link_target_value()
    / t:quoted_value() { Cow::Borrowed(t) }
    / t:plain_value() { Cow::Borrowed(t) }
    / t:json_value() { Cow::Borrowed(t) }
  )
  {?
    if v.starts_with('"') || v.starts_with('{') {
      serde_json::from_str(&v).map_err(|_| "invalid json")
    } else {
      Ok(Value::String(v.into_owned()))
    }
  }

  rule link_target_value() -> Cow<'input, str>
  = "[[" v:$([^']'|'\n']*) "]]"
  { Cow::Owned(Value::String(v.to_string()).to_string()) }

  rule quoted_value() -> &'input str
  = $("\"" ([^'\\'|'"'|'\n'] / "\\" [^'\n'])* "\"")

  rule plain_value() -> &'input str
  = $([^' '|'\t'|'\n'|'"'|'\''|'['|']'|'='|','|'!'|'{']+)

  rule json_value() -> &'input str
  = $("{" ([^'"'|'{'|'}'|'\n'] / quoted_value() / json_value() / eol())* "}")

  rule version()
  = quiet!{
    input:$([_]*<7>)
    {? if input.eq_ignore_ascii_case("version") { Ok(()) } else { Err("version") } }
  } / expected!("version")

  rule start<T>(r: rule<T>)
  = "!!" ws()? r() ws()? eol()

  rule end<T>(r: rule<T>)
  = "!!" ws()? ("end" r()?) ws()? eolf()

  rule end_test()
  = "!!" ws()? "end" ws()? eolf()

  rule eol() -> &'input str
  = $("\n")

  rule eolf() -> &'input str
  = $("\n" / ![_] "")

  rule ws()
  = [' '|'\t']+

  rule rest_of_line() -> &'input str
  = t:$([^'\n']*)
    eol()
  { t }

  rule line() -> &'input str
  = (!"!!")
    t:rest_of_line()
  { t }

  rule text() -> &'input str
  = $(line()*)
}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_testfile() {
        let code = "\
# a comment
!! article
Template:Echo
!! text
{{{1}}}
!! endarticle

!! test
Simple
!! options
inline title=[[Foo bar]]
!! wikitext
a
!! html
<p>a</p>
!! end
";
        let file = Testfile::parse(code).unwrap();
        let mut articles = 0;
        let mut tests = 0;
        for chunk in &file.chunks {
            match chunk {
                Chunk::Article { title, text } => {
                    articles += 1;
                    assert_eq!(*title, "Template:Echo");
                    assert_eq!(*text, "{{{1}}}\n");
                }
                Chunk::Test { name, sections } => {
                    tests += 1;
                    assert_eq!(*name, "Simple");
                    assert_eq!(sections["wikitext"].text(), Some("a"));
                    assert_eq!(sections["html"].text(), Some("<p>a</p>"));
                    let options = &sections["options"];
                    assert!(options.has_option("inline"));
                    let SectionText::Kv(options) = options else {
                        panic!("options are not key-value pairs");
                    };
                    assert_eq!(options["title"], Value::String("Foo bar".into()));
                }
                Chunk::Comment | Chunk::Line => {}
            }
        }
        assert_eq!((articles, tests), (1, 1));
    }
}
