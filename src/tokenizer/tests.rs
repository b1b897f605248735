use super::*;
use crate::tokens::{KvOffsets, KvValue, Span, Syntax, Tag};

fn tokenize(src: &str) -> Vec<Token> {
    let config = SiteConfig::default();
    PegTokenizer::new(&config)
        .tokenize(src, StartRule::Start, true)
        .unwrap()
}

fn tag(token: &Token) -> &Tag {
    token.tag().unwrap()
}

#[test]
fn plain_text() {
    assert_eq!(
        tokenize("hello"),
        vec!["hello".into(), Token::eof(Some(Span::at(5)))]
    );
}

#[test]
fn newlines() {
    assert_eq!(
        tokenize("a\nb"),
        vec![
            "a".into(),
            Token::newline(Some(Span::new(1, 2))),
            "b".into(),
            Token::eof(Some(Span::at(3))),
        ]
    );
}

#[test]
fn heading() {
    let tokens = tokenize("== a ==");
    assert_eq!(tokens.len(), 4);
    assert!(tokens[0].is_start("h2"));
    assert_eq!(tokens[0].tsr(), Some(Span::new(0, 2)));
    assert_eq!(tokens[1], " a ".into());
    assert_eq!(tokens[2], Tag::new("h2").with_tsr(Some(Span::new(5, 7))).end());
}

#[test]
fn unbalanced_heading() {
    let tokens = tokenize("=== a ==");
    assert!(tokens[0].is_start("h2"));
    assert_eq!(tokens[1], "= a ".into());
}

#[test]
fn list_items() {
    let tokens = tokenize("*a\n**b");
    assert_eq!(tokens.len(), 6);
    assert!(tokens[0].is_start("listItem"));
    assert_eq!(tag(&tokens[0]).attr_str("bullets"), Some("*"));
    assert_eq!(tokens[0].tsr(), Some(Span::new(0, 1)));
    assert_eq!(tokens[1], "a".into());
    assert!(matches!(tokens[2], Token::Newline(_)));
    assert_eq!(tag(&tokens[3]).attr_str("bullets"), Some("**"));
    assert_eq!(tokens[3].tsr(), Some(Span::new(3, 5)));
    assert_eq!(tokens[4], "b".into());
}

#[test]
fn definition_list_row() {
    let tokens = tokenize(";a:b");
    assert_eq!(tag(&tokens[0]).attr_str("bullets"), Some(";"));
    assert_eq!(tokens[1], "a".into());
    let dd = tag(&tokens[2]);
    assert_eq!(dd.attr_str("bullets"), Some(":"));
    assert_eq!(dd.dp.stx, Some(Syntax::Row));
    assert_eq!(dd.dp.tsr, Some(Span::new(2, 3)));
    assert_eq!(tokens[3], "b".into());
}

#[test]
fn template() {
    let src = "{{echo|a| b = c }}";
    let tokens = tokenize(src);
    assert_eq!(tokens.len(), 2);
    assert!(tokens[0].is_self_closing("template"));
    let tpl = tag(&tokens[0]);
    assert_eq!(tpl.dp.tsr, Some(Span::new(0, 18)));
    assert_eq!(tpl.dp.src.as_deref(), Some(src));
    assert_eq!(tpl.attribs.len(), 3);

    let target = &tpl.attribs[0];
    assert_eq!(target.k, KvValue::from("echo"));
    assert_eq!(
        target.src_offsets,
        Some(KvOffsets {
            key: Span::new(2, 6),
            value: Span::at(6),
        })
    );

    let positional = &tpl.attribs[1];
    assert_eq!(positional.k, KvValue::from(""));
    assert_eq!(positional.v, KvValue::from("a"));
    assert_eq!(
        positional.src_offsets,
        Some(KvOffsets {
            key: Span::at(7),
            value: Span::new(7, 8),
        })
    );

    let named = &tpl.attribs[2];
    assert_eq!(named.k, KvValue::from(" b "));
    assert_eq!(named.v, KvValue::from("c "));
    assert_eq!(
        named.src_offsets,
        Some(KvOffsets {
            key: Span::new(9, 12),
            value: Span::new(13, 16),
        })
    );
}

#[test]
fn nested_template() {
    let tokens = tokenize("{{a|{{b}}}}");
    let outer = tag(&tokens[0]);
    assert_eq!(outer.name, "template");
    let value = outer.attribs[1].v.tokens();
    assert_eq!(value.len(), 1);
    assert!(value[0].is_self_closing("template"));
    assert_eq!(value[0].tsr(), Some(Span::new(4, 9)));
}

#[test]
fn empty_template_is_text() {
    assert_eq!(tokenize("{{ }}")[0], "{{ }}".into());
}

#[test]
fn template_argument() {
    let tokens = tokenize("{{{1|x}}}");
    assert!(tokens[0].is_self_closing("templatearg"));
    let arg = tag(&tokens[0]);
    assert_eq!(arg.dp.tsr, Some(Span::new(0, 9)));
    assert_eq!(arg.attribs[0].k, KvValue::from("1"));
    assert_eq!(arg.attribs[1].v, KvValue::from("x"));
    assert_eq!(
        arg.attribs[1].src_offsets,
        Some(KvOffsets {
            key: Span::at(5),
            value: Span::new(5, 6),
        })
    );
}

#[test]
fn quotes() {
    let tokens = tokenize("a''''b");
    assert_eq!(tokens[0], "a'".into());
    let quote = tag(&tokens[1]);
    assert_eq!(quote.name, "mw-quote");
    assert_eq!(quote.attr_str("value"), Some("'''"));
    assert_eq!(quote.dp.tsr, Some(Span::new(2, 5)));
    assert_eq!(quote.dp.tmp.preceding_2chars.as_deref(), Some("a'"));
    assert_eq!(tokens[2], "b".into());
}

#[test]
fn extension_tag() {
    let tokens = tokenize("<nowiki>''x''</nowiki>");
    assert!(tokens[0].is_self_closing("extension"));
    let ext = tag(&tokens[0]);
    assert_eq!(ext.dp.tsr, Some(Span::new(0, 22)));
    assert_eq!(ext.dp.tag_widths, Some((8, 9)));
    let data_mw = ext.data_mw.as_deref().unwrap();
    assert_eq!(data_mw.name.as_deref(), Some("nowiki"));
    assert_eq!(data_mw.body.as_ref().unwrap().extsrc, "''x''");
}

#[test]
fn unclosed_extension_tag_is_text() {
    assert_eq!(tokenize("<nowiki>x")[0], "<nowiki>x".into());
}

#[test]
fn table() {
    let tokens = tokenize("{|\n|a||b\n|}");
    let names = tokens
        .iter()
        .map(|token| match token {
            Token::Text(text) => text.as_str(),
            Token::Newline(_) => "\\n",
            Token::EndOfInput(_) => "EOF",
            token => token.name().unwrap(),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        ["table", "\\n", "td", "a", "meta", "td", "b", "meta", "\\n", "table", "EOF"]
    );
    assert_eq!(tokens[0].tsr(), Some(Span::new(0, 2)));
    assert_eq!(tokens[2].tsr(), Some(Span::new(3, 4)));
    assert_eq!(tokens[4].tsr(), Some(Span::at(5)));
    assert!(tokens[4].is_meta("mw:TSRMarker"));
    assert_eq!(tokens[5].tsr(), Some(Span::new(5, 7)));
    assert_eq!(tag(&tokens[5]).dp.stx, Some(Syntax::Row));
    assert!(tokens[9].is_end("table"));
    assert_eq!(tokens[9].tsr(), Some(Span::new(9, 11)));
}

#[test]
fn doubled_cell_delimiters() {
    let tokens = tokenize("{|\n!a!!b||c\n|d{{!}}{{!}}e\n|}");
    let cells = tokens
        .iter()
        .filter_map(|token| match token {
            Token::TagStart(tag) if matches!(tag.name.as_str(), "td" | "th") => {
                Some(tag.name.as_str())
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(cells, ["th", "th", "th", "td", "td"]);
}

#[test]
fn start_of_input_is_a_line_start() {
    let tokens = tokenize("<!--c-->\n*a");
    assert!(matches!(tokens[0], Token::Comment(..)));
    assert!(matches!(tokens[1], Token::Newline(_)));
    assert!(tokens[2].is_start("listItem"));

    let tokens = tokenize("__NOTOC__*a");
    assert!(tokens[0].is_self_closing("meta"));
    assert!(tokens[1].is_start("listItem"));
    assert_eq!(tokens[2], "a".into());

    // Not at the start of a line, so the bullet is text
    let config = SiteConfig::default();
    let tokens = PegTokenizer::new(&config)
        .tokenize("*a", StartRule::Start, false)
        .unwrap();
    assert_eq!(tokens[0], "*a".into());
}

#[test]
fn wikilink() {
    let tokens = tokenize("[[foo bar|baz]]");
    let open = tag(&tokens[0]);
    assert!(tokens[0].is_start("a"));
    assert_eq!(open.attr_str("rel"), Some("mw:WikiLink"));
    assert_eq!(open.attr_str("href"), Some("./Foo_bar"));
    assert_eq!(open.dp.tsr, Some(Span::new(0, 10)));
    assert_eq!(open.dp.stx, Some(Syntax::Piped));
    assert_eq!(tokens[1], "baz".into());
    assert_eq!(tokens[2], Tag::new("a").with_tsr(Some(Span::new(13, 15))).end());
}

#[test]
fn category() {
    let tokens = tokenize("[[Category:Foo|bar]]");
    assert!(tokens[0].is_self_closing("link"));
    let link = tag(&tokens[0]);
    assert_eq!(link.attr_str("rel"), Some("mw:PageProp/Category"));
    assert_eq!(link.attr_str("href"), Some("./Category:Foo#bar"));
    assert!(crate::tokens::utils::is_sol_transparent(&tokens[0]));
}

#[test]
fn entity() {
    let tokens = tokenize("&amp;");
    let span = tag(&tokens[0]);
    assert_eq!(span.name, "span");
    assert!(span.has_typeof("mw:Entity"));
    assert_eq!(span.dp.src.as_deref(), Some("&amp;"));
    assert_eq!(tokens[1], "&".into());
    assert!(tokens[2].is_end("span"));
    assert_eq!(tokenize("&bogus;")[0], "&bogus;".into());
}

#[test]
fn html_tags() {
    let tokens = tokenize("<b class=x>y</b>");
    let open = tag(&tokens[0]);
    assert!(tokens[0].is_start("b"));
    assert_eq!(open.dp.stx, Some(Syntax::Html));
    assert_eq!(open.dp.tsr, Some(Span::new(0, 11)));
    assert_eq!(open.attr_str("class"), Some("x"));
    assert_eq!(tokens[1], "y".into());
    assert!(tokens[2].is_end("b"));
    assert_eq!(tokens[2].tsr(), Some(Span::new(12, 16)));

    assert!(tokenize("<br>")[0].is_self_closing("br"));
    assert!(tokenize("</br>")[0].is_self_closing("br"));
}

#[test]
fn comments() {
    let tokens = tokenize("a<!--c-->b");
    assert_eq!(tokens[0], "a".into());
    assert_eq!(
        tokens[1],
        Token::Comment("c".into(), crate::tokens::DataParsoid::with_tsr(Span::new(1, 9)))
    );
    assert_eq!(tokens[2], "b".into());
}

#[test]
fn behavior_switch() {
    let tokens = tokenize("__NOTOC__");
    let meta = tag(&tokens[0]);
    assert_eq!(meta.name, "meta");
    assert_eq!(meta.attr_str("property"), Some("mw:PageProp/notoc"));
    assert_eq!(meta.dp.src.as_deref(), Some("__NOTOC__"));
    assert_eq!(tokenize("__NOPE__")[0], "__NOPE__".into());
}

#[test]
fn include_tags() {
    let tokens = tokenize("<noinclude>a</noinclude>");
    assert!(tokens[0].is_start("noinclude"));
    assert_eq!(tag(&tokens[0]).dp.src.as_deref(), Some("<noinclude>"));
    assert_eq!(tokens[1], "a".into());
    assert!(tokens[2].is_end("noinclude"));
    assert_eq!(tokens[2].tsr(), Some(Span::new(12, 24)));
}

#[test]
fn attributes() {
    let config = SiteConfig::default();
    let attribs = PegTokenizer::new(&config)
        .tokenize_attributes("a=1 b='x y'")
        .unwrap();
    assert_eq!(attribs.len(), 2);
    assert_eq!(attribs[0].k, KvValue::from("a"));
    assert_eq!(attribs[0].v, KvValue::from("1"));
    assert_eq!(attribs[1].k, KvValue::from("b"));
    assert_eq!(attribs[1].v, KvValue::from("x y"));
    assert_eq!(attribs[1].src_offsets.unwrap().value, Span::new(7, 10));
}

#[test]
fn protected_attributes() {
    let tokens = tokenize("<span typeof=x>");
    assert_eq!(tag(&tokens[0]).attr_str("data-x-typeof"), Some("x"));
}

#[test]
fn partial_rules() {
    let config = SiteConfig::default();
    let tokenizer = PegTokenizer::new(&config);

    let table = tokenizer
        .tokenize("{| class=x", StartRule::TableStartTag, true)
        .unwrap();
    assert_eq!(table.len(), 1);
    assert!(table[0].is_start("table"));
    assert_eq!(tag(&table[0]).attr_str("class"), Some("x"));

    let item = tokenizer
        .tokenize("*# x", StartRule::ListItem, true)
        .unwrap();
    assert_eq!(tag(&item[0]).attr_str("bullets"), Some("*#"));
    assert_eq!(item[1], " x".into());
}

#[test]
fn source_ranges_are_in_bounds() {
    let src = "== h ==\n* [[a]] ''b'' {{c|d=e}}\n{|\n! x !! y\n|-\n| z\n|}\n<nowiki>q</nowiki> &lt;";
    let tokens = tokenize(src);
    let mut last = 0;
    for token in &tokens {
        if let Some(tsr) = token.tsr() {
            assert!(tsr.start <= tsr.end && tsr.end <= src.len(), "{token:?}");
            assert!(tsr.start >= last || tsr.is_empty(), "{token:?}");
            last = last.max(tsr.start);
        }
    }
    assert_eq!(tokens.last().and_then(Token::tsr), Some(Span::at(src.len())));
}
