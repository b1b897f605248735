//! File-driven parser tests.
//!
//! Each `.txt` file under [`BASE_DIR`] uses the parserTests format: articles
//! become pages in an in-memory store, and each test parses its `wikitext`
//! section as a full document and compares the flat HTML rendering of the
//! result with its `html` section. Marker `meta` tags and `about` attributes
//! are left out of the rendering so expectations only describe content.

use crate::{
    config::SiteConfig,
    pipeline::{DataAccess, Env, MemoryDataAccess, Options},
    title::{NS_MAIN, Title},
    tokens::{Token, html::to_html},
};
use futures::executor::block_on;
use std::{fs, path::Path, rc::Rc};
use test_parser::{Chunk, SectionText, Testfile};

mod test_parser;

const BASE_DIR: &str = "./src/tests/parser";

test_from_file! {
    attributes => "attributes",
    indent_pre => "indentPre",
    lists => "lists",
    p_wrapping => "pWrapping",
    parser_functions => "parserFunctions",
    quotes => "quotes",
    sanitizer => "sanitizer",
    templates => "templates",
}

/// Drops marker metas and about ids from parser output.
fn strip_markers(tokens: Vec<Token>) -> Vec<Token> {
    tokens
        .into_iter()
        .filter(|token| token.name() != Some("meta"))
        .map(|mut token| {
            if let Some(tag) = token.tag_mut() {
                tag.remove_attr("about");
            }
            token
        })
        .collect()
}

#[track_caller]
fn run_tests_from_file(path: impl AsRef<Path>) {
    let _ = env_logger::try_init();

    let path = path.as_ref();
    let code = fs::read_to_string(path).unwrap();
    let tests =
        Testfile::parse(&code).unwrap_or_else(|err| panic!("{}: {err}", path.display()));

    let config = Rc::new(SiteConfig::default());
    let mut store = MemoryDataAccess::default();
    let mut cases = Vec::new();
    for chunk in tests.chunks {
        match chunk {
            Chunk::Article { title, text } => {
                let title = Title::new(title, NS_MAIN, &config).unwrap();
                store.insert(&title, text.strip_suffix('\n').unwrap_or(text));
            }
            Chunk::Test { name, sections } => cases.push((name, sections)),
            Chunk::Comment | Chunk::Line => {}
        }
    }
    let store: Rc<dyn DataAccess> = Rc::new(store);

    let mut failures = Vec::new();
    for (name, sections) in &cases {
        let options = sections.get("options");
        if options.is_some_and(|options| options.has_option("disabled")) {
            log::info!("Skipping {name}");
            continue;
        }

        let (Some(wikitext), Some(expected)) = (
            sections.get("wikitext").and_then(SectionText::text),
            sections.get("html").and_then(SectionText::text),
        ) else {
            log::warn!("Could not find wikitext and html for {name}!");
            continue;
        };

        log::info!("Running {name} ...");
        let env = Env::new(Rc::clone(&config), Rc::clone(&store), "Parser test").unwrap();
        let options = Options {
            inline_context: options.is_some_and(|options| options.has_option("inline")),
            ..Options::default()
        };
        let actual = match block_on(env.parse(wikitext, options)) {
            Ok(tokens) => to_html(&strip_markers(tokens)),
            Err(err) => format!("error: {err}"),
        };
        if actual != expected {
            failures.push(format!(
                "{name}\n  wikitext: {wikitext:?}\n  expected: {expected:?}\n  actual:   {actual:?}"
            ));
        }
    }

    assert!(
        failures.is_empty(),
        "{} of {} tests in {} failed:\n\n{}",
        failures.len(),
        cases.len(),
        path.display(),
        failures.join("\n\n")
    );
}

macro_rules! test_from_file {
    ($($ident:ident => $path:literal),* $(,)?) => {
        $(#[test]
        fn $ident() {
            run_tests_from_file(format!("{BASE_DIR}/{}.txt", $path));
        })*
    }
}

use test_from_file;
