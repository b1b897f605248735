//! Template, parser function, and template argument expansion.

use super::{
    encapsulator::Encapsulator,
    parser_fns::{self, PfContext},
};
use crate::{
    pipeline::{Ctx, FrameError, Input, Options, PipelineType, Resource, Result, TokenHandler, Transform},
    title::{NS_MAIN, NS_TEMPLATE, Title},
    tokens::{
        Span, Tag, Token,
        utils::{shift_tsr, strip_eof, tokens_to_string},
    },
};
use futures::FutureExt as _;
use std::{borrow::Cow, rc::Rc};

/// A resolved transclusion target.
#[derive(Debug, PartialEq)]
enum Target {
    /// The `{{!}}` magic word.
    Pipe,
    /// A parser function or variable, with the text of its first argument.
    Function { name: String, first: String },
    /// A template page.
    Template(Title),
}

/// Expands templates, parser functions, and template arguments.
///
/// Every expansion is asynchronous. The handler itself keeps no state; each
/// pending expansion owns everything it needs.
#[derive(Default)]
pub struct TemplateHandler;

impl TokenHandler for TemplateHandler {
    fn name(&self) -> &'static str {
        "TemplateHandler"
    }

    fn reset_state(&mut self, _options: &Options) {}

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let cx = || PfContext {
            env: Rc::clone(ctx.env),
            frame: Rc::clone(ctx.frame),
            options: ctx.options.clone(),
        };
        Ok(match token {
            Token::SelfClosing(tag) if tag.name == "template" => {
                Transform::Pending(expand_template(cx(), tag).boxed_local())
            }
            Token::SelfClosing(tag) if tag.name == "templatearg" => {
                Transform::Pending(expand_template_arg(cx(), tag).boxed_local())
            }
            token => Transform::Unchanged(token),
        })
    }
}

/// Expands a `{{...}}` transclusion.
async fn expand_template(cx: PfContext, tag: Tag) -> Result<Vec<Token>> {
    if !cx.options.expand_templates {
        return convert_to_string(&cx, &tag).await;
    }

    let target = tag.attribs.first().map(|kv| &kv.k);
    let mut target_tokens = target.cloned().unwrap_or_default().into_tokens();
    if target.is_some_and(|target| target.is_templated()) {
        target_tokens = cx.expand(target_tokens).await?;
    }

    let Some(target) = resolve_target(&cx, &target_tokens) else {
        log::debug!("invalid transclusion target {:?}", tag.dp.src);
        return convert_to_string(&cx, &tag).await;
    };

    match target {
        Target::Pipe => Ok(vec![Token::from("|")]),
        Target::Function { name, first } => {
            cx.env.bump(Resource::Transclusions, 1)?;
            let mut encap = Encapsulator::new(&cx.env, &cx.frame, tag, "mw:Transclusion");
            encap.function = Some(name.clone());
            let args = encap.token().attribs.get(1..).unwrap_or_default();
            let mut tokens = match parser_fns::call(&cx, &name, &first, args).await? {
                Some(tokens) => tokens,
                None => {
                    log::warn!("no implementation for parser function '{name}'");
                    vec![Token::Text(format!(
                        "Parser function implementation for pf_{name} missing"
                    ))]
                }
            };
            shift_tsr(&mut tokens, None);
            Ok(wrap(&cx, &encap, tokens))
        }
        Target::Template(title) => {
            cx.env.bump(Resource::Transclusions, 1)?;
            let mut encap = Encapsulator::new(&cx.env, &cx.frame, tag, "mw:Transclusion");
            encap.resolved_target = Some(title.href());
            let tokens = transclude(&cx, &encap, title).await?;
            Ok(wrap(&cx, &encap, tokens))
        }
    }
}

/// Fetches and expands a template page in a new frame.
async fn transclude(cx: &PfContext, encap: &Encapsulator, title: Title) -> Result<Vec<Token>> {
    let max_depth = cx.env.config().limits.max_depth;
    if let Err(err) = cx.frame.check(&title, max_depth, false) {
        return Ok(error_tokens(&err, &title));
    }

    let Some(src) = cx.env.fetch_template(&title).await else {
        log::debug!("template '{title}' does not exist");
        return Ok(red_link(&title));
    };

    let args = encap.token().attribs.get(1..).unwrap_or_default().to_vec();
    let frame = match cx.frame.new_child(title.clone(), args, Rc::clone(&src), max_depth) {
        Ok(frame) => frame,
        Err(err) => return Ok(error_tokens(&err, &title)),
    };

    let options = Options {
        expand_templates: true,
        in_template: true,
        is_include: true,
        ext_tag: None,
        inline_context: false,
        attr_expansion: false,
    };
    let mut tokens = cx
        .env
        .process_content(
            &frame,
            Input::Wikitext(src.to_string()),
            PipelineType::ExpandedTokens,
            options,
            true,
            None,
        )
        .await?;
    strip_eof(&mut tokens);
    shift_tsr(&mut tokens, None);
    Ok(tokens)
}

/// Expands a `{{{...}}}` template argument.
async fn expand_template_arg(cx: PfContext, tag: Tag) -> Result<Vec<Token>> {
    let src = tag.dp.src.clone().unwrap_or_default();
    if !cx.options.expand_templates {
        return Ok(vec![Token::Text(src)]);
    }

    let name = tag.attribs.first().map(|kv| &kv.k);
    let mut name_tokens = name.cloned().unwrap_or_default().into_tokens();
    if name.is_some_and(|name| name.is_templated()) {
        name_tokens = cx.expand(name_tokens).await?;
    }
    let name = tokens_to_string(&name_tokens);
    let name = name.trim();

    let mut tokens = if let Some(value) = cx.frame.expand_arg(&cx.env, name, &cx.options).await? {
        value
    } else if let Some(default) = tag.attribs.get(1) {
        log::trace!("using default for template argument '{name}'");
        cx.expand(default.v.clone().into_tokens()).await?
    } else {
        vec![Token::Text(src)]
    };
    strip_eof(&mut tokens);
    shift_tsr(&mut tokens, None);

    let encap = Encapsulator::new(&cx.env, &cx.frame, tag, "mw:Param");
    Ok(wrap(&cx, &encap, tokens))
}

/// Encapsulates `tokens` unless they are part of an enclosing transclusion.
fn wrap(cx: &PfContext, encap: &Encapsulator, tokens: Vec<Token>) -> Vec<Token> {
    if cx.options.in_template {
        tokens
    } else {
        encap.encap_tokens(tokens)
    }
}

/// Reconstructs a transclusion as text. Anything nested inside it is still
/// processed normally.
async fn convert_to_string(cx: &PfContext, tag: &Tag) -> Result<Vec<Token>> {
    let src = tag.dp.src.as_deref().unwrap_or_default();
    let Some(inner) = src.get(1..src.len().saturating_sub(1)).filter(|inner| !inner.is_empty()) else {
        return Ok(vec![Token::from(src)]);
    };

    let src_offsets = tag
        .dp
        .tsr
        .map(|tsr| Span::new(tsr.start + 1, tsr.end.saturating_sub(1)));
    let mut tokens = cx
        .env
        .process_content(
            &cx.frame,
            Input::Wikitext(inner.to_string()),
            PipelineType::ExpandedTokens,
            cx.options.clone(),
            false,
            src_offsets,
        )
        .await?;
    strip_eof(&mut tokens);

    let mut out = Vec::with_capacity(tokens.len() + 2);
    out.push(Token::from("{"));
    out.extend(tokens);
    out.push(Token::from("}"));
    Ok(out)
}

/// Converts target tokens to a string.
///
/// Returns the string and any tokens which could not be converted. Text may
/// be followed by one newline and then only whitespace; anything else after
/// the newline is left unconverted.
fn target_to_string(tokens: &[Token]) -> (String, &[Token]) {
    let mut buf = String::new();
    let mut pre_newline = None::<String>;
    let mut index = 0;
    let finish = |pre_newline: Option<String>, buf: String| match pre_newline {
        Some(pre_newline) => pre_newline + &buf,
        None => buf,
    };

    while let Some(token) = tokens.get(index) {
        match token {
            Token::Text(text) => {
                if let Some(pre) = pre_newline.take_if(|_| !text.trim().is_empty()) {
                    return (pre, &tokens[index..]);
                }
                buf += text;
            }
            Token::Newline(_) => {
                if buf.trim().is_empty() {
                    buf.push('\n');
                } else if pre_newline.is_none() {
                    pre_newline = Some(core::mem::replace(&mut buf, "\n".into()));
                } else {
                    return (finish(pre_newline, buf), &tokens[index..]);
                }
            }
            Token::Comment(..) | Token::EndOfInput(_) => {}
            Token::SelfClosing(tag) if tag.name == "mw-quote" => {
                buf += &tag.attr("value").map(|v| v.to_text()).unwrap_or_default();
            }
            Token::SelfClosing(tag)
                if tag.name == "template"
                    || tag.name == "templatearg"
                    || tag.typeof_matching(|ty| ty.starts_with("mw:Includes/")).is_some() => {}
            Token::TagStart(tag) if tag.name == "span" && tag.has_typeof("mw:Entity") => {
                if let Some(Token::Text(text)) = tokens.get(index + 1) {
                    buf += text;
                }
                index += 2;
            }
            _ => return (finish(pre_newline, buf), &tokens[index..]),
        }
        index += 1;
    }
    (finish(pre_newline, buf), &[])
}

/// Resolves the target of a transclusion.
fn resolve_target(cx: &PfContext, tokens: &[Token]) -> Option<Target> {
    let config = cx.env.config();
    let (text, extra) = target_to_string(tokens);
    let mut target = text.trim();
    if let Some((prefix, rest)) = target.split_once(':')
        && prefix.trim().eq_ignore_ascii_case("safesubst")
    {
        target = rest.trim_start();
    }

    let (prefix, arg) = match target.split_once(':') {
        Some((prefix, arg)) => (prefix.trim(), Some(arg)),
        None => (target, None),
    };

    let has_hash = prefix.starts_with('#');
    let function = config
        .function_hook(prefix)
        .filter(|_| has_hash || arg.is_some());
    let variable = config.variable(prefix).filter(|_| function.is_none());
    if variable.as_deref() == Some("!") && arg.is_none() && extra.is_empty() {
        return Some(Target::Pipe);
    }

    let name = variable
        .map(|name| if name == "=" { "equal".to_string() } else { name })
        .or(function)
        .or_else(|| has_hash.then(|| prefix[1..].to_lowercase()));
    if let Some(name) = name {
        let first = arg.unwrap_or_default().to_string() + &tokens_to_string(extra);
        return Some(Target::Function { name, first });
    }

    if !extra.is_empty() {
        return None;
    }

    let resolved = cx.env.page().resolve_relative(target)?;
    let default_ns = match resolved {
        Cow::Owned(_) => NS_MAIN,
        Cow::Borrowed(_) => NS_TEMPLATE,
    };
    Title::new(&resolved, default_ns, config)
        .ok()
        .map(Target::Template)
}

/// The error shown in place of a transclusion which would loop or recurse
/// too deeply.
fn error_tokens(err: &FrameError, title: &Title) -> Vec<Token> {
    vec![
        Tag::new("span").with_attr("class", "error").start(),
        Token::Text(err.to_string()),
        Tag::new("a")
            .with_attr("rel", "mw:WikiLink")
            .with_attr("href", title.href())
            .start(),
        Token::Text(title.key().to_string()),
        Tag::new("a").end(),
        Tag::new("span").end(),
    ]
}

/// A link to a template page which does not exist.
fn red_link(title: &Title) -> Vec<Token> {
    vec![
        Tag::new("a")
            .with_attr("rel", "mw:WikiLink")
            .with_attr("href", title.href())
            .with_attr("class", "new")
            .start(),
        Token::Text(title.key().to_string()),
        Tag::new("a").end(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::testing::{env_with, parse, parse_to_html, run_on_source},
        tokens::Part,
    };
    use futures::executor::block_on;

    fn target(src: &str) -> Option<Target> {
        let env = env_with(&[]);
        let frame = crate::pipeline::Frame::new_root(env.page().clone(), "");
        let cx = PfContext {
            env,
            frame,
            options: Options::default(),
        };
        resolve_target(&cx, &[Token::from(src)])
    }

    fn template(name: &str) -> Option<Target> {
        let config = crate::config::SiteConfig::default();
        Some(Target::Template(Title::new(name, NS_TEMPLATE, &config).unwrap()))
    }

    fn function(name: &str, first: &str) -> Option<Target> {
        Some(Target::Function {
            name: name.into(),
            first: first.into(),
        })
    }

    #[test]
    fn targets() {
        assert_eq!(target(" foo "), template("Foo"));
        assert_eq!(target("safesubst:foo"), template("Foo"));
        assert_eq!(target(":Main"), template(":Main"));
        assert_eq!(target("#if: x"), function("if", " x"));
        assert_eq!(target("#IF:x"), function("if", "x"));
        assert_eq!(target("lc:X"), function("lc", "X"));
        assert_eq!(target("lc"), template("Lc"));
        assert_eq!(target("PAGENAME"), function("pagename", ""));
        assert_eq!(target("pagename"), template("Pagename"));
        assert_eq!(target("="), function("equal", ""));
        assert_eq!(target("!"), Some(Target::Pipe));
        assert_eq!(target("#nope:x"), function("nope", "x"));
        assert_eq!(target("a[b"), None);
        assert_eq!(target("/Sub"), template(":Main Page/Sub"));
        assert_eq!(target("./Sub/"), template(":Main Page/Sub"));
        assert_eq!(target("../Sub"), None);
    }

    #[test]
    fn relative_targets_resolve_against_the_page() {
        use crate::{
            config::SiteConfig,
            pipeline::{Env, MemoryDataAccess},
        };

        let config = SiteConfig::default();
        let mut store = MemoryDataAccess::default();
        for (title, text) in [("A/Foo", "sibling"), ("A/B/Sub", "child")] {
            store.insert(&Title::new(title, NS_MAIN, &config).unwrap(), text);
        }
        let env = Env::new(Rc::new(config), Rc::new(store), "A/B").unwrap();
        assert_eq!(tokens_to_string(&parse(&env, "{{../Foo}}")), "sibling");
        assert_eq!(tokens_to_string(&parse(&env, "{{./Sub}}")), "child");
        assert_eq!(
            tokens_to_string(&parse(&env, "{{../../../Foo}}")),
            "{{../../../Foo}}"
        );
    }

    #[test]
    fn target_strings() {
        let tokens = [
            Token::from("a"),
            Token::Comment("c".into(), Default::default()),
            Token::from("b"),
            Token::newline(None),
            Token::from(" "),
        ];
        assert_eq!(target_to_string(&tokens), ("ab\n ".to_string(), &[][..]));

        let tokens = [Token::from("a"), Token::newline(None), Token::from("b")];
        let (text, rest) = target_to_string(&tokens);
        assert_eq!(text, "a");
        assert_eq!(rest, &[Token::from("b")]);
    }

    #[test]
    fn expands_template() {
        let env = env_with(&[("Echo", "{{{1}}}")]);
        let tokens = parse(&env, "{{echo|hi}}");
        let start = tokens.iter().find(|t| t.is_meta("mw:Transclusion")).unwrap();
        let start = start.tag().unwrap();
        assert_eq!(start.attr_str("about"), Some("#mwt1"));
        assert_eq!(start.dp.tsr, Some(Span::new(0, 11)));
        let Some(Part::Template { template }) = start.data_mw.as_ref().unwrap().parts.first() else {
            panic!("missing template part");
        };
        assert_eq!(template.target.wt, "echo");
        assert_eq!(template.target.href.as_deref(), Some("./Template:Echo"));
        assert_eq!(template.params["1"].wt, "hi");
        assert!(tokens.iter().any(|t| t.is_meta("mw:Transclusion/End")));
        assert_eq!(tokens_to_string(&tokens), "hi");
    }

    #[test]
    fn positional_and_named_arguments() {
        let env = env_with(&[("Args", "{{{1}}}-{{{2}}}-{{{name}}}-{{{3|def}}}")]);
        let html = parse_to_html(&env, "{{args|a |name= b |c}}");
        assert!(html.contains("a -c-b-def"), "{html}");
    }

    #[test]
    fn nested_arguments_are_expanded_in_the_caller() {
        let env = env_with(&[("Outer", "{{inner|{{{1}}}}}"), ("Inner", "[{{{1}}}]")]);
        let html = parse_to_html(&env, "{{outer|x}}");
        assert!(html.contains("[x]"), "{html}");
        assert_eq!(html.matches("mw:Transclusion/End").count(), 1, "{html}");
    }

    #[test]
    fn missing_template() {
        let env = env_with(&[]);
        let html = parse_to_html(&env, "{{nothing here}}");
        assert!(
            html.contains(
                r#"<a rel="mw:WikiLink" href="./Template:Nothing_here" class="new">Template:Nothing here</a>"#
            ),
            "{html}"
        );
        assert!(html.contains("mw:Transclusion"), "{html}");
    }

    #[test]
    fn template_loop() {
        let env = env_with(&[("Loop", "a{{loop}}")]);
        let html = parse_to_html(&env, "{{loop}}");
        assert!(
            html.contains(r#"<span class="error">Template loop detected: <a rel="mw:WikiLink" href="./Template:Loop">Template:Loop</a></span>"#),
            "{html}"
        );
        assert_eq!(env.fetch_count(), 1);
    }

    #[test]
    fn mutual_template_loop() {
        let env = env_with(&[("A", "{{b}}"), ("B", "{{a}}")]);
        let html = parse_to_html(&env, "{{a}}{{a}}");
        assert_eq!(html.matches("Template loop detected").count(), 2, "{html}");
        assert_eq!(env.fetch_count(), 2);
    }

    #[test]
    fn depth_limit() {
        let mut config = crate::config::SiteConfig::default();
        config.limits.max_depth = 3;
        let mut store = crate::pipeline::MemoryDataAccess::default();
        for (name, text) in [("A", "{{b}}"), ("B", "{{c}}"), ("C", "{{d}}"), ("D", "x")] {
            store.insert(&Title::new(name, NS_TEMPLATE, &config).unwrap(), text);
        }
        let env = crate::pipeline::Env::new(Rc::new(config), Rc::new(store), "Main Page").unwrap();
        let html = parse_to_html(&env, "{{a}}");
        assert!(
            html.contains("Template recursion depth limit exceeded (3): "),
            "{html}"
        );
    }

    #[test]
    fn pipe_magic_word() {
        let env = env_with(&[]);
        let tokens = parse(&env, "a{{!}}b");
        assert_eq!(tokens_to_string(&tokens), "a|b");
        assert!(!tokens.iter().any(|t| t.is_meta("mw:Transclusion")));
    }

    #[test]
    fn template_argument_at_top_level() {
        let env = env_with(&[]);
        let tokens = parse(&env, "{{{1|d}}} {{{2}}}");
        assert_eq!(tokens_to_string(&tokens), "d {{{2}}}");
        assert_eq!(tokens.iter().filter(|t| t.is_meta("mw:Param")).count(), 2);
    }

    #[test]
    fn unknown_parser_function() {
        let env = env_with(&[]);
        let tokens = parse(&env, "{{#nope:x}}");
        assert_eq!(
            tokens_to_string(&tokens),
            "Parser function implementation for pf_nope missing"
        );
        assert!(tokens.iter().any(|t| t.is_meta("mw:Transclusion")));
    }

    #[test]
    fn invalid_target_is_text() {
        let env = env_with(&[("Echo", "{{{1}}}")]);
        let tokens = parse(&env, "{{a[b|{{echo|c}}}}");
        assert_eq!(tokens_to_string(&tokens), "{{a[b|c}}");
    }

    #[test]
    fn templated_target() {
        let env = env_with(&[("Echo", "{{{1}}}"), ("Foo", "foo!")]);
        let tokens = parse(&env, "{{ {{echo|foo}} }}");
        assert_eq!(tokens_to_string(&tokens), "foo!");
    }

    #[test]
    fn no_expansion() {
        let env = env_with(&[("Echo", "{{{1}}}")]);
        let options = Options {
            expand_templates: false,
            ..Default::default()
        };
        let tokens = run_on_source(&mut TemplateHandler, &env, "{{echo|{{echo|x}}}}", options);
        assert_eq!(tokens_to_string(&tokens), "{{echo|{{echo|x}}}}");
        assert_eq!(env.fetch_count(), 0);
    }

    #[test]
    fn transclusion_limit() {
        let mut config = crate::config::SiteConfig::default();
        config.limits.max_transclusions = 2;
        let env = crate::pipeline::Env::new(
            Rc::new(config),
            Rc::new(crate::pipeline::MemoryDataAccess::default()),
            "Main Page",
        )
        .unwrap();
        let result = block_on(env.parse("{{a}}{{b}}{{c}}", Options::default()));
        assert!(result.unwrap_err().is_payload_too_large());
    }
}
