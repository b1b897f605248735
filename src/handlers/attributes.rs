//! Expansion of templated attribute keys and values.
//!
//! Attributes like `style="{{color}}"` are expanded in a nested pipeline.
//! Outside of templates, the transclusion markers in the expansion are
//! removed again and the element is marked with `mw:ExpandedAttrs`, with the
//! original and expanded forms of each generated attribute in its
//! `data-mw.attribs`.
//!
//! Two kinds of template output need more work:
//!
//! * A template which emits a newline in a wikitext table tag generated
//!   content as well as attributes. The expansion is split at the newline,
//!   the transclusion start marker is hoisted before the element so the
//!   encapsulation covers all of it, and the rest of the expansion is emitted
//!   after the element.
//! * A templated key with no value which expands to `k=v` text is tokenized
//!   again as a run of attributes.

use crate::{
    pipeline::{Ctx, Env, Frame, Input, Options, PipelineType, Result, TokenHandler, Transform},
    tokens::{
        AttrKey, AttrValue, DataMw, ExpandedAttr, Kv, KvOffsets, KvValue, Span, Syntax, Token,
        html::to_html,
        utils::{is_html_tag, is_table_tag, is_template_token, strip_eof, tokens_to_string},
    },
};
use futures::FutureExt as _;
use indexmap::IndexMap;
use regex::Regex;
use std::{mem, rc::Rc, sync::LazyLock};

/// Compiles a regular expression which is known to be valid.
fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid pattern {pattern:?}: {err}"))
}

/// Metas which the expansion stages generate.
static EXPANSION_META: LazyLock<Regex> =
    LazyLock::new(|| regex(r"mw:(?:LanguageVariant|Transclusion|Param|Includes|Annotation/).*$"));

/// Inclusion control metas. Newlines between them are removed anyway.
static INCLUDE_META: LazyLock<Regex> = LazyLock::new(|| {
    regex(r"(?:^|\s)mw:Includes/(?:No|Only)?Include(?:Only)?(/\S*)?(?:\s|$)")
});

/// Annotation metas and their type.
static ANNOTATION_META: LazyLock<Regex> =
    LazyLock::new(|| regex(r"^mw:Annotation/(\w+)(?:/End)?$"));

/// Metas which never need expansion.
static GENERATED_META: LazyLock<Regex> =
    LazyLock::new(|| regex(r"mw:(?:Placeholder|Transclusion|Param|Includes)"));

/// Returns true if `token` has attributes which need expansion.
fn needs_expansion(token: &Token) -> bool {
    let tag = match token {
        Token::TagStart(tag) | Token::SelfClosing(tag) => tag,
        _ => return false,
    };

    if tag.name == "meta"
        && tag
            .attr_str("typeof")
            .is_some_and(|ty| GENERATED_META.is_match(ty))
    {
        return false;
    }

    if tag.has_typeof("mw:ExpandedAttrs") {
        log::warn!("<{}> already has expanded attributes", tag.name);
        return false;
    }

    tag.attribs
        .iter()
        .any(|kv| kv.k.is_templated() || kv.v.is_templated())
}

/// Returns the index of the first newline in `tokens` which would split a
/// tag that cannot contain newlines.
fn nl_index(nl_ok: bool, tokens: &[Token]) -> Option<usize> {
    if nl_ok {
        return None;
    }

    let mut in_include = false;
    for (index, token) in tokens.iter().enumerate() {
        match token {
            Token::SelfClosing(tag) => {
                if let Some(caps) = tag.attr_str("typeof").and_then(|ty| INCLUDE_META.captures(ty)) {
                    in_include = !caps.get(1).is_some_and(|m| m.as_str().ends_with("/End"));
                }
            }
            Token::Newline(_) if !in_include => return Some(index),
            _ => {}
        }
    }
    None
}

/// The result of splitting an expansion at a newline.
#[derive(Debug, Default)]
struct Split {
    /// The hoisted transclusion start marker.
    meta: Vec<Token>,
    /// The expansion up to the newline.
    pre: Vec<Token>,
    /// The expansion from the newline.
    post: Vec<Token>,
}

/// The upper case name of a tag with its syntax, as the serializer names the
/// first node of a multi-part transclusion.
fn wikitext_node_name(name: &str, stx: Option<Syntax>) -> String {
    let name = name.to_uppercase();
    match stx {
        Some(Syntax::Html) => format!("{name}_html"),
        Some(Syntax::Row) => format!("{name}_row"),
        Some(Syntax::Piped) => format!("{name}_piped"),
        Some(Syntax::Magic) => format!("{name}_magic"),
        None => name,
    }
}

/// Splits `tokens` at `nl_pos`, hoisting the last transclusion start marker
/// before the newline out of the expansion.
///
/// If there is no marker to hoist, nothing is split.
fn split_tokens(
    frame: &Frame,
    token: &mut Token,
    nl_pos: usize,
    mut tokens: Vec<Token>,
    wrap_templates: bool,
) -> Split {
    let post = tokens.split_off(nl_pos);
    let start_meta = wrap_templates
        .then(|| {
            tokens.iter().rposition(|token| {
                matches!(token, Token::SelfClosing(tag) if tag
                    .attr_str("typeof")
                    .and_then(|ty| EXPANSION_META.find(ty))
                    .is_some_and(|m| !m.as_str().ends_with("/End")))
            })
        })
        .flatten();

    let Some(tag) = token.tag_mut() else {
        tokens.extend(post);
        return Split {
            pre: tokens,
            ..Default::default()
        };
    };

    // The element no longer ends where its source did
    let token_start = tag.dp.tsr.map(|tsr| tsr.start);
    tag.dp.tsr = None;

    let Some(index) = start_meta else {
        tokens.extend(post);
        return Split {
            pre: tokens,
            ..Default::default()
        };
    };

    let mut meta = tokens.remove(index);
    if let Some(meta_tag) = meta.tag_mut() {
        if let Some(start) = token_start
            && let Some(meta_tsr) = meta_tag.dp.tsr
        {
            meta_tag.dp.tmp.unwrapped_wt = frame
                .src()
                .get(start..meta_tsr.start)
                .map(ToString::to_string);
            meta_tag.dp.tsr = Some(Span::new(start, meta_tsr.end));
        }
        meta_tag.dp.tmp.first_wikitext_node = Some(wikitext_node_name(&tag.name, tag.dp.stx));
    }
    log::debug!("hoisting transclusion start out of <{}> attributes", tag.name);

    Split {
        meta: vec![meta],
        pre: tokens,
        post,
    }
}

/// The result of removing expansion markers from an expansion.
#[derive(Debug, Default)]
struct Stripped {
    /// The expansion contained content generated by a transclusion.
    has_generated_content: bool,
    /// Annotation types found in the expansion.
    annotation_types: Vec<String>,
    /// The expansion without markers.
    value: Vec<Token>,
}

/// Removes expansion markers from `tokens`. When templates are not wrapped,
/// all metas are removed.
fn strip_meta_tags(tokens: Vec<Token>, wrap_templates: bool) -> Stripped {
    let mut out = Stripped::default();
    for token in tokens {
        let keep = match &token {
            Token::TagStart(tag) | Token::SelfClosing(tag) => {
                let ty = tag.attr_str("typeof").unwrap_or_default();
                match EXPANSION_META.find(ty) {
                    Some(m) if wrap_templates => {
                        if !m.as_str().ends_with("/End") {
                            out.has_generated_content = true;
                        }
                        if let Some(caps) = ANNOTATION_META.captures(ty) {
                            out.annotation_types.push(caps[1].to_string());
                        }
                        tag.name != "meta"
                    }
                    _ => wrap_templates || tag.name != "meta",
                }
            }
            _ => true,
        };
        if keep {
            out.value.push(token);
        }
    }
    out
}

/// Replaces template tokens which survived in reparsed attributes with their
/// source text.
fn templates_to_source(value: KvValue) -> KvValue {
    match value {
        KvValue::Tokens(tokens) => KvValue::Tokens(
            tokens
                .into_iter()
                .map(|token| match token {
                    Token::SelfClosing(tag) if tag.name == "template" => {
                        Token::Text(tag.dp.src.unwrap_or_default())
                    }
                    token => token,
                })
                .collect(),
        ),
        value => value,
    }
}

/// The original and expanded forms of one generated attribute, before they
/// are rendered.
struct Generated {
    /// The expanded key text.
    key: String,
    /// The key source offsets.
    offsets: Option<KvOffsets>,
    /// The key to render, if the key was generated.
    key_html: Option<KvValue>,
    /// The value to render, if any.
    val_html: Option<KvValue>,
    /// The key is part of a template which also generated content.
    key_uneditable: bool,
    /// The value is part of a template which also generated content.
    val_uneditable: bool,
}

/// The context of one attribute expansion.
struct AttrContext {
    /// The parse environment.
    env: Rc<Env>,
    /// The frame the element appeared in.
    frame: Rc<Frame>,
    /// The options of the calling pipeline.
    options: Options,
}

impl AttrContext {
    /// Expands `tokens` in the calling frame.
    async fn expand(&self, tokens: Vec<Token>) -> Result<Vec<Token>> {
        let options = Options {
            ext_tag: None,
            inline_context: false,
            attr_expansion: true,
            ..self.options.clone()
        };
        let mut tokens = self
            .env
            .process_content(
                &self.frame,
                Input::Tokens(tokens),
                PipelineType::TokensToExpanded,
                options,
                false,
                None,
            )
            .await?;
        strip_eof(&mut tokens);
        Ok(tokens)
    }

    /// Renders an attribute key or value as inline HTML.
    async fn render(&self, value: KvValue) -> Result<String> {
        let tokens = match value {
            KvValue::Str(text) => return Ok(html_escape::encode_text(&text).into_owned()),
            KvValue::Tokens(tokens) => tokens,
        };
        let options = Options {
            ext_tag: None,
            inline_context: true,
            attr_expansion: true,
            ..self.options.clone()
        };
        let tokens = self
            .env
            .process_content(
                &self.frame,
                Input::Tokens(tokens),
                PipelineType::ExpandedToFinal,
                options,
                false,
                None,
            )
            .await?;
        Ok(to_html(&tokens))
    }

    /// Expands the templated attributes of `token`.
    async fn expand_token(self, token: Token) -> Result<Vec<Token>> {
        let Some(tag) = token.tag() else {
            return Ok(vec![token]);
        };

        let mut expanded = Vec::with_capacity(tag.attribs.len());
        for kv in &tag.attribs {
            let mut kv = kv.clone();
            if kv.k.is_templated() {
                kv.k = KvValue::Tokens(self.expand(mem::take(&mut kv.k).into_tokens()).await?);
            }
            if kv.v.is_templated() {
                kv.v = KvValue::Tokens(self.expand(mem::take(&mut kv.v).into_tokens()).await?);
            }
            expanded.push(kv);
        }

        self.build_expanded_attrs(token, expanded).await
    }

    /// Replaces the attributes of `token` with their expansions, and records
    /// the generated ones.
    async fn build_expanded_attrs(&self, mut token: Token, mut expanded: Vec<Kv>) -> Result<Vec<Token>> {
        let wrap_templates = !self.options.in_template;
        let nl_ok = is_html_tag(&token) || !is_table_tag(&token);
        let old_attribs = token.tag().map(|tag| tag.attribs.clone()).unwrap_or_default();

        let mut meta_tokens = Vec::new();
        let mut post_nl_tokens = Vec::new();
        let mut new_attrs = None::<Vec<Kv>>;
        let mut annotation_types = Vec::new();
        let mut generated = IndexMap::<String, Generated>::new();

        for (index, old) in old_attribs.iter().enumerate() {
            let orig_k = expanded[index].k.clone();
            let orig_v = expanded[index].v.clone();
            let mut expanded_k = orig_k.clone();
            let mut k_generated = false;
            let mut v_generated = false;
            let mut reparsed = false;
            let mut key_uneditable = false;
            let mut val_uneditable = false;

            if matches!(old.k, KvValue::Tokens(_)) {
                let k_tokens = mem::take(&mut expanded[index].k).into_tokens();
                let k_tokens = if let Some(nl_pos) = nl_index(nl_ok, &k_tokens) {
                    key_uneditable = true;
                    let split = split_tokens(&self.frame, &mut token, nl_pos, k_tokens, wrap_templates);
                    meta_tokens = split.meta;
                    post_nl_tokens = split.post;
                    split.pre
                } else {
                    let stripped = strip_meta_tags(k_tokens, wrap_templates);
                    k_generated = stripped.has_generated_content;
                    annotation_types.extend(stripped.annotation_types);
                    stripped.value
                };
                expanded[index].k = KvValue::Tokens(k_tokens);
                expanded_k = expanded[index].k.clone();

                if matches!(&expanded[index].v, KvValue::Str(v) if v.is_empty()) {
                    let k_str = tokens_to_string(expanded[index].k.tokens());
                    let k_str = k_str.trim();
                    let kvs = if k_str.contains('=') {
                        self.env.tokenizer().tokenize_attributes(k_str).unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    if let Some(first) = kvs.first() {
                        log::trace!("reparsed generated attributes {k_str:?}");
                        expanded_k = templates_to_source(first.k.clone());
                        reparsed = true;
                        new_attrs
                            .get_or_insert_with(|| expanded[..index].to_vec())
                            .extend(kvs.into_iter().map(|kv| Kv {
                                k: templates_to_source(kv.k),
                                v: templates_to_source(kv.v),
                                src_offsets: None,
                                ..kv
                            }));
                    }
                }
            }

            if let KvValue::Str(key) = &expanded_k
                && !key.starts_with("mw:")
                && matches!(old.v, KvValue::Tokens(_))
            {
                let v_tokens = mem::take(&mut expanded[index].v).into_tokens();
                let v_tokens = if let Some(nl_pos) = nl_index(nl_ok, &v_tokens) {
                    val_uneditable = true;
                    let split = split_tokens(&self.frame, &mut token, nl_pos, v_tokens, wrap_templates);
                    meta_tokens = split.meta;
                    post_nl_tokens = split.post;
                    split.pre
                } else {
                    let stripped = strip_meta_tags(v_tokens, wrap_templates);
                    v_generated = stripped.has_generated_content;
                    annotation_types.extend(stripped.annotation_types);
                    stripped.value
                };
                expanded[index].v = KvValue::Tokens(v_tokens);
            }

            if k_generated || v_generated || (reparsed && !meta_tokens.is_empty()) {
                let key = expanded_k.to_text().into_owned();
                let (key_html, val_html) = if reparsed {
                    // The transclusion is editable through the key only
                    let key_html = if key_uneditable {
                        expanded[index].k.clone()
                    } else {
                        orig_k
                    };
                    (Some(key_html), None)
                } else {
                    let val_html = if val_uneditable {
                        expanded[index].v.clone()
                    } else {
                        orig_v
                    };
                    (k_generated.then_some(orig_k), Some(val_html))
                };
                generated.insert(
                    key.clone(),
                    Generated {
                        key,
                        offsets: expanded[index].src_offsets,
                        key_html,
                        val_html,
                        key_uneditable,
                        val_uneditable,
                    },
                );
            }

            if !reparsed && let Some(new_attrs) = &mut new_attrs {
                new_attrs.push(expanded[index].clone());
            }
        }

        let Some(tag) = token.tag_mut() else {
            return Ok(vec![token]);
        };
        let has_about = tag.has_attr("about");
        tag.attribs = new_attrs.unwrap_or(expanded);

        // Elements with an about id are already encapsulated
        if !has_about && !generated.is_empty() && !is_template_token(&token) {
            let mut attribs = Vec::with_capacity(generated.len());
            for attr in generated.into_values() {
                let key_html = match attr.key_html {
                    Some(value) => Some(self.render(value).await?),
                    None => None,
                };
                let val_html = match attr.val_html {
                    Some(value) => self.render(value).await?,
                    None => String::new(),
                };
                attribs.push(ExpandedAttr(
                    AttrKey {
                        txt: Some(attr.key),
                        html: key_html,
                        src_offsets: attr.offsets.map(|offsets| offsets.key),
                        uneditable: attr.key_uneditable,
                    },
                    AttrValue {
                        html: val_html,
                        src_offsets: attr.offsets.map(|offsets| offsets.value),
                        uneditable: attr.val_uneditable,
                    },
                ));
            }

            if let Some(tag) = token.tag_mut() {
                tag.add_attr("about", self.env.new_about_id());
                tag.add_space_separated_attr("typeof", "mw:ExpandedAttrs");
                for ty in annotation_types {
                    let ty = format!("mw:Annotation/{ty}");
                    if !tag.has_typeof(&ty) {
                        tag.add_space_separated_attr("typeof", &ty);
                    }
                }
                tag.data_mw = Some(Box::new(DataMw {
                    attribs,
                    ..Default::default()
                }));
            }
        }

        let mut out = meta_tokens;
        out.push(token);
        out.extend(post_nl_tokens);
        Ok(out)
    }
}

/// Expands templated attribute keys and values.
#[derive(Default)]
pub struct AttributeExpander;

impl TokenHandler for AttributeExpander {
    fn name(&self) -> &'static str {
        "AttributeExpander"
    }

    fn reset_state(&mut self, _options: &Options) {}

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        if !needs_expansion(&token) {
            return Ok(Transform::Unchanged(token));
        }

        let cx = AttrContext {
            env: Rc::clone(ctx.env),
            frame: Rc::clone(ctx.frame),
            options: ctx.options.clone(),
        };
        Ok(Transform::Pending(cx.expand_token(token).boxed_local()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::testing::{env_with, run_on_source},
        tokens::Tag,
    };
    use futures::executor::block_on;

    const ECHO: (&str, &str) = ("Echo", "{{{1}}}");

    fn expand(env: &Rc<Env>, src: &str) -> Vec<Token> {
        let frame = Frame::new_root(env.page().clone(), src);
        block_on(env.process_content(
            &frame,
            src.into(),
            PipelineType::ExpandedTokens,
            Options::default(),
            true,
            None,
        ))
        .unwrap()
    }

    fn find<'a>(tokens: &'a [Token], name: &str) -> &'a Tag {
        tokens
            .iter()
            .find_map(|token| match token {
                Token::TagStart(tag) if tag.name == name => Some(tag),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn templated_value() {
        let env = env_with(&[ECHO]);
        let tokens = expand(&env, "<div style=\"{{echo|red}}\">x</div>");
        let div = find(&tokens, "div");

        assert_eq!(div.attr("style").unwrap().to_text(), "red");
        assert!(div.has_typeof("mw:ExpandedAttrs"));
        assert!(div.attr_str("about").unwrap().starts_with("#mwt"));

        let kv = div.attribs.iter().find(|kv| kv.k.as_str() == Some("style")).unwrap();
        assert_eq!(kv.vsrc.as_deref(), Some("{{echo|red}}"));

        let data_mw = div.data_mw.as_ref().unwrap();
        assert_eq!(data_mw.attribs.len(), 1);
        let ExpandedAttr(key, value) = &data_mw.attribs[0];
        assert_eq!(key.txt.as_deref(), Some("style"));
        assert_eq!(key.html, None);
        assert!(value.html.contains("mw:Transclusion"));
        assert!(value.html.contains("red"));
    }

    #[test]
    fn templated_value_in_template() {
        let env = env_with(&[ECHO]);
        let tokens = run_on_source(
            &mut AttributeExpander,
            &env,
            "<div style=\"{{echo|red}}\">",
            Options {
                in_template: true,
                ..Default::default()
            },
        );
        let div = find(&tokens, "div");
        assert_eq!(div.attr("style").unwrap().to_text(), "red");
        assert!(!div.has_attr("typeof"));
        assert!(div.data_mw.is_none());
    }

    #[test]
    fn generated_attribute_string() {
        let env = env_with(&[ECHO]);
        let tokens = expand(&env, "<div {{echo|1=style='color:red'}}>x</div>");
        let div = find(&tokens, "div");

        assert_eq!(div.attr_str("style"), Some("color:red"));
        assert!(div.has_typeof("mw:ExpandedAttrs"));
        let ExpandedAttr(key, value) = &div.data_mw.as_ref().unwrap().attribs[0];
        assert_eq!(key.txt.as_deref(), Some("style"));
        assert!(key.html.is_some());
        assert_eq!(value.html, "");
    }

    #[test]
    fn plain_attributes_are_untouched() {
        let env = env_with(&[]);
        let tokens = expand(&env, "<div class=\"a\">x</div>");
        let div = find(&tokens, "div");
        assert_eq!(div.attr_str("class"), Some("a"));
        assert!(!div.has_attr("typeof"));
    }

    #[test]
    fn newline_index() {
        let tokens = vec![Token::from("a"), Token::newline(None), Token::from("b")];
        assert_eq!(nl_index(false, &tokens), Some(1));
        assert_eq!(nl_index(true, &tokens), None);

        let tokens = vec![
            Token::meta("mw:Includes/IncludeOnly").self_closing(),
            Token::newline(None),
            Token::meta("mw:Includes/IncludeOnly/End").self_closing(),
            Token::newline(None),
        ];
        assert_eq!(nl_index(false, &tokens), Some(3));
    }

    #[test]
    fn strip_markers() {
        let tokens = vec![
            Token::meta("mw:Transclusion").self_closing(),
            Token::from("red"),
            Token::meta("mw:Transclusion/End").self_closing(),
            Token::meta("mw:Annotation/translate").self_closing(),
            Tag::new("b").start(),
        ];
        let stripped = strip_meta_tags(tokens.clone(), true);
        assert!(stripped.has_generated_content);
        assert_eq!(stripped.annotation_types, ["translate"]);
        assert_eq!(stripped.value, [Token::from("red"), Tag::new("b").start()]);

        let stripped = strip_meta_tags(tokens, false);
        assert!(!stripped.has_generated_content);
        assert_eq!(stripped.value, [Token::from("red"), Tag::new("b").start()]);
    }

    #[test]
    fn split_hoists_transclusion_start() {
        let frame = Frame::new_root(env_with(&[]).page().clone(), "|{{x}}");
        let mut td = Tag::new("td").with_tsr(Some(Span::new(0, 7))).start();
        let tokens = vec![
            Token::meta("mw:Transclusion")
                .with_tsr(Some(Span::new(1, 6)))
                .self_closing(),
            Token::from("a"),
            Token::newline(None),
            Token::from("b"),
        ];
        let split = split_tokens(&frame, &mut td, 2, tokens, true);

        assert_eq!(split.pre, [Token::from("a")]);
        assert_eq!(split.post, [Token::newline(None), Token::from("b")]);
        assert_eq!(td.tsr(), None);
        let meta = split.meta[0].tag().unwrap();
        assert_eq!(meta.dp.tsr, Some(Span::new(0, 6)));
        assert_eq!(meta.dp.tmp.unwrapped_wt.as_deref(), Some("|"));
        assert_eq!(meta.dp.tmp.first_wikitext_node.as_deref(), Some("TD"));
    }

    #[test]
    fn split_without_marker_keeps_everything() {
        let frame = Frame::new_root(env_with(&[]).page().clone(), "");
        let mut td = Tag::new("td").start();
        let tokens = vec![Token::from("a"), Token::newline(None), Token::from("b")];
        let split = split_tokens(&frame, &mut td, 1, tokens.clone(), true);
        assert!(split.meta.is_empty());
        assert!(split.post.is_empty());
        assert_eq!(split.pre, tokens);
    }
}
