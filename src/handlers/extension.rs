//! Extension tag expansion.

use crate::{
    pipeline::{
        self, Ctx, Env, Frame, Input, Options, PipelineType, Result, TokenHandler, Transform,
    },
    tokens::{DataMw, DataParsoid, MwError, Span, Tag, Token, utils::tokens_to_string},
};
use futures::FutureExt as _;
use indexmap::IndexMap;
use std::rc::Rc;

/// An extension tag implementation error.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// Processing nested content failed.
    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),

    /// The extension could not make sense of its input.
    #[error("invalid extension input: {0}")]
    Invalid(String),
}

/// One use of an extension tag.
#[derive(Debug)]
pub struct ExtensionCall {
    /// The lowercased tag name.
    pub name: String,
    /// The tag attributes, with whitespace normalised and entities decoded.
    pub attrs: IndexMap<String, String>,
    /// The raw source between the start and end tags, or `None` if the tag
    /// was self-closed.
    pub body: Option<String>,
    /// The parse environment.
    pub env: Rc<Env>,
    /// The frame the tag appeared in.
    pub frame: Rc<Frame>,
    /// The options of the calling pipeline.
    pub options: Options,
    /// The source range of the body, if known.
    pub src_offsets: Option<Span>,
}

impl ExtensionCall {
    /// Processes `text` as wikitext in the calling frame, returning expanded
    /// tokens without the end-of-input token.
    ///
    /// If `text` is the unmodified body, pass `src_offsets` so that the
    /// output has correct source ranges.
    pub async fn process_wikitext(
        &self,
        text: &str,
        src_offsets: Option<Span>,
    ) -> Result<Vec<Token>, ExtensionError> {
        let options = Options {
            ext_tag: Some(self.name.clone()),
            attr_expansion: false,
            ..self.options.clone()
        };
        let mut tokens = self
            .env
            .process_content(
                &self.frame,
                Input::Wikitext(text.to_string()),
                PipelineType::ExpandedTokens,
                options,
                true,
                src_offsets,
            )
            .await?;
        crate::tokens::utils::strip_eof(&mut tokens);
        Ok(tokens)
    }
}

/// Expands extension tags using the implementations registered in the site
/// configuration.
///
/// Output is cached for the rest of the parse, keyed by the extension
/// source, and encapsulated like a transclusion unless it is part of one.
#[derive(Default)]
pub struct ExtensionHandler;

impl TokenHandler for ExtensionHandler {
    fn name(&self) -> &'static str {
        "ExtensionHandler"
    }

    fn reset_state(&mut self, _options: &Options) {}

    fn on_tag(&mut self, ctx: &Ctx<'_>, token: Token) -> Result<Transform> {
        let Token::SelfClosing(tag) = token else {
            return Ok(Transform::Unchanged(token));
        };
        if tag.name != "extension" {
            return Ok(Transform::Unchanged(Token::SelfClosing(tag)));
        }

        let data_mw = tag.data_mw.as_deref().cloned().unwrap_or_default();
        let name = data_mw.name.clone().unwrap_or_default();
        let src = tag.dp.src.clone().unwrap_or_default();
        let Some(ext) = ctx.env.config().extension_tag(&name) else {
            log::warn!("no implementation for extension tag '{name}'");
            return Ok(Transform::Replace(vec![Token::Text(src)]));
        };

        let attrs = normalize_attrs(&tag);
        let encap = Encap {
            about: (!ctx.options.in_template).then(|| ctx.env.new_about_id()),
            tag,
            name: name.clone(),
            attrs: attrs.clone(),
        };

        if let Some(tokens) = ctx.env.cached_extension(&src) {
            log::trace!("extension cache hit for {name}");
            return Ok(Transform::Replace(encap.wrap(tokens, None)));
        }

        let src_offsets = match (encap.tag.dp.tsr, encap.tag.dp.tag_widths) {
            (Some(tsr), Some((start, end))) if data_mw.body.is_some() => {
                Some(Span::new(tsr.start + start, tsr.end - end))
            }
            _ => None,
        };
        let call = ExtensionCall {
            name,
            attrs,
            body: data_mw.body.map(|body| body.extsrc),
            env: Rc::clone(ctx.env),
            frame: Rc::clone(ctx.frame),
            options: ctx.options.clone(),
            src_offsets,
        };
        let env = Rc::clone(ctx.env);
        Ok(Transform::Pending(
            async move {
                match ext.source_to_tokens(call).await {
                    Ok(tokens) => {
                        env.cache_extension(&src, &tokens);
                        Ok(encap.wrap(tokens, None))
                    }
                    Err(ExtensionError::Pipeline(err)) if err.is_payload_too_large() => Err(err),
                    Err(err) => {
                        log::error!("error parsing extension tag {}: {err}", encap.name);
                        let error = MwError {
                            key: "mw-api-extparse-error".into(),
                            message: "Could not parse extension source.".into(),
                            params: vec![],
                        };
                        let tokens = vec![
                            Tag::new("span").start(),
                            Token::Text(src),
                            Tag::new("span").end(),
                        ];
                        Ok(encap.wrap(tokens, Some(error)))
                    }
                }
            }
            .boxed_local(),
        ))
    }
}

/// Extension output encapsulation.
struct Encap {
    /// The shared about id, if the output is encapsulated.
    about: Option<String>,
    /// The extension token.
    tag: Tag,
    /// The lowercased tag name.
    name: String,
    /// The normalised attributes.
    attrs: IndexMap<String, String>,
}

impl Encap {
    /// Wraps the output of the extension. `nowiki` is never wrapped, since
    /// it marks up its own output.
    fn wrap(&self, tokens: Vec<Token>, error: Option<MwError>) -> Vec<Token> {
        let Some(about) = &self.about else {
            return tokens;
        };
        if self.name == "nowiki" && error.is_none() {
            return tokens;
        }
        if tokens.is_empty() && error.is_none() {
            log::debug!("extension {} expanded to nothing", self.name);
        }

        let ty = format!("mw:Extension/{}", self.name);
        let mut start = Token::meta(if error.is_some() {
            format!("mw:Error {ty}")
        } else {
            ty.clone()
        })
        .with_attr("about", about.as_str())
        .with_dp(DataParsoid {
            tsr: self.tag.dp.tsr,
            src: self.tag.dp.src.clone(),
            tag_widths: self.tag.dp.tag_widths,
            ..Default::default()
        });
        start.dp.tmp.is_html_ext = self.name == "html";
        let body = self.tag.data_mw.as_ref().and_then(|data_mw| data_mw.body.clone());
        start.data_mw = Some(Box::new(DataMw {
            name: Some(self.name.clone()),
            attrs: Some(self.attrs.clone()),
            body,
            errors: error.into_iter().collect(),
            ..Default::default()
        }));

        let end = Token::meta(format!("{ty}/End"))
            .with_attr("about", about.as_str())
            .with_tsr(self.tag.dp.tsr.map(|tsr| Span::at(tsr.end)));

        let mut out = Vec::with_capacity(tokens.len() + 2);
        out.push(start.self_closing());
        out.extend(tokens);
        out.push(end.self_closing());
        out
    }
}

/// Converts extension tag attributes to plain text. Extension attributes are
/// never wikitext, so the source is used when there is one, with whitespace
/// collapsed and entities decoded.
fn normalize_attrs(tag: &Tag) -> IndexMap<String, String> {
    let mut attrs = IndexMap::new();
    for kv in &tag.attribs {
        let key = kv.k.to_text().trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = match &kv.vsrc {
            Some(vsrc) => vsrc.clone(),
            None => match kv.v.as_str() {
                Some(value) => value.to_string(),
                None => tokens_to_string(kv.v.tokens()),
            },
        };
        let value = value.split_ascii_whitespace().collect::<Vec<_>>().join(" ");
        attrs.insert(key, html_escape::decode_html_entities(&value).into_owned());
    }
    attrs
}
