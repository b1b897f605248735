//! Wrapping of transclusion output in `meta` markers with editing metadata.

use crate::{
    pipeline::{Env, Frame},
    tokens::{
        DataMw, DataParsoid, KvValue, Param, ParamInfo, ParamKey, Part, Span, Tag, TemplateInfo,
        Token, utils::tokens_to_string_strict,
    },
};
use indexmap::IndexMap;
use std::{borrow::Cow, rc::Rc};

/// Encapsulates the output of one template, parser function, or template
/// argument.
///
/// The output is wrapped in a start and end marker which share an about id.
/// The start marker carries the source of the whole construct and a
/// `data-mw` description of its target and parameters.
pub(super) struct Encapsulator {
    /// The frame the construct appeared in.
    frame: Rc<Frame>,
    /// The template or template argument token.
    token: Tag,
    /// The marker type, e.g. `mw:Transclusion`.
    wrapper_type: &'static str,
    /// The shared about id.
    about: String,
    /// The link to the resolved template page.
    pub resolved_target: Option<String>,
    /// The canonical name of the parser function or variable.
    pub function: Option<String>,
}

impl Encapsulator {
    pub fn new(env: &Env, frame: &Rc<Frame>, token: Tag, wrapper_type: &'static str) -> Self {
        Self {
            frame: Rc::clone(frame),
            token,
            wrapper_type,
            about: env.new_about_id(),
            resolved_target: None,
            function: None,
        }
    }

    /// The template or template argument token.
    #[inline]
    pub fn token(&self) -> &Tag {
        &self.token
    }

    /// Wraps `tokens` in encapsulation markers.
    pub fn encap_tokens(&self, tokens: Vec<Token>) -> Vec<Token> {
        let tsr = self.token.dp.tsr;
        let (info, pi) = self.template_info();
        let part = if self.wrapper_type == "mw:Param" {
            Part::TemplateArg { templatearg: info }
        } else {
            Part::Template { template: info }
        };

        let mut start = Token::meta(self.wrapper_type)
            .with_attr("about", self.about.as_str())
            .with_dp(DataParsoid {
                tsr,
                src: self.token.dp.src.clone(),
                pi: Some(pi),
                ..Default::default()
            });
        start.dp.tmp.tpl_src_offsets = tsr;
        start.data_mw = Some(Box::new(DataMw {
            parts: vec![part],
            ..Default::default()
        }));

        let end = Token::meta(format!("{}/End", self.wrapper_type))
            .with_attr("about", self.about.as_str())
            .with_tsr(tsr.map(|tsr| Span::at(tsr.end)));

        let mut out = Vec::with_capacity(tokens.len() + 2);
        out.push(start.self_closing());
        out.extend(tokens);
        out.push(end.self_closing());
        log::debug!("encapsulated {} as {}", self.wrapper_type, self.about);
        out
    }

    /// Builds the public target and parameter description, plus the spacing
    /// information needed to reproduce the source.
    fn template_info(&self) -> (TemplateInfo, Vec<ParamInfo>) {
        let mut info = TemplateInfo::default();
        if let Some(target) = self.token.attribs.first() {
            info.target.wt = self
                .slice(target.src_offsets.map(|offsets| offsets.key))
                .map_or_else(|| target.k.to_text().into_owned(), ToString::to_string);
        }

        let pi = if let Some(function) = &self.function {
            info.target.function = Some(function.clone());
            self.function_params(&mut info)
        } else {
            info.target.href.clone_from(&self.resolved_target);
            self.template_params(&mut info.params)
        };
        (info, pi)
    }

    /// Parameters of a parser function are always numbered. The text after
    /// the colon in the target is the first one.
    fn function_params(&self, info: &mut TemplateInfo) -> Vec<ParamInfo> {
        let mut infos = Vec::new();
        let mut index = 1;
        let mut add = |info: &mut TemplateInfo, wt: String| {
            let k = index.to_string();
            index += 1;
            info.params.insert(
                k.clone(),
                Param {
                    wt,
                    ..Default::default()
                },
            );
            infos.push(ParamInfo {
                k,
                ..Default::default()
            });
        };

        if let Some((name, arg)) = info.target.wt.split_once(':') {
            let arg = arg.to_string();
            info.target.wt = name.to_string();
            add(info, arg);
        }

        for param in self.token.attribs.iter().skip(1) {
            let wt = self
                .slice(param.src_offsets.map(|offsets| offsets.span()))
                .map_or_else(
                    || {
                        if param.k.is_empty() {
                            param.v.to_text().into_owned()
                        } else {
                            format!("{}={}", param.k.to_text(), param.v.to_text())
                        }
                    },
                    ToString::to_string,
                );
            add(info, wt);
        }
        infos
    }

    /// Template parameters keep their names. Unnamed parameters are
    /// numbered, and spacing which differs from the default is recorded.
    fn template_params(&self, params: &mut IndexMap<String, Param>) -> Vec<ParamInfo> {
        let mut infos = Vec::new();
        let mut index = 1;
        for param in self.token.attribs.iter().skip(1) {
            let (k_src, v_src) = match param.src_offsets {
                Some(offsets) => (
                    Cow::Borrowed(self.slice(Some(offsets.key)).unwrap_or_default()),
                    Cow::Borrowed(self.slice(Some(offsets.value)).unwrap_or_default()),
                ),
                None => (param.k.to_text(), param.v.to_text()),
            };

            let k_wt = k_src.trim();
            let mut k = match &param.k {
                KvValue::Str(k) => k.trim().to_string(),
                KvValue::Tokens(tokens) => match tokens_to_string_strict(tokens) {
                    (k, None) => k.trim().to_string(),
                    // Names with markup other than comments keep their source
                    _ => k_wt.to_string(),
                },
            };

            let positional = k.is_empty()
                && param
                    .src_offsets
                    .is_some_and(|offsets| offsets.key.end == offsets.value.start);

            let key_space = split_space(&k_src);
            let (v, value_space) = if positional {
                k = index.to_string();
                index += 1;
                (v_src.to_string(), ("", ""))
            } else {
                let v = v_src.trim();
                let space = if v.is_empty() {
                    ("", &*v_src)
                } else {
                    split_space(&v_src)
                };
                (v.to_string(), space)
            };

            let spc = [key_space.0, key_space.1, value_space.0, value_space.1];
            let spc = spc
                .iter()
                .any(|space| !space.is_empty())
                .then(|| spc.map(ToString::to_string));

            let key = (!positional && k_wt != k).then(|| ParamKey {
                wt: k_wt.to_string(),
            });
            params.insert(
                k.clone(),
                Param {
                    key,
                    wt: v,
                    html: None,
                },
            );
            infos.push(ParamInfo {
                k,
                named: !positional,
                spc,
            });
        }
        infos
    }

    /// Returns the frame source in the given range.
    fn slice(&self, span: Option<Span>) -> Option<&str> {
        span.and_then(|span| span.slice(self.frame.src()))
    }
}

/// Splits the leading and trailing whitespace off `text`. Text which is all
/// whitespace is all leading.
fn split_space(text: &str) -> (&str, &str) {
    let trimmed = text.trim_start();
    let lead = &text[..text.len() - trimmed.len()];
    let trail = &trimmed[trimmed.trim_end().len()..];
    (lead, trail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::testing::{env_with, tokenize},
        tokens::DataMw,
    };

    fn encapsulate(src: &str, function: Option<&str>) -> Vec<Token> {
        let env = env_with(&[]);
        let frame = Frame::new_root(env.page().clone(), src);
        let token = tokenize(&env, src)
            .into_iter()
            .find_map(|token| match token {
                Token::SelfClosing(tag) if tag.name == "template" || tag.name == "templatearg" => {
                    Some(tag)
                }
                _ => None,
            })
            .unwrap();
        let ty = if token.name == "templatearg" {
            "mw:Param"
        } else {
            "mw:Transclusion"
        };
        let mut encap = Encapsulator::new(&env, &frame, token, ty);
        encap.function = function.map(ToString::to_string);
        if ty == "mw:Transclusion" && function.is_none() {
            encap.resolved_target = Some("./Template:Echo".into());
        }
        encap.encap_tokens(vec!["x".into()])
    }

    fn data_mw(tokens: &[Token]) -> &DataMw {
        tokens[0].tag().unwrap().data_mw.as_deref().unwrap()
    }

    #[test]
    fn split_spacing() {
        assert_eq!(split_space(" a b  "), (" ", "  "));
        assert_eq!(split_space("   "), ("   ", ""));
        assert_eq!(split_space("a"), ("", ""));
    }

    #[test]
    fn markers() {
        let tokens = encapsulate("{{echo|a}}", None);
        assert_eq!(tokens.len(), 3);
        let start = tokens[0].tag().unwrap();
        let end = tokens[2].tag().unwrap();
        assert!(start.has_typeof("mw:Transclusion"));
        assert!(end.has_typeof("mw:Transclusion/End"));
        assert_eq!(start.attr_str("about"), Some("#mwt1"));
        assert_eq!(end.attr_str("about"), Some("#mwt1"));
        assert_eq!(start.dp.tsr, Some(Span::new(0, 10)));
        assert_eq!(start.dp.src.as_deref(), Some("{{echo|a}}"));
        assert_eq!(end.dp.tsr, Some(Span::at(10)));
    }

    #[test]
    fn template_params() {
        let tokens = encapsulate("{{echo| a |b= c |  d=e|=f}}", None);
        let json = serde_json::to_string(data_mw(&tokens)).unwrap();
        assert_eq!(
            json,
            r#"{"parts":[{"template":{"target":{"wt":"echo","href":"./Template:Echo"},"params":{"1":{"wt":" a "},"b":{"wt":"c"},"d":{"wt":"e"},"":{"wt":"f"}},"i":0}}]}"#
        );

        let pi = tokens[0].tag().unwrap().dp.pi.clone().unwrap();
        assert_eq!(pi.len(), 4);
        assert_eq!(pi[0].k, "1");
        assert!(!pi[0].named);
        assert_eq!(pi[0].spc, None);
        assert_eq!(pi[1].k, "b");
        assert!(pi[1].named);
        assert_eq!(
            pi[1].spc,
            Some(["".into(), "".into(), " ".into(), " ".into()])
        );
        assert_eq!(
            pi[2].spc,
            Some(["  ".into(), "".into(), "".into(), "".into()])
        );
        assert!(pi[3].named);
        assert_eq!(pi[3].k, "");
    }

    #[test]
    fn parser_function_params() {
        let tokens = encapsulate("{{#if: x |a|b=c}}", Some("if"));
        let json = serde_json::to_string(data_mw(&tokens)).unwrap();
        assert_eq!(
            json,
            r##"{"parts":[{"template":{"target":{"wt":"#if","function":"if"},"params":{"1":{"wt":" x "},"2":{"wt":"a"},"3":{"wt":"b=c"}},"i":0}}]}"##
        );
    }

    #[test]
    fn template_argument() {
        let tokens = encapsulate("{{{1|d}}}", None);
        let start = tokens[0].tag().unwrap();
        assert!(start.has_typeof("mw:Param"));
        let json = serde_json::to_string(data_mw(&tokens)).unwrap();
        assert_eq!(
            json,
            r#"{"parts":[{"templatearg":{"target":{"wt":"1"},"params":{"1":{"wt":"d"}},"i":0}}]}"#
        );
    }
}
