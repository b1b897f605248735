//! Transclusion frames.

use super::{Env, Input, Options, PipelineType, Result};
use crate::{
    title::Title,
    tokens::{Kv, Token, utils::token_trim},
};
use std::rc::Rc;

/// A frame construction error.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// Expanding the title would exceed the maximum expansion depth.
    #[error("Template recursion depth limit exceeded ({0}): ")]
    Depth(usize),

    /// The title is already being expanded by an ancestor frame.
    ///
    /// Loops back to the root page are allowed, because a template may be
    /// demonstrated on its own page.
    #[error("Template loop detected: ")]
    Loop,
}

/// A template transclusion frame.
#[derive(Debug)]
pub struct Frame {
    /// The title of the page (or template) rendered by this frame.
    title: Title,
    /// The arguments passed in from the parent, unexpanded.
    args: Vec<Kv>,
    /// The parent frame.
    parent: Option<Rc<Frame>>,
    /// The number of ancestors.
    depth: usize,
    /// The source of the frame.
    src: Rc<str>,
}

impl Frame {
    /// Creates the root frame of a parse.
    pub fn new_root(title: Title, src: impl Into<Rc<str>>) -> Rc<Self> {
        Rc::new(Self {
            title,
            args: Vec::new(),
            parent: None,
            depth: 0,
            src: src.into(),
        })
    }

    /// Creates a child frame for the given title and arguments, if doing so
    /// would not cause a loop or exceed `max_depth`.
    ///
    /// `args` are the template arguments, without the target.
    pub fn new_child(
        self: &Rc<Self>,
        title: Title,
        args: Vec<Kv>,
        src: impl Into<Rc<str>>,
        max_depth: usize,
    ) -> Result<Rc<Self>, FrameError> {
        self.check(&title, max_depth, false)?;
        Ok(Rc::new(Self {
            title,
            args,
            parent: Some(Rc::clone(self)),
            depth: self.depth + 1,
            src: src.into(),
        }))
    }

    /// Checks whether expanding `title` from this frame would exceed
    /// `max_depth` or loop back to a template which is already being expanded.
    pub fn check(&self, title: &Title, max_depth: usize, ignore_loop: bool) -> Result<(), FrameError> {
        if self.depth >= max_depth {
            log::warn!("depth limit {max_depth} reached expanding '{title}'");
            return Err(FrameError::Depth(max_depth));
        }

        if !ignore_loop {
            let mut frame = Some(self);
            while let Some(current) = frame {
                // In MW, only template calls participate in loop checking so
                // it is OK to loop back to the root frame
                if current.parent.is_some() && current.title.key() == title.key() {
                    log::warn!("loop detected expanding '{title}'");
                    self.backtrace();
                    return Err(FrameError::Loop);
                }
                frame = current.parent.as_deref();
            }
        }

        Ok(())
    }

    /// The title of the frame.
    #[inline]
    pub fn title(&self) -> &Title {
        &self.title
    }

    /// The unexpanded arguments of the frame.
    #[inline]
    pub fn args(&self) -> &[Kv] {
        &self.args
    }

    /// The parent frame.
    #[inline]
    pub fn parent(&self) -> Option<&Rc<Frame>> {
        self.parent.as_ref()
    }

    /// The number of ancestors of this frame.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The source of the frame.
    #[inline]
    pub fn src(&self) -> &Rc<str> {
        &self.src
    }

    /// Finds the argument with the given name.
    ///
    /// Positional arguments are numbered from 1. Named argument keys are
    /// compared after trimming, and later duplicates win. The returned value
    /// is unexpanded; named values are trimmed, positional values are not.
    pub fn arg(&self, name: &str) -> Option<Vec<Token>> {
        let mut position = 0;
        let mut found = None;
        for kv in &self.args {
            let key = kv.k.to_text();
            let key = key.trim();
            let positional = kv.k.is_empty()
                && kv
                    .src_offsets
                    .is_none_or(|offsets| offsets.key.end == offsets.value.start);
            if positional {
                position += 1;
                if position.to_string() == name {
                    found = Some(kv.v.clone().into_tokens());
                }
            } else if key == name {
                found = Some(token_trim(kv.v.clone().into_tokens()));
            }
        }
        found
    }

    /// Expands the named argument in the parent frame.
    ///
    /// The result is `None` if the argument does not exist.
    pub async fn expand_arg(
        self: &Rc<Self>,
        env: &Rc<Env>,
        name: &str,
        options: &Options,
    ) -> Result<Option<Vec<Token>>> {
        let Some(value) = self.arg(name) else {
            return Ok(None);
        };
        let Some(parent) = &self.parent else {
            return Ok(Some(value));
        };

        let options = Options {
            in_template: true,
            is_include: parent.depth > 0,
            attr_expansion: false,
            ..options.clone()
        };
        let tokens = env
            .process_content(
                parent,
                Input::Tokens(value),
                PipelineType::TokensToExpanded,
                options,
                false,
                None,
            )
            .await?;
        Ok(Some(tokens))
    }

    /// Emits a backtrace of the frame chain to the debug log.
    fn backtrace(&self) {
        let mut index = 0;
        let mut frame = Some(self);
        while let Some(current) = frame {
            log::debug!("{index:>2}. {}", current.title);
            frame = current.parent.as_deref();
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SiteConfig,
        title::NS_TEMPLATE,
        tokens::{KvOffsets, Span},
    };

    fn title(config: &SiteConfig, name: &str) -> Title {
        Title::new(name, NS_TEMPLATE, config).unwrap()
    }

    #[test]
    fn loop_and_depth() {
        let config = SiteConfig::default();
        let root = Frame::new_root(Title::new("Main Page", 0, &config).unwrap(), "");
        let a = root.new_child(title(&config, "A"), vec![], "", 3).unwrap();
        let b = a.new_child(title(&config, "B"), vec![], "", 3).unwrap();
        assert_eq!(b.depth(), 2);
        assert_eq!(
            b.new_child(title(&config, "a"), vec![], "", 3).unwrap_err(),
            FrameError::Loop
        );
        assert!(b.check(&title(&config, "A"), 3, true).is_ok());
        // Looping back to the root page is allowed
        assert!(b.check(&Title::new("Main Page", 0, &config).unwrap(), 3, false).is_ok());
        let c = b.new_child(title(&config, "C"), vec![], "", 3).unwrap();
        assert_eq!(
            c.new_child(title(&config, "D"), vec![], "", 3).unwrap_err(),
            FrameError::Depth(3)
        );
    }

    #[test]
    fn argument_lookup() {
        let config = SiteConfig::default();
        let root = Frame::new_root(Title::new("Main Page", 0, &config).unwrap(), "");
        let positional = |value: &str, at: usize| {
            Kv::new("", value).with_offsets(Some(KvOffsets {
                key: Span::at(at),
                value: Span::new(at, at + value.len()),
            }))
        };
        let args = vec![
            positional(" a ", 6),
            Kv::new(" x ", " 1 "),
            positional("b", 20),
            Kv::new("x", vec![Token::from(" 2"), Token::newline(None)]),
            Kv::new("2", "c"),
        ];
        let frame = root.new_child(title(&config, "T"), args, "", 40).unwrap();
        assert_eq!(frame.arg("1"), Some(vec![" a ".into()]));
        assert_eq!(frame.arg("x"), Some(vec!["2".into()]));
        assert_eq!(frame.arg("2"), Some(vec!["c".into()]));
        assert_eq!(frame.arg("3"), None);
    }
}
