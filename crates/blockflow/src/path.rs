//! Binding path grammar.
//!
//! A path is a `.`-separated list of segments:
//!
//! - `##` enclosing flow, `###` outermost flow, `#parent` parent block
//! - `~name` helper property, `^name` context property (first segment only)
//! - anything else names a property on the block reached so far

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use chumsky::prelude::*;
use smallvec::SmallVec;

use crate::error::{FlowError, Result};
use crate::property::{FLOW, PARENT, ROOT_FLOW};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Flow,
    RootFlow,
    Parent,
    /// Property name including the `~`.
    Helper(Arc<str>),
    /// Property name including the `^`.
    Context(Arc<str>),
    Name(Arc<str>),
}

impl Segment {
    /// Name of the property this segment reads, for segments that read one.
    pub fn property_name(&self) -> Option<&Arc<str>> {
        match self {
            Segment::Helper(name) | Segment::Context(name) | Segment::Name(name) => Some(name),
            Segment::Flow | Segment::RootFlow | Segment::Parent => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.property_name().is_none()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Flow => f.write_str(FLOW),
            Segment::RootFlow => f.write_str(ROOT_FLOW),
            Segment::Parent => f.write_str(PARENT),
            Segment::Helper(name) | Segment::Context(name) | Segment::Name(name) => {
                f.write_str(name)
            }
        }
    }
}

/// A parsed binding path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    source: Arc<str>,
    segments: SmallVec<[Segment; 4]>,
}

type Spanned<'src> = (&'src str, Range<usize>);

fn segments<'src>() -> impl Parser<'src, &'src str, Vec<Spanned<'src>>, extra::Err<Rich<'src, char>>>
{
    none_of('.')
        .repeated()
        .to_slice()
        .map_with(|segment: &'src str, e| {
            let span: SimpleSpan = e.span();
            (segment, span.into_range())
        })
        .separated_by(just('.'))
        .collect::<Vec<_>>()
        .then_ignore(end())
}

impl Path {
    pub fn parse(source: &str) -> Result<Self> {
        if source.is_empty() {
            return Err(FlowError::invalid_path(source, "empty path", 0..0));
        }
        let raw = segments().parse(source).into_result().map_err(|errors| {
            let (reason, span) = errors
                .first()
                .map(|error| (error.to_string(), error.span().into_range()))
                .unwrap_or_else(|| ("unparsable path".to_string(), 0..source.len()));
            FlowError::invalid_path(source, reason, span)
        })?;

        let mut parsed = SmallVec::new();
        for (index, (text, span)) in raw.into_iter().enumerate() {
            let segment = match text {
                "" => return Err(FlowError::invalid_path(source, "empty segment", span)),
                FLOW => Segment::Flow,
                ROOT_FLOW => Segment::RootFlow,
                PARENT => Segment::Parent,
                "~" | "^" => {
                    return Err(FlowError::invalid_path(source, "missing name after prefix", span));
                }
                _ if text.starts_with('^') => {
                    if index != 0 {
                        return Err(FlowError::invalid_path(
                            source,
                            "context segment must come first",
                            span,
                        ));
                    }
                    Segment::Context(Arc::from(text))
                }
                _ if text.starts_with('~') => Segment::Helper(Arc::from(text)),
                _ => Segment::Name(Arc::from(text)),
            };
            parsed.push(segment);
        }
        Ok(Self {
            source: Arc::from(source),
            segments: parsed,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub(crate) fn source(&self) -> &Arc<str> {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether this is the default helper binding `~name.#output` for `name`.
    pub fn is_helper_output_of(&self, name: &str) -> bool {
        match self.segments.as_slice() {
            [Segment::Helper(helper), Segment::Name(output)] => {
                helper.strip_prefix('~') == Some(name) && &**output == crate::property::OUTPUT
            }
            _ => false,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
