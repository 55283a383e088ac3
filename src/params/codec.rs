//! Typed access to the fields of one dictionary file.
//!
//! Updates are splices: only the byte span of the changed literal is
//! replaced, so everything else in the file is preserved byte for byte.

use crate::error::CodecError;
use crate::model::{FieldMap, ParamValue};
use crate::params::dictionary::{
    self, Body, Dictionary, Entry, IncludeLine, Item, Span, Token, TokenKind,
};
use crate::params::schema::{Axis, DictKind, FieldKind, FieldSpec, Locator, LENGTH_UNITS};
use std::cmp::Reverse;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumberStyle {
    Plain,
    Scientific,
}

impl NumberStyle {
    fn of(text: &str) -> Self {
        if text.contains(['e', 'E']) {
            NumberStyle::Scientific
        } else {
            NumberStyle::Plain
        }
    }

    fn format(self, v: f64) -> String {
        match self {
            NumberStyle::Plain => format!("{v}"),
            NumberStyle::Scientific => format!("{v:e}"),
        }
    }
}

struct Literal {
    span: Span,
    value: ParamValue,
    style: NumberStyle,
}

#[derive(Clone, Copy)]
struct Component {
    value: f64,
    span: Span,
    style: NumberStyle,
}

type Edit = (Span, String);

/// Reads and writes the fields of one [`DictKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCodec {
    kind: DictKind,
}

impl ParameterCodec {
    pub fn new(kind: DictKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DictKind {
        self.kind
    }

    pub fn field(&self, name: &str) -> Option<FieldSpec> {
        self.kind.resolve(name)
    }

    /// Extract every known field present in `text`.
    ///
    /// Fields absent from the file are simply omitted. When a keyword occurs
    /// more than once at the same path, the last occurrence wins, as it does
    /// for OpenFOAM itself.
    pub fn parse(&self, text: &str) -> Result<FieldMap, CodecError> {
        let mut fields = FieldMap::new();
        if let DictKind::OcvSelection(_) = self.kind {
            for spec in self.kind.fields() {
                if let Some(value) = active_include(text, &spec)? {
                    fields.insert(spec.name, value);
                }
            }
            return Ok(fields);
        }
        let dict = Dictionary::parse(text)?;
        for spec in self.kind.discover(&dict) {
            if let Some(value) = read_field(&dict, &spec)? {
                fields.insert(spec.name, value);
            }
        }
        Ok(fields)
    }

    /// Return `text` with the literal of `field` replaced by `value`.
    ///
    /// Writing the value a field already has returns `text` unchanged.
    pub fn update(&self, text: &str, field: &str, value: &ParamValue) -> Result<String, CodecError> {
        let spec = self.resolve(field)?;
        let value = coerce(&spec, value)?;
        let edits = if spec.locator == Locator::ActiveInclude {
            select_include(text, &spec, &value)?
        } else {
            dictionary_edits(&Dictionary::parse(text)?, &spec, &value)?
        };
        debug!(field, edits = edits.len(), "applying dictionary edits");
        Ok(apply_edits(text, edits))
    }

    /// Add a field that is not yet present.
    ///
    /// The entry is appended inside its parent block (or at the end of the
    /// file for top-level keywords), using the indentation of its siblings.
    pub fn insert(&self, text: &str, field: &str, value: &ParamValue) -> Result<String, CodecError> {
        let spec = self.resolve(field)?;
        let value = coerce(&spec, value)?;
        let Locator::Entry(path) = &spec.locator else {
            return Err(CodecError::NotInsertable { field: spec.name });
        };
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        let Some((key, parents)) = path.split_last() else {
            return Err(CodecError::NotInsertable { field: spec.name });
        };
        let dict = Dictionary::parse(text)?;
        if !dict.find_path(&path).is_empty() {
            return Err(CodecError::FieldExists { field: spec.name });
        }

        let literal = match &value {
            ParamValue::Scalar(v) => format!("{v:.5e}"),
            ParamValue::Integer(v) => v.to_string(),
            ParamValue::Word(w) => w.clone(),
        };
        let line = match spec.dimensions {
            Some(dims) => format!("{key:<15} {dims} {literal};"),
            None => format!("{key:<15} {literal};"),
        };

        if parents.is_empty() {
            let mut out = text.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&line);
            out.push('\n');
            return Ok(out);
        }

        let parent = unique(dict.find_path(parents), &parents.join("."))?;
        let Body::Dict { entries, close } = &parent.body else {
            return Err(CodecError::Parse {
                line: dict.line_of(parent.keyword_span.start),
                message: format!("`{}` is not a block", parent.keyword),
            });
        };
        let line_start = text[..close.start].rfind('\n').map_or(0, |i| i + 1);
        let before_brace = &text[line_start..close.start];
        let mut out = text.to_string();
        if before_brace.chars().all(char::is_whitespace) {
            let indent = entries
                .last()
                .map(|e| indentation(text, e.span.start))
                .unwrap_or_else(|| format!("{before_brace}    "));
            out.insert_str(line_start, &format!("{indent}{line}\n"));
        } else {
            out.insert_str(close.start, &format!(" {line} "));
        }
        Ok(out)
    }

    fn resolve(&self, field: &str) -> Result<FieldSpec, CodecError> {
        self.kind
            .resolve(field)
            .ok_or_else(|| CodecError::FieldNotFound {
                field: field.to_string(),
            })
    }
}

fn dictionary_edits(
    dict: &Dictionary<'_>,
    spec: &FieldSpec,
    value: &ParamValue,
) -> Result<Vec<Edit>, CodecError> {
    match &spec.locator {
        Locator::Entry(path) => {
            let path: Vec<&str> = path.iter().map(String::as_str).collect();
            let entry = unique(dict.find_path(&path), &spec.name)?;
            replace_literal(dict, entry, spec, value)
        }
        Locator::Anywhere(keyword) => {
            let entry = unique(dict.find_anywhere(keyword), &spec.name)?;
            replace_literal(dict, entry, spec, value)
        }
        Locator::Extent(axis) => update_extent(dict, spec, *axis, value),
        Locator::Division(axis) => update_division(dict, spec, *axis, value),
        Locator::LengthUnit => update_length_unit(dict, spec, value),
        Locator::ActiveInclude => select_include(dict.src, spec, value),
    }
}

fn parse_error(dict: &Dictionary<'_>, offset: usize, message: impl Into<String>) -> CodecError {
    CodecError::Parse {
        line: dict.line_of(offset),
        message: message.into(),
    }
}

fn unique<'d>(mut found: Vec<&'d Entry>, field: &str) -> Result<&'d Entry, CodecError> {
    match found.len() {
        0 => Err(CodecError::FieldNotFound {
            field: field.to_string(),
        }),
        1 => Ok(found.remove(0)),
        occurrences => Err(CodecError::AmbiguousField {
            field: field.to_string(),
            occurrences,
        }),
    }
}

fn normalize_words(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn coerce(spec: &FieldSpec, value: &ParamValue) -> Result<ParamValue, CodecError> {
    let mismatch = |expected| CodecError::TypeMismatch {
        field: spec.name.clone(),
        expected,
    };
    match (spec.kind, value) {
        (FieldKind::Scalar, ParamValue::Scalar(v)) if !v.is_finite() => {
            Err(mismatch("a finite number"))
        }
        (FieldKind::Scalar, ParamValue::Scalar(v)) => Ok(ParamValue::Scalar(*v)),
        (FieldKind::Scalar, ParamValue::Integer(v)) => Ok(ParamValue::Scalar(*v as f64)),
        (FieldKind::Integer, ParamValue::Integer(v)) => Ok(ParamValue::Integer(*v)),
        (FieldKind::Choice(_), ParamValue::Word(w)) => Ok(ParamValue::Word(normalize_words(w))),
        (kind, _) => Err(mismatch(kind.describe())),
    }
}

fn number_literal<'a>(dict: &Dictionary<'a>, entry: &Entry) -> Result<(Span, &'a str), CodecError> {
    let Some(items) = entry.items() else {
        return Err(parse_error(
            dict,
            entry.keyword_span.start,
            format!("`{}` is a block, expected a value", entry.keyword),
        ));
    };
    match items.last() {
        Some(Item::Token(Token {
            kind: TokenKind::Number,
            span,
        })) => Ok((*span, span.text(dict.src))),
        _ => Err(parse_error(
            dict,
            entry.keyword_span.start,
            format!("expected a number for `{}`", entry.keyword),
        )),
    }
}

/// The literal of a plain `keyword [dims] [uniform] literal;` entry. Any
/// prefix items stay outside the literal's span.
fn read_literal(dict: &Dictionary<'_>, entry: &Entry, spec: &FieldSpec) -> Result<Literal, CodecError> {
    match spec.kind {
        FieldKind::Scalar | FieldKind::Integer => {
            let (span, text) = number_literal(dict, entry)?;
            let value = if spec.kind == FieldKind::Integer {
                text.parse::<i64>().map(ParamValue::Integer).map_err(|_| {
                    parse_error(
                        dict,
                        span.start,
                        format!("expected an integer for `{}`", entry.keyword),
                    )
                })?
            } else {
                ParamValue::Scalar(text.parse().map_err(|_| {
                    parse_error(dict, span.start, format!("invalid number `{text}`"))
                })?)
            };
            Ok(Literal {
                span,
                value,
                style: NumberStyle::of(text),
            })
        }
        FieldKind::Choice(_) => {
            let items = entry.items().unwrap_or_default();
            let (Some(first), Some(last)) = (items.first(), items.last()) else {
                return Err(parse_error(
                    dict,
                    entry.keyword_span.start,
                    format!("`{}` has no value", entry.keyword),
                ));
            };
            let span = first.span().to(last.span());
            Ok(Literal {
                span,
                value: ParamValue::Word(normalize_words(span.text(dict.src))),
                style: NumberStyle::Plain,
            })
        }
    }
}

fn replace_literal(
    dict: &Dictionary<'_>,
    entry: &Entry,
    spec: &FieldSpec,
    value: &ParamValue,
) -> Result<Vec<Edit>, CodecError> {
    let literal = read_literal(dict, entry, spec)?;
    if literal.value == *value {
        return Ok(Vec::new());
    }
    let text = match value {
        ParamValue::Scalar(v) => literal.style.format(*v),
        ParamValue::Integer(v) => v.to_string(),
        ParamValue::Word(w) => w.clone(),
    };
    Ok(vec![(literal.span, text)])
}

fn read_field(dict: &Dictionary<'_>, spec: &FieldSpec) -> Result<Option<ParamValue>, CodecError> {
    let last = |found: Vec<&Entry>| -> Result<Option<ParamValue>, CodecError> {
        match found.last() {
            Some(entry) => Ok(Some(read_literal(dict, entry, spec)?.value)),
            None => Ok(None),
        }
    };
    match &spec.locator {
        Locator::Entry(path) => {
            let path: Vec<&str> = path.iter().map(String::as_str).collect();
            last(dict.find_path(&path))
        }
        Locator::Anywhere(keyword) => last(dict.find_anywhere(keyword)),
        Locator::Extent(axis) => {
            let Some(entry) = dict.find_path(&["vertices"]).pop() else {
                return Ok(None);
            };
            let vertices = read_vertices(dict, entry)?;
            Ok(bounds(&vertices, *axis).map(|(min, max)| ParamValue::Scalar(max - min)))
        }
        Locator::Division(axis) => {
            let Some(entry) = dict.find_path(&["blocks"]).pop() else {
                return Ok(None);
            };
            let blocks = read_hex_blocks(dict, entry)?;
            let mut counts = blocks.iter().map(|b| b[axis.index()].0);
            let Some(first) = counts.next() else {
                return Ok(None);
            };
            if counts.all(|n| n == first) {
                Ok(Some(ParamValue::Integer(first)))
            } else {
                debug!(field = %spec.name, "hex blocks disagree on cell count, field omitted");
                Ok(None)
            }
        }
        Locator::LengthUnit => {
            let Some(entry) = dict.find_path(&["convertToMeters"]).pop() else {
                return Ok(None);
            };
            let (span, text) = number_literal(dict, entry)?;
            let scale: f64 = text
                .parse()
                .map_err(|_| parse_error(dict, span.start, format!("invalid number `{text}`")))?;
            match LENGTH_UNITS.iter().find(|(_, s)| same_scale(*s, scale)) {
                Some((name, _)) => Ok(Some(ParamValue::Word(name.to_string()))),
                None => {
                    warn!(scale, "convertToMeters is not a known length unit, field omitted");
                    Ok(None)
                }
            }
        }
        Locator::ActiveInclude => active_include(dict.src, spec),
    }
}

/// The `OCV_<model>.H` include lines of the models `spec` chooses from.
fn model_includes(
    text: &str,
    spec: &FieldSpec,
) -> Result<Vec<(&'static str, IncludeLine)>, CodecError> {
    let FieldKind::Choice(models) = spec.kind else {
        return Ok(Vec::new());
    };
    Ok(dictionary::include_lines(text)?
        .into_iter()
        .filter_map(|line| {
            let stem = line.target.strip_prefix("OCV_")?.strip_suffix(".H")?;
            let model = models.iter().find(|m| **m == stem)?;
            Some((*model, line))
        })
        .collect())
}

fn active_include(text: &str, spec: &FieldSpec) -> Result<Option<ParamValue>, CodecError> {
    let active: Vec<&str> = model_includes(text, spec)?
        .into_iter()
        .filter(|(_, line)| line.is_active())
        .map(|(model, _)| model)
        .collect();
    match active.as_slice() {
        [model] => Ok(Some(ParamValue::Word(model.to_string()))),
        [] => {
            debug!(field = %spec.name, "no model include is active");
            Ok(None)
        }
        several => {
            warn!(field = %spec.name, models = ?several, "several model includes are active, field omitted");
            Ok(None)
        }
    }
}

/// Uncomment the include of the chosen model and comment out every other
/// active include of the group.
fn select_include(text: &str, spec: &FieldSpec, value: &ParamValue) -> Result<Vec<Edit>, CodecError> {
    let ParamValue::Word(chosen) = value else {
        return Err(CodecError::TypeMismatch {
            field: spec.name.clone(),
            expected: "a model name",
        });
    };
    let includes = model_includes(text, spec)?;
    let target = format!("OCV_{chosen}.H");
    match includes.iter().filter(|(model, _)| model == chosen).count() {
        0 => return Err(CodecError::FieldNotFound { field: target }),
        1 => {}
        occurrences => {
            return Err(CodecError::AmbiguousField {
                field: target,
                occurrences,
            })
        }
    }
    let mut edits = Vec::new();
    for (model, line) in &includes {
        match line.marker {
            Some(marker) if model == chosen => edits.push((marker, String::new())),
            None if model != chosen => {
                let at = line.directive.start;
                edits.push((Span { start: at, end: at }, "//".to_string()));
            }
            _ => {}
        }
    }
    Ok(edits)
}

fn same_scale(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs())
}

fn read_vertices(dict: &Dictionary<'_>, entry: &Entry) -> Result<Vec<[Component; 3]>, CodecError> {
    let malformed = |offset| parse_error(dict, offset, "expected `vertices ( (x y z) ... );`");
    let Some([Item::List { items: points, .. }]) = entry.items() else {
        return Err(malformed(entry.keyword_span.start));
    };
    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let not_numeric = || {
                parse_error(
                    dict,
                    point.span().start,
                    format!("vertex {i} is not a numeric (x y z) triple"),
                )
            };
            let Item::List { items: xyz, .. } = point else {
                return Err(not_numeric());
            };
            let components = xyz
                .iter()
                .map(|item| {
                    let value = item.as_number(dict.src)?;
                    let span = item.span();
                    Some(Component {
                        value,
                        span,
                        style: NumberStyle::of(span.text(dict.src)),
                    })
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(not_numeric)?;
            <[Component; 3]>::try_from(components).map_err(|_| not_numeric())
        })
        .collect()
}

fn bounds(vertices: &[[Component; 3]], axis: Axis) -> Option<(f64, f64)> {
    if vertices.len() < 2 {
        return None;
    }
    let values = vertices.iter().map(|v| v[axis.index()].value);
    let min = values.clone().fold(f64::INFINITY, f64::min);
    let max = values.fold(f64::NEG_INFINITY, f64::max);
    Some((min, max))
}

/// Rescale the vertex coordinates along `axis` so the block spans
/// `-extent / 2 ..= extent / 2`, centred on the origin like the particle
/// sphere of the region selection. Halving is exact in binary floating
/// point, so the extent read back is the extent written.
fn update_extent(
    dict: &Dictionary<'_>,
    spec: &FieldSpec,
    axis: Axis,
    value: &ParamValue,
) -> Result<Vec<Edit>, CodecError> {
    let target = value.as_f64().unwrap_or(f64::NAN);
    let entry = unique(dict.find_path(&["vertices"]), &spec.name)?;
    let vertices = read_vertices(dict, entry)?;
    let degenerate = |reason: &str| CodecError::Degenerate {
        field: spec.name.clone(),
        reason: reason.to_string(),
    };
    let (min, max) = bounds(&vertices, axis).ok_or_else(|| degenerate("fewer than two vertices"))?;
    let current = max - min;
    if current == target {
        return Ok(Vec::new());
    }
    if current == 0.0 {
        return Err(degenerate("all vertices share the same coordinate on this axis"));
    }
    let half = target / 2.0;
    let scale = target / current;
    let mut edits = Vec::new();
    for vertex in &vertices {
        let c = vertex[axis.index()];
        let moved = if c.value == min {
            -half
        } else if c.value == max {
            half
        } else {
            -half + (c.value - min) * scale
        };
        if moved != c.value {
            edits.push((c.span, c.style.format(moved)));
        }
    }
    Ok(edits)
}

fn read_hex_blocks(dict: &Dictionary<'_>, entry: &Entry) -> Result<Vec<[(i64, Span); 3]>, CodecError> {
    let src = dict.src;
    let Some([Item::List { items: parts, .. }]) = entry.items() else {
        return Err(parse_error(
            dict,
            entry.keyword_span.start,
            "expected `blocks ( hex (...) (nx ny nz) ... );`",
        ));
    };
    let mut blocks = Vec::new();
    let mut parts = parts.iter().peekable();
    while let Some(part) = parts.next() {
        if !part.is_word(src, "hex") {
            continue;
        }
        let hex_at = part.span().start;
        if !matches!(parts.next(), Some(Item::List { .. })) {
            return Err(parse_error(dict, hex_at, "`hex` must be followed by its vertex labels"));
        }
        // optional cell zone name
        if matches!(
            parts.peek(),
            Some(Item::Token(Token {
                kind: TokenKind::Word,
                ..
            }))
        ) {
            parts.next();
        }
        let counts = match parts.next() {
            Some(Item::List { items, .. }) => items
                .iter()
                .map(|item| match item {
                    Item::Token(Token {
                        kind: TokenKind::Number,
                        span,
                    }) => span.text(src).parse::<i64>().ok().map(|n| (n, *span)),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>(),
            _ => None,
        };
        let counts = counts
            .and_then(|c| <[(i64, Span); 3]>::try_from(c).ok())
            .ok_or_else(|| parse_error(dict, hex_at, "hex cell counts must be three integers"))?;
        blocks.push(counts);
    }
    Ok(blocks)
}

fn update_division(
    dict: &Dictionary<'_>,
    spec: &FieldSpec,
    axis: Axis,
    value: &ParamValue,
) -> Result<Vec<Edit>, CodecError> {
    let ParamValue::Integer(target) = value else {
        return Err(CodecError::TypeMismatch {
            field: spec.name.clone(),
            expected: "an integer",
        });
    };
    let entry = unique(dict.find_path(&["blocks"]), &spec.name)?;
    let blocks = read_hex_blocks(dict, entry)?;
    let [block] = blocks.as_slice() else {
        return Err(if blocks.is_empty() {
            CodecError::FieldNotFound {
                field: spec.name.clone(),
            }
        } else {
            CodecError::AmbiguousField {
                field: spec.name.clone(),
                occurrences: blocks.len(),
            }
        });
    };
    let (current, span) = block[axis.index()];
    if current == *target {
        return Ok(Vec::new());
    }
    Ok(vec![(span, target.to_string())])
}

fn update_length_unit(
    dict: &Dictionary<'_>,
    spec: &FieldSpec,
    value: &ParamValue,
) -> Result<Vec<Edit>, CodecError> {
    let scale = match value {
        ParamValue::Word(name) => LENGTH_UNITS
            .iter()
            .find(|(unit, _)| *unit == name.as_str())
            .map(|(_, scale)| *scale),
        _ => None,
    };
    let Some(scale) = scale else {
        return Err(CodecError::TypeMismatch {
            field: spec.name.clone(),
            expected: "one of micrometer, millimeter, meter",
        });
    };
    let entry = unique(dict.find_path(&["convertToMeters"]), &spec.name)?;
    let (span, text) = number_literal(dict, entry)?;
    if text.parse::<f64>().is_ok_and(|current| same_scale(current, scale)) {
        return Ok(Vec::new());
    }
    Ok(vec![(span, NumberStyle::of(text).format(scale))])
}

fn indentation(text: &str, offset: usize) -> String {
    let line_start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
    text[line_start..offset]
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect()
}

fn apply_edits(text: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|(span, _)| Reverse(span.start));
    let mut out = text.to_string();
    for (span, replacement) in edits {
        out.replace_range(span.start..span.end, &replacement);
    }
    out
}
