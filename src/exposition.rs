//! Decoder for the line-oriented text exposition format.
//!
//! ```text
//! # HELP http_requests_total Total HTTP requests.
//! # TYPE http_requests_total counter
//! http_requests_total{method="post",code="200"} 1027 1395066363000
//! ```
//!
//! Decoding is all-or-nothing: the first malformed line fails the batch.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
};

use thiserror::Error;

use crate::{Metric, Sample, Time, METRIC_NAME_LABEL};

#[derive(Debug, Error, PartialEq)]
#[error("line {line}: {kind}")]
pub struct DecodeError {
    /// 1-based line number within the batch.
    pub line: usize,
    pub kind: DecodeErrorKind,
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeErrorKind {
    #[error("input is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid metric name {0:?}")]
    InvalidMetricName(String),
    #[error("invalid label name {0:?}")]
    InvalidLabelName(String),
    #[error("label name {0:?} is reserved")]
    ReservedLabelName(String),
    #[error("duplicate label name {0:?}")]
    DuplicateLabelName(String),
    #[error("expected '=' after label name {0:?}")]
    ExpectedEquals(String),
    #[error("expected '\"' to start the value of label {0:?}")]
    ExpectedQuote(String),
    #[error("unterminated value of label {0:?}")]
    UnterminatedLabelValue(String),
    #[error("invalid escape sequence in value of label {0:?}")]
    InvalidEscape(String),
    #[error("expected ',' or '}}' after label value")]
    ExpectedLabelSeparator,
    #[error("expected value after metric {0:?}")]
    MissingValue(String),
    #[error("invalid sample value {0:?}")]
    InvalidValue(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("unexpected content after timestamp {0:?}")]
    TrailingContent(String),
    #[error("{0} line is missing the metric name")]
    MissingMetadataName(&'static str),
    #[error("unknown metric type {0:?}")]
    UnknownType(String),
    #[error("second HELP line for metric {0:?}")]
    DuplicateHelp(String),
    #[error("second TYPE line for metric {0:?}")]
    DuplicateType(String),
    #[error("TYPE line for metric {0:?} must precede its samples")]
    TypeAfterSamples(String),
    #[error("histogram bucket {0:?} needs a numeric \"le\" label")]
    MissingBucketBound(String),
    #[error("summary sample {0:?} needs a numeric \"quantile\" label")]
    MissingQuantile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}
impl FromStr for MetricType {
    type Err = DecodeErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "counter" => Self::Counter,
            "gauge" => Self::Gauge,
            "histogram" => Self::Histogram,
            "summary" => Self::Summary,
            "untyped" => Self::Untyped,
            _ => return Err(DecodeErrorKind::UnknownType(s.to_string())),
        })
    }
}

/// Decodes one batch.
///
/// Samples without an explicit timestamp are stamped with `timestamp`, so all
/// of them share the same time.
pub fn decode(batch: &[u8], timestamp: Time) -> Result<Vec<Sample>, DecodeError> {
    let text = std::str::from_utf8(batch).map_err(|e| {
        let line = batch[..e.valid_up_to()]
            .iter()
            .filter(|b| **b == b'\n')
            .count();
        DecodeError {
            line: line + 1,
            kind: DecodeErrorKind::InvalidUtf8,
        }
    })?;
    let mut parser = TextParser::new(timestamp);
    for (i, line) in text.lines().enumerate() {
        parser
            .parse_line(line)
            .map_err(|kind| DecodeError { line: i + 1, kind })?;
    }
    Ok(parser.samples)
}

#[derive(Debug)]
struct TextParser {
    timestamp: Time,
    types: HashMap<String, MetricType>,
    helps: HashSet<String>,
    families_with_samples: HashSet<String>,
    samples: Vec<Sample>,
}
impl TextParser {
    fn new(timestamp: Time) -> Self {
        Self {
            timestamp,
            types: HashMap::new(),
            helps: HashSet::new(),
            families_with_samples: HashSet::new(),
            samples: vec![],
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<(), DecodeErrorKind> {
        let line = line.trim_start();
        if line.is_empty() {
            return Ok(());
        }
        match line.strip_prefix('#') {
            Some(comment) => self.parse_comment(comment),
            None => self.parse_sample(line),
        }
    }

    fn parse_comment(&mut self, comment: &str) -> Result<(), DecodeErrorKind> {
        let mut tokens = comment.split_whitespace();
        let keyword = match tokens.next() {
            Some("HELP") => "HELP",
            Some("TYPE") => "TYPE",
            _ => return Ok(()),
        };
        let name = tokens
            .next()
            .ok_or(DecodeErrorKind::MissingMetadataName(keyword))?;
        if !is_metric_name(name) {
            return Err(DecodeErrorKind::InvalidMetricName(name.to_string()));
        }
        if keyword == "HELP" {
            if !self.helps.insert(name.to_string()) {
                return Err(DecodeErrorKind::DuplicateHelp(name.to_string()));
            }
            return Ok(());
        }
        let metric_type: MetricType = tokens.next().unwrap_or_default().parse()?;
        if self.types.contains_key(name) {
            return Err(DecodeErrorKind::DuplicateType(name.to_string()));
        }
        if self.families_with_samples.contains(name) {
            return Err(DecodeErrorKind::TypeAfterSamples(name.to_string()));
        }
        self.types.insert(name.to_string(), metric_type);
        Ok(())
    }

    fn parse_sample(&mut self, line: &str) -> Result<(), DecodeErrorKind> {
        let name_end = line.find(|c: char| !is_name_char(c)).unwrap_or(line.len());
        let (name, mut rest) = line.split_at(name_end);
        let separated = rest.is_empty() || rest.starts_with([' ', '\t', '{']);
        if !is_metric_name(name) || !separated {
            let token = line.split_whitespace().next().unwrap_or_default();
            return Err(DecodeErrorKind::InvalidMetricName(token.to_string()));
        }
        let mut metric = Metric::new(name);
        if let Some(labels) = rest.trim_start_matches([' ', '\t']).strip_prefix('{') {
            rest = parse_labels(labels, &mut metric)?;
        }

        let mut fields = rest.split_whitespace();
        let value = fields
            .next()
            .ok_or_else(|| DecodeErrorKind::MissingValue(name.to_string()))?;
        let value = value
            .parse::<f64>()
            .map_err(|_| DecodeErrorKind::InvalidValue(value.to_string()))?;
        let time = match fields.next() {
            Some(ts) => ts
                .parse::<Time>()
                .map_err(|_| DecodeErrorKind::InvalidTimestamp(ts.to_string()))?,
            None => self.timestamp,
        };
        if let Some(extra) = fields.next() {
            return Err(DecodeErrorKind::TrailingContent(extra.to_string()));
        }

        let (family, metric_type) = self.family_of(name);
        match metric_type {
            MetricType::Histogram if name.ends_with("_bucket") && family != name => {
                if !has_float_label(&metric, "le") {
                    return Err(DecodeErrorKind::MissingBucketBound(metric.key()));
                }
            }
            MetricType::Summary if family == name => {
                if !has_float_label(&metric, "quantile") {
                    return Err(DecodeErrorKind::MissingQuantile(metric.key()));
                }
            }
            _ => {}
        }
        if !self.families_with_samples.contains(family) {
            self.families_with_samples.insert(family.to_string());
        }

        self.samples.push(Sample {
            metric,
            value,
            time,
        });
        Ok(())
    }

    /// Resolves `_bucket`, `_sum` and `_count` samples to their declared
    /// histogram or summary family.
    fn family_of<'a>(&self, name: &'a str) -> (&'a str, MetricType) {
        for suffix in ["_bucket", "_sum", "_count"] {
            let Some(base) = name.strip_suffix(suffix) else {
                continue;
            };
            match self.types.get(base) {
                Some(MetricType::Histogram) => return (base, MetricType::Histogram),
                Some(MetricType::Summary) if suffix != "_bucket" => {
                    return (base, MetricType::Summary)
                }
                _ => {}
            }
        }
        let metric_type = self.types.get(name).copied();
        (name, metric_type.unwrap_or(MetricType::Untyped))
    }
}

/// Parses a label set after its opening `{`, returning the rest of the line.
fn parse_labels<'a>(s: &'a str, metric: &mut Metric) -> Result<&'a str, DecodeErrorKind> {
    let mut rest = s;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('}') {
            return Ok(after);
        }
        let end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        let (label, after) = rest.split_at(end);
        if !is_label_name(label) {
            return Err(DecodeErrorKind::InvalidLabelName(label.to_string()));
        }
        if label == METRIC_NAME_LABEL {
            return Err(DecodeErrorKind::ReservedLabelName(label.to_string()));
        }
        let after = after
            .trim_start()
            .strip_prefix('=')
            .ok_or_else(|| DecodeErrorKind::ExpectedEquals(label.to_string()))?;
        let after = after
            .trim_start()
            .strip_prefix('"')
            .ok_or_else(|| DecodeErrorKind::ExpectedQuote(label.to_string()))?;
        let (value, after) = parse_label_value(after, label)?;
        if metric.insert(label.to_string(), value).is_some() {
            return Err(DecodeErrorKind::DuplicateLabelName(label.to_string()));
        }

        rest = after.trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix('}') {
            return Ok(after);
        }
        return Err(DecodeErrorKind::ExpectedLabelSeparator);
    }
}

fn parse_label_value<'a>(s: &'a str, label: &str) -> Result<(String, &'a str), DecodeErrorKind> {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &s[i + 1..])),
            '\\' => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some(_) => return Err(DecodeErrorKind::InvalidEscape(label.to_string())),
                None => break,
            },
            c => value.push(c),
        }
    }
    Err(DecodeErrorKind::UnterminatedLabelValue(label.to_string()))
}

fn has_float_label(metric: &Metric, label: &str) -> bool {
    metric
        .get(label)
        .is_some_and(|value| value.parse::<f64>().is_ok())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => chars.all(is_name_char),
        _ => false,
    }
}

fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
