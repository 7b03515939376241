//! # Benchmark Output Parsing
//!
//! Backends print their measured speed as free text. Two extraction policies
//! cover the backends supported here:
//!
//! - [`extract_samples`]: one figure per line, found between a start marker and
//!   an end marker.
//! - [`WindowPattern`]: one pattern match per line reporting a short-window and
//!   a long-window average side by side.
//!
//! Lines that do not match, or whose figure does not parse, are skipped
//! silently. A noisy line is never an error.

use regex::Regex;

/// Extract one throughput sample per matching line, in input order
///
/// Matching is case-insensitive. The text between the end of `start` and the
/// first following `end` is trimmed and parsed with Rust's locale-independent
/// float grammar.
pub fn extract_samples<'a, I, S>(
    lines: I,
    start: &'a str,
    end: &'a str,
) -> impl Iterator<Item = f64> + 'a
where
    I: IntoIterator<Item = S> + 'a,
    I::IntoIter: 'a,
    S: AsRef<str> + 'a,
{
    let start = start.to_lowercase();
    let end = end.to_lowercase();
    lines
        .into_iter()
        .filter_map(move |line| sample_between(line.as_ref(), &start, &end))
}

/// Parse the figure between two lowercase markers on a single line
fn sample_between(line: &str, start: &str, end: &str) -> Option<f64> {
    let lowered = line.to_lowercase();
    let after = &lowered[lowered.find(start)? + start.len()..];
    let figure = &after[..after.find(end)?];
    figure.trim().parse().ok()
}

/// Samples classified by reporting window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSamples {
    pub short: Vec<f64>,
    pub long: Vec<f64>,
}

/// Pattern for lines that carry several rolling averages at once
///
/// For a line such as `speed 10s/60s/15m 812.4 798.0 n/a H/s max 830.1 H/s`
/// the captured group between the markers is split on whitespace and the
/// figures at `short_index` and `long_index` are read. A line contributes its
/// long figure when it parses; otherwise it contributes its short figure, so
/// warm-up lines (long window still `n/a`) only feed the fallback sequence.
#[derive(Debug, Clone)]
pub struct WindowPattern {
    regex: Regex,
    short_index: usize,
    long_index: usize,
}

impl WindowPattern {
    pub fn new(
        start: &str,
        end: &str,
        short_index: usize,
        long_index: usize,
    ) -> Result<Self, regex::Error> {
        let pattern = format!(
            "{} (.+?) {}",
            regex::escape(&start.to_lowercase()),
            regex::escape(&end.to_lowercase())
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
            short_index,
            long_index,
        })
    }

    /// Classify every matching line into the short or long sequence
    pub fn extract<I, S>(&self, lines: I) -> WindowSamples
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut samples = WindowSamples::default();
        for line in lines {
            let lowered = line.as_ref().to_lowercase();
            let Some(caps) = self.regex.captures(&lowered) else {
                continue;
            };
            let figures: Vec<&str> = caps[1].split_whitespace().collect();
            let parse = |i: usize| figures.get(i).and_then(|f| f.parse::<f64>().ok());
            if let Some(long) = parse(self.long_index) {
                samples.long.push(long);
            } else if let Some(short) = parse(self.short_index) {
                samples.short.push(short);
            }
        }
        samples
    }
}
