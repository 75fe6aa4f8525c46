//! TSH (thyroid-stimulating hormone) results from lab reports.
//!
//! Lab reports are usually tables: a test name, then the result, then
//! reference values and sometimes earlier results, in columns. We find the
//! first line mentioning TSH, work out where the numeric columns are from the
//! whole page, and take the value in the leftmost column of that line.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

use super::{MarkerConfidence, MarkerError, MarkerKind, MarkerResult, WordBox};

/// Words whose tops are this close belong to the same line.
const LINE_TOLERANCE: u32 = 12;

/// Numbers further apart than this horizontally are in different columns.
const COLUMN_GAP: u32 = 40;

/// Plausible TSH values. Anything else is a misread.
const VALUE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=150.0;

/// Reference intervals are written `0,27 - 4,20`, `0.27 à 4.20` or
/// `0,27 ; 4,20`.
static INTERVAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+[.,]?\d*)\s*(?:-|à|;)\s*(\d+[.,]?\d*)").expect("failed to compile regex")
});

/// Unit spellings, most specific first, with their normalized forms.
static UNIT_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"m\s*u\s*i\s*/\s*m\s*l", "mUI/mL"),
        (r"m\s*u\s*i\s*/\s*l", "mUI/L"),
        (r"[µμ]\s*u?\s*i\s*/\s*m\s*l", "µUI/mL"),
        (r"[µμ]\s*u?\s*i\s*/\s*l", "µUI/L"),
        (r"u\s*u\s*i\s*/\s*l", "uUI/L"),
        (r"u\s*i\s*/\s*m\s*l", "UI/mL"),
        (r"u\s*i\s*/\s*l", "UI/L"),
    ]
    .into_iter()
    .map(|(pattern, unit)| (Regex::new(pattern).expect("failed to compile regex"), unit))
    .collect()
});

/// Extract a TSH value. `pages` holds the words of each page.
pub(super) fn extract_tsh(raw_text: &str, pages: &[Vec<WordBox>]) -> MarkerResult {
    let not_found = || MarkerResult::not_found(MarkerKind::Tsh, MarkerError::TshNotFound);
    if !raw_text.to_lowercase().contains("tsh") {
        return not_found();
    }

    for (page_index, words) in pages.iter().enumerate() {
        let lines = group_lines(words);
        let Some(tsh_line) = lines.iter().find(|line| merge_line(line).to_lowercase().contains("tsh"))
        else {
            continue;
        };
        let centers = column_centers(&lines);
        let Some(value) = first_column_value(tsh_line, &centers) else {
            debug!(page_index, "TSH line has no numeric values");
            continue;
        };
        if !VALUE_RANGE.contains(&value) {
            debug!(page_index, value, "Implausible TSH value");
            return not_found();
        }

        let unit = find_unit(&merge_line(tsh_line)).or_else(|| find_unit(raw_text));
        let (ref_min, ref_max) = match reference_interval(raw_text) {
            Some((min, max)) => (Some(min), Some(max)),
            None => (None, None),
        };
        let confidence = if unit.is_some() {
            MarkerConfidence::High
        } else {
            MarkerConfidence::Medium
        };
        return MarkerResult {
            marker: MarkerKind::Tsh,
            ok: true,
            value: Some(value),
            unit: unit.map(str::to_owned),
            ref_min,
            ref_max,
            confidence,
            error: None,
        };
    }
    not_found()
}

/// Group words into lines, top to bottom, each sorted left to right.
///
/// A word joins the first line whose first word has a top within
/// [`LINE_TOLERANCE`] of its own.
fn group_lines(words: &[WordBox]) -> Vec<Vec<&WordBox>> {
    let mut lines: Vec<Vec<&WordBox>> = vec![];
    for word in words {
        match lines
            .iter_mut()
            .find(|line| line[0].top.abs_diff(word.top) <= LINE_TOLERANCE)
        {
            Some(line) => line.push(word),
            None => lines.push(vec![word]),
        }
    }
    for line in &mut lines {
        line.sort_by_key(|word| word.left);
    }
    lines.sort_by_key(|line| line[0].top);
    lines
}

fn merge_line(line: &[&WordBox]) -> String {
    line.iter()
        .map(|word| word.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a word as a number, accepting a decimal comma.
fn parse_number(text: &str) -> Option<f64> {
    text.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Centers of the numeric columns on a page, left to right.
fn column_centers(lines: &[Vec<&WordBox>]) -> Vec<f64> {
    let mut xs = lines
        .iter()
        .flatten()
        .filter(|word| word.text.starts_with(|c: char| c.is_ascii_digit()))
        .map(|word| word.left)
        .collect::<Vec<_>>();
    xs.sort_unstable();

    let mut clusters: Vec<Vec<u32>> = vec![];
    for x in xs {
        match clusters.last_mut() {
            Some(cluster) if cluster.last().is_some_and(|&last| x - last < COLUMN_GAP) => {
                cluster.push(x)
            }
            _ => clusters.push(vec![x]),
        }
    }
    clusters
        .iter()
        .map(|cluster| {
            cluster.iter().map(|&x| f64::from(x)).sum::<f64>() / cluster.len() as f64
        })
        .collect()
}

/// The first value on `line` in the leftmost column that has one.
fn first_column_value(line: &[&WordBox], centers: &[f64]) -> Option<f64> {
    let values = line
        .iter()
        .filter_map(|word| {
            let value = parse_number(&word.text)?;
            let column = nearest_center(f64::from(word.left), centers)?;
            Some((column, value))
        })
        .collect::<Vec<_>>();
    let first_column = values.iter().map(|(column, _)| *column).min()?;
    values
        .into_iter()
        .find(|(column, _)| *column == first_column)
        .map(|(_, value)| value)
}

/// Index of the center closest to `x`. Ties go to the leftmost.
fn nearest_center(x: f64, centers: &[f64]) -> Option<usize> {
    centers
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (x - **a).abs().total_cmp(&(x - **b).abs()))
        .map(|(index, _)| index)
}

/// Find a concentration unit in some text.
fn find_unit(text: &str) -> Option<&'static str> {
    let cleaned = text.to_lowercase().replace(',', ".");
    UNIT_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(&cleaned))
        .map(|(_, unit)| *unit)
}

/// Find the most plausible reference interval: the one with the lowest lower
/// bound, among intervals with `0 < min < max < 50`.
fn reference_interval(text: &str) -> Option<(f64, f64)> {
    INTERVAL_REGEX
        .captures_iter(text)
        .filter_map(|caps| {
            let min = parse_number(&caps[1])?;
            let max = parse_number(&caps[2])?;
            (0.0 < min && min < max && max < 50.0).then_some((min, max))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
}
