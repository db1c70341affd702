//! Typed entities extracted from user messages, plus price normalization.
//!
//! An [`Entity`] is a confidence-scored span of the input message. Entities
//! come from up to three extraction methods (pattern rules, structured
//! generation, heuristics) and are merged into a non-overlapping list by the
//! extraction stage.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How an entity was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Deterministic pattern rules (prices, lexicons, order numbers).
    Rules,
    /// External structured-generation call.
    Generation,
    /// Secondary keyword heuristics (sizes, colors, urgency).
    Heuristics,
    /// Whole-message placeholder emitted when every method failed.
    Fallback,
}

impl ExtractionMethod {
    /// Method-level authority used to rank overlapping candidates.
    /// Generation output is treated as most authoritative.
    pub fn authority(&self) -> f64 {
        match self {
            ExtractionMethod::Generation => 0.9,
            ExtractionMethod::Rules => 0.8,
            ExtractionMethod::Heuristics => 0.6,
            ExtractionMethod::Fallback => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Rules => "rules",
            ExtractionMethod::Generation => "generation",
            ExtractionMethod::Heuristics => "heuristics",
            ExtractionMethod::Fallback => "fallback",
        }
    }
}

/// A typed, confidence-scored span of the input message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// The matched text, exactly as it appears in the message.
    pub text: String,
    /// Entity label ("price", "brand", "category", "order_number", ...).
    pub label: String,
    /// Extraction confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Byte offset of the span start in the message.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// Normalized value, when the label has a canonical form
    /// (e.g., a [`PriceFilter`] for price entities).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_value: Option<Value>,
    /// Which method produced this entity.
    pub extraction_method: ExtractionMethod,
}

impl Entity {
    pub fn new(
        text: impl Into<String>,
        label: impl Into<String>,
        confidence: f64,
        start: usize,
        end: usize,
        extraction_method: ExtractionMethod,
    ) -> Self {
        Self {
            text: text.into(),
            label: label.into(),
            confidence,
            start,
            end,
            normalized_value: None,
            extraction_method,
        }
    }

    #[must_use]
    pub fn with_normalized(mut self, value: Value) -> Self {
        self.normalized_value = Some(value);
        self
    }

    /// True when the two spans share at least one byte.
    pub fn overlaps(&self, other: &Entity) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Comparison operator for a normalized price constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceOperator {
    Lt,
    Gt,
    Between,
    Approx,
    Eq,
}

impl PriceOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceOperator::Lt => "lt",
            PriceOperator::Gt => "gt",
            PriceOperator::Between => "between",
            PriceOperator::Approx => "approx",
            PriceOperator::Eq => "eq",
        }
    }
}

/// Normalized form of a price mention: an operator plus optional bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceFilter {
    pub operator: PriceOperator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

/// Band applied around point prices for `approx` and bare `eq` mentions.
pub const APPROX_BAND: f64 = 0.10;

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d{1,2})?").unwrap_or_else(|e| panic!("number pattern: {e}"))
});

/// Normalize a price mention (with surrounding context) into a [`PriceFilter`].
///
/// Keyword rules, applied in order:
/// - "under" / "below" / "less than" → `lt` with only a maximum
/// - "over" / "above" / "more than" → `gt` with only a minimum
/// - "between", or two amounts joined by "and" / "to" / "-" → `between`
/// - "around" / "about" / "approximately" → `approx` ± 10 %
/// - otherwise → `eq` ± 10 %
///
/// Returns `None` when the text contains no numeric amount.
pub fn parse_price_filter(text: &str) -> Option<PriceFilter> {
    let lower = text.to_lowercase();
    let amounts: Vec<f64> = NUMBER_RE
        .find_iter(&lower)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();
    let first = *amounts.first()?;

    let has_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has_any(&["under", "below", "less than"]) {
        return Some(PriceFilter {
            operator: PriceOperator::Lt,
            min_value: None,
            max_value: Some(first),
        });
    }
    if has_any(&["over", "above", "more than"]) {
        return Some(PriceFilter {
            operator: PriceOperator::Gt,
            min_value: Some(first),
            max_value: None,
        });
    }
    if amounts.len() >= 2 && (lower.contains("between") || has_any(&["and", "to", "-", "from"])) {
        let (lo, hi) = if amounts[0] <= amounts[1] {
            (amounts[0], amounts[1])
        } else {
            (amounts[1], amounts[0])
        };
        return Some(PriceFilter {
            operator: PriceOperator::Between,
            min_value: Some(lo),
            max_value: Some(hi),
        });
    }
    if has_any(&["around", "about", "approximately"]) {
        return Some(PriceFilter {
            operator: PriceOperator::Approx,
            min_value: Some(first * (1.0 - APPROX_BAND)),
            max_value: Some(first * (1.0 + APPROX_BAND)),
        });
    }
    Some(PriceFilter {
        operator: PriceOperator::Eq,
        min_value: Some(first * (1.0 - APPROX_BAND)),
        max_value: Some(first * (1.0 + APPROX_BAND)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_becomes_lt_with_max_only() {
        let filter = parse_price_filter("under $50").unwrap();
        assert_eq!(filter.operator, PriceOperator::Lt);
        assert_eq!(filter.min_value, None);
        assert_eq!(filter.max_value, Some(50.0));
    }

    #[test]
    fn between_captures_both_bounds() {
        let filter = parse_price_filter("between $50 and $100").unwrap();
        assert_eq!(filter.operator, PriceOperator::Between);
        assert_eq!(filter.min_value, Some(50.0));
        assert_eq!(filter.max_value, Some(100.0));
    }

    #[test]
    fn between_sorts_reversed_bounds() {
        let filter = parse_price_filter("between $200 and $80").unwrap();
        assert_eq!(filter.min_value, Some(80.0));
        assert_eq!(filter.max_value, Some(200.0));
    }

    #[test]
    fn over_becomes_gt_with_min_only() {
        let filter = parse_price_filter("anything over $250").unwrap();
        assert_eq!(filter.operator, PriceOperator::Gt);
        assert_eq!(filter.min_value, Some(250.0));
        assert_eq!(filter.max_value, None);
    }

    #[test]
    fn around_applies_ten_percent_band() {
        let filter = parse_price_filter("around $100").unwrap();
        assert_eq!(filter.operator, PriceOperator::Approx);
        assert_eq!(filter.min_value, Some(90.0));
        assert!((filter.max_value.unwrap() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn bare_amount_becomes_eq_band() {
        let filter = parse_price_filter("$60 headphones").unwrap();
        assert_eq!(filter.operator, PriceOperator::Eq);
        assert_eq!(filter.min_value, Some(54.0));
        assert!((filter.max_value.unwrap() - 66.0).abs() < 1e-9);
    }

    #[test]
    fn no_amount_yields_none() {
        assert_eq!(parse_price_filter("cheap stuff please"), None);
    }

    #[test]
    fn overlap_detection() {
        let a = Entity::new("$50", "price", 0.7, 6, 9, ExtractionMethod::Rules);
        let b = Entity::new("50", "size", 0.6, 7, 9, ExtractionMethod::Heuristics);
        let c = Entity::new("sony", "brand", 0.8, 10, 14, ExtractionMethod::Rules);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
