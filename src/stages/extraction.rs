//! Entity extraction: up to three independent methods, merged into one
//! non-overlapping entity list.
//!
//! Methods, in order of authority:
//! 1. structured generation (model-driven, confidence 0.9),
//! 2. deterministic pattern rules (prices, lexicons, order numbers, 0.7–0.9),
//! 3. keyword heuristics (sizes, colors, urgency, 0.6).
//!
//! A failing method contributes zero entities without failing the stage. If
//! every method comes back empty, a whole-message placeholder entity keeps
//! downstream stages away from the empty-list case.

use std::cmp::Ordering;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::instrument;

use crate::capabilities::ChatModel;
use crate::entities::{Entity, ExtractionMethod, parse_price_filter};
use crate::faults::StageFault;
use crate::stage::{Stage, StageContext, StageError, StageUpdate};
use crate::state::StateSnapshot;

const PRICE_CONFIDENCE: f64 = 0.7;
const BRAND_CONFIDENCE: f64 = 0.8;
const CATEGORY_CONFIDENCE: f64 = 0.8;
const ORDER_CONFIDENCE: f64 = 0.9;
const HEURISTIC_CONFIDENCE: f64 = 0.6;
const GENERATION_CONFIDENCE: f64 = 0.9;

/// Bytes of surrounding context considered when normalizing a price mention.
const PRICE_CONTEXT: usize = 24;

fn pattern(source: &str) -> Regex {
    Regex::new(source).unwrap_or_else(|e| panic!("extraction pattern {source:?}: {e}"))
}

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\$\s*\d+(?:\.\d{1,2})?|\b\d+(?:\.\d{1,2})?\s*(?:dollars|bucks)\b")
});

static BRAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)\b(sony|apple|samsung|nike|adidas|dell|lenovo|bose|canon|nikon|microsoft|google|lg|hp)\b",
    )
});

static CATEGORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)\b(headphones?|laptops?|phones?|tablets?|cameras?|speakers?|monitors?|keyboards?|shoes|shirts|jackets|tvs?)\b",
    )
});

static ORDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\border\s*[#:]?\s*\d{4,12}\b|\b[A-Z]{2,4}-\d{4,10}\b")
});

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\bsize\s+(?:\d{1,2}|xs|s|m|l|xl|xxl)\b|\b(?:x-?small|x-?large|small|medium|large|xs|xl|xxl)\b")
});

static COLOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)\b(black|white|red|blue|green|yellow|pink|purple|gray|grey|silver|gold|brown|orange)\b",
    )
});

static URGENCY_RE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(urgent|asap|immediately|today)\b|\bright now\b"));

fn clamp_back(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn clamp_forward(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(s.len())
}

/// Deterministic pattern rules. Also used by routing for its cheap entity
/// estimate.
pub fn rules_extract(message: &str) -> Vec<Entity> {
    let mut entities = Vec::new();

    for m in PRICE_RE.find_iter(message) {
        let ctx_start = clamp_back(message, m.start().saturating_sub(PRICE_CONTEXT));
        let ctx_end = clamp_forward(message, (m.end() + PRICE_CONTEXT).min(message.len()));
        let context = &message[ctx_start..ctx_end];
        let mut entity = Entity::new(
            m.as_str(),
            "price",
            PRICE_CONFIDENCE,
            m.start(),
            m.end(),
            ExtractionMethod::Rules,
        );
        if let Some(filter) = parse_price_filter(context) {
            if let Ok(value) = serde_json::to_value(&filter) {
                entity = entity.with_normalized(value);
            }
        }
        entities.push(entity);
    }

    for m in BRAND_RE.find_iter(message) {
        entities.push(
            Entity::new(
                m.as_str(),
                "brand",
                BRAND_CONFIDENCE,
                m.start(),
                m.end(),
                ExtractionMethod::Rules,
            )
            .with_normalized(Value::String(m.as_str().to_lowercase())),
        );
    }

    for m in CATEGORY_RE.find_iter(message) {
        entities.push(
            Entity::new(
                m.as_str(),
                "category",
                CATEGORY_CONFIDENCE,
                m.start(),
                m.end(),
                ExtractionMethod::Rules,
            )
            .with_normalized(Value::String(m.as_str().to_lowercase())),
        );
    }

    for m in ORDER_RE.find_iter(message) {
        entities.push(Entity::new(
            m.as_str(),
            "order_number",
            ORDER_CONFIDENCE,
            m.start(),
            m.end(),
            ExtractionMethod::Rules,
        ));
    }

    entities
}

/// Secondary keyword heuristics: sizes, colors, urgency markers.
pub fn heuristic_extract(message: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    for (re, label) in [
        (&*SIZE_RE, "size"),
        (&*COLOR_RE, "color"),
        (&*URGENCY_RE, "urgency"),
    ] {
        for m in re.find_iter(message) {
            entities.push(Entity::new(
                m.as_str(),
                label,
                HEURISTIC_CONFIDENCE,
                m.start(),
                m.end(),
                ExtractionMethod::Heuristics,
            ));
        }
    }
    entities
}

fn generation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "label": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["text", "label"]
                }
            }
        },
        "required": ["entities"]
    })
}

/// Structured-generation extraction. Candidates whose text cannot be located
/// in the message are dropped; spans come from the first occurrence.
async fn generation_extract(
    model: &dyn ChatModel,
    message: &str,
) -> Result<Vec<Entity>, StageError> {
    let prompt = format!(
        "Extract shopping-related entities (products, brands, categories, prices, \
         order numbers, sizes, colors) from this customer message.\n\nMessage: {message}"
    );
    let output = model
        .generate_structured(&prompt, &generation_schema())
        .await?;

    let candidates = output
        .get("entities")
        .and_then(Value::as_array)
        .ok_or_else(|| StageError::Failed("generation output missing entities array".into()))?;

    let mut entities = Vec::new();
    for candidate in candidates {
        let Some(text) = candidate.get("text").and_then(Value::as_str) else {
            continue;
        };
        let Some(start) = message.find(text) else {
            continue;
        };
        let label = candidate
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let confidence = candidate
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(GENERATION_CONFIDENCE)
            .clamp(0.0, 1.0);
        let mut entity = Entity::new(
            text,
            label,
            confidence,
            start,
            start + text.len(),
            ExtractionMethod::Generation,
        );
        if label == "price" {
            if let Some(filter) = parse_price_filter(text) {
                if let Ok(value) = serde_json::to_value(&filter) {
                    entity = entity.with_normalized(value);
                }
            }
        }
        entities.push(entity);
    }
    Ok(entities)
}

/// Merge candidates from all methods into a non-overlapping list.
///
/// Candidates are ranked by (method authority, confidence) descending with
/// leftmost start breaking ties, then kept greedily when their span does not
/// overlap an already-kept span. The result is ordered by span start.
pub fn merge_entities(mut candidates: Vec<Entity>) -> Vec<Entity> {
    candidates.sort_by(|a, b| {
        b.extraction_method
            .authority()
            .partial_cmp(&a.extraction_method.authority())
            .unwrap_or(Ordering::Equal)
            .then(
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(Ordering::Equal),
            )
            .then(a.start.cmp(&b.start))
    });

    let mut kept: Vec<Entity> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !kept.iter().any(|k| k.overlaps(&candidate)) {
            kept.push(candidate);
        }
    }
    kept.sort_by_key(|e| e.start);
    kept
}

/// Whole-message placeholder used when every method came back empty.
pub fn placeholder_entity(message: &str) -> Entity {
    Entity::new(
        message,
        "unknown",
        0.1,
        0,
        message.len(),
        ExtractionMethod::Fallback,
    )
}

/// Entity extraction stage.
///
/// The simple path runs pattern rules only. The parallel path launches rules,
/// heuristics, and structured generation together and joins them; generation
/// failure is recorded as a fault and contributes nothing.
pub struct ExtractionStage {
    model: Option<Arc<dyn ChatModel>>,
    concurrent: bool,
}

impl ExtractionStage {
    /// Rules-only extraction for the simple path.
    pub fn simple() -> Self {
        Self {
            model: None,
            concurrent: false,
        }
    }

    /// All three methods, run concurrently, for the parallel path.
    pub fn parallel(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model: Some(model),
            concurrent: true,
        }
    }
}

#[async_trait]
impl Stage for ExtractionStage {
    #[instrument(skip(self, snapshot, ctx), fields(thread_id = %ctx.thread_id))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StageContext,
    ) -> Result<StageUpdate, StageError> {
        let message = snapshot.user_message;
        let mut faults = Vec::new();
        let mut llm_calls = 0;
        let mut candidates = Vec::new();

        if self.concurrent {
            if let Some(model) = &self.model {
                llm_calls = 1;
                let (rules, heuristics, generated) = tokio::join!(
                    async { rules_extract(&message) },
                    async { heuristic_extract(&message) },
                    generation_extract(model.as_ref(), &message),
                );
                candidates.extend(rules);
                candidates.extend(heuristics);
                match generated {
                    Ok(entities) => candidates.extend(entities),
                    Err(err) => faults.push(StageFault::new(
                        ctx.stage_id.clone(),
                        format!("generation extraction failed: {err}"),
                    )),
                }
            } else {
                candidates.extend(rules_extract(&message));
                candidates.extend(heuristic_extract(&message));
            }
        } else {
            candidates.extend(rules_extract(&message));
        }

        let mut merged = merge_entities(candidates);
        if merged.is_empty() {
            merged.push(placeholder_entity(&message));
        }

        ctx.emit("extraction", format!("{} entities", merged.len()))?;

        Ok(StageUpdate::new()
            .with_entities(merged)
            .with_llm_calls(llm_calls)
            .with_faults(faults))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PriceOperator;

    #[test]
    fn rules_find_price_brand_category() {
        let entities = rules_extract("Do you have sony headphones under $50?");
        let labels: Vec<&str> = entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"price"));
        assert!(labels.contains(&"brand"));
        assert!(labels.contains(&"category"));
    }

    #[test]
    fn price_entity_is_normalized_from_context() {
        let entities = rules_extract("anything under $50 please");
        let price = entities.iter().find(|e| e.label == "price").unwrap();
        let filter: crate::entities::PriceFilter =
            serde_json::from_value(price.normalized_value.clone().unwrap()).unwrap();
        assert_eq!(filter.operator, PriceOperator::Lt);
        assert_eq!(filter.max_value, Some(50.0));
    }

    #[test]
    fn order_numbers_are_high_confidence() {
        let entities = rules_extract("where is order #12345678?");
        let order = entities.iter().find(|e| e.label == "order_number").unwrap();
        assert!(order.confidence >= 0.9);
    }

    #[test]
    fn heuristics_find_sizes_and_colors() {
        let entities = heuristic_extract("large black running shoes, needed today");
        let labels: Vec<&str> = entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"size"));
        assert!(labels.contains(&"color"));
        assert!(labels.contains(&"urgency"));
    }

    #[test]
    fn merge_prefers_generation_over_rules_on_overlap() {
        let rules = Entity::new("sony", "brand", 0.8, 0, 4, ExtractionMethod::Rules);
        let generated = Entity::new("sony wh-1000", "product", 0.9, 0, 12, ExtractionMethod::Generation);
        let merged = merge_entities(vec![rules, generated]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].extraction_method, ExtractionMethod::Generation);
    }

    #[test]
    fn merge_output_is_ordered_by_start() {
        let a = Entity::new("b", "brand", 0.8, 10, 11, ExtractionMethod::Rules);
        let b = Entity::new("a", "category", 0.8, 0, 1, ExtractionMethod::Rules);
        let merged = merge_entities(vec![a, b]);
        assert!(merged[0].start < merged[1].start);
    }

    #[test]
    fn placeholder_spans_whole_message() {
        let entity = placeholder_entity("hello");
        assert_eq!(entity.start, 0);
        assert_eq!(entity.end, 5);
        assert_eq!(entity.extraction_method, ExtractionMethod::Fallback);
    }
}
