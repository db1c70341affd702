use proptest::prelude::*;

use shopgraph::entities::parse_price_filter;
use shopgraph::stages::extraction::{merge_entities, rules_extract};
use shopgraph::stages::routing::{PARALLEL_THRESHOLD, choose_path, complexity_score};
use shopgraph::types::RoutePath;

proptest! {
    #[test]
    fn price_parsing_never_panics(text in ".{0,200}") {
        let _ = parse_price_filter(&text);
    }

    #[test]
    fn parsed_ranges_are_ordered(a in 1u32..10_000, b in 1u32..10_000) {
        let text = format!("something between ${a} and ${b}");
        let filter = parse_price_filter(&text).unwrap();
        if let (Some(min), Some(max)) = (filter.min_value, filter.max_value) {
            prop_assert!(min <= max);
        }
    }

    #[test]
    fn merged_entities_never_overlap(text in "[a-z0-9 $#.]{0,120}") {
        let merged = merge_entities(rules_extract(&text));
        for (i, a) in merged.iter().enumerate() {
            for b in &merged[i + 1..] {
                prop_assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn rule_spans_index_into_the_message(text in "[a-zA-Z0-9 $#]{0,120}") {
        for entity in rules_extract(&text) {
            prop_assert!(entity.end <= text.len());
            prop_assert_eq!(&text[entity.start..entity.end], entity.text.as_str());
        }
    }

    #[test]
    fn routing_is_consistent_with_its_score(text in ".{0,120}", entities in 0usize..20) {
        let score = complexity_score(&text, entities);
        let expected = if score >= PARALLEL_THRESHOLD {
            RoutePath::Parallel
        } else {
            RoutePath::Simple
        };
        prop_assert_eq!(choose_path(&text, entities), expected);
    }
}
