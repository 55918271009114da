//! Property-based tests for the filter engine and the return value cache
//!
//! Designed to run in a few seconds as a pre-commit quality gate.

use calltrace::cache::{CacheConfig, CorrelationCache};
use calltrace::filter::{prefix_eq, FilterEngine, FilterRule};
use calltrace::retval::ReturnHint;
use calltrace::sink::MemorySink;
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_wildcard_matches_iff_shared_prefix(
        pattern in "[a-c]{0,6}",
        candidate in "[a-c]{0,6}",
    ) {
        // Property: a wildcard rule matches exactly when one string is a
        // prefix of the other
        let rule = FilterRule::parse(&format!("{}*", pattern));
        let expected = pattern.starts_with(&candidate) || candidate.starts_with(&pattern);
        prop_assert_eq!(rule.matches(&candidate), expected);
    }

    #[test]
    fn prop_prefix_eq_is_symmetric(a in "[a-z!.]{0,12}", b in "[a-z!.]{0,12}") {
        prop_assert_eq!(prefix_eq(a.as_bytes(), b.as_bytes()), prefix_eq(b.as_bytes(), a.as_bytes()));
    }

    #[test]
    fn prop_exact_rule_is_equality(pattern in "[a-z]{1,4}![a-z]{1,4}", candidate in "[a-z]{1,4}![a-z]{1,4}") {
        let rule = FilterRule::parse(&pattern);
        prop_assert!(!rule.is_wildcard());
        prop_assert_eq!(rule.matches(&candidate), pattern == candidate);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_whitelist_makes_blacklist_inert(
        whitelist in prop::collection::vec("[ab]{1,3}(![ab]{1,3})?\\*?", 1..4),
        blacklist in prop::collection::vec("[ab]{1,3}(![ab]{1,3})?\\*?", 1..4),
        module in proptest::option::of("[ab]{1,3}"),
        function in "[ab]{1,3}",
    ) {
        let both = FilterEngine::from_lists(&whitelist, &blacklist);
        let only = FilterEngine::from_lists::<String>(&whitelist, &[]);

        prop_assert_eq!(
            both.decide(module.as_deref(), &function),
            only.decide(module.as_deref(), &function)
        );
        prop_assert_eq!(
            both.module_allowed(module.as_deref()),
            only.module_allowed(module.as_deref())
        );
    }

    #[test]
    fn prop_filter_parse_never_panics(text in "(\\[whitelist\\]|\\[blacklist\\]|#.*|[a-z!.*]{0,10})(\n(\\[whitelist\\]|\\[blacklist\\]|#.*|[a-z!.*]{0,10})){0,10}") {
        let filter = FilterEngine::parse(&text);
        let _ = filter.decide(Some("libc.so.6"), "malloc");
        let _ = filter.module_allowed(None);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Append(u32, u8),
    Return(u32, u8),
    Output(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u32..4, 0u8..4).prop_map(|(t, f)| Op::Append(t, f)),
        2 => (0u32..4, 0u8..4).prop_map(|(t, f)| Op::Return(t, f)),
        1 => (0u32..4).prop_map(Op::Output),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_cache_bounded_and_lossless(
        capacity in 1usize..8,
        max_cache_size in 0usize..6,
        ops in prop::collection::vec(op_strategy(), 0..60),
    ) {
        // Property: the cache never exceeds its capacity, and every appended
        // record is written out exactly once by the end
        let sink = Arc::new(MemorySink::new());
        let config = CacheConfig { capacity, max_cache_size, grepable: true };
        let cache = CorrelationCache::new(config, sink.clone(), None).unwrap();

        for op in &ops {
            match *op {
                Op::Append(t, f) => {
                    let name = format!("lib!f{}", f);
                    cache.append(t, &name, name.clone(), ReturnHint::Size);
                }
                Op::Return(t, f) => cache.set_return_value(t, &format!("lib!f{}", f), 1),
                Op::Output(t) => cache.output(t, false),
            }
            prop_assert!(cache.len() <= capacity);
        }

        cache.flush_all();
        prop_assert!(cache.shutdown());

        let appended = ops.iter().filter(|op| matches!(op, Op::Append(..))).count();
        let records = sink
            .lines()
            .iter()
            .filter(|line| !line.starts_with("ERROR"))
            .count();
        prop_assert_eq!(records, appended);
        prop_assert_eq!(cache.stats().emitted as usize, appended);
    }
}
