/// Property tests for error classification invariants
use gpu_stack_deploy::error::{
    ErrorCategory, ErrorCode, ErrorContext, ErrorEngine, RecoveryStrategy, Severity,
};
use proptest::prelude::*;
use std::collections::HashMap;

const STRATEGIES: [RecoveryStrategy; 5] = [
    RecoveryStrategy::Retry,
    RecoveryStrategy::Fallback,
    RecoveryStrategy::Skip,
    RecoveryStrategy::Abort,
    RecoveryStrategy::Manual,
];

prop_compose! {
    fn arb_code()(index in 0..ErrorCode::PREDEFINED.len() + 2) -> ErrorCode {
        match ErrorCode::PREDEFINED.get(index) {
            Some(code) => code.clone(),
            None => ErrorCode::Other(format!("provider-code-{}", index)),
        }
    }
}

prop_compose! {
    fn arb_call()(
        code in arb_code(),
        strategy in proptest::option::of(0..STRATEGIES.len()),
    ) -> (ErrorCode, Option<RecoveryStrategy>) {
        (code, strategy.map(|i| STRATEGIES[i]))
    }
}

proptest! {
    #[test]
    fn test_first_binding_wins_and_counts_increase(
        calls in proptest::collection::vec(arb_call(), 1..60),
    ) {
        let engine = ErrorEngine::new();
        let ctx = ErrorContext::new("property");
        let mut first: HashMap<ErrorCode, RecoveryStrategy> = HashMap::new();
        let mut counts: HashMap<ErrorCode, u64> = HashMap::new();

        for (code, strategy) in calls {
            let event = engine.classify(code.clone(), &ctx, None, strategy);

            let expected = *first
                .entry(code.clone())
                .or_insert_with(|| strategy.unwrap_or(code.defaults().2));
            prop_assert_eq!(event.recovery_strategy, expected);

            let count = counts.entry(code.clone()).or_insert(0);
            *count += 1;
            prop_assert_eq!(event.occurrence_count, *count);
            prop_assert_eq!(engine.occurrences(&code), *count);
        }

        let total: u64 = ErrorCategory::ALL
            .iter()
            .map(|category| engine.count_by_category(*category))
            .sum();
        prop_assert_eq!(total, counts.values().sum::<u64>());
    }

    #[test]
    fn test_manual_codes_never_retry(
        code in arb_code(),
        repeats in 1u32..10,
    ) {
        let engine = ErrorEngine::new();
        let ctx = ErrorContext::new("property");
        for _ in 0..repeats {
            engine.record(code.clone(), &ctx);
        }

        let (_, _, strategy) = code.defaults();
        if strategy != RecoveryStrategy::Retry {
            prop_assert!(!engine.should_retry(&code, u32::MAX));
        } else {
            prop_assert_eq!(engine.should_retry(&code, repeats + 1), true);
            prop_assert_eq!(engine.should_retry(&code, repeats), false);
        }
    }

    #[test]
    fn test_code_names_round_trip(code in arb_code()) {
        let json = serde_json::to_string(&code).unwrap();
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, code);
    }
}

#[test]
fn test_credentials_are_critical_and_manual() {
    let (category, severity, strategy) = ErrorCode::InvalidCredentials.defaults();
    assert_eq!(category, ErrorCategory::Authentication);
    assert_eq!(severity, Severity::Critical);
    assert_eq!(strategy, RecoveryStrategy::Manual);
    assert!(category.always_propagates());
}
