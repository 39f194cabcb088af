//! Property-based tests for destination key mapping.

use bucketsync_core::key::{is_canonical, map_destination_key, normalize_key};
use proptest::prelude::*;
use std::collections::HashSet;

fn canonical_key() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-zA-Z0-9._-]{1,8}", 1..5).prop_map(|parts| parts.join("/"))
}

fn any_prefix() -> impl Strategy<Value = String> {
    "[a-z/]{0,12}"
}

proptest! {
    #[test]
    fn prop_map_is_deterministic(key in canonical_key(), prefix in any_prefix()) {
        prop_assert_eq!(
            map_destination_key(&key, &prefix),
            map_destination_key(&key, &prefix)
        );
    }

    #[test]
    fn prop_map_equals_normalized_join(key in canonical_key(), prefix in any_prefix()) {
        let expected = normalize_key(&format!("{}/{}", prefix, key));
        prop_assert_eq!(map_destination_key(&key, &prefix), expected);
    }

    #[test]
    fn prop_map_output_is_canonical(key in "[a-z/]{1,16}", prefix in any_prefix()) {
        let mapped = map_destination_key(&key, &prefix);
        prop_assert!(is_canonical(&mapped));
        prop_assert!(!mapped.starts_with('/'));
        prop_assert!(!mapped.contains("//"));
    }

    #[test]
    fn prop_distinct_keys_never_collapse(
        keys in prop::collection::hash_set(canonical_key(), 1..50),
        prefix in any_prefix(),
    ) {
        let mapped: HashSet<String> = keys
            .iter()
            .map(|k| map_destination_key(k, &prefix))
            .collect();
        prop_assert_eq!(mapped.len(), keys.len());
    }
}
