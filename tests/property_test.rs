//! Property tests over the public validation and hashing surface

use memento::store::{validate_draft, RememberOptions};
use memento::{EmbedCache, MemoryId};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_id_is_deterministic(text in ".{1,64}", source in "[a-z]{1,8}", ts in 0i64..i64::MAX / 2) {
        let a = MemoryId::derive(&text, &source, "default", ts);
        let b = MemoryId::derive(&text, &source, "default", ts);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_id_hex_round_trips(text in ".{1,64}", ts in 0i64..1_000_000) {
        let id = MemoryId::derive(&text, "src", "sess", ts);
        let parsed: MemoryId = id.to_hex().parse().unwrap();
        prop_assert_eq!(parsed, id);
    }

    #[test]
    fn prop_importance_always_clamped(text in "[a-z ]{1,40}", importance in -1000.0f32..1000.0) {
        let opts = RememberOptions { importance: Some(importance), ..Default::default() };
        let draft = validate_draft(&text, &opts);
        // Whitespace-only strings are rejected; anything else clamps
        if let Ok(draft) = draft {
            prop_assert!((0.0..=1.0).contains(&draft.importance));
        }
    }

    #[test]
    fn prop_validated_text_is_nfc_stable(text in "\\PC{1,64}") {
        // Validating already-validated text changes nothing (NFC idempotent)
        if let Ok(first) = validate_draft(&text, &RememberOptions::default()) {
            let second = validate_draft(&first.text, &RememberOptions::default()).unwrap();
            prop_assert_eq!(first.text, second.text);
        }
    }

    #[test]
    fn prop_cache_key_is_stable_and_sensitive(a in ".{1,64}", b in ".{1,64}") {
        prop_assert_eq!(EmbedCache::key(&a), EmbedCache::key(&a));
        // Distinct NFC forms hash distinctly
        let a_nfc: String = {
            use unicode_normalization::UnicodeNormalization;
            a.nfc().collect()
        };
        let b_nfc: String = {
            use unicode_normalization::UnicodeNormalization;
            b.nfc().collect()
        };
        if a_nfc != b_nfc {
            prop_assert_ne!(EmbedCache::key(&a), EmbedCache::key(&b));
        }
    }

    #[test]
    fn prop_tag_validation_canonicalizes(tags in proptest::collection::vec("[a-z0-9_-]{1,16}", 0..20)) {
        let opts = RememberOptions { tags: tags.clone(), ..Default::default() };
        let draft = validate_draft("text", &opts).unwrap();
        // Sorted, deduplicated, and a subset of the input
        let mut expected: Vec<String> = tags;
        expected.sort();
        expected.dedup();
        prop_assert_eq!(draft.tags, expected);
    }
}
