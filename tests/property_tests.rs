//! Property tests for the pure invariants named in §8 "Invariants to
//! property-test": sanitized names stay within the allowed character
//! class, and placeholder expansion is a no-op on inputs with no
//! `${VAR}` markers.

use proptest::prelude::*;

use ica_mcp_proxy::config::loader::expand_placeholder;
use ica_mcp_proxy::mirror::sanitize;

fn arb_tool_name_char() -> impl Strategy<Value = char> {
    prop_oneof![
        Just('.'),
        Just('-'),
        Just('_'),
        Just(' '),
        Just('/'),
        Just(':'),
        Just('@'),
        'a'..='z',
        'A'..='Z',
        '0'..='9',
    ]
}

proptest! {
    /// Invariant 2 (partial): `sanitize` always yields a string drawn
    /// from `[A-Za-z0-9_.-]+`, for any non-empty input.
    #[test]
    fn sanitize_output_matches_allowed_character_class(
        name in prop::collection::vec(arb_tool_name_char(), 1..32)
    ) {
        let input: String = name.into_iter().collect();
        let out = sanitize(&input);
        prop_assert_eq!(out.len(), input.chars().count());
        prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
    }

    /// `sanitize` is idempotent: already-sanitized input is unchanged,
    /// since every character in its output is already in the allowed
    /// class.
    #[test]
    fn sanitize_is_idempotent(
        name in prop::collection::vec(arb_tool_name_char(), 1..32)
    ) {
        let input: String = name.into_iter().collect();
        let once = sanitize(&input);
        let twice = sanitize(&once);
        prop_assert_eq!(once, twice);
    }

    /// Invariant 4: placeholder expansion is idempotent over
    /// configurations containing no `${VAR}` patterns.
    #[test]
    fn expand_placeholder_is_idempotent_without_markers(
        text in "[a-zA-Z0-9_ /:.,-]{0,64}"
    ) {
        prop_assume!(!text.contains("${"));
        prop_assert_eq!(expand_placeholder(&text), text);
    }

    /// Expanding an unresolved placeholder twice is the same as
    /// expanding it once: unknown variables are left literal, so a
    /// second pass finds the same untouched `${VAR}` text.
    #[test]
    fn expand_placeholder_on_unknown_var_is_idempotent(
        var in "[A-Z_][A-Z0-9_]{0,16}"
    ) {
        prop_assume!(std::env::var(&var).is_err());
        let text = format!("prefix-${{{var}}}-suffix");
        let once = expand_placeholder(&text);
        let twice = expand_placeholder(&once);
        prop_assert_eq!(once, twice);
    }
}
