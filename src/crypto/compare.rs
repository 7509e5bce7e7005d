use subtle::ConstantTimeEq;

/// Compares two secrets without short-circuiting on the first differing byte.
///
/// Length differences still return early; only content is protected.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}
