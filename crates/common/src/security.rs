//! Credential comparison helpers.

/// Constant-time comparison to prevent timing attacks.
///
/// Length is not treated as secret: unequal lengths return `false` right away.
/// For equal lengths every byte pair is folded into one accumulator and the
/// result is tested once, so the running time does not depend on where the
/// first mismatch sits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= std::hint::black_box(x ^ y);
    }
    diff == 0
}

/// Check a submitted admin password. An empty expected password never matches.
pub fn verify_admin_password(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

/// Check a cron bearer token. An empty expected secret never matches.
pub fn verify_cron_secret(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && constant_time_eq(provided.as_bytes(), expected.as_bytes())
}
