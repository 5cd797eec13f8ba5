use crate::utils;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Key fragments that mark a variable as sensitive.
pub const SENSITIVE_KEY_TERMS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "private_key",
    "credential",
    "access_key",
    "signing_key",
    "encryption_key",
];

/// Key segments that mark a variable as sensitive only when they stand alone, so `API_AUTH` is
/// secret but `AUTHOR_NAME` is not.
pub const SENSITIVE_KEY_SEGMENTS: &[&str] = &["auth"];

/// Prefix used for hashed secret values in definition files.
pub const SECRET_HASH_PREFIX: &str = "sha256:";

const TOKEN_MIN_LENGTH: usize = 20;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a variable should be treated as a secret.
///
/// A variable is secret if its key contains a sensitive term, or its value looks like an opaque
/// token: longer than 20 characters, no whitespace, only token characters and at least one
/// separator.
pub fn is_secret(key: &str, value: &str) -> bool {
    let key = key.to_ascii_lowercase();
    if SENSITIVE_KEY_TERMS.iter().any(|term| key.contains(term)) {
        return true;
    }
    if key
        .split(['_', '-', '.'])
        .any(|segment| SENSITIVE_KEY_SEGMENTS.contains(&segment))
    {
        return true;
    }

    looks_like_token(value)
}

/// Whether a value looks like an opaque credential.
pub fn looks_like_token(value: &str) -> bool {
    value.len() > TOKEN_MIN_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '/' | '='))
        && value.chars().any(|c| matches!(c, '-' | '_' | '.'))
        && value.chars().any(|c| c.is_ascii_digit())
}

/// Hashes a secret value for storage.
pub fn hash_secret(value: &str) -> String {
    format!("{}{}", SECRET_HASH_PREFIX, utils::hash_bytes(value))
}

/// Whether a stored value is a secret hash rather than plaintext.
pub fn is_hashed_secret(stored: &str) -> bool {
    stored.starts_with(SECRET_HASH_PREFIX)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
