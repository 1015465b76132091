//! # Channel wire names
//!
//! Postgres LISTEN accepts identifiers of at most 63 characters, and the
//! identifier charset is narrower than what a fully-qualified Rust type path
//! contains. Channels therefore get two names:
//!
//! - a **logical name** derived from the channel type's path, lowercased and
//!   sanitized to `[a-z0-9_]` (human-readable, stored in the outbox table),
//! - a **wire name** used with LISTEN/NOTIFY: a fixed prefix plus a truncated
//!   SHA-256 digest of the logical name, always protocol-legal and well under
//!   the length ceiling.
//!
//! Distinct channel types hashing to the same wire name is a fatal
//! configuration error; the registry checks for it at registration time.

use sha2::{Digest, Sha256};

/// Postgres LISTEN identifiers are at most 63 characters
pub const MAX_POSTGRES_CHANNEL_LENGTH: usize = 63;

/// Fixed namespace prefix for all pgbus wire names
pub const WIRE_PREFIX: &str = "pgbus_";

/// Hex characters of the digest kept in the wire name
const WIRE_DIGEST_LEN: usize = 40;

/// Derive the logical channel name for a type from its fully-qualified path.
pub fn logical_name<T: ?Sized>() -> String {
    sanitize(std::any::type_name::<T>())
}

/// Lowercase and map everything outside `[a-z0-9_]` to `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the short, hashed LISTEN/NOTIFY identifier for a logical name.
pub fn wire_name(logical: &str) -> String {
    let digest = Sha256::digest(logical.as_bytes());
    let digest_hex = hex::encode(digest);
    format!("{WIRE_PREFIX}{}", &digest_hex[..WIRE_DIGEST_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SomeChannel;

    mod nested {
        pub struct SomeChannel;
    }

    #[test]
    fn test_logical_name_is_sanitized() {
        let name = logical_name::<SomeChannel>();
        assert!(name.ends_with("somechannel"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_logical_names_distinguish_scopes() {
        assert_ne!(
            logical_name::<SomeChannel>(),
            logical_name::<nested::SomeChannel>()
        );
    }

    #[test]
    fn test_wire_name_fits_protocol_limit() {
        let wire = wire_name(&logical_name::<SomeChannel>());
        assert!(wire.len() <= MAX_POSTGRES_CHANNEL_LENGTH);
        assert!(wire.starts_with(WIRE_PREFIX));
        assert_eq!(wire.len(), WIRE_PREFIX.len() + 40);
    }

    #[test]
    fn test_wire_name_is_stable_and_distinct() {
        let a = wire_name("module_a_channel");
        assert_eq!(a, wire_name("module_a_channel"));
        assert_ne!(a, wire_name("module_b_channel"));
    }

    #[test]
    fn test_sanitize_replaces_path_separators() {
        assert_eq!(sanitize("my_app::channels::Reads"), "my_app__channels__reads");
        assert_eq!(sanitize("RowChange<Spec>"), "rowchange_spec_");
    }
}
