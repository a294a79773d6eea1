//! Docker-compatible identifiers.
//!
//! Containers, networks, and exec instances all use the Docker convention:
//! 64 lowercase hex characters, abbreviated to a 12-character short form
//! for display and prefix lookup.

use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a fresh 64-hex Docker-style ID.
///
/// A 32-hex UUIDv4 simple string concatenated with itself. This matches
/// the engine's historical ID generator; the doubled half means 128 bits
/// of entropy presented as 256.
fn generate_hex64() -> String {
    let half = uuid::Uuid::new_v4().simple().to_string();
    format!("{half}{half}")
}

fn is_hex64(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
}

macro_rules! hex64_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Length of the full ID (64 hex chars).
            pub const FULL_LENGTH: usize = 64;

            /// Length of the short display form.
            pub const SHORT_LENGTH: usize = 12;

            /// Generate a new random ID.
            pub fn new() -> Self {
                Self(generate_hex64())
            }

            /// Parse an existing 64-hex string.
            pub fn parse(s: &str) -> Option<Self> {
                if is_hex64(s) { Some(Self(s.to_string())) } else { None }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 12 characters, for display and prefix matching.
            pub fn short(&self) -> &str {
                &self.0[..Self::SHORT_LENGTH]
            }

            pub fn starts_with(&self, prefix: &str) -> bool {
                self.0.starts_with(prefix)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.short())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.0.as_bytes())))
            }
        }
    };
}

hex64_id! {
    /// Container identifier.
    ContainerId
}

hex64_id! {
    /// Network identifier.
    NetworkId
}

hex64_id! {
    /// Exec-instance identifier (in-memory only, never persisted).
    ExecId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_64_lowercase_hex() {
        let id = ContainerId::new();
        assert_eq!(id.as_str().len(), ContainerId::FULL_LENGTH);
        assert!(
            id.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
        );
    }

    #[test]
    fn id_is_uuid_hex_doubled() {
        let id = NetworkId::new();
        let (a, b) = id.as_str().split_at(32);
        assert_eq!(a, b);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ContainerId::new(), ContainerId::new());
        assert_ne!(ExecId::new(), ExecId::new());
    }

    #[test]
    fn short_form_is_a_prefix() {
        let id = ContainerId::new();
        assert_eq!(id.short().len(), ContainerId::SHORT_LENGTH);
        assert!(id.as_str().starts_with(id.short()));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(ContainerId::parse("abc").is_none());
        assert!(ContainerId::parse(&"G".repeat(64)).is_none());
        assert!(ContainerId::parse(&"A".repeat(64)).is_none());
        let valid = "a".repeat(64);
        assert_eq!(ContainerId::parse(&valid).unwrap().as_str(), valid);
    }
}
