//! Validated hex-string identifiers (§3): `ContentId`, `MetadataHash`,
//! `ContentHashSHA256`. Newtypes instead of bare `String` so the registry's
//! dual-key lookups can't accidentally compare a content id against a
//! metadata hash at the type level.

use std::fmt;

use crate::error::DccError;

macro_rules! hex_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(s: impl Into<String>) -> Result<Self, DccError> {
                let s = s.into();
                if s.len() != $len || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
                    return Err(DccError::InvalidArgument {
                        message: format!(
                            "{} must be {} lowercase hex characters, got {:?}",
                            stringify!($name),
                            $len,
                            s
                        ),
                    });
                }
                Ok($name(s))
            }

            /// Build an identifier without validating shape. Used by the
            /// blocklist, which stores poisoned ids verbatim even when
            /// malformed (spec §4.7: "invalid-shape ContentIds are accepted
            /// and stored, never normalized").
            pub fn new_unchecked(s: impl Into<String>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = DccError;
            fn try_from(s: String) -> Result<Self, DccError> {
                $name::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

hex_id!(
    ContentId,
    40,
    "SHA-1 over the canonical bencoded info-dict; 40 lowercase hex chars."
);
hex_id!(
    MetadataHash,
    64,
    "SHA-256 over a canonicalized provider-metadata record; 64 lowercase hex chars."
);
hex_id!(
    ContentHashSha256,
    64,
    "SHA-256 of the whole downloaded file; the authoritative post-download integrity hash."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_rejects_wrong_length() {
        assert!(ContentId::parse("abc").is_err());
    }

    #[test]
    fn content_id_rejects_uppercase() {
        let s: String = std::iter::repeat('A').take(40).collect();
        assert!(ContentId::parse(s).is_err());
    }

    #[test]
    fn content_id_accepts_valid_hex() {
        let s: String = std::iter::repeat('a').take(40).collect();
        assert!(ContentId::parse(s).is_ok());
    }

    #[test]
    fn new_unchecked_accepts_garbage() {
        let id = ContentId::new_unchecked("not-a-real-id");
        assert_eq!(id.as_str(), "not-a-real-id");
    }
}
