//! Strongly typed identifiers shared across the crate.
//!
//! All identifiers are opaque strings on the wire; the newtypes only keep
//! a request id from being passed where a document id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
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

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// The account whose quota is checked.
    UserId
);
string_id!(
    /// Consultation or session grouping key; one push subscription per scope.
    ScopeId
);
string_id!(
    /// Server-assigned id of a generation request.
    RequestId
);
string_id!(
    /// Id of a generated artifact, set on COMPLETED.
    DocumentId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = RequestId::new("req-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""req-1""#);
        let parsed: DocumentId = serde_json::from_str(r#""doc-9""#).unwrap();
        assert_eq!(parsed.as_str(), "doc-9");
    }

    #[test]
    fn display_is_raw_value() {
        assert_eq!(ScopeId::from("consult-42").to_string(), "consult-42");
    }
}
