use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The webapp exports a missing id as an empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Server-assigned identity of an event.
    EventId
);
string_id!(
    /// Server-assigned identity of a candidate location.
    LocationId
);
string_id!(
    /// Server-assigned identity of a user (members, owners, voters).
    UserId
);
string_id!(
    /// Identity of one location's vote record within a voting occurrence.
    VotesId
);

/// Monotonic change marker attached to server state.
///
/// Revision 0 means "unknown", which every real revision supersedes.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub fn is_newer_than(self, other: Revision) -> bool {
        self > other
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Reference to a document (image) stored by the webapp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoRef {
    pub id: String,
    pub etag: String,
}

impl PhotoRef {
    /// Build a reference from the exported `photoId`/`photoETag` pair,
    /// which the server leaves empty when no photo is attached.
    pub fn from_parts(id: &str, etag: &str) -> Option<Self> {
        if id.is_empty() {
            None
        } else {
            Some(Self {
                id: id.to_string(),
                etag: etag.to_string(),
            })
        }
    }
}
