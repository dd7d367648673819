use core::fmt;
use serde::{Deserialize, Serialize};

/// Caller-supplied identity of a worker.
///
/// Identifiers are either signed 64-bit integers or strings and must be unique
/// among the workers currently on duty. The two shapes never compare equal:
/// `7` and `"7"` name different workers.
///
/// On the wire the identifier is untagged, so a JSON number decodes to
/// [`WorkerId::Number`] and a JSON string to [`WorkerId::Name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerId {
    Number(i64),
    Name(String),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for WorkerId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for WorkerId {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for WorkerId {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}
