use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a call by its type (e.g. `default`, `audio_room`) and id.
/// The pair is rendered as the call id `type:id` (`cid`) on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId {
    pub call_type: String,
    pub id: String,
}

impl CallId {
    pub fn new(call_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            call_type: call_type.into(),
            id: id.into(),
        }
    }

    pub fn cid(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.call_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid call cid: {0:?}")]
pub struct InvalidCid(pub String);

impl FromStr for CallId {
    type Err = InvalidCid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((call_type, id)) if !call_type.is_empty() && !id.is_empty() => {
                Ok(Self::new(call_type, id))
            }
            _ => Err(InvalidCid(s.to_string())),
        }
    }
}

impl TryFrom<String> for CallId {
    type Error = InvalidCid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CallId> for String {
    fn from(value: CallId) -> Self {
        value.to_string()
    }
}
