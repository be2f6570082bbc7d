use std::fmt;
use std::str::FromStr;

use crate::ids::SessionId;

/// URI scheme of share links.
pub const LINK_SCHEME: &str = "zkv";

/// `zkv://<sessionId>/<urlEncodedFileName>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub session_id: SessionId,
    pub file_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkParseError {
    #[error("link must start with {LINK_SCHEME}://")]
    Scheme,
    #[error("link has no file name segment")]
    MissingName,
    #[error("session id {0:?} is not hex")]
    SessionId(String),
    #[error("file name is not valid UTF-8 after decoding")]
    Encoding,
}

impl ShareLink {
    pub fn new(session_id: SessionId, file_name: impl Into<String>) -> Self {
        Self {
            session_id,
            file_name: file_name.into(),
        }
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            LINK_SCHEME,
            self.session_id,
            urlencoding::encode(&self.file_name)
        )
    }
}

impl FromStr for ShareLink {
    type Err = LinkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix(LINK_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or(LinkParseError::Scheme)?;
        let (session, name) = rest.split_once('/').ok_or(LinkParseError::MissingName)?;

        if session.is_empty() || !session.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LinkParseError::SessionId(session.to_string()));
        }
        if name.is_empty() {
            return Err(LinkParseError::MissingName);
        }
        let file_name = urlencoding::decode(name)
            .map_err(|_| LinkParseError::Encoding)?
            .into_owned();

        Ok(Self {
            session_id: SessionId::new(session.to_ascii_lowercase()),
            file_name,
        })
    }
}
