// Channel Model
// Channel identity and outbound destinations

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque identifier for a logical destination context (e.g. a chat).
/// Deserializes from a string or an integer chat id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(Self::from(id)),
            Raw::Text(id) if id.trim().is_empty() => Err(D::Error::custom("channel id must not be empty")),
            Raw::Text(id) => Ok(Self::new(id.trim())),
        }
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<i64> for ChannelId {
    fn from(value: i64) -> Self {
        Self::new(value.to_string())
    }
}

/// Outbound stream destination: base RTMP endpoint plus the bound stream key.
///
/// `Debug` and `Display` never print the key.
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    url: String,
}

impl Destination {
    pub fn new(base_url: &str, stream_key: &str) -> Self {
        Self {
            url: format!("{}{}", base_url.trim(), stream_key.trim()),
        }
    }

    /// Full URL including the secret key, for the encoder only
    pub fn as_url(&self) -> &str {
        &self.url
    }

    pub fn redacted(&self) -> String {
        redact_rtmp_url(&self.url)
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination").field("url", &self.redacted()).finish()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Replace the stream key (last path segment) of an RTMP URL with `***`.
/// Non-RTMP strings are returned unchanged.
pub fn redact_rtmp_url(url: &str) -> String {
    if !(url.starts_with("rtmp://") || url.starts_with("rtmps://")) {
        return url.to_string();
    }

    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return url.to_string(),
    };

    let (host, path) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return url.to_string(),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.split_last() {
        Some((_, [])) => format!("{scheme}://{host}/***"),
        Some((_, prefix)) => format!("{scheme}://{host}/{}/***", prefix.join("/")),
        None => url.to_string(),
    }
}

/// Redact every RTMP URL embedded in free text (error messages, stderr lines)
pub fn redact_rtmp_urls_in(text: &str) -> String {
    if !(text.contains("rtmp://") || text.contains("rtmps://")) {
        return text.to_string();
    }

    text.split(' ')
        .map(|word| match word.find("rtmp://").or_else(|| word.find("rtmps://")) {
            Some(pos) => format!("{}{}", &word[..pos], redact_rtmp_url(&word[pos..])),
            None => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
