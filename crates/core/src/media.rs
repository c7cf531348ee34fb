//! Media keys: the canonical identity of one stored asset.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum accepted key length in bytes (S3 object key limit).
pub const MAX_MEDIA_KEY_LEN: usize = 1024;

/// Storage path of one managed asset, e.g. `ebooks/book1/img1.png`.
///
/// Keys are relative, contain no `..` segments and no control characters,
/// so they can be used directly as object-store keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaKey(String);

impl MediaKey {
    /// Create from a string, validating format.
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(crate::Error::InvalidMediaKey(
                "media key cannot be empty".to_string(),
            ));
        }
        if key.len() > MAX_MEDIA_KEY_LEN {
            return Err(crate::Error::InvalidMediaKey(format!(
                "media key exceeds {MAX_MEDIA_KEY_LEN} bytes"
            )));
        }
        if key.starts_with('/') {
            return Err(crate::Error::InvalidMediaKey(format!(
                "media key must be relative: {key}"
            )));
        }
        if key.ends_with('/') {
            return Err(crate::Error::InvalidMediaKey(format!(
                "media key must name an object, not a prefix: {key}"
            )));
        }
        if key.split('/').any(|segment| segment == ".." || segment == ".") {
            return Err(crate::Error::InvalidMediaKey(format!(
                "media key contains relative segments: {key}"
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(crate::Error::InvalidMediaKey(
                "media key contains control characters".to_string(),
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl TryFrom<String> for MediaKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<MediaKey> for String {
    fn from(key: MediaKey) -> Self {
        key.0
    }
}

impl AsRef<str> for MediaKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaKey({})", self.0)
    }
}

impl fmt::Display for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalise a CDN base so it always ends with exactly one `/`.
pub fn normalize_cdn_base(base: &str) -> String {
    format!("{}/", base.trim().trim_end_matches('/'))
}

/// Derive the media key an absolute URL points at.
///
/// `cdn_base` must already be normalised with [`normalize_cdn_base`]. Returns
/// `None` when the URL is not served from the CDN or does not decode to a
/// valid key. Query strings and fragments are dropped. Raw whitespace never
/// appears in a single URL, so a candidate list is rejected as a whole.
pub fn key_from_url(url: &str, cdn_base: &str) -> Option<MediaKey> {
    let rest = url.trim().strip_prefix(cdn_base)?;
    if rest.contains(char::is_whitespace) {
        return None;
    }
    let path = rest.split(['?', '#']).next().unwrap_or_default();
    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    MediaKey::new(decoded.into_owned()).ok()
}
