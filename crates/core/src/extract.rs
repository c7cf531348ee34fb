//! Media reference extraction from document content trees.

use crate::config::MediaConfig;
use crate::media::{MediaKey, key_from_url, normalize_cdn_base};
use serde_json::Value;
use std::collections::HashSet;

/// Finds managed media keys referenced anywhere in a JSON content tree.
///
/// Every string scalar is tested as a whole URL. Values stored under one of
/// the configured media-bearing field names are additionally split on
/// whitespace, with separator commas trimmed from each token, so that
/// `srcset`-style candidate lists are covered. Commas inside a URL are kept.
/// The walk is schema-agnostic: unknown node kinds are visited like any other
/// object.
#[derive(Debug, Clone)]
pub struct MediaExtractor {
    cdn_base: String,
    allowed_prefix: String,
    media_fields: HashSet<String>,
}

impl MediaExtractor {
    pub fn new(
        cdn_base_url: &str,
        allowed_prefix: impl Into<String>,
        media_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            cdn_base: normalize_cdn_base(cdn_base_url),
            allowed_prefix: allowed_prefix.into(),
            media_fields: media_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            &config.cdn_base_url,
            config.allowed_prefix.clone(),
            config.media_fields.iter().cloned(),
        )
    }

    pub fn cdn_base(&self) -> &str {
        &self.cdn_base
    }

    pub fn allowed_prefix(&self) -> &str {
        &self.allowed_prefix
    }

    /// Extract the distinct managed keys referenced by `content`.
    pub fn extract(&self, content: &Value) -> HashSet<MediaKey> {
        let mut keys = HashSet::new();
        // Explicit stack: user content can nest deeper than the call stack allows.
        let mut stack: Vec<(Option<&str>, &Value)> = vec![(None, content)];

        while let Some((field, node)) = stack.pop() {
            match node {
                Value::Object(map) => {
                    stack.extend(map.iter().map(|(name, child)| (Some(name.as_str()), child)));
                }
                // Array elements inherit the field they were stored under.
                Value::Array(items) => {
                    stack.extend(items.iter().map(|child| (field, child)));
                }
                Value::String(text) => {
                    let is_media_field = field.is_some_and(|f| self.media_fields.contains(f));
                    self.collect_from_str(text, is_media_field, &mut keys);
                }
                Value::Null | Value::Bool(_) | Value::Number(_) => {}
            }
        }

        keys
    }

    /// Whether `key` falls under the managed prefix.
    pub fn is_managed(&self, key: &MediaKey) -> bool {
        key.starts_with(&self.allowed_prefix)
    }

    fn collect_from_str(&self, text: &str, tokenize: bool, keys: &mut HashSet<MediaKey>) {
        if let Some(key) = self.managed_key(text) {
            keys.insert(key);
        }
        if tokenize {
            for token in text.split_whitespace() {
                if token.len() == text.len() {
                    continue;
                }
                // `1x,https://...` when a candidate follows a descriptor without a space.
                let token = match token.find(&format!(",{}", self.cdn_base)) {
                    Some(at) => &token[at + 1..],
                    None => token,
                };
                let token = token.trim_matches(',');
                if token.is_empty() {
                    continue;
                }
                if let Some(key) = self.managed_key(token) {
                    keys.insert(key);
                }
            }
        }
    }

    fn managed_key(&self, candidate: &str) -> Option<MediaKey> {
        key_from_url(candidate, &self.cdn_base).filter(|key| self.is_managed(key))
    }
}
