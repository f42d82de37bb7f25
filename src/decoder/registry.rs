//! Name → constructor table for decoders.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{builtin, Decoder, DecoderKind};
use crate::config::ConfigError;

type Constructor = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;

struct Entry {
    kind: DecoderKind,
    description: String,
    constructor: Constructor,
}

/// Registry of known decoders, keyed by name.
///
/// Built and populated by the caller and passed to whoever needs it; each
/// test can build its own.
#[derive(Default)]
pub struct DecoderRegistry {
    entries: BTreeMap<String, Entry>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every decoder shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register a decoder under the name its constructor reports. A later
    /// registration of the same name replaces the earlier one.
    pub fn register<F>(&mut self, constructor: F)
    where
        F: Fn() -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        let sample = constructor();
        let name = sample.name().to_string();
        let entry = Entry {
            kind: sample.kind(),
            description: sample.description().to_string(),
            constructor: Arc::new(constructor),
        };
        if self.entries.insert(name.clone(), entry).is_some() {
            tracing::warn!(decoder = %name, "decoder registered twice, keeping the latest");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, kind, description)` of every registered decoder.
    pub fn describe(&self) -> Vec<(&str, DecoderKind, &str)> {
        self.entries
            .iter()
            .map(|(name, e)| (name.as_str(), e.kind, e.description.as_str()))
            .collect()
    }

    /// Build a fresh instance of `name`.
    pub fn build(&self, name: &str) -> Option<Box<dyn Decoder>> {
        self.entries.get(name).map(|e| (e.constructor)())
    }

    /// Resolve comma separated include and exclude lists to decoder names.
    ///
    /// An empty include list selects every registered decoder. Names listed
    /// in both lists are excluded. Every listed name must be registered.
    pub fn select(&self, include: &str, exclude: &str) -> Result<Vec<String>, ConfigError> {
        let included = self.parse_list(include)?;
        let excluded = self.parse_list(exclude)?;

        let selected: Vec<String> = self
            .entries
            .keys()
            .filter(|name| included.is_empty() || included.contains(*name))
            .filter(|name| !excluded.contains(*name))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(ConfigError::NoDecodersSelected {
                include: include.to_string(),
                exclude: exclude.to_string(),
            });
        }
        tracing::debug!(decoders = ?selected, "decoders selected");
        Ok(selected)
    }

    fn parse_list(&self, list: &str) -> Result<Vec<String>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                if self.contains(name) {
                    Ok(name.to_string())
                } else {
                    Err(ConfigError::UnknownDecoder(name.to_string()))
                }
            })
            .collect()
    }
}
