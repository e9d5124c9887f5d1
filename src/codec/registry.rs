//! Lookup of codecs by the name recorded in commit points.

use std::sync::Arc;

use ahash::AHashMap;

use crate::codec::Codec;
use crate::config::IndexConfig;
use crate::error::{QuiverError, Result};

/// Known codecs, keyed by name, with one of them used for new segments.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: AHashMap<String, Arc<Codec>>,
    default: String,
}

impl CodecRegistry {
    /// A registry holding the standard codec, configured from `config`.
    pub fn with_config(config: &IndexConfig) -> Self {
        let codec = Arc::new(Codec::quiver10(config));
        let mut codecs = AHashMap::new();
        codecs.insert(codec.name().to_string(), codec);
        CodecRegistry {
            codecs,
            default: Codec::QUIVER10.to_string(),
        }
    }

    /// Add or replace a codec.
    pub fn register(&mut self, codec: Arc<Codec>) {
        log::debug!("Registering codec {}", codec.name());
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Use the registered codec `name` for new segments.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.codecs.contains_key(name) {
            return Err(QuiverError::invalid_argument(format!(
                "codec {name} is not registered"
            )));
        }
        self.default = name.to_string();
        Ok(())
    }

    /// The codec called `name`. An unknown name means the index was written
    /// by something this build cannot read.
    pub fn lookup(&self, name: &str) -> Result<Arc<Codec>> {
        self.codecs.get(name).cloned().ok_or_else(|| {
            QuiverError::corrupt_index(format!(
                "unknown codec {name:?}; registered codecs: {:?}",
                self.names()
            ))
        })
    }

    pub fn default_codec(&self) -> Result<Arc<Codec>> {
        self.lookup(&self.default)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::with_config(&IndexConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field_infos::{FieldInfosFormat, Quiver10FieldInfosFormat};

    #[test]
    fn test_lookup() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.names(), vec!["Quiver10".to_string()]);
        assert_eq!(registry.default_codec().unwrap().name(), "Quiver10");
        assert!(registry.lookup("Quiver10").is_ok());

        let err = registry.lookup("Lucene40").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_register_and_set_default() {
        let mut registry = CodecRegistry::default();
        assert!(registry.set_default("Custom").is_err());

        let custom = Codec::builder("Custom")
            .field_infos_format(|| {
                Ok(Arc::new(Quiver10FieldInfosFormat) as Arc<dyn FieldInfosFormat>)
            })
            .build();
        // Incomplete codecs are rejected by the builder.
        assert!(custom.is_err());

        registry.register(Arc::new(Codec::quiver10(&IndexConfig::default())));
        assert_eq!(registry.names().len(), 1);
        registry.set_default("Quiver10").unwrap();
    }
}
