//! Maps fuzzer-kind strings (case-insensitive, including aliases) to adapter
//! instances (spec.md §4.2), grounded on the original `FuzzerRegistry`
//! (`examples/original_source/src/fuzzflow/adapters/registry.py`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{Error, Result};

use super::afl::AflAdapter;
use super::libfuzzer::LibFuzzerAdapter;
use super::FuzzerAdapter;

pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn FuzzerAdapter>>,
}

impl AdapterRegistry {
    /// Built-in registry seeded with the AFL-family and libFuzzer adapters
    /// under their canonical aliases.
    pub fn with_defaults(afl_dir: PathBuf) -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        let afl: Arc<dyn FuzzerAdapter> = Arc::new(AflAdapter::new(afl_dir));
        registry.register("afl", afl.clone());
        registry.register("afl++", afl.clone());
        registry.register("aflplusplus", afl);
        registry.register("libfuzzer", Arc::new(LibFuzzerAdapter));
        registry
    }

    pub fn register(&mut self, name: &str, adapter: Arc<dyn FuzzerAdapter>) {
        self.adapters.insert(name.to_lowercase(), adapter);
    }

    /// Returns the adapter for `kind`, or an enumerated "unsupported kind"
    /// error listing the available kinds (spec.md §4.2).
    pub fn get(&self, kind: &str) -> Result<Arc<dyn FuzzerAdapter>> {
        self.adapters
            .get(&kind.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnsupportedFuzzer {
                kind: kind.to_string(),
                available: self.list(),
            })
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults(PathBuf::from("/usr/local/bin"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_aliases_case_insensitively() {
        let registry = AdapterRegistry::default();
        assert!(registry.get("AFL++").is_ok());
        assert!(registry.get("LibFuzzer").is_ok());
    }

    #[test]
    fn unknown_kind_lists_available() {
        let registry = AdapterRegistry::default();
        let err = registry.get("honggfuzz").unwrap_err();
        match err {
            Error::UnsupportedFuzzer { kind, available } => {
                assert_eq!(kind, "honggfuzz");
                assert!(available.contains(&"afl".to_string()));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
