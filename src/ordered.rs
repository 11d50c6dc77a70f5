use std::collections::HashMap;
use std::sync::Arc;

use crate::flag_data::{FlagData, FlagId};
use crate::source::FlagSource;

/// Layers several sources, highest priority first.
///
/// A lookup takes the whole record from the first source that has one; rule
/// lists are never merged across sources.
#[derive(Clone, Default)]
pub struct OrderedFlagSource {
    sources: Vec<Arc<dyn FlagSource>>,
}

impl OrderedFlagSource {
    pub fn new(sources: Vec<Arc<dyn FlagSource>>) -> Self {
        Self { sources }
    }

    /// Appends a source below every source already present.
    #[must_use]
    pub fn then(mut self, source: Arc<dyn FlagSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl FlagSource for OrderedFlagSource {
    fn get(&self, id: &FlagId) -> Option<FlagData> {
        self.sources.iter().find_map(|source| source.get(id))
    }

    fn get_all(&self) -> HashMap<FlagId, FlagData> {
        let mut all = HashMap::new();
        // lowest priority first so higher sources overwrite
        for source in self.sources.iter().rev() {
            all.extend(source.get_all());
        }
        all
    }
}

impl std::fmt::Debug for OrderedFlagSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedFlagSource")
            .field("sources", &self.sources.len())
            .finish()
    }
}
