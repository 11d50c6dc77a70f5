use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::dimension::Dimension;
use crate::error::{FlagsError, Result};
use crate::fetch_vector::FetchVector;
use crate::flag_data::{FlagData, FlagId};
use crate::source::{decode_or_warn, FlagSource};

/// A typed flag with its compiled-in default.
///
/// ```
/// use std::sync::Arc;
/// use flagdb_lib::{BootstrapSource, Dimension, FlagData, FlagDefinition, FlagId};
///
/// let timeout = FlagDefinition::new(FlagId::new("request-timeout-ms").unwrap(), 500_i64);
/// let source = Arc::new(BootstrapSource::from_flags(Vec::<FlagData>::new()));
/// let bound = timeout.bind(source).with(Dimension::ZoneId, "zone-a");
/// assert_eq!(bound.value(), 500);
/// ```
#[derive(Debug, Clone)]
pub struct FlagDefinition<T> {
    id: FlagId,
    default: T,
}

impl<T: DeserializeOwned + Clone> FlagDefinition<T> {
    pub fn new(id: FlagId, default: T) -> Self {
        Self { id, default }
    }

    pub fn id(&self) -> &FlagId {
        &self.id
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Attaches the definition to a source with an empty context.
    pub fn bind(&self, source: Arc<dyn FlagSource>) -> BoundFlag<T> {
        BoundFlag {
            definition: self.clone(),
            source,
            context: FetchVector::new(),
        }
    }

    /// Checks that `data` belongs to this flag and every rule value decodes
    /// as `T`. Useful before writing operator-supplied data.
    pub fn validate(&self, data: &FlagData) -> Result<()> {
        if data.id() != &self.id {
            return Err(FlagsError::IdMismatch {
                expected: self.id.to_string(),
                found: data.id().to_string(),
            });
        }
        for (index, rule) in data.rules().iter().enumerate() {
            if let Some(value) = rule.value() {
                value.decode::<T>().map_err(|e| {
                    FlagsError::Malformed(format!("rule {index} of {}: {e}", self.id))
                })?;
            }
        }
        Ok(())
    }
}

/// A flag definition bound to a source and an evaluation context.
#[derive(Clone)]
pub struct BoundFlag<T> {
    definition: FlagDefinition<T>,
    source: Arc<dyn FlagSource>,
    context: FetchVector,
}

impl<T: DeserializeOwned + Clone> BoundFlag<T> {
    /// Returns a copy bound to a context with `dimension` set.
    #[must_use]
    pub fn with(&self, dimension: Dimension, value: impl Into<String>) -> Self {
        Self {
            definition: self.definition.clone(),
            source: Arc::clone(&self.source),
            context: self.context.with(dimension, value),
        }
    }

    pub fn context(&self) -> &FetchVector {
        &self.context
    }

    /// The resolved value, or the compiled-in default when no source has a
    /// matching rule or the stored value does not decode.
    pub fn value(&self) -> T {
        let id = &self.definition.id;
        self.source
            .resolve(id, &self.context)
            .and_then(|raw| decode_or_warn(id, raw))
            .unwrap_or_else(|| self.definition.default.clone())
    }
}
