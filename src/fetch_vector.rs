use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dimension::Dimension;

/// A partial mapping from [`Dimension`] to value.
///
/// Serves both as the caller's evaluation context and as the scoping
/// attributes stored with a flag. The map is shared behind an `Arc`, so
/// clones are cheap and [`FetchVector::with`] copies only when it has to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchVector {
    values: Arc<BTreeMap<Dimension, String>>,
}

impl FetchVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a vector with `dimension` set to `value`; `self` is unchanged.
    #[must_use]
    pub fn with(&self, dimension: Dimension, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(dimension, value.into());
        Self {
            values: Arc::new(values),
        }
    }

    /// Returns a vector with every entry of `other` layered over `self`.
    #[must_use]
    pub fn with_all(&self, other: &FetchVector) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut values = (*self.values).clone();
        for (d, v) in other.iter() {
            values.insert(d.clone(), v.to_string());
        }
        Self {
            values: Arc::new(values),
        }
    }

    /// Returns a vector without `dimension`; `self` is unchanged.
    #[must_use]
    pub fn without(&self, dimension: &Dimension) -> Self {
        if !self.has_dimension(dimension) {
            return self.clone();
        }
        let mut values = (*self.values).clone();
        values.remove(dimension);
        Self {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, dimension: &Dimension) -> Option<&str> {
        self.values.get(dimension).map(String::as_str)
    }

    pub fn has_dimension(&self, dimension: &Dimension) -> bool {
        self.values.contains_key(dimension)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Dimension, &str)> {
        self.values.iter().map(|(d, v)| (d, v.as_str()))
    }
}

impl<V: Into<String>> FromIterator<(Dimension, V)> for FetchVector {
    fn from_iter<I: IntoIterator<Item = (Dimension, V)>>(iter: I) -> Self {
        let values = iter.into_iter().map(|(d, v)| (d, v.into())).collect();
        Self {
            values: Arc::new(values),
        }
    }
}

impl Serialize for FetchVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FetchVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = BTreeMap::<Dimension, String>::deserialize(deserializer)?;
        Ok(Self {
            values: Arc::new(values),
        })
    }
}
