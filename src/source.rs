use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::fetch_vector::FetchVector;
use crate::flag_data::{FlagData, FlagId};
use crate::rule::RawFlag;

/// Read access to flag data. Bootstrap sources and the flags database both
/// implement this, which lets [`OrderedFlagSource`](crate::OrderedFlagSource)
/// layer them.
///
/// Implementations answer from memory; none of these calls may wait on the
/// network.
pub trait FlagSource: Send + Sync {
    /// The record for `id`, if this source has one.
    fn get(&self, id: &FlagId) -> Option<FlagData>;

    /// Every record this source holds, keyed by id.
    fn get_all(&self) -> HashMap<FlagId, FlagData>;

    /// Resolves `id` against `context` to its raw value.
    fn resolve(&self, id: &FlagId, context: &FetchVector) -> Option<RawFlag> {
        self.get(id)?.resolve(context).cloned()
    }

    /// Resolves and decodes `id`. A stored value of the wrong shape is
    /// logged and treated as absent so the caller falls back to its default.
    fn resolve_as<T: DeserializeOwned>(&self, id: &FlagId, context: &FetchVector) -> Option<T>
    where
        Self: Sized,
    {
        decode_or_warn(id, self.resolve(id, context)?)
    }
}

pub(crate) fn decode_or_warn<T: DeserializeOwned>(id: &FlagId, raw: RawFlag) -> Option<T> {
    match raw.decode::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(flag_id = %id, error = %e, "flag value has unexpected type, ignoring it");
            None
        }
    }
}

impl<S: FlagSource + ?Sized> FlagSource for Arc<S> {
    fn get(&self, id: &FlagId) -> Option<FlagData> {
        (**self).get(id)
    }

    fn get_all(&self) -> HashMap<FlagId, FlagData> {
        (**self).get_all()
    }
}

impl<S: FlagSource + ?Sized> FlagSource for Box<S> {
    fn get(&self, id: &FlagId) -> Option<FlagData> {
        (**self).get(id)
    }

    fn get_all(&self) -> HashMap<FlagId, FlagData> {
        (**self).get_all()
    }
}
