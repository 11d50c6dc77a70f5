use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FlagsError, Result};
use crate::fetch_vector::FetchVector;
use crate::rule::{RawFlag, Rule};

/// Identifier of a flag. Doubles as the node name in the coordination store,
/// so it is restricted to `[A-Za-z0-9._-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlagId(String);

impl FlagId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(FlagsError::InvalidFlagId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for FlagId {
    type Error = FlagsError;

    fn try_from(value: String) -> Result<Self> {
        FlagId::new(value)
    }
}

impl From<FlagId> for String {
    fn from(id: FlagId) -> Self {
        id.0
    }
}

/// Every override known for one flag: an ordered rule list plus the
/// attributes naming the slice of the fleet the record is meant for.
///
/// Values are never edited in place. A change is a new `FlagData` written
/// over the old one, so readers can share instances freely.
///
/// The canonical wire form orders keys `id`, `rules`, `attributes` and omits
/// the latter two when empty:
///
/// ```
/// use flagdb_lib::{Condition, Dimension, FetchVector, FlagData, FlagId, Rule};
///
/// let data = FlagData::new(
///     FlagId::new("id").unwrap(),
///     FetchVector::new().with(Dimension::ZoneId, "zone-a"),
///     vec![Rule::new(
///         vec![Condition::whitelist(Dimension::Hostname, ["host1"])],
///         Some(13.into()),
///     )],
/// );
/// assert_eq!(
///     data.to_json_string().unwrap(),
///     r#"{"id":"id","rules":[{"conditions":[{"type":"whitelist","dimension":"hostname","values":["host1"]}],"value":13}],"attributes":{"zone":"zone-a"}}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagData {
    id: FlagId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "FetchVector::is_empty")]
    attributes: FetchVector,
}

impl FlagData {
    pub fn new(id: FlagId, attributes: FetchVector, rules: Vec<Rule>) -> Self {
        Self {
            id,
            rules,
            attributes,
        }
    }

    /// A record with no rules, which resolves to nothing for every context.
    pub fn empty(id: FlagId) -> Self {
        Self::new(id, FetchVector::new(), Vec::new())
    }

    pub fn id(&self) -> &FlagId {
        &self.id
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn attributes(&self) -> &FetchVector {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The value of the first matching rule. `None` when no rule matches, or
    /// when the first matching rule carries no value.
    pub fn resolve(&self, context: &FetchVector) -> Option<&RawFlag> {
        self.rules
            .iter()
            .find(|rule| rule.matches(context))
            .and_then(Rule::value)
    }

    /// Specializes the record for a partially known context. Rules that
    /// cannot match are dropped, satisfied conditions are removed from the
    /// rest, and nothing after the first unconditional rule is kept.
    /// Resolving the result with any extension of `context` gives the same
    /// value as resolving `self`.
    pub fn partial_resolve(&self, context: &FetchVector) -> FlagData {
        let mut rules = Vec::new();
        for rule in &self.rules {
            if let Some(specialized) = rule.partial_resolve(context) {
                let terminal = specialized.is_unconditional();
                rules.push(specialized);
                if terminal {
                    break;
                }
            }
        }
        FlagData::new(self.id.clone(), self.attributes.clone(), rules)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| FlagsError::Malformed(e.to_string()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_json_bytes(json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::dimension::Dimension;

    const EXAMPLE: &str = r#"{"id":"id","rules":[{"conditions":[{"type":"whitelist","dimension":"hostname","values":["host1"]}],"value":13}],"attributes":{"zone":"zone-a"}}"#;

    fn id(s: &str) -> FlagId {
        FlagId::new(s).unwrap()
    }

    fn host(h: &str) -> FetchVector {
        FetchVector::new().with(Dimension::Hostname, h)
    }

    #[test]
    fn test_flag_id_validation() {
        assert!(FlagId::new("use-new-feature_2.x").is_ok());
        assert!(matches!(FlagId::new(""), Err(FlagsError::InvalidFlagId(_))));
        assert!(FlagId::new("a/b").is_err());
        assert!(FlagId::new("..").is_err());
        assert!(FlagId::new("with space").is_err());
    }

    #[test]
    fn test_example_serializes_canonically() {
        let data = FlagData::new(
            id("id"),
            FetchVector::new().with(Dimension::ZoneId, "zone-a"),
            vec![Rule::new(
                vec![Condition::whitelist(Dimension::Hostname, ["host1"])],
                Some(13.into()),
            )],
        );
        assert_eq!(data.to_json_string().unwrap(), EXAMPLE);
        assert_eq!(FlagData::from_json_str(EXAMPLE).unwrap(), data);

        assert_eq!(data.resolve(&host("host1")), Some(&RawFlag::from(13)));
        assert_eq!(data.resolve(&host("host2")), None);
    }

    #[test]
    fn test_first_match_wins() {
        let data = FlagData::new(
            id("first-match"),
            FetchVector::new(),
            vec![
                Rule::new(
                    vec![Condition::whitelist(Dimension::Hostname, ["host1"])],
                    Some(1.into()),
                ),
                Rule::catch_all(Some(2.into())),
            ],
        );
        assert_eq!(data.resolve(&host("host1")), Some(&RawFlag::from(1)));
        assert_eq!(data.resolve(&host("host9")), Some(&RawFlag::from(2)));
    }

    #[test]
    fn test_catch_all_first_shadows_later_rules() {
        let data = FlagData::new(
            id("shadowed"),
            FetchVector::new(),
            vec![
                Rule::catch_all(Some(false.into())),
                Rule::new(
                    vec![Condition::whitelist(Dimension::Hostname, ["host1"])],
                    Some(true.into()),
                ),
            ],
        );
        assert_eq!(data.resolve(&host("host1")), Some(&RawFlag::from(false)));
    }

    #[test]
    fn test_matching_rule_without_value_resolves_to_nothing() {
        let data = FlagData::new(
            id("no-value"),
            FetchVector::new(),
            vec![
                Rule::new(vec![Condition::whitelist(Dimension::Hostname, ["host1"])], None),
                Rule::catch_all(Some(true.into())),
            ],
        );
        assert_eq!(data.resolve(&host("host1")), None);
        assert_eq!(data.resolve(&host("host2")), Some(&RawFlag::from(true)));
    }

    #[test]
    fn test_no_rules_resolves_to_nothing() {
        let data = FlagData::empty(id("empty"));
        assert!(data.is_empty());
        assert_eq!(data.resolve(&host("host1")), None);
        assert_eq!(data.to_json_string().unwrap(), r#"{"id":"empty"}"#);
    }

    #[test]
    fn test_missing_id_is_malformed() {
        assert!(matches!(
            FlagData::from_json_str(r#"{"rules":[]}"#),
            Err(FlagsError::Malformed(_))
        ));
        assert!(FlagData::from_json_str(r#"{"id":"bad/id"}"#).is_err());
        assert!(FlagData::from_json_str("not json").is_err());
    }

    #[test]
    fn test_unknown_condition_survives_round_trip_and_never_matches() {
        let json = r#"{"id":"future","rules":[{"conditions":[{"type":"percentage","dimension":"hostname","percent":50}],"value":true},{"value":false}]}"#;
        let data = FlagData::from_json_str(json).unwrap();
        assert_eq!(data.to_json_string().unwrap(), json);
        assert_eq!(data.resolve(&host("host1")), Some(&RawFlag::from(false)));
    }

    #[test]
    fn test_partial_resolve_keeps_semantics() {
        let data = FlagData::new(
            id("partial"),
            FetchVector::new(),
            vec![
                Rule::new(
                    vec![Condition::whitelist(Dimension::ZoneId, ["zone-b"])],
                    Some(1.into()),
                ),
                Rule::new(
                    vec![
                        Condition::whitelist(Dimension::ZoneId, ["zone-a"]),
                        Condition::whitelist(Dimension::Hostname, ["host1"]),
                    ],
                    Some(2.into()),
                ),
                Rule::new(
                    vec![Condition::whitelist(Dimension::ZoneId, ["zone-a"])],
                    Some(3.into()),
                ),
                Rule::catch_all(Some(4.into())),
            ],
        );
        let zone_a = FetchVector::new().with(Dimension::ZoneId, "zone-a");
        let specialized = data.partial_resolve(&zone_a);

        assert_eq!(specialized.rules().len(), 2);
        assert_eq!(specialized.rules()[1], Rule::catch_all(Some(3.into())));

        for h in ["host1", "host2"] {
            let full = zone_a.with(Dimension::Hostname, h);
            assert_eq!(specialized.resolve(&full), data.resolve(&full));
        }
    }
}
