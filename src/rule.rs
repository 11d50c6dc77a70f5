use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::fetch_vector::FetchVector;

/// An untyped flag value, exactly as stored on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawFlag(Value);

impl RawFlag {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.0.as_bool()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Decodes the value into any deserializable type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }
}

impl From<Value> for RawFlag {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<bool> for RawFlag {
    fn from(value: bool) -> Self {
        Self(Value::Bool(value))
    }
}

impl From<i64> for RawFlag {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<i32> for RawFlag {
    fn from(value: i32) -> Self {
        Self(Value::from(value))
    }
}

impl From<&str> for RawFlag {
    fn from(value: &str) -> Self {
        Self(Value::from(value))
    }
}

/// A conjunction of conditions and the value it yields when all hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<RawFlag>,
}

impl Rule {
    /// A JSON `null` value is the same as no value: the wire form never
    /// carries null-valued keys.
    pub fn new(conditions: Vec<Condition>, value: Option<RawFlag>) -> Self {
        Self {
            conditions,
            value: value.filter(|v| !v.is_null()),
        }
    }

    /// A rule without conditions, matching every context.
    pub fn catch_all(value: Option<RawFlag>) -> Self {
        Self::new(Vec::new(), value)
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn value(&self) -> Option<&RawFlag> {
        self.value.as_ref()
    }

    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }

    /// True when every condition matches; stops at the first that does not.
    pub fn matches(&self, context: &FetchVector) -> bool {
        self.conditions.iter().all(|c| c.matches(context))
    }

    /// Specializes the rule for a context where only some dimensions are
    /// known. Returns `None` when a condition on a known dimension fails;
    /// otherwise drops the conditions that are already satisfied.
    pub fn partial_resolve(&self, context: &FetchVector) -> Option<Rule> {
        let mut remaining = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            let decided = condition
                .dimension()
                .is_some_and(|d| context.has_dimension(d));
            if !decided {
                remaining.push(condition.clone());
            } else if !condition.matches(context) {
                return None;
            }
        }
        Some(Rule::new(remaining, self.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::Dimension;

    fn host_rule(host: &str, value: i64) -> Rule {
        Rule::new(
            vec![Condition::whitelist(Dimension::Hostname, [host])],
            Some(value.into()),
        )
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        let rule = Rule::catch_all(Some(true.into()));
        assert!(rule.matches(&FetchVector::new()));
        assert!(rule.matches(&FetchVector::new().with(Dimension::ZoneId, "zone-a")));
    }

    #[test]
    fn test_all_conditions_must_match() {
        let rule = Rule::new(
            vec![
                Condition::whitelist(Dimension::Hostname, ["host1"]),
                Condition::whitelist(Dimension::ZoneId, ["zone-a"]),
            ],
            Some(1.into()),
        );
        let both = FetchVector::new()
            .with(Dimension::Hostname, "host1")
            .with(Dimension::ZoneId, "zone-a");
        assert!(rule.matches(&both));
        assert!(!rule.matches(&both.with(Dimension::ZoneId, "zone-b")));
        assert!(!rule.matches(&both.without(&Dimension::ZoneId)));
    }

    #[test]
    fn test_partial_resolve() {
        let rule = Rule::new(
            vec![
                Condition::whitelist(Dimension::ZoneId, ["zone-a"]),
                Condition::whitelist(Dimension::Hostname, ["host1"]),
            ],
            Some(7.into()),
        );
        let zone_a = FetchVector::new().with(Dimension::ZoneId, "zone-a");
        let specialized = rule.partial_resolve(&zone_a).unwrap();
        assert_eq!(specialized, host_rule("host1", 7));

        let zone_b = FetchVector::new().with(Dimension::ZoneId, "zone-b");
        assert!(rule.partial_resolve(&zone_b).is_none());

        assert_eq!(rule.partial_resolve(&FetchVector::new()).unwrap(), rule);
    }

    #[test]
    fn test_wire_form_omits_empty_fields() {
        assert_eq!(serde_json::to_string(&Rule::default()).unwrap(), "{}");
        assert_eq!(
            serde_json::to_string(&Rule::catch_all(Some(false.into()))).unwrap(),
            r#"{"value":false}"#
        );
        let parsed: Rule = serde_json::from_str(r#"{"conditions":[],"value":null}"#).unwrap();
        assert_eq!(parsed, Rule::default());
    }

    #[test]
    fn test_null_value_is_no_value() {
        let rule = Rule::catch_all(Some(RawFlag::new(Value::Null)));
        assert_eq!(rule.value(), None);
        assert_eq!(rule, Rule::default());

        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, "{}");
        assert_eq!(serde_json::from_str::<Rule>(&json).unwrap(), rule);

        let conditional = Rule::new(
            vec![Condition::whitelist(Dimension::Hostname, ["h"])],
            Some(RawFlag::from(Value::Null)),
        );
        let json = serde_json::to_string(&conditional).unwrap();
        assert!(!json.contains("null"));
        assert_eq!(serde_json::from_str::<Rule>(&json).unwrap(), conditional);
    }

    #[test]
    fn test_raw_flag_decoding() {
        let raw = RawFlag::new(serde_json::json!(["a", "b"]));
        let list: Vec<String> = raw.decode().unwrap();
        assert_eq!(list, vec!["a", "b"]);
        assert!(raw.decode::<bool>().is_err());
        assert_eq!(RawFlag::from(13).as_i64(), Some(13));
        assert_eq!(RawFlag::from("x").as_str(), Some("x"));
    }
}
