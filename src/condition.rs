use core::cmp::Ordering;
use core::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::dimension::Dimension;
use crate::fetch_vector::FetchVector;

/// A predicate over one dimension of a [`FetchVector`].
///
/// The wire form is an object keyed by a `type` discriminator. Objects whose
/// `type` this build does not recognise are kept verbatim in
/// [`Condition::Unknown`] and never match. Extra keys on a recognised type
/// are not kept and disappear on re-serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Matches when the dimension is present and its value is listed.
    Whitelist {
        dimension: Dimension,
        values: ValueSet,
    },
    /// Matches when the dimension is present and its value is not listed.
    Blacklist {
        dimension: Dimension,
        values: ValueSet,
    },
    /// Matches when the dimension holds a dotted version satisfying the predicate.
    Relational {
        dimension: Dimension,
        predicate: Predicate,
    },
    Unknown(Map<String, Value>),
}

impl Condition {
    pub fn whitelist<I, S>(dimension: Dimension, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Condition::Whitelist {
            dimension,
            values: values.into_iter().collect(),
        }
    }

    pub fn blacklist<I, S>(dimension: Dimension, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Condition::Blacklist {
            dimension,
            values: values.into_iter().collect(),
        }
    }

    pub fn relational(dimension: Dimension, predicate: Predicate) -> Self {
        Condition::Relational {
            dimension,
            predicate,
        }
    }

    /// The inspected dimension, or `None` for an unrecognised condition type.
    pub fn dimension(&self) -> Option<&Dimension> {
        match self {
            Condition::Whitelist { dimension, .. }
            | Condition::Blacklist { dimension, .. }
            | Condition::Relational { dimension, .. } => Some(dimension),
            Condition::Unknown(_) => None,
        }
    }

    /// An absent dimension never matches, nor does a dimension or condition
    /// type unknown to this build.
    pub fn matches(&self, context: &FetchVector) -> bool {
        let Some(dimension) = self.dimension() else {
            return false;
        };
        if !dimension.is_known() {
            return false;
        }
        let Some(value) = context.get(dimension) else {
            return false;
        };
        match self {
            Condition::Whitelist { values, .. } => values.contains(value),
            Condition::Blacklist { values, .. } => !values.contains(value),
            Condition::Relational { predicate, .. } => predicate.test(value),
            Condition::Unknown(_) => false,
        }
    }

    fn from_wire(mut object: Map<String, Value>) -> Result<Self, String> {
        let type_name = match object.get("type") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => return Err(format!("condition type must be a string, got {other}")),
            None => return Err("condition is missing 'type'".to_string()),
        };
        if !matches!(type_name.as_str(), "whitelist" | "blacklist" | "relational") {
            return Ok(Condition::Unknown(object));
        }

        let dimension = match object.remove("dimension") {
            Some(Value::String(s)) => Dimension::from_wire(&s),
            _ => return Err(format!("{type_name} condition is missing 'dimension'")),
        };

        if type_name == "relational" {
            let predicate = match object.remove("predicate") {
                Some(Value::String(s)) => s.parse::<Predicate>()?,
                _ => return Err("relational condition is missing 'predicate'".to_string()),
            };
            return Ok(Condition::Relational {
                dimension,
                predicate,
            });
        }

        let values = match object.remove("values") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(format!("{type_name} value must be a string, got {other}")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => return Err(format!("{type_name} 'values' must be an array, got {other}")),
        };

        Ok(if type_name == "whitelist" {
            Condition::whitelist(dimension, values)
        } else {
            Condition::blacklist(dimension, values)
        })
    }
}

/// Listed values of a whitelist or blacklist: duplicates dropped, first-seen
/// order kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueSet(Vec<String>);

impl ValueSet {
    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ValueSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut out: Vec<String> = Vec::new();
        for v in iter {
            let v = v.into();
            if !out.contains(&v) {
                out.push(v);
            }
        }
        ValueSet(out)
    }
}

impl Serialize for ValueSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let type_name = match self {
            Condition::Unknown(object) => return object.serialize(serializer),
            Condition::Whitelist { .. } => "whitelist",
            Condition::Blacklist { .. } => "blacklist",
            Condition::Relational { .. } => "relational",
        };
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", type_name)?;
        match self {
            Condition::Whitelist { dimension, values } | Condition::Blacklist { dimension, values } => {
                map.serialize_entry("dimension", dimension)?;
                map.serialize_entry("values", values)?;
            }
            Condition::Relational {
                dimension,
                predicate,
            } => {
                map.serialize_entry("dimension", dimension)?;
                map.serialize_entry("predicate", &predicate.to_string())?;
            }
            Condition::Unknown(_) => {}
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        Condition::from_wire(object).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationalOp {
    Less,
    LessEq,
    Eq,
    MoreEq,
    More,
}

impl RelationalOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            RelationalOp::Less => ordering == Ordering::Less,
            RelationalOp::LessEq => ordering != Ordering::Greater,
            RelationalOp::Eq => ordering == Ordering::Equal,
            RelationalOp::MoreEq => ordering != Ordering::Less,
            RelationalOp::More => ordering == Ordering::Greater,
        }
    }
}

impl fmt::Display for RelationalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationalOp::Less => write!(f, "<"),
            RelationalOp::LessEq => write!(f, "<="),
            RelationalOp::Eq => write!(f, "=="),
            RelationalOp::MoreEq => write!(f, ">="),
            RelationalOp::More => write!(f, ">"),
        }
    }
}

/// A comparison against a dotted numeric version, e.g. `>=8.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    op: RelationalOp,
    version: Vec<u64>,
}

impl Predicate {
    pub fn new(op: RelationalOp, version: Vec<u64>) -> Self {
        Self { op, version }
    }

    /// A value that is not a dotted numeric version never satisfies the predicate.
    pub fn test(&self, value: &str) -> bool {
        match parse_version(value) {
            Some(v) => self.op.holds(compare_versions(&v, &self.version)),
            None => false,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version: Vec<String> = self.version.iter().map(u64::to_string).collect();
        write!(f, "{}{}", self.op, version.join("."))
    }
}

impl std::str::FromStr for Predicate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // two-character operators first so "<=" is not read as "<"
        let (op, rest) = [
            ("<=", RelationalOp::LessEq),
            (">=", RelationalOp::MoreEq),
            ("==", RelationalOp::Eq),
            ("<", RelationalOp::Less),
            (">", RelationalOp::More),
            ("=", RelationalOp::Eq),
        ]
        .iter()
        .find_map(|(token, op)| s.strip_prefix(token).map(|rest| (*op, rest)))
        .ok_or_else(|| format!("predicate {s:?} has no comparison operator"))?;

        let version = parse_version(rest.trim())
            .ok_or_else(|| format!("predicate {s:?} does not compare against a version"))?;
        Ok(Predicate { op, version })
    }
}

fn parse_version(s: &str) -> Option<Vec<u64>> {
    if s.is_empty() {
        return None;
    }
    s.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
