//! Version strings and version constraints.
//!
//! Scientific software uses loosely structured versions (`11.0`, `2022a`,
//! `1.26.4`, `3.11.5-GCCcore-13.2.0`). A version is split into segments on
//! `.`, `-`, `_`, `+` and on digit/letter boundaries; numeric segments compare
//! numerically, text segments lexically, and missing trailing segments count
//! as `0`, so `1.0 == 1.0.0` and `2022a < 2022b`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
  #[error("empty version string")]
  Empty,

  #[error("invalid character {ch:?} in version {input:?}")]
  InvalidChar { input: String, ch: char },

  #[error("invalid version constraint {input:?}: {message}")]
  InvalidConstraint { input: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Segment {
  // Variant order matters: numbers sort before text.
  Num(u64),
  Text(String),
}

const ZERO: Segment = Segment::Num(0);

/// A parsed, orderable version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
  raw: String,
  segments: Vec<Segment>,
}

impl Version {
  pub fn parse(input: &str) -> Result<Self, VersionError> {
    let raw = input.trim();
    if raw.is_empty() {
      return Err(VersionError::Empty);
    }

    let mut segments = Vec::new();
    for piece in raw.split(['.', '-', '_', '+']) {
      let mut current = String::new();
      let mut current_is_digit = None;
      for ch in piece.chars() {
        if !ch.is_ascii_alphanumeric() {
          return Err(VersionError::InvalidChar {
            input: raw.to_string(),
            ch,
          });
        }
        let is_digit = ch.is_ascii_digit();
        if current_is_digit.is_some_and(|d| d != is_digit) {
          segments.push(make_segment(&current));
          current.clear();
        }
        current_is_digit = Some(is_digit);
        current.push(ch);
      }
      if !current.is_empty() {
        segments.push(make_segment(&current));
      }
    }

    if segments.is_empty() {
      return Err(VersionError::Empty);
    }

    Ok(Self {
      raw: raw.to_string(),
      segments,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }

  /// Segments with trailing zeros removed; equal versions share this form.
  fn normalized(&self) -> &[Segment] {
    let mut end = self.segments.len();
    while end > 0 && self.segments[end - 1] == ZERO {
      end -= 1;
    }
    &self.segments[..end]
  }
}

fn make_segment(s: &str) -> Segment {
  match s.parse::<u64>() {
    Ok(n) => Segment::Num(n),
    Err(_) => Segment::Text(s.to_ascii_lowercase()),
  }
}

impl Ord for Version {
  fn cmp(&self, other: &Self) -> Ordering {
    let len = self.segments.len().max(other.segments.len());
    for i in 0..len {
      let a = self.segments.get(i).unwrap_or(&ZERO);
      let b = other.segments.get(i).unwrap_or(&ZERO);
      match a.cmp(b) {
        Ordering::Equal => continue,
        ord => return ord,
      }
    }
    Ordering::Equal
  }
}

impl PartialOrd for Version {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Version {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for Version {}

impl Hash for Version {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.normalized().hash(state);
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.raw)
  }
}

impl FromStr for Version {
  type Err = VersionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for Version {
  type Error = VersionError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<Version> for String {
  fn from(value: Version) -> Self {
    value.raw
  }
}

/// One end of a version interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bound {
  pub version: Version,
  pub inclusive: bool,
}

/// A version interval. `lower == upper`, both inclusive, is an exact pin.
///
/// Textual forms: `*` (any), `1.0` / `=1.0` / `==1.0` (exact), and
/// comma-separated `>=`, `>`, `<=`, `<` clauses such as `>=1.2,<2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionConstraint {
  lower: Option<Bound>,
  upper: Option<Bound>,
}

impl VersionConstraint {
  pub fn any() -> Self {
    Self::default()
  }

  pub fn exact(version: Version) -> Self {
    Self {
      lower: Some(Bound {
        version: version.clone(),
        inclusive: true,
      }),
      upper: Some(Bound {
        version,
        inclusive: true,
      }),
    }
  }

  pub fn at_least(version: Version) -> Self {
    Self {
      lower: Some(Bound {
        version,
        inclusive: true,
      }),
      upper: None,
    }
  }

  pub fn parse(input: &str) -> Result<Self, VersionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "*" {
      return Ok(Self::any());
    }

    let mut constraint = Self::any();
    for clause in trimmed.split(',') {
      let clause = clause.trim();
      let invalid = |message: &str| VersionError::InvalidConstraint {
        input: input.to_string(),
        message: message.to_string(),
      };

      let (op, rest) = if let Some(rest) = clause.strip_prefix(">=") {
        (">=", rest)
      } else if let Some(rest) = clause.strip_prefix("<=") {
        ("<=", rest)
      } else if let Some(rest) = clause.strip_prefix("==") {
        ("==", rest)
      } else if let Some(rest) = clause.strip_prefix('>') {
        (">", rest)
      } else if let Some(rest) = clause.strip_prefix('<') {
        ("<", rest)
      } else if let Some(rest) = clause.strip_prefix('=') {
        ("==", rest)
      } else {
        ("==", clause)
      };

      let version = Version::parse(rest).map_err(|e| invalid(&e.to_string()))?;
      let clause_constraint = match op {
        ">=" => Self::at_least(version),
        ">" => Self {
          lower: Some(Bound {
            version,
            inclusive: false,
          }),
          upper: None,
        },
        "<=" => Self {
          lower: None,
          upper: Some(Bound {
            version,
            inclusive: true,
          }),
        },
        "<" => Self {
          lower: None,
          upper: Some(Bound {
            version,
            inclusive: false,
          }),
        },
        _ => Self::exact(version),
      };

      constraint = constraint
        .intersect(&clause_constraint)
        .ok_or_else(|| invalid("clauses exclude every version"))?;
    }

    Ok(constraint)
  }

  pub fn is_any(&self) -> bool {
    self.lower.is_none() && self.upper.is_none()
  }

  /// The pinned version, if this constraint allows exactly one version.
  pub fn pinned(&self) -> Option<&Version> {
    match (&self.lower, &self.upper) {
      (Some(lo), Some(hi)) if lo.inclusive && hi.inclusive && lo.version == hi.version => Some(&lo.version),
      _ => None,
    }
  }

  pub fn lower(&self) -> Option<&Bound> {
    self.lower.as_ref()
  }

  pub fn upper(&self) -> Option<&Bound> {
    self.upper.as_ref()
  }

  pub fn matches(&self, version: &Version) -> bool {
    let above = match &self.lower {
      Some(b) if b.inclusive => version >= &b.version,
      Some(b) => version > &b.version,
      None => true,
    };
    let below = match &self.upper {
      Some(b) if b.inclusive => version <= &b.version,
      Some(b) => version < &b.version,
      None => true,
    };
    above && below
  }

  /// The tightest constraint satisfied by both, or `None` if they are disjoint.
  pub fn intersect(&self, other: &Self) -> Option<Self> {
    let lower = tighter_bound(self.lower.as_ref(), other.lower.as_ref(), Ordering::Greater);
    let upper = tighter_bound(self.upper.as_ref(), other.upper.as_ref(), Ordering::Less);

    if let (Some(lo), Some(hi)) = (&lower, &upper) {
      match lo.version.cmp(&hi.version) {
        Ordering::Greater => return None,
        Ordering::Equal if !(lo.inclusive && hi.inclusive) => return None,
        _ => {}
      }
    }

    Some(Self { lower, upper })
  }
}

/// Pick the bound that restricts more. `prefer` is `Greater` for lower bounds
/// and `Less` for upper bounds; on equal versions the exclusive bound wins.
fn tighter_bound(a: Option<&Bound>, b: Option<&Bound>, prefer: Ordering) -> Option<Bound> {
  match (a, b) {
    (None, None) => None,
    (Some(x), None) | (None, Some(x)) => Some(x.clone()),
    (Some(x), Some(y)) => match x.version.cmp(&y.version) {
      Ordering::Equal => Some(Bound {
        version: x.version.clone(),
        inclusive: x.inclusive && y.inclusive,
      }),
      ord if ord == prefer => Some(x.clone()),
      _ => Some(y.clone()),
    },
  }
}

impl fmt::Display for VersionConstraint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_any() {
      return f.write_str("*");
    }
    if let Some(pinned) = self.pinned() {
      return write!(f, "{}", pinned);
    }

    let mut clauses = Vec::new();
    if let Some(lo) = &self.lower {
      clauses.push(format!("{}{}", if lo.inclusive { ">=" } else { ">" }, lo.version));
    }
    if let Some(hi) = &self.upper {
      clauses.push(format!("{}{}", if hi.inclusive { "<=" } else { "<" }, hi.version));
    }
    f.write_str(&clauses.join(","))
  }
}

impl FromStr for VersionConstraint {
  type Err = VersionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for VersionConstraint {
  type Error = VersionError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<VersionConstraint> for String {
  fn from(value: VersionConstraint) -> Self {
    value.to_string()
  }
}
