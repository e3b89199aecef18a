//! Identifiers for mesh bases and mesh objects
//!
//! - `MeshBaseIdentifier`: names a mesh base, the key for proxies and name servers
//! - `MeshObjectIdentifier`: names a mesh object inside the namespace of its mesh base
//! - Access specifications: the path of mesh bases to traverse to reach an object
//! - Coherence specifications: how a replica obtained through a path is kept fresh

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between mesh base and local part in the external form
pub const IDENTIFIER_SEPARATOR: char = '#';

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshBaseIdentifier(String);

impl MeshBaseIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeshBaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeshBaseIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MeshBaseIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a mesh object, scoped by the mesh base that created it
///
/// The local part of the home object is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshObjectIdentifier {
    base: MeshBaseIdentifier,
    local: String,
}

impl MeshObjectIdentifier {
    pub fn new(base: MeshBaseIdentifier, local: impl Into<String>) -> Self {
        Self {
            base,
            local: local.into(),
        }
    }

    /// The reserved identifier of a mesh base's home object
    pub fn home_of(base: &MeshBaseIdentifier) -> Self {
        Self::new(base.clone(), String::new())
    }

    /// A fresh random identifier in the namespace of `base`
    pub fn generate(base: &MeshBaseIdentifier) -> Self {
        Self::new(base.clone(), Uuid::new_v4().to_string())
    }

    pub fn base(&self) -> &MeshBaseIdentifier {
        &self.base
    }

    pub fn local_id(&self) -> &str {
        &self.local
    }

    pub fn is_home_object(&self) -> bool {
        self.local.is_empty()
    }

    pub fn to_external_form(&self) -> String {
        if self.local.is_empty() {
            self.base.0.clone()
        } else {
            format!("{}{}{}", self.base, IDENTIFIER_SEPARATOR, self.local)
        }
    }

    /// Parses the external form; the last separator splits base and local part
    pub fn from_external_form(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        match raw.rsplit_once(IDENTIFIER_SEPARATOR) {
            Some((base, _)) if base.is_empty() => None,
            Some((base, local)) => Some(Self::new(MeshBaseIdentifier::new(base), local)),
            None => Some(Self::home_of(&MeshBaseIdentifier::new(raw))),
        }
    }
}

impl fmt::Display for MeshObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

// ============================================================================
// Coherence
// ============================================================================

/// How aggressively a replica is kept fresh after it has been accessed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceSpecification {
    /// Read the source once
    #[default]
    OneTime,
    /// Re-read every `period_ms`
    Periodic { period_ms: u64 },
    /// Start at `fallback_delay_ms`, multiply by `adaptive_factor` while nothing
    /// changes, never exceed `max_delay_ms`
    AdaptivePeriodic {
        fallback_delay_ms: u64,
        max_delay_ms: u64,
        adaptive_factor: f64,
    },
}

impl CoherenceSpecification {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoherenceSpecification::OneTime => "one_time",
            CoherenceSpecification::Periodic { .. } => "periodic",
            CoherenceSpecification::AdaptivePeriodic { .. } => "adaptive_periodic",
        }
    }

    /// Delay before the next run, given the delay used last time and whether
    /// the source changed (or failed) in the run that just finished
    pub fn next_delay(&self, previous: Option<Duration>, changed: bool) -> Option<Duration> {
        match self {
            CoherenceSpecification::OneTime => None,
            CoherenceSpecification::Periodic { period_ms } => {
                Some(Duration::from_millis(*period_ms))
            }
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay_ms,
                max_delay_ms,
                adaptive_factor,
            } => {
                let fallback = Duration::from_millis(*fallback_delay_ms);
                let next = match previous {
                    Some(previous) if !changed => previous.mul_f64(*adaptive_factor),
                    _ => fallback,
                };
                Some(next.min(Duration::from_millis(*max_delay_ms)))
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            CoherenceSpecification::OneTime => Ok(()),
            CoherenceSpecification::Periodic { period_ms } if *period_ms == 0 => {
                Err("periodic coherence needs a period greater than 0".to_string())
            }
            CoherenceSpecification::Periodic { .. } => Ok(()),
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay_ms,
                max_delay_ms,
                adaptive_factor,
            } => {
                if *fallback_delay_ms == 0 || fallback_delay_ms > max_delay_ms {
                    return Err(format!(
                        "adaptive coherence needs 0 < fallback ({fallback_delay_ms}) <= max ({max_delay_ms})"
                    ));
                }
                if !adaptive_factor.is_finite() || *adaptive_factor < 1.0 {
                    return Err(format!(
                        "adaptive factor must be at least 1.0, got {adaptive_factor}"
                    ));
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Access Specifications
// ============================================================================

/// One hop of an access path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshBaseAccessSpecification {
    pub base: MeshBaseIdentifier,
    pub coherence: Option<CoherenceSpecification>,
}

impl MeshBaseAccessSpecification {
    pub fn new(base: MeshBaseIdentifier) -> Self {
        Self {
            base,
            coherence: None,
        }
    }

    pub fn with_coherence(base: MeshBaseIdentifier, coherence: CoherenceSpecification) -> Self {
        Self {
            base,
            coherence: Some(coherence),
        }
    }
}

/// Where to find a mesh object: the object's identifier plus the mesh bases
/// to traverse, nearest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObjectAccessSpecification {
    pub path: Vec<MeshBaseAccessSpecification>,
    pub object: MeshObjectIdentifier,
}

impl MeshObjectAccessSpecification {
    /// Access by identifier only; remote objects are looked for at their own mesh base
    pub fn of(object: MeshObjectIdentifier) -> Self {
        Self {
            path: Vec::new(),
            object,
        }
    }

    /// Access `object` through the single hop `base`
    pub fn at(base: MeshBaseIdentifier, object: MeshObjectIdentifier) -> Self {
        Self {
            path: vec![MeshBaseAccessSpecification::new(base)],
            object,
        }
    }

    /// The home object of `base`, reached directly
    pub fn home_of(base: &MeshBaseIdentifier) -> Self {
        Self::at(base.clone(), MeshObjectIdentifier::home_of(base))
    }

    pub fn via(path: Vec<MeshBaseAccessSpecification>, object: MeshObjectIdentifier) -> Self {
        Self { path, object }
    }

    /// The first hop, if any
    pub fn pivot(&self) -> Option<&MeshBaseAccessSpecification> {
        self.path.first()
    }

    /// The same specification as seen by the first hop
    pub fn without_pivot(&self) -> Self {
        Self {
            path: self.path.iter().skip(1).cloned().collect(),
            object: self.object.clone(),
        }
    }

    /// Prepends `prefix` to the path
    pub fn with_prefix(&self, prefix: MeshBaseAccessSpecification) -> Self {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.push(prefix);
        path.extend(self.path.iter().cloned());
        Self {
            path,
            object: self.object.clone(),
        }
    }

    /// Strips every hop up to and including the last occurrence of `local`, and
    /// routes identifier-only access to a foreign object through its mesh base
    pub fn corrected_for(&self, local: &MeshBaseIdentifier) -> Self {
        let start = self
            .path
            .iter()
            .rposition(|hop| &hop.base == local)
            .map(|index| index + 1)
            .unwrap_or(0);
        let path: Vec<_> = self.path[start..].to_vec();
        if path.is_empty() && self.object.base() != local {
            return Self::at(self.object.base().clone(), self.object.clone());
        }
        Self {
            path,
            object: self.object.clone(),
        }
    }
}

impl fmt::Display for MeshObjectAccessSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hop in &self.path {
            write!(f, "{}!", hop.base)?;
        }
        write!(f, "{}", self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_form() {
        let base = MeshBaseIdentifier::new("http://example.org/base");
        let object = MeshObjectIdentifier::new(base.clone(), "abc");
        assert_eq!(object.to_external_form(), "http://example.org/base#abc");
        assert_eq!(
            MeshObjectIdentifier::from_external_form("http://example.org/base#abc"),
            Some(object)
        );

        let home = MeshObjectIdentifier::home_of(&base);
        assert!(home.is_home_object());
        assert_eq!(home.to_external_form(), "http://example.org/base");
        assert_eq!(
            MeshObjectIdentifier::from_external_form("http://example.org/base"),
            Some(home)
        );
        assert_eq!(MeshObjectIdentifier::from_external_form(""), None);
        assert_eq!(MeshObjectIdentifier::from_external_form("#x"), None);
    }

    #[test]
    fn test_generated_identifiers_are_distinct() {
        let base = MeshBaseIdentifier::new("a");
        let first = MeshObjectIdentifier::generate(&base);
        let second = MeshObjectIdentifier::generate(&base);
        assert_ne!(first, second);
        assert_eq!(first.base(), &base);
    }

    #[test]
    fn test_path_correction() {
        let a = MeshBaseIdentifier::new("a");
        let b = MeshBaseIdentifier::new("b");
        let c = MeshBaseIdentifier::new("c");
        let object = MeshObjectIdentifier::new(c.clone(), "x");

        let spec = MeshObjectAccessSpecification::via(
            vec![
                MeshBaseAccessSpecification::new(a.clone()),
                MeshBaseAccessSpecification::new(b.clone()),
                MeshBaseAccessSpecification::new(c.clone()),
            ],
            object.clone(),
        );
        let corrected = spec.corrected_for(&b);
        assert_eq!(corrected.path.len(), 1);
        assert_eq!(corrected.pivot().map(|hop| &hop.base), Some(&c));

        // identifier-only access to a foreign object goes to its mesh base
        let spec = MeshObjectAccessSpecification::of(object.clone());
        assert_eq!(spec.corrected_for(&a).pivot().map(|hop| &hop.base), Some(&c));

        // and to a local object stays local
        assert!(spec.corrected_for(&c).path.is_empty());

        let prefixed = spec.with_prefix(MeshBaseAccessSpecification::new(b.clone()));
        assert_eq!(prefixed.pivot().map(|hop| &hop.base), Some(&b));
        assert!(prefixed.without_pivot().path.is_empty());
    }

    #[test]
    fn test_adaptive_coherence() {
        let coherence = CoherenceSpecification::AdaptivePeriodic {
            fallback_delay_ms: 100,
            max_delay_ms: 350,
            adaptive_factor: 2.0,
        };
        let first = coherence.next_delay(None, false);
        assert_eq!(first, Some(Duration::from_millis(100)));
        let second = coherence.next_delay(first, false);
        assert_eq!(second, Some(Duration::from_millis(200)));
        let third = coherence.next_delay(second, false);
        assert_eq!(third, Some(Duration::from_millis(350)));
        assert_eq!(
            coherence.next_delay(third, true),
            Some(Duration::from_millis(100))
        );
        assert_eq!(CoherenceSpecification::OneTime.next_delay(None, true), None);
        assert!(coherence.validate().is_ok());
    }
}
