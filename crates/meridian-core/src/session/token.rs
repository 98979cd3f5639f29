//! Vector session tokens.
//!
//! Wire form is `version#globalLsn#region=lsn#region=lsn`. A bare integer is
//! accepted as a simple token with no regional progress. The collection-level
//! form joins `rangeId:token` pairs with commas.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Progress of one partition as observed by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub version: i64,
    pub global_lsn: i64,
    /// Region id to local LSN
    pub regional: BTreeMap<u32, i64>,
    simple: bool,
}

impl SessionToken {
    pub fn new(version: i64, global_lsn: i64) -> Self {
        Self { version, global_lsn, regional: BTreeMap::new(), simple: false }
    }

    /// Token with only a global sequence number.
    pub fn simple(global_lsn: i64) -> Self {
        Self { version: 0, global_lsn, regional: BTreeMap::new(), simple: true }
    }

    pub fn with_region(mut self, region: u32, lsn: i64) -> Self {
        self.regional.insert(region, lsn);
        self.simple = false;
        self
    }

    /// Parse one partition token (without the `rangeId:` prefix).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if !s.contains('#') {
            let lsn = s.parse::<i64>().ok()?;
            return (lsn >= 0).then(|| Self::simple(lsn));
        }

        let mut parts = s.split('#');
        let version = parts.next()?.parse::<i64>().ok()?;
        let global_lsn = parts.next()?.parse::<i64>().ok()?;
        if version < 0 || global_lsn < 0 {
            return None;
        }
        let mut token = Self::new(version, global_lsn);
        for part in parts {
            let (region, lsn) = part.split_once('=')?;
            let region = region.parse::<u32>().ok()?;
            let lsn = lsn.parse::<i64>().ok()?;
            token.regional.insert(region, lsn);
        }
        Some(token)
    }

    /// Merge two observations of the same partition.
    ///
    /// The global LSN only moves forward. With equal versions every regional
    /// LSN is the maximum of both. With different versions the higher
    /// version's region set wins: shared regions keep the maximum and regions
    /// only the older version tracked are dropped.
    pub fn merge(&self, other: &SessionToken) -> SessionToken {
        let (higher, lower) = if other.version > self.version { (other, self) } else { (self, other) };
        let regional = if self.version == other.version {
            let mut regional = self.regional.clone();
            for (region, lsn) in &other.regional {
                regional
                    .entry(*region)
                    .and_modify(|current| *current = (*current).max(*lsn))
                    .or_insert(*lsn);
            }
            regional
        } else {
            higher
                .regional
                .iter()
                .map(|(region, lsn)| (*region, lower.regional.get(region).map_or(*lsn, |older| (*older).max(*lsn))))
                .collect()
        };
        SessionToken {
            version: higher.version,
            global_lsn: self.global_lsn.max(other.global_lsn),
            regional,
            simple: self.simple && other.simple,
        }
    }

    /// Check if a replica at `replica` progress can serve a request carrying `self`.
    pub fn is_satisfied_by(&self, replica: &SessionToken) -> bool {
        if replica.version < self.version || replica.global_lsn < self.global_lsn {
            return false;
        }
        if replica.version != self.version {
            return true;
        }
        self.regional.iter().all(|(region, lsn)| {
            replica.regional.get(region).is_some_and(|replica_lsn| replica_lsn >= lsn)
        })
    }

    /// Partial order used by the container: `Greater` when `self` is strictly ahead.
    pub fn compare_progress(&self, other: &SessionToken) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        let merged = self.merge(other);
        if &merged == self {
            Some(Ordering::Greater)
        } else if &merged == other {
            Some(Ordering::Less)
        } else {
            None
        }
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.simple && self.regional.is_empty() {
            return write!(f, "{}", self.global_lsn);
        }
        write!(f, "{}#{}", self.version, self.global_lsn)?;
        for (region, lsn) in &self.regional {
            write!(f, "#{region}={lsn}")?;
        }
        Ok(())
    }
}

/// Split a `rangeId:token[,rangeId:token]` header into its parsed pairs.
///
/// Pairs that fail to parse are skipped.
pub fn parse_partitioned_tokens(header: &str) -> Vec<(String, SessionToken)> {
    header
        .split(',')
        .filter_map(|pair| {
            let (range_id, token) = pair.trim().split_once(':')?;
            let token = SessionToken::parse(token)?;
            Some((range_id.to_string(), token))
        })
        .collect()
}

/// Resolve the token a request carries for `range_id`, falling back to the
/// range's parents. Every ancestor found is merged.
pub fn resolve_for_range(
    tokens: &[(String, SessionToken)],
    range_id: &str,
    parents: &[String],
) -> Option<SessionToken> {
    if let Some((_, token)) = tokens.iter().find(|(id, _)| id == range_id) {
        return Some(token.clone());
    }
    parents
        .iter()
        .filter_map(|parent| tokens.iter().find(|(id, _)| id == parent).map(|(_, t)| t))
        .fold(None, |acc: Option<SessionToken>, token| {
            Some(acc.map_or_else(|| token.clone(), |acc| acc.merge(token)))
        })
}
