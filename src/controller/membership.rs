//! Membership resolution
//!
//! Maps unit identities to the stable hostnames used as replica set member
//! addresses, and derives the desired member set from the peer inventory.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Invalid unit identifier: {0}")]
    InvalidIdentifier(String),
}

/// Identity of one unit: application name plus ordinal
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    app: String,
    ordinal: u32,
}

impl UnitId {
    pub fn new(app: impl Into<String>, ordinal: u32) -> Result<Self, MembershipError> {
        let app = app.into();
        if !is_valid_app_name(&app) {
            return Err(MembershipError::InvalidIdentifier(format!("{}/{}", app, ordinal)));
        }
        Ok(Self { app, ordinal })
    }

    /// Parse a StatefulSet pod name such as `mongodb-2`
    pub fn from_pod_name(name: &str) -> Result<Self, MembershipError> {
        let invalid = || MembershipError::InvalidIdentifier(name.to_string());
        let (app, ordinal) = name.rsplit_once('-').ok_or_else(invalid)?;
        let ordinal = parse_ordinal(ordinal).ok_or_else(invalid)?;
        Self::new(app, ordinal).map_err(|_| invalid())
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Pod name of this unit
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.app, self.ordinal)
    }

    /// Stable DNS name of this unit behind the headless endpoints service
    pub fn hostname(&self) -> String {
        format!("{app}-{n}.{app}-endpoints", app = self.app, n = self.ordinal)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.ordinal)
    }
}

impl FromStr for UnitId {
    type Err = MembershipError;

    /// Accepts `<app>/<ordinal>` and the pod name form `<app>-<ordinal>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((app, ordinal)) => {
                let ordinal = parse_ordinal(ordinal)
                    .ok_or_else(|| MembershipError::InvalidIdentifier(s.to_string()))?;
                Self::new(app, ordinal).map_err(|_| MembershipError::InvalidIdentifier(s.to_string()))
            }
            None => Self::from_pod_name(s),
        }
    }
}

fn parse_ordinal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// DNS-1123 label without the trailing ordinal
fn is_valid_app_name(app: &str) -> bool {
    !app.is_empty()
        && app.len() <= 63
        && app
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !app.starts_with('-')
        && !app.ends_with('-')
}

/// Desired member hostnames for `self_unit` plus its peers
pub fn desired_hosts(self_unit: &UnitId, peers: &[UnitId]) -> BTreeSet<String> {
    std::iter::once(self_unit)
        .chain(peers.iter())
        .map(UnitId::hostname)
        .collect()
}

/// Resolve raw identifiers into the desired member set
pub fn resolve(self_id: &str, peer_ids: &[&str]) -> Result<BTreeSet<String>, MembershipError> {
    let self_unit: UnitId = self_id.parse()?;
    let peers = peer_ids
        .iter()
        .map(|id| id.parse())
        .collect::<Result<Vec<UnitId>, _>>()?;
    Ok(desired_hosts(&self_unit, &peers))
}
