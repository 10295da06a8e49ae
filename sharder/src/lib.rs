//! Consistent-hash routing of series to backends.
//!
//! A [`Circle`] is a replica group's hash ring: every backend contributes a
//! fixed number of virtual nodes, and a routing key maps to the backend
//! owning the first ring point at or after the key's hash. The ring is built
//! once at startup and never mutated online; rebalancing is coordinated by
//! the transfer service.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::Deserialize;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use std::str::FromStr;
use thiserror::Error;

/// Virtual nodes per backend. High enough that the key space splits evenly
/// across small backend sets.
const VNODE_FACTOR: u64 = 256;

/// Fixed sip keys: ring layout must be identical across processes and
/// restarts for the same configuration.
const SIP_KEY_0: u64 = 0x8f1b_a3bc_1e2d_4c5a;
const SIP_KEY_1: u64 = 0x6a09_e667_f3bc_c908;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid hash_key: {value}, require idx, exi, name or url")]
    InvalidHashKey { value: String },
}

/// The routing key for a series: database and measurement, canonically
/// joined. Replica-health accounting uses the same key to decide whether a
/// measurement is in place on a backend.
pub fn get_key(db: &str, measurement: &str) -> String {
    format!("{db},{measurement}")
}

/// Which backend attribute feeds the ring hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKey {
    /// The backend's position in the circle's configuration.
    #[default]
    Idx,
    /// Compatibility namespace for rings built by earlier deployments.
    Exi,
    /// The backend's configured name.
    Name,
    /// The backend's URL.
    Url,
}

impl HashKey {
    /// The identity string a backend contributes to the ring.
    pub fn identity(&self, idx: usize, name: &str, url: &str) -> String {
        match self {
            Self::Idx => idx.to_string(),
            Self::Exi => format!("exi-{idx}"),
            Self::Name => name.to_string(),
            Self::Url => url.to_string(),
        }
    }
}

impl FromStr for HashKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "idx" => Ok(Self::Idx),
            "exi" => Ok(Self::Exi),
            "name" => Ok(Self::Name),
            "url" => Ok(Self::Url),
            other => Err(Error::InvalidHashKey {
                value: other.to_string(),
            }),
        }
    }
}

/// A replica group's consistent-hash ring. Lookup returns the index of the
/// owning backend within the group.
#[derive(Debug, Clone)]
pub struct Circle {
    /// `(point, backend index)`, sorted by point.
    ring: Vec<(u64, usize)>,
}

impl Circle {
    /// Build the ring from the backends' identity strings (see
    /// [`HashKey::identity`]).
    ///
    /// # Panics
    ///
    /// Panics if `identities` is empty; configuration validation rejects
    /// empty circles before this point.
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Vec::new();
        for (idx, identity) in identities.into_iter().enumerate() {
            for vnode in 0..VNODE_FACTOR {
                ring.push((hash_point(identity.as_ref(), vnode), idx));
            }
        }
        assert!(!ring.is_empty(), "circle requires at least one backend");
        ring.sort_unstable();
        Self { ring }
    }

    /// Map a routing key to its owning backend index: the first ring point
    /// at or after the key's hash, wrapping past the end.
    pub fn get(&self, key: &str) -> usize {
        let h = hash_key(key);
        let at = self.ring.partition_point(|&(point, _)| point < h);
        let (_, idx) = self.ring[at % self.ring.len()];
        idx
    }
}

fn hash_point(identity: &str, vnode: u64) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(SIP_KEY_0, SIP_KEY_1);
    hasher.write(identity.as_bytes());
    hasher.write_u8(b'#');
    hasher.write_u64(vnode);
    hasher.finish()
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(SIP_KEY_0, SIP_KEY_1);
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_circle(names: &[&str]) -> Circle {
        Circle::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| HashKey::Name.identity(i, n, "")),
        )
    }

    #[test]
    fn lookup_is_deterministic_across_instances() {
        // Two independently built rings with the same config must agree —
        // the on-ring layout is what makes restarts and peers consistent.
        let a = named_circle(&["A", "B", "C"]);
        let b = named_circle(&["A", "B", "C"]);
        for key in ["mydb,cpu", "mydb,mem", "other,disk", ""] {
            assert_eq!(a.get(key), b.get(key), "key {key:?}");
        }
    }

    #[test]
    fn every_backend_owns_some_keys() {
        let circle = named_circle(&["A", "B", "C", "D"]);
        let mut seen = [false; 4];
        for i in 0..10_000 {
            seen[circle.get(&get_key("db", &format!("m{i}")))] = true;
        }
        assert_eq!(seen, [true; 4]);
    }

    #[test]
    fn hash_key_policies_produce_distinct_identities() {
        let (idx, name, url) = (2, "b2", "http://127.0.0.1:8086");
        assert_eq!(HashKey::Idx.identity(idx, name, url), "2");
        assert_eq!(HashKey::Exi.identity(idx, name, url), "exi-2");
        assert_eq!(HashKey::Name.identity(idx, name, url), "b2");
        assert_eq!(HashKey::Url.identity(idx, name, url), url);
    }

    #[test]
    fn hash_key_parses_config_values() {
        assert_eq!("idx".parse::<HashKey>().unwrap(), HashKey::Idx);
        assert_eq!("EXI".parse::<HashKey>().unwrap(), HashKey::Exi);
        assert_eq!("name".parse::<HashKey>().unwrap(), HashKey::Name);
        assert_eq!("url".parse::<HashKey>().unwrap(), HashKey::Url);
        assert!("uuid".parse::<HashKey>().is_err());
    }

    #[test]
    fn routing_key_is_db_comma_measurement() {
        assert_eq!(get_key("mydb", "cpu"), "mydb,cpu");
    }

    #[test]
    fn single_backend_owns_everything() {
        let circle = named_circle(&["only"]);
        for i in 0..100 {
            assert_eq!(circle.get(&format!("db,m{i}")), 0);
        }
    }
}
