//! Multi-domain state, serialized as the ECL resumption cookie
//!
//! Text form: `<base dn>:<csn>[ <csn>]*;` per domain, domains in sorted order.
//! Base DNs contain commas, so each token is split on its *last* colon.

use crate::csn::Csn;
use crate::state::ReplicaStateVector;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Replica state vectors of every replicated domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiDomainState {
    domains: BTreeMap<String, ReplicaStateVector>,
}

impl MultiDomainState {
    /// Empty state: "from the beginning"
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a CSN into the vector of `domain`
    pub fn update(&mut self, domain: &str, csn: Csn) -> bool {
        match self.domains.get_mut(domain) {
            Some(state) => state.update(csn),
            None => {
                let mut state = ReplicaStateVector::new();
                state.update(csn);
                self.domains.insert(domain.to_string(), state);
                true
            }
        }
    }

    /// Vector of one domain
    pub fn get(&self, domain: &str) -> Option<&ReplicaStateVector> {
        self.domains.get(domain)
    }

    /// Replace the vector of one domain
    pub fn set(&mut self, domain: impl Into<String>, state: ReplicaStateVector) {
        self.domains.insert(domain.into(), state);
    }

    /// Forget one domain
    pub fn remove(&mut self, domain: &str) -> Option<ReplicaStateVector> {
        self.domains.remove(domain)
    }

    /// Iterate `(domain, vector)` in domain order
    pub fn domains(&self) -> impl Iterator<Item = (&str, &ReplicaStateVector)> {
        self.domains.iter().map(|(d, s)| (d.as_str(), s))
    }

    /// Whether a domain is present
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    /// Whether no domain is present
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Number of domains present
    pub fn len(&self) -> usize {
        self.domains.len()
    }
}

impl fmt::Display for MultiDomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (domain, state) in &self.domains {
            write!(f, "{domain}:{state};")?;
        }
        Ok(())
    }
}

impl FromStr for MultiDomainState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut cookie = Self::new();
        for token in s.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let Some(sep) = token.rfind(':') else {
                return Err(Error::malformed_cookie(token, "missing ':' separator"));
            };
            let domain = token[..sep].trim();
            if domain.is_empty() {
                return Err(Error::malformed_cookie(token, "empty domain"));
            }
            if cookie.contains(domain) {
                return Err(Error::malformed_cookie(domain, "domain listed twice"));
            }
            let state = token[sep + 1..]
                .trim()
                .parse::<ReplicaStateVector>()
                .map_err(|e| Error::malformed_cookie(domain, e.to_string()))?;
            cookie.set(domain, state);
        }
        Ok(cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_cookie() {
        let cookie: MultiDomainState = "".parse().unwrap();
        assert!(cookie.is_empty());
        assert_eq!(cookie.to_string(), "");
    }

    #[test]
    fn test_single_domain_text() {
        let csn = Csn::new(0x10, 2, 1);
        let mut cookie = MultiDomainState::new();
        cookie.update("dc=example,dc=com", csn);
        assert_eq!(cookie.to_string(), format!("dc=example,dc=com:{csn};"));
    }

    #[test]
    fn test_multi_csn_domain() {
        let a = Csn::new(10, 0, 1);
        let b = Csn::new(20, 0, 2);
        let text = format!("o=test:{a} {b};o=other:{b};");
        let cookie: MultiDomainState = text.parse().unwrap();
        assert_eq!(cookie.len(), 2);
        assert_eq!(cookie.get("o=test").unwrap().len(), 2);
        // canonical form sorts domains
        assert_eq!(cookie.to_string(), format!("o=other:{b};o=test:{a} {b};"));
    }

    #[test]
    fn test_malformed_cookie_names_domain() {
        let err = "o=test:nothex;".parse::<MultiDomainState>().unwrap_err();
        match err {
            Error::MalformedCookie { domain, .. } => assert_eq!(domain, "o=test"),
            other => panic!("unexpected error {other:?}"),
        }

        let err = "garbage;".parse::<MultiDomainState>().unwrap_err();
        assert!(matches!(err, Error::MalformedCookie { domain, .. } if domain == "garbage"));
    }

    fn arb_csn() -> impl Strategy<Value = Csn> {
        (any::<u64>(), any::<u32>(), 0u16..8).prop_map(|(t, s, r)| Csn::new(t, s, r))
    }

    proptest! {
        #[test]
        fn prop_cookie_round_trip(
            domains in proptest::collection::btree_map(
                "(o|ou|dc)=[a-z]{1,8}(,dc=[a-z]{1,6}){0,2}",
                proptest::collection::vec(arb_csn(), 0..5),
                0..4,
            )
        ) {
            let mut cookie = MultiDomainState::new();
            for (domain, csns) in domains {
                cookie.set(domain, csns.into_iter().collect());
            }
            let parsed: MultiDomainState = cookie.to_string().parse().unwrap();
            prop_assert_eq!(parsed, cookie);
        }
    }
}
