//! Execution context handed to the machine for a test run

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TestError};

/// Default block height of a test context
pub const DEFAULT_HEIGHT: i64 = 123;
/// Default block timestamp of a test context
pub const DEFAULT_TIMESTAMP: i64 = 1234567890;
/// Address used as the caller of every test transaction
pub const DEFAULT_CALLER: &str = "x1wymu47drhr0kuq2098m792lytgtj2nyx77yrsm";

static COIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+)([a-z][a-z0-9/:._-]{2,127})$").expect("coin pattern is valid")
});

static REALM_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9-]+\.)+[a-z]{2,}/r/[a-z0-9_.-]+(/[a-z0-9_.-]+)*$")
        .expect("realm path pattern is valid")
});

/// Reports whether `pkg_path` follows the realm convention, `<domain>/r/<name>`.
pub fn is_realm_path(pkg_path: &str) -> bool {
    REALM_PATH.is_match(pkg_path)
}

/// Derives the address owned by the package at `pkg_path`.
pub fn derive_pkg_addr(pkg_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pkgPath:");
    hasher.update(pkg_path.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..20])
}

/// An amount of a single denomination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: u64,
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// A set of coins, as sent along with a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coins(pub Vec<Coin>);

impl Coins {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn amount_of(&self, denom: &str) -> u64 {
        self.0
            .iter()
            .find(|c| c.denom == denom)
            .map_or(0, |c| c.amount)
    }
}

impl FromStr for Coins {
    type Err = TestError;

    /// Parses `"100xcoin,5foo"`; the empty string is no coins.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }

        let mut seen = BTreeSet::new();
        let mut coins = Vec::new();
        for item in s.split(',') {
            let item = item.trim();
            let caps = COIN
                .captures(item)
                .ok_or_else(|| TestError::invalid_coins(s, format!("invalid coin expression {item:?}")))?;
            let amount = caps[1]
                .parse::<u64>()
                .map_err(|e| TestError::invalid_coins(s, e.to_string()))?;
            let denom = caps[2].to_string();
            if !seen.insert(denom.clone()) {
                return Err(TestError::invalid_coins(s, format!("duplicate denomination {denom}")));
            }
            coins.push(Coin { denom, amount });
        }
        Ok(Self(coins))
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", items.join(","))
    }
}

/// Chain context the program observes while running under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecContext {
    pub chain_id: String,
    pub chain_domain: String,
    pub height: i64,
    pub timestamp: i64,
    pub caller: String,
    pub pkg_path: String,
    pub pkg_addr: String,
    pub send: Coins,
}

impl ExecContext {
    /// The test context for `pkg_path`; the package owns exactly the coins in `send`.
    pub fn new(pkg_path: &str, send: Coins) -> Self {
        Self {
            chain_id: "dev".to_string(),
            chain_domain: "tests.x.land".to_string(),
            height: DEFAULT_HEIGHT,
            timestamp: DEFAULT_TIMESTAMP,
            caller: DEFAULT_CALLER.to_string(),
            pkg_path: pkg_path.to_string(),
            pkg_addr: derive_pkg_addr(pkg_path),
            send,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coins() {
        let coins: Coins = "100xcoin, 5foo".parse().unwrap();
        assert_eq!(coins.amount_of("xcoin"), 100);
        assert_eq!(coins.amount_of("foo"), 5);
        assert_eq!(coins.to_string(), "100xcoin,5foo");

        assert!("".parse::<Coins>().unwrap().is_empty());
        assert!("abc".parse::<Coins>().is_err());
        assert!("10xcoin,3xcoin".parse::<Coins>().is_err());
    }

    #[test]
    fn test_realm_paths() {
        assert!(is_realm_path("x.land/r/demo"));
        assert!(is_realm_path("x.land/r/demo/boards"));
        assert!(!is_realm_path("x.land/p/demo/avl"));
        assert!(!is_realm_path("main"));
        assert!(!is_realm_path("x.land/r/"));
    }

    #[test]
    fn test_context_defaults() {
        let ctx = ExecContext::new("x.land/r/demo", Coins::default());
        assert_eq!(ctx.chain_id, "dev");
        assert_eq!(ctx.height, DEFAULT_HEIGHT);
        assert_eq!(ctx.pkg_addr.len(), 40);
        assert_eq!(ctx.pkg_addr, derive_pkg_addr("x.land/r/demo"));
        assert_ne!(ctx.pkg_addr, derive_pkg_addr("x.land/r/other"));
    }
}
