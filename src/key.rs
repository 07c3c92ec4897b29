//! Fingerprint keys for cached answers
//!
//! A fingerprint is built from a namespace, the chain it belongs to and every
//! field that influences the cached answer. Address fields are rendered in
//! their normalized lowercase form, and free-text fields are escaped, so equal
//! logical queries always produce equal keys and distinct queries never collide.
//!
//! Rendered form: `{namespace}|chain={id}|{name}={value}|...`

use std::fmt;

use crate::types::{Address, ChainId};

/// Namespace for position listings.
pub const POSITIONS_NAMESPACE: &str = "positions";
/// Namespace for token metadata records.
pub const METADATA_NAMESPACE: &str = "token-metadata";

/// A deterministic composite cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Start a fingerprint in `namespace` for `chain_id`.
    pub fn builder(namespace: &str, chain_id: ChainId) -> FingerprintBuilder {
        let mut key = String::with_capacity(128);
        push_escaped(&mut key, namespace);
        key.push_str("|chain=");
        key.push_str(&chain_id.to_string());
        FingerprintBuilder { key }
    }

    /// Key for the positions a user holds in a lending pool.
    pub fn positions(chain_id: ChainId, pool: &Address, user: &Address) -> Self {
        Self::builder(POSITIONS_NAMESPACE, chain_id)
            .address("pool", pool)
            .address("user", user)
            .build()
    }

    /// Key for a token's descriptive metadata.
    pub fn token_metadata(chain_id: ChainId, token: &Address) -> Self {
        Self::builder(METADATA_NAMESPACE, chain_id)
            .address("token", token)
            .build()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Appends fields to a fingerprint in call order.
#[derive(Debug)]
pub struct FingerprintBuilder {
    key: String,
}

impl FingerprintBuilder {
    /// Add an address field.
    pub fn address(self, name: &str, value: &Address) -> Self {
        self.field(name, &value.to_string())
    }

    /// Add a free-text field. Case is preserved.
    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.key.push('|');
        push_escaped(&mut self.key, name);
        self.key.push('=');
        push_escaped(&mut self.key, value);
        self
    }

    pub fn build(self) -> Fingerprint {
        Fingerprint(self.key)
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        if matches!(c, '|' | '=' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_equal_queries_share_a_key() {
        let pool_upper = addr("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        let pool_lower = addr("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let user = addr("0x1111111111111111111111111111111111111111");

        assert_eq!(
            Fingerprint::positions(1, &pool_upper, &user),
            Fingerprint::positions(1, &pool_lower, &user)
        );
        assert_eq!(
            Fingerprint::positions(1, &pool_lower, &user).as_str(),
            "positions|chain=1|pool=0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa|user=0x1111111111111111111111111111111111111111"
        );
    }

    #[test]
    fn test_distinct_queries_do_not_collide() {
        let a = addr("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = addr("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

        // Swapped roles, different chain, different namespace.
        assert_ne!(Fingerprint::positions(1, &a, &b), Fingerprint::positions(1, &b, &a));
        assert_ne!(Fingerprint::positions(1, &a, &b), Fingerprint::positions(10, &a, &b));
        assert_ne!(
            Fingerprint::token_metadata(1, &a),
            Fingerprint::builder(POSITIONS_NAMESPACE, 1).address("token", &a).build()
        );
    }

    #[test]
    fn test_separators_in_free_text_are_escaped() {
        let joined = Fingerprint::builder("ns", 1).field("a", "x|b=y").build();
        let split = Fingerprint::builder("ns", 1).field("a", "x").field("b", "y").build();
        assert_ne!(joined, split);
        assert_eq!(joined.as_str(), r"ns|chain=1|a=x\|b\=y");
    }
}
