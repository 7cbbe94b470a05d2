use sha2::{Digest, Sha256};

/// Derive the stable server id for a BMC endpoint within a datacenter.
///
/// The id is a pure function of its inputs so that the same hardware
/// re-reported by any agent (or rediscovered after an agent restart) maps to
/// the same Server and ServerLocation rows.
pub fn generate_server_id(datacenter_id: &str, bmc_endpoint: &str) -> String {
    let mut hasher = Sha256::default();
    hasher.update(datacenter_id.as_bytes());
    hasher.update(b"|");
    hasher.update(bmc_endpoint.as_bytes());
    let hash = hasher.finalize();
    format!("srv-{}", &hex::encode(hash)[..16])
}

#[cfg(test)]
mod tests {
    use super::generate_server_id;

    #[test]
    fn deterministic() {
        let a = generate_server_id("dc-east-1", "192.168.1.100:623");
        let b = generate_server_id("dc-east-1", "192.168.1.100:623");
        assert_eq!(a, b);
        assert!(a.starts_with("srv-"));
        assert_eq!(a.len(), "srv-".len() + 16);
    }

    #[test]
    fn distinct_inputs_distinct_ids() {
        let a = generate_server_id("dc-east-1", "192.168.1.100:623");
        let b = generate_server_id("dc-west-1", "192.168.1.100:623");
        let c = generate_server_id("dc-east-1", "192.168.1.101:623");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn delimiter_prevents_ambiguity() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(
            generate_server_id("ab", "c"),
            generate_server_id("a", "bc")
        );
    }
}
