use rand::Rng;
use sha2::{Digest, Sha256};

/// Hash a password with a fresh random salt, producing `salt$hash` in hex.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::thread_rng().gen();
    let salt_hex = hex::encode(salt);
    format!("{salt_hex}${}", digest(&salt_hex, password))
}

/// Constant-shape verification against a stored `salt$hash` value.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, expected)) = stored.split_once('$') else {
        return false;
    };
    // Compare without early exit on length so timing reveals nothing useful.
    let actual = digest(salt_hex, password);
    let mut diff = actual.len() ^ expected.len();
    for (a, b) in actual.bytes().zip(expected.bytes()) {
        diff |= (a ^ b) as usize;
    }
    diff == 0
}

fn digest(salt_hex: &str, password: &str) -> String {
    let mut hasher = Sha256::default();
    hasher.update(salt_hex.as_bytes());
    hasher.update(b"$");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{hash_password, verify_password};

    #[test]
    fn roundtrip() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        assert!(!verify_password("", &stored));
    }

    #[test]
    fn distinct_salts() {
        assert_ne!(hash_password("hunter2"), hash_password("hunter2"));
    }

    #[test]
    fn malformed_stored_value_never_verifies() {
        assert!(!verify_password("anything", "not-a-valid-entry"));
        assert!(!verify_password("anything", ""));
    }
}
