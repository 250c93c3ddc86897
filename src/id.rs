//! Short identifier generation.
//!
//! User ids and client keys are compact base62 strings: long enough that
//! collisions inside one control channel are not a practical concern, short
//! enough to fit the 255-byte frame URI alongside a host and port.

use rand::Rng;

const CHAR_MAP: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Prefix the server requires on every client key it accepts.
pub const CLIENT_KEY_PREFIX: &str = "ZC-";

/// Length of a generated user id.
pub const USER_ID_LEN: usize = 6;

/// Length of the random part of a generated client key.
pub const CLIENT_KEY_LEN: usize = 12;

fn random_base62(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHAR_MAP[rng.gen_range(0..CHAR_MAP.len())] as char)
        .collect()
}

/// Generate a short id for one SOCKS5 user flow.
pub fn user_id() -> String {
    random_base62(USER_ID_LEN)
}

/// Generate a default client key, e.g. `ZC-BCE92F671DD2`.
pub fn client_key() -> String {
    format!("{}{}", CLIENT_KEY_PREFIX, random_base62(CLIENT_KEY_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_shape() {
        let id = user_id();
        assert_eq!(id.len(), USER_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_client_key_shape() {
        let key = client_key();
        assert!(key.starts_with(CLIENT_KEY_PREFIX));
        assert_eq!(key.len(), CLIENT_KEY_PREFIX.len() + CLIENT_KEY_LEN);
    }

    #[test]
    fn test_ids_vary() {
        let a = user_id();
        let b = user_id();
        let c = user_id();
        // Three draws from 62^6 colliding means the RNG is broken.
        assert!(!(a == b && b == c));
    }
}
