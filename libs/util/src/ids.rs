//! Binary identifiers, treated as opaque bytes at rest and formatted at the
//! edges: base62 node ids, low-endian hex etcd member ids, base36 hashed
//! hostnames, ULA pseudo-addresses, timestamp-seeded event ids.

use std::net::Ipv6Addr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use ulid::Ulid;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Size of a node identity in raw bytes.
pub const NODE_ID_BYTES: usize = 32;

/// Generate a fresh node id: 32 random bytes, base62-encoded.
pub fn generate_node_id() -> String {
    let mut raw = [0u8; NODE_ID_BYTES];
    rand::rng().fill_bytes(&mut raw);
    encode_base(&raw, BASE62)
}

/// Generate a fresh 64-bit etcd member id, formatted low-endian hex.
pub fn generate_member_id() -> String {
    format_member_id(rand::rng().next_u64())
}

/// Format an etcd member id as low-endian hex over 64 bits.
pub fn format_member_id(id: u64) -> String {
    hex::encode(id.to_le_bytes())
}

/// Parse a low-endian hex member id back to its numeric form.
pub fn parse_member_id(id: &str) -> Option<u64> {
    let bytes = hex::decode(id).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Stable hostname for a node id: base36 over the first 8 bytes of
/// SHA-256(id), split `b[0:3]-b[3:6]`.
pub fn stable_hostname(node_id: &str) -> String {
    let digest = Sha256::digest(node_id.as_bytes());
    let b = encode_base(&digest[..8], BASE36);
    // 8 random-ish bytes encode to 10+ base36 digits, so the split is safe;
    // pad defensively for degenerate inputs all the same.
    let b = format!("{b:0>6}");
    format!("talos-{}-{}", &b[..3], &b[3..6])
}

/// Deterministic ULA-prefix pseudo-address for a node: the prefix is the
/// first 8 bytes of SHA-256(id) with fixed marker bytes, the interface
/// identifier is random.
pub fn pseudo_ipv6(node_id: &str) -> Ipv6Addr {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut octets = [0u8; 16];
    octets[..8].copy_from_slice(&digest[..8]);
    octets[0] = 0xdd;
    octets[7] = 0x04;
    rand::rng().fill_bytes(&mut octets[8..]);
    Ipv6Addr::from(octets)
}

/// Event id seeded from the moment the underlying resource changed, so
/// replays after reconnection produce the same id for the same change.
pub fn event_id(updated: DateTime<Utc>) -> String {
    let system_time: std::time::SystemTime = updated.into();
    Ulid::from_datetime(system_time).to_string()
}

/// Encode bytes as a big-endian big integer in the given alphabet.
fn encode_base(bytes: &[u8], alphabet: &[u8]) -> String {
    let base = alphabet.len() as u32;
    let mut digits: Vec<u8> = Vec::new();
    let mut scratch: Vec<u32> = bytes.iter().map(|&b| b as u32).collect();

    loop {
        let mut remainder = 0u32;
        let mut any = false;
        for digit in scratch.iter_mut() {
            let value = remainder * 256 + *digit;
            *digit = value / base;
            remainder = value % base;
            any |= *digit != 0;
        }
        digits.push(alphabet[remainder as usize]);
        if !any {
            break;
        }
    }

    digits.reverse();
    String::from_utf8(digits).expect("alphabet is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_alphabet_and_length() {
        let id = generate_node_id();
        assert!(id.len() >= 40, "32 bytes encode to 40+ base62 digits: {id}");
        assert!(id.bytes().all(|b| BASE62.contains(&b)));
        assert_ne!(generate_node_id(), id);
    }

    #[test]
    fn test_member_id_low_endian_hex() {
        assert_eq!(format_member_id(42), "2a00000000000000");
        assert_eq!(format_member_id(0), "0000000000000000");
        assert_eq!(format_member_id(u64::MAX), "ffffffffffffffff");
    }

    #[test]
    fn test_member_id_round_trip() {
        for id in [0u64, 1, 42, u64::MAX, 0xdead_beef] {
            assert_eq!(parse_member_id(&format_member_id(id)), Some(id));
        }
        assert_eq!(parse_member_id("zz"), None);
        assert_eq!(parse_member_id("2a00"), None);
    }

    #[test]
    fn test_stable_hostname_is_stable() {
        let a = stable_hostname("node-1");
        let b = stable_hostname("node-1");
        assert_eq!(a, b);
        assert_ne!(a, stable_hostname("node-2"));

        let rest = a.strip_prefix("talos-").unwrap();
        let parts: Vec<&str> = rest.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 3);
        assert!(rest
            .bytes()
            .all(|b| b == b'-' || b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_pseudo_ipv6_prefix_deterministic() {
        let a = pseudo_ipv6("node-1");
        let b = pseudo_ipv6("node-1");
        assert_eq!(a.octets()[..8], b.octets()[..8]);
        assert_eq!(a.octets()[0], 0xdd);
        assert_eq!(a.octets()[7], 0x04);
        // Interface identifiers are random per call.
        assert_ne!(a.octets()[8..], b.octets()[8..]);
    }

    #[test]
    fn test_encode_base_zero() {
        assert_eq!(encode_base(&[0, 0], BASE62), "0");
    }
}
