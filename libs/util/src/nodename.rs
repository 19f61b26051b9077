//! Kubernetes node name derivation from a hostname.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("hostname {0:?} produces an empty node name")]
    Empty(String),
}

/// Derive a Kubernetes-compliant node name: lowercase ASCII letters, keep
/// digits, replace underscores with `-`, keep `.` and `-`, drop everything
/// else, then trim leading/trailing `.` and `-`.
pub fn from_hostname(hostname: &str) -> Result<String, Error> {
    let mapped: String = hostname
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '_' => Some('-'),
            _ => None,
        })
        .collect();

    let trimmed = mapped.trim_matches(|c| c == '.' || c == '-');
    if trimmed.is_empty() {
        return Err(Error::Empty(hostname.to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        assert_eq!(
            from_hostname("talos-fdae41e4649b9303111122223333-4444").unwrap(),
            "talos-fdae41e4649b9303111122223333-4444"
        );
    }

    #[test]
    fn test_lowercases_and_maps_underscores() {
        assert_eq!(from_hostname("My_Node.Example").unwrap(), "my-node.example");
    }

    #[test]
    fn test_drops_invalid_and_trims() {
        assert_eq!(from_hostname("-node!@#name.").unwrap(), "nodename");
        assert_eq!(from_hostname("node_name").unwrap(), "node-name");
        assert_eq!(from_hostname("..--").unwrap_err(), Error::Empty("..--".to_string()));
    }

    #[test]
    fn test_result_matches_kubernetes_shape() {
        for input in ["Worker_01", "a", "9node", "x.y-z"] {
            let name = from_hostname(input).unwrap();
            assert!(
                name.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
            );
            assert!(!name.starts_with(['.', '-']));
            assert!(!name.ends_with(['.', '-']));
        }
    }
}
