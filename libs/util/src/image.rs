//! Installer image reference parsing. Factory references carry a
//! content-addressed schematic id in the path and the Talos version in the
//! tag.

use thiserror::Error;

pub const FACTORY_HOST: &str = "factory.talos.dev";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("image reference {0:?} has no tag")]
    MissingTag(String),

    #[error("image reference {0:?} is not a factory installer reference")]
    NotFactory(String),
}

/// A parsed `factory.talos.dev/<kind>/<schematic>:<version>` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryReference {
    pub schematic: String,
    pub version: String,
    pub secure_boot: bool,
}

/// Split any image reference into repository and tag.
pub fn split_tag(reference: &str) -> Result<(&str, &str), Error> {
    // The tag separator is the last ':' after the last '/', so host ports
    // do not confuse the split.
    let slash = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[slash..].rfind(':') {
        Some(colon) => {
            let at = slash + colon;
            Ok((&reference[..at], &reference[at + 1..]))
        }
        None => Err(Error::MissingTag(reference.to_string())),
    }
}

impl FactoryReference {
    pub fn parse(reference: &str) -> Result<Self, Error> {
        let (repository, version) = split_tag(reference)?;

        let mut segments = repository.split('/');
        if segments.next() != Some(FACTORY_HOST) {
            return Err(Error::NotFactory(reference.to_string()));
        }
        let (Some(kind), Some(schematic), None) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(Error::NotFactory(reference.to_string()));
        };
        if !kind.contains("installer") {
            return Err(Error::NotFactory(reference.to_string()));
        }

        Ok(Self {
            schematic: schematic.to_string(),
            version: version.to_string(),
            secure_boot: kind.contains("secureboot"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_factory_reference() {
        let reference = FactoryReference::parse(
            "factory.talos.dev/installer/376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba:v1.9.1",
        )
        .unwrap();
        assert_eq!(
            reference.schematic,
            "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba"
        );
        assert_eq!(reference.version, "v1.9.1");
        assert!(!reference.secure_boot);
    }

    #[test]
    fn test_parse_secureboot_reference() {
        let reference =
            FactoryReference::parse("factory.talos.dev/installer-secureboot/abc:v1.9.1").unwrap();
        assert!(reference.secure_boot);
    }

    #[test]
    fn test_rejects_foreign_registry() {
        let err = FactoryReference::parse("ghcr.io/siderolabs/installer:v1.9.1").unwrap_err();
        assert!(matches!(err, Error::NotFactory(_)));
    }

    #[test]
    fn test_split_tag_ignores_port_colon() {
        let (repo, tag) = split_tag("registry.local:5000/installer:v1").unwrap();
        assert_eq!(repo, "registry.local:5000/installer");
        assert_eq!(tag, "v1");
    }

    #[test]
    fn test_missing_tag() {
        assert!(split_tag("factory.talos.dev/installer/abc").is_err());
    }
}
