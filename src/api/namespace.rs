use crate::api::error::Error;

/// Namespaces beginning with an underscore are reserved for internal
/// services, such as the session sync service.
const RESERVED_PREFIX: char = '_';

/// Checks that ns is valid for application use.
pub fn validate(ns: &str) -> Result<(), Error> {
    if ns.starts_with(RESERVED_PREFIX) {
        return Err(Error::InvalidNamespace(format!(
            "namespace '{}' is reserved",
            ns
        )));
    }

    validate_internal(ns)
}

/// Checks namespace syntax only, allowing the reserved prefix. Used when
/// binding internal services.
pub fn validate_internal(ns: &str) -> Result<(), Error> {
    if ns.is_empty() {
        return Err(Error::InvalidNamespace(
            "namespace must not be empty".to_string(),
        ));
    }

    if !ns.chars().all(|c| c.is_ascii_graphic()) {
        return Err(Error::InvalidNamespace(format!(
            "namespace '{}' contains invalid characters",
            ns
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_namespaces() {
        for ns in ["math", "my-api.v2", "a"] {
            assert!(validate(ns).is_ok(), "expected '{}' to be valid", ns);
        }
    }

    #[test]
    fn rejects_empty_namespaces() {
        assert!(matches!(validate(""), Err(Error::InvalidNamespace(_))));
    }

    #[test]
    fn rejects_unprintable_namespaces() {
        for ns in ["with space", "tab\tchar", "ünïcode"] {
            assert!(validate(ns).is_err(), "expected '{}' to be rejected", ns);
        }
    }

    #[test]
    fn rejects_the_reserved_prefix_for_applications_only() {
        assert!(validate("_sess").is_err());
        assert!(validate_internal("_sess").is_ok());
    }
}
