//! Kubernetes name validation
//!
//! Inputs are checked before any upstream call so malformed paths fail fast
//! with a validation error instead of an opaque 404 from the API server.

use crate::error::Error;

const DNS1123_LABEL_MAX: usize = 63;
const DNS1123_SUBDOMAIN_MAX: usize = 253;

/// Check a DNS-1123 label (namespaces, container names)
pub fn is_dns1123_label(value: &str) -> bool {
    if value.is_empty() || value.len() > DNS1123_LABEL_MAX {
        return false;
    }
    let bytes = value.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// Check a DNS-1123 subdomain (most object names)
pub fn is_dns1123_subdomain(value: &str) -> bool {
    if value.is_empty() || value.len() > DNS1123_SUBDOMAIN_MAX {
        return false;
    }
    value.split('.').all(is_dns1123_label)
}

/// Validate a namespace path segment
pub fn validate_namespace(namespace: &str) -> Result<(), Error> {
    if is_dns1123_label(namespace) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid namespace {:?}: must be a DNS-1123 label",
            namespace
        )))
    }
}

/// Validate an object name path segment
pub fn validate_resource_name(name: &str) -> Result<(), Error> {
    // Some kinds (e.g. RBAC roles) allow ':' in names
    let normalized = name.replace(':', "-");
    if is_dns1123_subdomain(&normalized) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid resource name {:?}: must be a DNS-1123 subdomain",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert!(is_dns1123_label("default"));
        assert!(is_dns1123_label("kube-system"));
        assert!(is_dns1123_label("a1"));
        assert!(!is_dns1123_label(""));
        assert!(!is_dns1123_label("-lead"));
        assert!(!is_dns1123_label("trail-"));
        assert!(!is_dns1123_label("Upper"));
        assert!(!is_dns1123_label("dot.ted"));
        assert!(!is_dns1123_label(&"a".repeat(64)));
    }

    #[test]
    fn subdomains() {
        assert!(is_dns1123_subdomain("nginx-7c5ddbdf54-x2x8k"));
        assert!(is_dns1123_subdomain("widgets.example.com"));
        assert!(!is_dns1123_subdomain("bad..dots"));
        assert!(!is_dns1123_subdomain("under_score"));
    }

    #[test]
    fn resource_names_allow_colons() {
        assert!(validate_resource_name("system:controller:job-controller").is_ok());
        assert!(validate_resource_name("../etc").is_err());
    }

    #[test]
    fn namespace_errors_are_validation_errors() {
        assert!(matches!(
            validate_namespace("Not_Valid"),
            Err(Error::Validation(_))
        ));
        assert!(validate_namespace("default").is_ok());
    }
}
