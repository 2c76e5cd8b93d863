/// Appends the trailing root dot if missing.
pub fn qualified(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Qualifies `name` inside the `local.` domain unless it already is.
pub fn local_qualified(name: &str) -> String {
    if name.ends_with(".local.") {
        name.to_string()
    } else if name.ends_with(".local") {
        format!("{name}.")
    } else {
        format!("{}local.", qualified(name))
    }
}

/// Removes a trailing `.local.` / `.local` suffix.
pub fn strip_local(name: &str) -> &str {
    name.strip_suffix(".local.")
        .or_else(|| name.strip_suffix(".local"))
        .unwrap_or(name)
}

/// A service type is `_service._tcp` or `_service._udp` (RFC 6763 section 7).
pub fn is_valid_service_type(service_type: &str) -> bool {
    let bare = strip_local(service_type).trim_end_matches('.');
    let mut parts = bare.split('.');
    let (Some(service), Some(proto), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let service_ok = service.len() > 1
        && service.len() <= 16
        && service.starts_with('_')
        && service[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    service_ok && (proto == "_tcp" || proto == "_udp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_qualified_spellings() {
        assert_eq!(local_qualified("_ipp._tcp"), "_ipp._tcp.local.");
        assert_eq!(local_qualified("_ipp._tcp."), "_ipp._tcp.local.");
        assert_eq!(local_qualified("_ipp._tcp.local"), "_ipp._tcp.local.");
        assert_eq!(local_qualified("_ipp._tcp.local."), "_ipp._tcp.local.");
    }

    #[test]
    fn test_strip_local() {
        assert_eq!(strip_local("_http._tcp.local."), "_http._tcp");
        assert_eq!(strip_local("_http._tcp.local"), "_http._tcp");
        assert_eq!(strip_local("_http._tcp"), "_http._tcp");
    }

    #[test]
    fn test_service_type_validation() {
        assert!(is_valid_service_type("_ipp._tcp"));
        assert!(is_valid_service_type("_my-service._udp.local."));
        assert!(!is_valid_service_type("ipp._tcp"));
        assert!(!is_valid_service_type("_ipp._sctp"));
        assert!(!is_valid_service_type("_ipp"));
        assert!(!is_valid_service_type("_a._b._tcp"));
    }
}
