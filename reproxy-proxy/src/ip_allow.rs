use ipnet::IpNet;
use std::net::IpAddr;

/// An empty `cidrs` list means "allow from anywhere" — `only_from_ips` is opt-in per rule.
/// Entries that fail to parse as a CIDR are tried as a bare IP (an implicit /32 or /128).
pub fn is_allowed(cidrs: &[String], client_ip: IpAddr) -> bool {
    if cidrs.is_empty() {
        return true;
    }
    cidrs.iter().any(|entry| match entry.parse::<IpNet>() {
        Ok(net) => net.contains(&client_ip),
        Err(_) => entry.parse::<IpAddr>().map(|ip| ip == client_ip).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everything() {
        assert!(is_allowed(&[], "203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn cidr_match_allows() {
        let cidrs = vec!["10.0.0.0/8".to_string()];
        assert!(is_allowed(&cidrs, "10.1.2.3".parse().unwrap()));
        assert!(!is_allowed(&cidrs, "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn bare_ip_match_allows_exact_address_only() {
        let cidrs = vec!["203.0.113.5".to_string()];
        assert!(is_allowed(&cidrs, "203.0.113.5".parse().unwrap()));
        assert!(!is_allowed(&cidrs, "203.0.113.6".parse().unwrap()));
    }
}
