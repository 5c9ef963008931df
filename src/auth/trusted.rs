//! Caller networks that bypass credential validation.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::ConfigError;

/// Flattened allow-list of IPs and CIDR blocks.
#[derive(Debug, Clone, Default)]
pub struct TrustedSources {
    nets: Vec<IpNet>,
}

impl TrustedSources {
    /// Parses the nested `trusted_sources` lists. A bare IP is a host-sized
    /// block.
    pub fn parse(groups: &[Vec<String>]) -> Result<Self, ConfigError> {
        let nets = groups
            .iter()
            .flatten()
            .map(|raw| parse_source(raw.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nets })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let mapped = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };

        self.nets
            .iter()
            .any(|net| net.contains(&ip) || mapped.is_some_and(|v4| net.contains(&v4)))
    }
}

fn parse_source(raw: &str) -> Result<IpNet, ConfigError> {
    raw.parse::<IpNet>()
        .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| ConfigError::InvalidTrustedSource {
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sources(groups: Vec<Vec<&str>>) -> TrustedSources {
        let groups: Vec<Vec<String>> = groups
            .into_iter()
            .map(|g| g.into_iter().map(String::from).collect())
            .collect();
        TrustedSources::parse(&groups).unwrap()
    }

    #[test]
    fn test_cidr_block_matches_members() {
        let sources = make_sources(vec![vec!["10.0.0.0/8"]]);
        assert!(sources.contains("10.1.2.3".parse().unwrap()));
        assert!(!sources.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_bare_ip_matches_only_itself() {
        let sources = make_sources(vec![vec!["192.168.1.10"]]);
        assert!(sources.contains("192.168.1.10".parse().unwrap()));
        assert!(!sources.contains("192.168.1.11".parse().unwrap()));
    }

    #[test]
    fn test_groups_are_flattened() {
        let sources = make_sources(vec![vec!["10.0.0.1"], vec!["::1", "172.16.0.0/12"]]);
        assert!(sources.contains("10.0.0.1".parse().unwrap()));
        assert!(sources.contains("::1".parse().unwrap()));
        assert!(sources.contains("172.20.0.5".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_matches_ipv4_block() {
        let sources = make_sources(vec![vec!["127.0.0.0/8"]]);
        assert!(sources.contains("::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_empty_sources_match_nothing() {
        let sources = make_sources(vec![]);
        assert!(!sources.contains("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_source_fails() {
        let result = TrustedSources::parse(&[vec!["10.0.0.0/33".to_string()]]);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidTrustedSource { value }) if value == "10.0.0.0/33"
        ));
    }
}
