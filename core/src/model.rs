use serde::{Deserialize, Serialize};

/// Registrable base domain (eTLD+1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
}

/// A matched, fully-qualified host name tracked by the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subdomain {
    pub name: String,
    pub domain: String,
    /// Takeover service id, empty when not vulnerable.
    pub takeover: String,
    pub ports: Vec<Port>,
}

/// An open port observed on a subdomain. Rows are append-only per distinct
/// (number, subdomain, protocol, service, product, version) tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub subdomain: String,
    pub protocol: String,
    pub service: String,
    pub product: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl Subdomain {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Subdomain { name: name.into(), domain: domain.into(), ..Default::default() }
    }

    pub fn is_vulnerable(&self) -> bool {
        !self.takeover.is_empty()
    }
}

/// Derive the registrable base domain of a host name using the public suffix list.
/// Returns `None` for bare suffixes and names the list cannot place.
pub fn base_domain(name: &str) -> Option<String> {
    let lowered = name.trim_end_matches('.').to_ascii_lowercase();
    psl::domain_str(&lowered).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_domain_of_nested_names() {
        assert_eq!(base_domain("api.example.com").as_deref(), Some("example.com"));
        assert_eq!(base_domain("a.b.Example.COM.").as_deref(), Some("example.com"));
        assert_eq!(base_domain("shop.example.co.uk").as_deref(), Some("example.co.uk"));
    }

    #[test]
    fn base_domain_rejects_bare_suffix() {
        assert_eq!(base_domain("co.uk"), None);
    }
}
