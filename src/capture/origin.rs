use log::debug;

/// Widget hostnames whose messages are trusted by default.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &["labs.heygen.com", "heygen.com", "app.heygen.com"];

/// Substring allow-list over the transport-reported origin.
///
/// Containment instead of exact host matching tolerates subdomain variation,
/// at the cost that any origin merely containing an allowed host also passes.
#[derive(Debug, Clone)]
pub struct OriginGate {
    allowed_hosts: Vec<String>,
}

impl OriginGate {
    pub fn new<I, S>(hosts: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> {
        let allowed_hosts = hosts
            .into_iter()
            .map(Into::into)
            .map(|h: String| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { allowed_hosts }
    }

    pub fn accepts(&self, origin: &str) -> bool {
        let origin = origin.trim().to_lowercase();
        if origin.is_empty() {
            debug!("Rejecting message with empty origin");
            return false;
        }
        let accepted = self.allowed_hosts.iter().any(|host| origin.contains(host.as_str()));
        if !accepted {
            debug!("Rejecting message from non-widget origin {}", origin);
        }
        accepted
    }
}

impl Default for OriginGate {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_HOSTS.iter().copied())
    }
}
