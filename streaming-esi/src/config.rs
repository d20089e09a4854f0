use std::net::IpAddr;

use fastly::mime::Mime;

/// This struct is used to configure optional behaviour within the ESI processor.
///
/// ## Usage Example
/// ```rust,no_run
/// let config = streaming_esi::Configuration::default()
///     .with_recursion_limit(5)
///     .with_third_party_includes_disabled(true)
///     .with_third_party_includes_domain_whitelist(["cdn.example.com"]);
/// ```
#[allow(clippy::return_self_not_must_use)]
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Response media types that are eligible for ESI processing.
    pub content_types: Vec<String>,
    /// Maximum include depth. An include whose child level reaches this value is dropped.
    pub recursion_limit: u32,
    /// Whether a downstream surrogate that advertises ESI support may process the document instead.
    pub surrogate_delegation: SurrogateDelegation,
    /// Block includes to hosts other than the one the request was made to.
    pub disable_third_party_includes: bool,
    /// Hosts still allowed when third party includes are disabled.
    pub third_party_includes_domain_whitelist: Vec<String>,
    /// Cookie names that `$(HTTP_COOKIE)` never exposes.
    pub vars_cookie_blacklist: Vec<String>,
    /// Device token advertised in `Surrogate-Capability`.
    pub surrogate_capability_token: String,
    /// Number of bytes read from a body at a time.
    pub chunk_size: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            content_types: vec!["text/html".to_string(), "text/plain".to_string()],
            recursion_limit: 10,
            surrogate_delegation: SurrogateDelegation::default(),
            disable_third_party_includes: false,
            third_party_includes_domain_whitelist: Vec::new(),
            vars_cookie_blacklist: Vec::new(),
            surrogate_capability_token: "fastlyESI".to_string(),
            chunk_size: 16 * 1024,
        }
    }
}

impl Configuration {
    /// Replaces the list of content types that are processed.
    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = content_types.into_iter().map(Into::into).collect();
        self
    }
    /// Sets the maximum include depth.
    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }
    /// Sets the surrogate delegation policy.
    pub fn with_surrogate_delegation(mut self, delegation: SurrogateDelegation) -> Self {
        self.surrogate_delegation = delegation;
        self
    }
    /// Blocks or allows includes from other hosts.
    pub fn with_third_party_includes_disabled(mut self, disabled: impl Into<bool>) -> Self {
        self.disable_third_party_includes = disabled.into();
        self
    }
    /// Hosts that may still be included while third party includes are disabled.
    pub fn with_third_party_includes_domain_whitelist<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.third_party_includes_domain_whitelist = domains.into_iter().map(Into::into).collect();
        self
    }
    /// Cookie names hidden from variable lookups.
    pub fn with_vars_cookie_blacklist<I, S>(mut self, cookies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vars_cookie_blacklist = cookies.into_iter().map(Into::into).collect();
        self
    }
    pub fn with_surrogate_capability_token(mut self, token: impl Into<String>) -> Self {
        self.surrogate_capability_token = token.into();
        self
    }
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub(crate) fn is_processable_content_type(&self, content_type: &Mime) -> bool {
        let essence = content_type.essence_str();
        self.content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }

    pub(crate) fn is_whitelisted_host(&self, host: &str, port: Option<u16>) -> bool {
        let with_port = port.map(|port| format!("{host}:{port}"));
        self.third_party_includes_domain_whitelist
            .iter()
            .any(|allowed| {
                allowed.eq_ignore_ascii_case(host)
                    || with_port
                        .as_deref()
                        .is_some_and(|hp| allowed.eq_ignore_ascii_case(hp))
            })
    }
}

/// Controls whether ESI processing may be left to a surrogate further downstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SurrogateDelegation {
    /// Always process here.
    #[default]
    Disabled,
    /// Delegate whenever the request advertises ESI capability.
    Enabled,
    /// Delegate only for clients connecting from one of these addresses.
    AllowedIps(Vec<IpAddr>),
}

impl SurrogateDelegation {
    pub(crate) fn permits(&self, client_ip: Option<IpAddr>) -> bool {
        match self {
            Self::Disabled => false,
            Self::Enabled => true,
            Self::AllowedIps(ips) => client_ip.is_some_and(|ip| ips.contains(&ip)),
        }
    }
}
