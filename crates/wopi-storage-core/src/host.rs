//! Storage host authorization: allow/deny lists and alias groups.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::{error, info, warn};
use url::Url;

use crate::settings::{AliasMode, WopiSettings};

/// A host pattern, matched exactly or as a case-insensitive full-string regex.
#[derive(Debug, Clone)]
struct HostPattern {
    raw: String,
    regex: Option<Regex>,
}

impl HostPattern {
    fn new(raw: &str) -> Self {
        let regex = RegexBuilder::new(&format!("^(?:{})$", raw))
            .case_insensitive(true)
            .build()
            .ok();
        Self {
            raw: raw.to_string(),
            regex,
        }
    }

    fn matches_regex(&self, subject: &str) -> bool {
        self.regex
            .as_ref()
            .map(|re| re.is_match(subject))
            .unwrap_or(false)
    }
}

/// Exact matches win over regex matches; a pattern that is not a valid
/// regex can still match exactly.
fn find_match<'a>(patterns: &'a [HostPattern], subject: &str) -> Option<&'a HostPattern> {
    patterns
        .iter()
        .find(|p| p.raw == subject)
        .or_else(|| patterns.iter().find(|p| p.matches_regex(subject)))
}

/// Allow/deny matcher over host patterns. A deny match overrides any allow.
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    allowed: Vec<HostPattern>,
    denied: Vec<HostPattern>,
}

impl HostMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, pattern: &str) {
        self.allowed.push(HostPattern::new(pattern));
    }

    pub fn deny(&mut self, pattern: &str) {
        self.denied.push(HostPattern::new(pattern));
    }

    pub fn matches(&self, subject: &str) -> bool {
        find_match(&self.denied, subject).is_none() && find_match(&self.allowed, subject).is_some()
    }
}

/// `host[:port]` of a URL; the port is omitted when it is the scheme default.
pub fn authority_of(uri: &Url) -> String {
    let host = uri.host_str().unwrap_or("");
    match uri.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Split an alias such as `https://mirror[0-9]\.example\.com:8443` into its
/// authority and host without validating it as a URL, so regex aliases
/// survive. Default ports are dropped, as in [`authority_of`].
fn split_alias(alias: &str) -> (String, String) {
    let (scheme, rest) = match alias.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => (String::new(), alias),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host, Some(port))
        }
        _ => (authority, None),
    };
    let default_port = match scheme.as_str() {
        "https" => Some("443"),
        "http" => Some("80"),
        _ => None,
    };

    match port {
        Some(port) if Some(port) != default_port => (authority.to_string(), host.to_string()),
        _ => (host.to_string(), host.to_string()),
    }
}

/// Decides which storage hosts a document may be loaded from, and maps
/// alias authorities onto their canonical host.
///
/// Built once from [`WopiSettings`] and read-only afterwards, except for the
/// first-host slot used when no alias groups are configured.
#[derive(Debug)]
pub struct HostAuthorization {
    wopi_enabled: bool,
    wopi_hosts: HostMatcher,
    mode: AliasMode,
    /// Alias authority pattern -> canonical authority.
    alias_hosts: Vec<(HostPattern, String)>,
    /// Every canonical and alias authority from the groups.
    all_hosts: Vec<HostPattern>,
    first_host: OnceLock<String>,
}

impl HostAuthorization {
    pub fn from_settings(settings: &WopiSettings) -> Self {
        let mut auth = Self {
            wopi_enabled: settings.allow,
            wopi_hosts: HostMatcher::new(),
            mode: AliasMode::Compat,
            alias_hosts: Vec::new(),
            all_hosts: Vec::new(),
            first_host: OnceLock::new(),
        };

        if settings.allow {
            for entry in &settings.hosts {
                auth.add_wopi_host(&entry.host, entry.allow);
            }
        }

        let Some(alias_groups) = &settings.alias_groups else {
            return auth;
        };

        auth.mode = alias_groups.mode;
        if alias_groups.mode == AliasMode::First && !alias_groups.groups.is_empty() {
            error!("alias_groups are configured but mode is 'first'; set mode to 'groups' to use them");
            return auth;
        }

        for group in &alias_groups.groups {
            if group.host.is_empty() {
                continue;
            }

            let real_uri = match Url::parse(&group.host) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!("Ignoring alias group with invalid host [{}]: {}", group.host, e);
                    continue;
                }
            };
            let real_authority = authority_of(&real_uri);
            auth.add_wopi_host(real_uri.host_str().unwrap_or(""), group.allow);
            auth.all_hosts.push(HostPattern::new(&real_authority));

            for alias in &group.aliases {
                if alias.is_empty() {
                    continue;
                }
                let (alias_authority, alias_host) = split_alias(alias);
                if alias_authority.is_empty() {
                    warn!("Ignoring invalid alias [{}]", alias);
                    continue;
                }
                if auth.alias_hosts.iter().any(|(p, _)| p.raw == alias_authority) {
                    warn!(
                        "Alias [{}] is already mapped; keeping the first mapping",
                        alias_authority
                    );
                } else {
                    auth.alias_hosts
                        .push((HostPattern::new(&alias_authority), real_authority.clone()));
                }
                auth.all_hosts.push(HostPattern::new(&alias_authority));
                auth.add_wopi_host(&alias_host, group.allow);
            }
        }

        auth
    }

    fn add_wopi_host(&mut self, host: &str, allow: bool) {
        if host.is_empty() {
            return;
        }
        if allow {
            info!("Adding trusted WOPI host: [{}]", host);
            self.wopi_hosts.allow(host);
        } else {
            info!("Adding blocked WOPI host: [{}]", host);
            self.wopi_hosts.deny(host);
        }
    }

    pub fn is_wopi_enabled(&self) -> bool {
        self.wopi_enabled
    }

    pub fn mode(&self) -> AliasMode {
        self.mode
    }

    /// Whether remote access is enabled and `host` is allow-listed.
    pub fn allowed_host(&self, host: &str) -> bool {
        self.wopi_enabled && self.wopi_hosts.matches(host)
    }

    /// Whether the authority of `uri` belongs to the configured alias groups.
    ///
    /// Without alias groups the first authority ever checked is recorded and
    /// becomes the only one accepted.
    pub fn allowed_alias(&self, uri: &Url) -> bool {
        if self.mode == AliasMode::Compat {
            return true;
        }

        let authority = authority_of(uri);
        if self.all_hosts.is_empty() {
            let first = self.first_host.get_or_init(|| authority.clone());
            if *first != authority {
                error!("Only allowed host is: {}", first);
                return false;
            }
        } else if find_match(&self.all_hosts, &authority).is_none() {
            error!(
                "Host: {} is not allowed, it is not part of alias_groups configuration",
                authority
            );
            return false;
        }
        true
    }

    /// The canonical form of `uri`, used to tell whether two URIs address
    /// the same document through different aliases.
    pub fn resolve_canonical_uri(&self, uri: &Url) -> String {
        if self.mode == AliasMode::Compat {
            return uri.path().to_string();
        }

        let mut authority = authority_of(uri);
        if let Some((_, canonical)) = self
            .alias_hosts
            .iter()
            .find(|(p, _)| p.raw == authority)
            .or_else(|| self.alias_hosts.iter().find(|(p, _)| p.matches_regex(&authority)))
        {
            authority = canonical.clone();
        }

        if authority.is_empty() {
            return uri.path().to_string();
        }

        match Url::parse(&format!("{}://{}", uri.scheme(), authority)) {
            Ok(base) => format!(
                "{}://{}:{}{}",
                uri.scheme(),
                base.host_str().unwrap_or(""),
                base.port_or_known_default().unwrap_or(0),
                uri.path()
            ),
            Err(_) => uri.path().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AliasGroup, AliasGroupSettings, HostEntry};

    fn hosts(entries: &[(&str, bool)]) -> Vec<HostEntry> {
        entries
            .iter()
            .map(|(host, allow)| HostEntry {
                host: host.to_string(),
                allow: *allow,
            })
            .collect()
    }

    fn grouped_settings() -> WopiSettings {
        WopiSettings {
            allow: true,
            hosts: Vec::new(),
            alias_groups: Some(AliasGroupSettings {
                mode: AliasMode::Groups,
                groups: vec![AliasGroup {
                    host: "https://wopi.example.com".to_string(),
                    allow: true,
                    aliases: vec![
                        "https://files.example.com:8443".to_string(),
                        "https://mirror[0-9]\\.example\\.com".to_string(),
                    ],
                }],
            }),
            ..WopiSettings::default()
        }
    }

    #[test]
    fn test_matcher_exact_and_regex() {
        let mut matcher = HostMatcher::new();
        matcher.allow("wopi\\.example\\.com");
        matcher.allow("10\\.0\\.0\\.[0-9]+");
        matcher.allow("plain[host");

        assert!(matcher.matches("wopi.example.com"));
        assert!(matcher.matches("WOPI.EXAMPLE.COM"));
        assert!(matcher.matches("10.0.0.12"));
        assert!(matcher.matches("plain[host"));
        assert!(!matcher.matches("evil-wopi.example.com"));
        assert!(!matcher.matches("wopi.example.com.evil"));
    }

    #[test]
    fn test_deny_overrides_allow() {
        let mut matcher = HostMatcher::new();
        matcher.allow(".*\\.example\\.com");
        matcher.deny("blocked\\.example\\.com");

        assert!(matcher.matches("ok.example.com"));
        assert!(!matcher.matches("blocked.example.com"));
    }

    #[test]
    fn test_allowed_host_requires_wopi_enabled() {
        let mut settings = WopiSettings {
            allow: false,
            hosts: hosts(&[("wopi\\.example\\.com", true)]),
            ..WopiSettings::default()
        };
        assert!(!HostAuthorization::from_settings(&settings).allowed_host("wopi.example.com"));

        settings.allow = true;
        let auth = HostAuthorization::from_settings(&settings);
        assert!(auth.allowed_host("wopi.example.com"));
        assert!(!auth.allowed_host("other.example.com"));
    }

    #[test]
    fn test_compat_mode_allows_every_alias() {
        let auth = HostAuthorization::from_settings(&WopiSettings {
            allow: true,
            ..WopiSettings::default()
        });
        assert_eq!(auth.mode(), AliasMode::Compat);

        let uri = Url::parse("https://anything.example.com/wopi/files/1").unwrap();
        assert!(auth.allowed_alias(&uri));
        assert_eq!(auth.resolve_canonical_uri(&uri), "/wopi/files/1");
    }

    #[test]
    fn test_first_host_wins() {
        let auth = HostAuthorization::from_settings(&WopiSettings {
            allow: true,
            alias_groups: Some(AliasGroupSettings::default()),
            ..WopiSettings::default()
        });

        let first = Url::parse("https://one.example.com/wopi/files/1").unwrap();
        let second = Url::parse("https://two.example.com/wopi/files/1").unwrap();
        assert!(auth.allowed_alias(&first));
        assert!(auth.allowed_alias(&first));
        assert!(!auth.allowed_alias(&second));
    }

    #[test]
    fn test_groups_in_first_mode_are_ignored() {
        let mut settings = grouped_settings();
        if let Some(groups) = settings.alias_groups.as_mut() {
            groups.mode = AliasMode::First;
        }
        let auth = HostAuthorization::from_settings(&settings);

        assert!(!auth.allowed_host("wopi.example.com"));
        let uri = Url::parse("https://files.example.com:8443/wopi/files/1").unwrap();
        assert!(auth.allowed_alias(&uri));
        let other = Url::parse("https://wopi.example.com/wopi/files/1").unwrap();
        assert!(!auth.allowed_alias(&other));
    }

    #[test]
    fn test_alias_groups_authorize_hosts() {
        let auth = HostAuthorization::from_settings(&grouped_settings());

        assert!(auth.allowed_host("wopi.example.com"));
        assert!(auth.allowed_host("files.example.com"));

        let canonical = Url::parse("https://wopi.example.com/wopi/files/1").unwrap();
        let alias = Url::parse("https://files.example.com:8443/wopi/files/1").unwrap();
        let unknown = Url::parse("https://files.example.com:9999/wopi/files/1").unwrap();
        assert!(auth.allowed_alias(&canonical));
        assert!(auth.allowed_alias(&alias));
        assert!(!auth.allowed_alias(&unknown));
    }

    #[test]
    fn test_resolve_canonical_uri() {
        let auth = HostAuthorization::from_settings(&grouped_settings());

        let alias = Url::parse("https://files.example.com:8443/wopi/files/1?x=y").unwrap();
        let canonical = Url::parse("https://wopi.example.com/wopi/files/1").unwrap();
        let expected = "https://wopi.example.com:443/wopi/files/1";

        assert_eq!(auth.resolve_canonical_uri(&alias), expected);
        assert_eq!(auth.resolve_canonical_uri(&canonical), expected);
        // Pure: same input, same output.
        assert_eq!(auth.resolve_canonical_uri(&alias), auth.resolve_canonical_uri(&alias));
    }

    #[test]
    fn test_resolve_regex_alias() {
        let auth = HostAuthorization::from_settings(&grouped_settings());
        let alias = Url::parse("https://mirror3.example.com/wopi/files/7").unwrap();
        assert!(auth.allowed_alias(&alias));
        assert_eq!(
            auth.resolve_canonical_uri(&alias),
            "https://wopi.example.com:443/wopi/files/7"
        );
    }

    #[test]
    fn test_regex_alias_is_configurable() {
        let auth = HostAuthorization::from_settings(&grouped_settings());
        assert!(auth.allowed_host("mirror7.example.com"));
        assert!(!auth.allowed_host("mirrorX.example.com"));

        let stray = Url::parse("https://mirrorX.example.com/wopi/files/7").unwrap();
        assert!(!auth.allowed_alias(&stray));
        assert_eq!(auth.resolve_canonical_uri(&stray), "https://mirrorx.example.com:443/wopi/files/7");
    }

    #[test]
    fn test_split_alias() {
        assert_eq!(
            split_alias("https://mirror[0-9]\\.example\\.com"),
            (
                "mirror[0-9]\\.example\\.com".to_string(),
                "mirror[0-9]\\.example\\.com".to_string()
            )
        );
        assert_eq!(
            split_alias("https://files.example.com:8443/path"),
            ("files.example.com:8443".to_string(), "files.example.com".to_string())
        );
        assert_eq!(
            split_alias("https://files.example.com:443"),
            ("files.example.com".to_string(), "files.example.com".to_string())
        );
        assert_eq!(split_alias("").0, "");
    }

    #[test]
    fn test_authority_of_omits_default_port() {
        let uri = Url::parse("https://host.example.com:443/a").unwrap();
        assert_eq!(authority_of(&uri), "host.example.com");
        let uri = Url::parse("http://host.example.com:8080/a").unwrap();
        assert_eq!(authority_of(&uri), "host.example.com:8080");
    }
}
