use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};
use url::{Host, Url};
use wopi_storage_core::{
    sanitize_uri, Anonymizer, HostAuthorization, LockContext, StorageBackend, StorageError,
    StorageSettings,
};
use wopi_storage_local::LocalStorage;
use wopi_storage_remote::{WopiClient, WopiStorage};

/// Turn a document location into a URI.
///
/// Absolute URLs are kept as they are; anything else is a filesystem path,
/// made absolute against the working directory.
pub fn parse_location(location: &str) -> Result<Url, StorageError> {
    if location.is_empty() {
        return Err(StorageError::BadRequest("Empty document location".to_string()));
    }

    // Single-letter schemes are drive letters, not URLs.
    if let Ok(uri) = Url::parse(location) {
        if uri.scheme().len() > 1 {
            return Ok(uri);
        }
    }

    let path = std::path::absolute(location).map_err(|e| {
        StorageError::BadRequest(format!("Invalid document path {}: {}", location, e))
    })?;
    Url::from_file_path(&path).map_err(|()| {
        StorageError::BadRequest(format!("Invalid document path {}", path.display()))
    })
}

fn is_localhost(uri: &Url) -> bool {
    match uri.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Creates the storage backend for a document location.
///
/// Holds the process-wide settings, the host allow-list and the HTTP client
/// shared by every WOPI backend it creates.
#[derive(Debug)]
pub struct StorageFactory {
    settings: Arc<StorageSettings>,
    hosts: HostAuthorization,
    client: WopiClient,
}

impl StorageFactory {
    pub fn new(settings: StorageSettings) -> Result<Self, StorageError> {
        let client = WopiClient::from_settings(&settings)?;
        let hosts = HostAuthorization::from_settings(&settings.wopi);
        info!(
            "Storage configured: filesystem {}, WOPI {}",
            if settings.filesystem.allow { "enabled" } else { "disabled" },
            if hosts.is_wopi_enabled() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            settings: Arc::new(settings),
            hosts,
            client,
        })
    }

    pub fn settings(&self) -> &Arc<StorageSettings> {
        &self.settings
    }

    pub fn hosts(&self) -> &HostAuthorization {
        &self.hosts
    }

    /// A lock context using the configured refresh interval.
    pub fn new_lock_context(&self) -> LockContext {
        LockContext::new(self.settings.lock_refresh_interval())
    }

    /// Create the backend for `location`.
    ///
    /// Paths and `file:` URIs get a local backend, which requires filesystem
    /// storage to be enabled unless the caller hands the file over with
    /// `take_ownership`. Anything else is a WOPI document and its host must
    /// be trusted.
    pub async fn create(
        &self,
        location: &str,
        jail_root: &Path,
        jail_path: &Path,
        take_ownership: bool,
    ) -> Result<Box<dyn StorageBackend>, StorageError> {
        let uri = parse_location(location)?;
        let anonymizer = Anonymizer::from_settings(&self.settings.anonymization);
        let uri_anonym = anonymizer.url(sanitize_uri(&uri).as_str());

        if uri.scheme() == "file" {
            info!("Public URI [{}] is a file", uri_anonym);
            if self.settings.filesystem.allow || take_ownership {
                return Ok(Box::new(LocalStorage::new(
                    &uri,
                    jail_root,
                    jail_path,
                    take_ownership,
                    Arc::clone(&self.settings),
                )));
            }
            error!("Local storage is disabled. Enable filesystem storage in the settings to use it.");
        } else if self.hosts.is_wopi_enabled() {
            info!("Public URI [{}] considered WOPI", uri_anonym);
            let host = uri.host_str().unwrap_or_default().to_string();
            if self.is_host_authorized(&uri).await {
                return Ok(Box::new(WopiStorage::new(
                    &uri,
                    jail_root,
                    jail_path,
                    Arc::clone(&self.settings),
                    self.client.clone(),
                )));
            }
            error!(
                "No acceptable WOPI hosts found matching the target host [{}] in config",
                host
            );
            return Err(StorageError::Unauthorized(format!(
                "No acceptable WOPI hosts found matching the target host [{}] in config.",
                host
            )));
        }

        Err(StorageError::BadRequest(
            "No Storage configured or invalid URI.".to_string(),
        ))
    }

    /// Whether the host of `uri`, or one of its addresses, may be used.
    async fn is_host_authorized(&self, uri: &Url) -> bool {
        let Some(host) = uri.host_str() else {
            return false;
        };

        if self.hosts.allowed_host(host) && self.hosts.allowed_alias(uri) {
            return true;
        }
        if is_localhost(uri) {
            info!("WOPI host [{}] is on the same host. Connection is allowed.", host);
            return true;
        }

        let lookup = match uri.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => host.to_string(),
        };
        let port = uri.port_or_known_default().unwrap_or(80);
        let addresses = match tokio::net::lookup_host((lookup.as_str(), port)).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("Failed to resolve WOPI host [{}]: {}", host, e);
                return false;
            }
        };

        for address in addresses {
            if self.hosts.allowed_host(&address.ip().to_string()) && self.hosts.allowed_alias(uri)
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wopi_storage_core::{AliasGroup, AliasGroupSettings, AliasMode, HostEntry};

    fn host(pattern: &str, allow: bool) -> HostEntry {
        HostEntry {
            host: pattern.to_string(),
            allow,
        }
    }

    fn wopi_settings(hosts: Vec<HostEntry>) -> StorageSettings {
        let mut settings = StorageSettings::default();
        settings.wopi.allow = true;
        settings.wopi.hosts = hosts;
        settings
    }

    async fn create(factory: &StorageFactory, location: &str) -> Result<Box<dyn StorageBackend>, StorageError> {
        factory
            .create(location, Path::new("/tmp/jails"), Path::new("/doc"), false)
            .await
    }

    #[test]
    fn test_parse_location() {
        let uri = parse_location("https://wopi.example.com/wopi/files/1?access_token=x").unwrap();
        assert_eq!(uri.scheme(), "https");

        let uri = parse_location("docs/report.odt").unwrap();
        assert_eq!(uri.scheme(), "file");
        assert!(uri.path().ends_with("/docs/report.odt"));

        let uri = parse_location("file:///tmp/report.odt").unwrap();
        assert_eq!(uri.path(), "/tmp/report.odt");

        assert!(matches!(parse_location(""), Err(StorageError::BadRequest(_))));
    }

    #[test]
    fn test_is_localhost() {
        for local in ["http://localhost:9980/", "http://127.0.0.1/", "http://[::1]:8080/"] {
            assert!(is_localhost(&Url::parse(local).unwrap()), "{}", local);
        }
        assert!(!is_localhost(&Url::parse("https://wopi.example.com/").unwrap()));
    }

    #[tokio::test]
    async fn test_local_requires_filesystem_or_ownership() {
        let factory = StorageFactory::new(StorageSettings::default()).unwrap();
        let err = create(&factory, "/tmp/report.odt").await.unwrap_err();
        assert!(matches!(err, StorageError::BadRequest(_)));

        let storage = factory
            .create("/tmp/report.odt", Path::new("/tmp/jails"), Path::new("/doc"), true)
            .await
            .unwrap();
        assert_eq!(storage.base().uri().scheme(), "file");

        let mut settings = StorageSettings::default();
        settings.filesystem.allow = true;
        let factory = StorageFactory::new(settings).unwrap();
        assert!(create(&factory, "file:///tmp/report.odt").await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_requires_wopi() {
        let factory = StorageFactory::new(StorageSettings::default()).unwrap();
        let err = create(&factory, "https://wopi.example.com/wopi/files/1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_allow_listed_host() {
        let factory =
            StorageFactory::new(wopi_settings(vec![host(r"wopi\.example\.com", true)])).unwrap();
        let storage = create(&factory, "https://wopi.example.com/wopi/files/1?access_token=abc")
            .await
            .unwrap();
        assert_eq!(storage.base().uri().host_str(), Some("wopi.example.com"));
        assert!(!storage.base().uri().as_str().contains("abc"));
    }

    #[tokio::test]
    async fn test_unknown_host_is_unauthorized() {
        let factory =
            StorageFactory::new(wopi_settings(vec![host(r"wopi\.example\.com", true)])).unwrap();
        let err = create(&factory, "https://untrusted.invalid/wopi/files/1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_denied_host_is_unauthorized() {
        let factory = StorageFactory::new(wopi_settings(vec![
            host(r".*\.invalid", true),
            host(r"blocked\.invalid", false),
        ]))
        .unwrap();
        assert!(create(&factory, "https://open.invalid/wopi/files/1").await.is_ok());
        let err = create(&factory, "https://blocked.invalid/wopi/files/1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_localhost_is_always_allowed() {
        let factory = StorageFactory::new(wopi_settings(Vec::new())).unwrap();
        assert!(create(&factory, "http://localhost:9980/wopi/files/1").await.is_ok());
        assert!(create(&factory, "http://127.0.0.1:9980/wopi/files/1").await.is_ok());
    }

    #[tokio::test]
    async fn test_alias_groups() {
        let mut settings = wopi_settings(vec![host(r".*\.invalid", true)]);
        settings.wopi.alias_groups = Some(AliasGroupSettings {
            mode: AliasMode::Groups,
            groups: vec![AliasGroup {
                host: "https://wopi.invalid".to_string(),
                allow: true,
                aliases: vec!["https://alias.invalid".to_string()],
            }],
        });
        let factory = StorageFactory::new(settings).unwrap();

        assert!(create(&factory, "https://wopi.invalid/wopi/files/1").await.is_ok());
        assert!(create(&factory, "https://alias.invalid/wopi/files/1").await.is_ok());
        let err = create(&factory, "https://stray.invalid/wopi/files/1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));

        let canonical = factory
            .hosts()
            .resolve_canonical_uri(&Url::parse("https://alias.invalid/wopi/files/1").unwrap());
        assert_eq!(canonical, "https://wopi.invalid:443/wopi/files/1");
    }

    #[tokio::test]
    async fn test_first_host_mode() {
        let mut settings = wopi_settings(vec![host(r".*\.invalid", true)]);
        settings.wopi.alias_groups = Some(AliasGroupSettings {
            mode: AliasMode::First,
            groups: Vec::new(),
        });
        let factory = StorageFactory::new(settings).unwrap();

        assert!(create(&factory, "https://first.invalid/wopi/files/1").await.is_ok());
        assert!(create(&factory, "https://first.invalid/wopi/files/2").await.is_ok());
        let err = create(&factory, "https://second.invalid/wopi/files/1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));
    }

    #[test]
    fn test_lock_context_uses_settings() {
        let mut settings = StorageSettings::default();
        settings.wopi.locking_refresh_secs = 42;
        let factory = StorageFactory::new(settings).unwrap();
        assert_eq!(
            factory.new_lock_context().refresh_interval(),
            std::time::Duration::from_secs(42)
        );
    }
}
