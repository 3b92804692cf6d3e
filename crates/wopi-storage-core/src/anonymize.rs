//! Salted, cached pseudonyms for identifiers that must not reach the logs.
//!
//! The cache is process-wide and append-only: once a string has been given a
//! pseudonym it keeps it for the life of the process, across all backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

use tracing::trace;

use crate::settings::AnonymizationSettings;

static ANONYMIZED: LazyLock<Mutex<HashMap<String, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static COUNTER: AtomicU64 = AtomicU64::new(0);

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Record an explicit pseudonym for `plain`. Empty values are ignored.
pub fn map_anonymized(plain: &str, anonymized: &str) {
    if plain.is_empty() || anonymized.is_empty() {
        return;
    }

    if plain != anonymized {
        trace!("Anonymizing [{}] -> [{}]", plain, anonymized);
    }

    ANONYMIZED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(plain.to_string(), anonymized.to_string());
}

/// Salted 64-bit FNV-1a. Bytes are sign-extended, so pseudonyms of
/// non-ASCII text match those issued by other servers sharing the salt.
fn salted_hash(text: &str, salt: u64) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    hash ^= salt;
    hash = hash.wrapping_mul(FNV_PRIME);
    for byte in text.bytes() {
        hash ^= byte as i8 as i64 as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= salt;
    hash.wrapping_mul(FNV_PRIME)
}

/// Return the pseudonym of `text`, creating and caching it on first use.
///
/// Pseudonyms look like `#<n>#<hash>#`: `n` is a per-process sequence number
/// that keeps them unique even if two hashes collide.
pub fn anonymize(text: &str, salt: u64) -> String {
    let mut cache = ANONYMIZED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(found) = cache.get(text) {
        return found.clone();
    }

    let hash = salted_hash(text, salt);
    let res = format!("#{:x}#{:x}#", COUNTER.fetch_add(1, Ordering::Relaxed), hash);
    cache.insert(text.to_string(), res.clone());
    res
}

/// Split a URL into `(base, filename, extension, params)`.
///
/// `base` keeps its trailing slash, `extension` its leading dot and `params`
/// its leading `?`, so concatenating the four parts yields the input.
pub fn split_url(url: &str) -> (&str, &str, &str, &str) {
    let (path, params) = match url.find('?') {
        Some(idx) => url.split_at(idx),
        None => (url, ""),
    };

    let (base, file) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    };

    let (filename, ext) = match file.rfind('.') {
        Some(idx) if idx > 0 => file.split_at(idx),
        _ => (file, ""),
    };

    (base, filename, ext, params)
}

/// The filename of a URL or path, without directory, extension or query.
pub fn filename_from_url(url: &str) -> &str {
    split_url(url).1
}

/// Replace the filename part of a URL with its pseudonym.
pub fn anonymize_url(url: &str, salt: u64) -> String {
    let (base, filename, ext, params) = split_url(url);
    format!("{}{}{}{}", base, anonymize(filename, salt), ext, params)
}

/// Privacy policy applied to everything the storage layer logs.
///
/// When disabled every method returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymizer {
    enabled: bool,
    salt: u64,
}

impl Anonymizer {
    pub fn new(enabled: bool, salt: u64) -> Self {
        Self { enabled, salt }
    }

    pub fn from_settings(settings: &AnonymizationSettings) -> Self {
        Self::new(settings.enabled, settings.salt)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self, url: &str) -> String {
        if self.enabled {
            anonymize_url(url, self.salt)
        } else {
            url.to_string()
        }
    }

    pub fn username(&self, username: &str) -> String {
        if self.enabled {
            anonymize(username, self.salt)
        } else {
            username.to_string()
        }
    }

    /// Pin the pseudonym of `plain`; a no-op when disabled.
    pub fn map(&self, plain: &str, anonymized: &str) {
        if self.enabled {
            map_anonymized(plain, anonymized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_sign_extends_high_bytes() {
        let step = |hash: u64, value: u64| (hash ^ value).wrapping_mul(FNV_PRIME);
        let salt = 7;
        let start = step(FNV_OFFSET_BASIS, salt);

        // "\u{e9}" is 0xc3 0xa9 in UTF-8.
        let expected = step(
            step(step(start, 0xffff_ffff_ffff_ffc3), 0xffff_ffff_ffff_ffa9),
            salt,
        );
        assert_eq!(salted_hash("\u{e9}", salt), expected);

        let ascii = step(step(start, u64::from(b'a')), salt);
        assert_eq!(salted_hash("a", salt), ascii);
    }

    #[test]
    fn test_anonymize_is_cached() {
        let first = anonymize("anonymize-cached-input", 42);
        let second = anonymize("anonymize-cached-input", 42);
        assert_eq!(first, second);
        assert!(first.starts_with('#') && first.ends_with('#'));
        assert!(!first.contains("anonymize-cached-input"));
    }

    #[test]
    fn test_anonymize_distinct_inputs() {
        let a = anonymize("anonymize-distinct-a", 7);
        let b = anonymize("anonymize-distinct-b", 7);
        assert_ne!(a, b);
    }

    #[test]
    fn test_map_anonymized_overrides() {
        map_anonymized("anonymize-mapped-user", "obfuscated-42");
        assert_eq!(anonymize("anonymize-mapped-user", 1), "obfuscated-42");

        map_anonymized("", "ignored");
        map_anonymized("anonymize-empty-target", "");
        assert_ne!(anonymize("anonymize-empty-target", 1), "");
    }

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("https://host/wopi/files/doc.odt?access_token=x"),
            ("https://host/wopi/files/", "doc", ".odt", "?access_token=x")
        );
        assert_eq!(split_url("doc.odt"), ("", "doc", ".odt", ""));
        assert_eq!(split_url("/tmp/noext"), ("/tmp/", "noext", "", ""));
        assert_eq!(split_url("/tmp/.hidden"), ("/tmp/", ".hidden", "", ""));
    }

    #[test]
    fn test_anonymize_url_keeps_structure() {
        let url = "https://host/wopi/files/secret-name.docx?a=b";
        let anon = anonymize_url(url, 3);
        assert!(anon.starts_with("https://host/wopi/files/#"));
        assert!(anon.ends_with("#.docx?a=b"));
        assert!(!anon.contains("secret-name"));
    }

    #[test]
    fn test_disabled_anonymizer_is_identity() {
        let anonymizer = Anonymizer::new(false, 0);
        assert_eq!(anonymizer.url("/path/file.odt"), "/path/file.odt");
        assert_eq!(anonymizer.username("alice"), "alice");
    }
}
