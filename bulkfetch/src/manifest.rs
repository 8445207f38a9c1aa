//! Manifest parsing.
//!
//! A manifest is a JSON object mapping a filename to either a bare hex
//! digest string (interpreted as MD5) or an object carrying the source URL,
//! an expected digest and an optional size:
//!
//! ```json
//! {
//!   "icons/play.png": "d41d8cd98f00b204e9800998ecf8427e",
//!   "levels/intro.json": {
//!     "url": "https://cdn.example.com/levels/intro-4f2a.json",
//!     "digest": { "algorithm": "sha256", "value": "4f2a..." },
//!     "size": 18234
//!   }
//! }
//! ```
//!
//! Keys are filenames relative to the download root. Bare-digest entries
//! resolve their URL against a base URL using the `<stem>-<digest><ext>`
//! naming scheme of the upstream asset store.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Digest algorithms accepted in manifests and state files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Length of the hex representation for this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 32,
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Sha256 => 64,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

/// An expected digest: algorithm plus lowercase hex value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    pub value: String,
}

impl Digest {
    /// Create a digest, normalising the hex value to lowercase.
    pub fn new(algorithm: DigestAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_ascii_lowercase(),
        }
    }

    /// Validate that the hex value has the right length and charset.
    pub fn is_well_formed(&self) -> bool {
        self.value.len() == self.algorithm.hex_len()
            && self.value.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

/// One entry of a parsed manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    /// Logical name, unique within the manifest. Doubles as the local path
    /// relative to the download root.
    pub name: String,
    /// Fully resolved source URL.
    pub url: String,
    /// Expected digest of the decoded payload.
    pub digest: Digest,
    /// Expected size in bytes, when the manifest declares one.
    pub expected_size: Option<u64>,
}

/// A parsed manifest, keyed by entry name.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

/// Errors raised while reading or parsing a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("manifest root must be a JSON object")]
    NotAnObject,

    #[error("entry {name:?} has a malformed digest: {value:?}")]
    MalformedDigest { name: String, value: String },

    #[error("entry {name:?} is a bare digest but no base URL is configured")]
    MissingBaseUrl { name: String },
}

/// Wire form of an object-style manifest entry.
#[derive(Deserialize)]
struct RawEntry {
    url: String,
    digest: Digest,
    #[serde(default)]
    size: Option<u64>,
}

impl Manifest {
    /// Parse manifest text.
    ///
    /// `base_url` is required only when the manifest contains bare-digest
    /// entries; their URL becomes `<base_url>/<stem>-<digest><ext>`.
    pub fn parse(text: &str, base_url: Option<&str>) -> Result<Self, ManifestError> {
        let healed = heal_trailing_commas(text);
        let root: serde_json::Value = serde_json::from_str(&healed)?;
        let map = root.as_object().ok_or(ManifestError::NotAnObject)?;

        let mut entries = BTreeMap::new();
        for (name, value) in map {
            let entry = match value {
                serde_json::Value::String(hexval) => {
                    let digest = Digest::new(DigestAlgorithm::Md5, hexval.as_str());
                    if !digest.is_well_formed() {
                        return Err(ManifestError::MalformedDigest {
                            name: name.clone(),
                            value: hexval.clone(),
                        });
                    }
                    let base = base_url.ok_or_else(|| ManifestError::MissingBaseUrl {
                        name: name.clone(),
                    })?;
                    ManifestEntry {
                        name: name.clone(),
                        url: remote_name_url(base, name, &digest.value),
                        digest,
                        expected_size: None,
                    }
                }
                other => {
                    let raw: RawEntry = serde_json::from_value(other.clone())?;
                    let digest = Digest::new(raw.digest.algorithm, raw.digest.value);
                    if !digest.is_well_formed() {
                        return Err(ManifestError::MalformedDigest {
                            name: name.clone(),
                            value: digest.value,
                        });
                    }
                    ManifestEntry {
                        name: name.clone(),
                        url: raw.url,
                        digest,
                        expected_size: raw.size,
                    }
                }
            };
            entries.insert(name.clone(), entry);
        }

        Ok(Self { entries })
    }

    /// Load and parse a manifest file.
    pub async fn load(path: &Path, base_url: Option<&str>) -> Result<Self, ManifestError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text, base_url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// URL for a bare-digest entry: the asset store publishes files under
/// `<stem>-<digest><ext>`.
fn remote_name_url(base: &str, name: &str, digest_hex: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    };
    format!("{}/{}-{}{}", base.trim_end_matches('/'), stem, digest_hex, ext)
}

/// Some upstream manifests are emitted with a trailing comma before the
/// closing brace, which strict JSON parsers reject.
fn heal_trailing_commas(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(stripped) = trimmed.strip_suffix(",}") {
        return format!("{}}}", stripped);
    }
    if let Some(stripped) = trimmed.strip_suffix(',') {
        return stripped.to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn parses_bare_digest_entry() {
        let text = format!(r#"{{ "a.json": "{}" }}"#, EMPTY_MD5);
        let manifest = Manifest::parse(&text, Some("https://cdn.example.com/assets")).unwrap();

        let entry = manifest.get("a.json").unwrap();
        assert_eq!(entry.digest.algorithm, DigestAlgorithm::Md5);
        assert_eq!(entry.digest.value, EMPTY_MD5);
        assert_eq!(
            entry.url,
            format!("https://cdn.example.com/assets/a-{}.json", EMPTY_MD5)
        );
        assert_eq!(entry.expected_size, None);
    }

    #[test]
    fn parses_object_entry() {
        let text = r#"{
            "levels/intro.json": {
                "url": "https://cdn.example.com/intro.json",
                "digest": { "algorithm": "sha256", "value": "AB12" },
                "size": 99
            }
        }"#;
        // 4 hex chars is not a valid sha256 length
        assert!(matches!(
            Manifest::parse(text, None),
            Err(ManifestError::MalformedDigest { .. })
        ));

        let good = text.replace("AB12", &"ab".repeat(32));
        let manifest = Manifest::parse(&good, None).unwrap();
        let entry = manifest.get("levels/intro.json").unwrap();
        assert_eq!(entry.digest.algorithm, DigestAlgorithm::Sha256);
        assert_eq!(entry.expected_size, Some(99));
        assert_eq!(entry.url, "https://cdn.example.com/intro.json");
    }

    #[test]
    fn digest_value_is_lowercased() {
        let text = format!(r#"{{ "a.bin": "{}" }}"#, EMPTY_MD5.to_uppercase());
        let manifest = Manifest::parse(&text, Some("https://x")).unwrap();
        assert_eq!(manifest.get("a.bin").unwrap().digest.value, EMPTY_MD5);
    }

    #[test]
    fn bare_entry_without_base_url_is_rejected() {
        let text = format!(r#"{{ "a.json": "{}" }}"#, EMPTY_MD5);
        assert!(matches!(
            Manifest::parse(&text, None),
            Err(ManifestError::MissingBaseUrl { .. })
        ));
    }

    #[test]
    fn heals_trailing_comma() {
        let text = format!(r#"{{ "a.json": "{}" ,}}"#, EMPTY_MD5);
        let manifest = Manifest::parse(&text, Some("https://x")).unwrap();
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn extensionless_name_keeps_digest_suffix() {
        assert_eq!(
            remote_name_url("https://x/", "README", "abc"),
            "https://x/README-abc"
        );
        assert_eq!(
            remote_name_url("https://x", "a/b.png", "abc"),
            "https://x/a/b-abc.png"
        );
    }
}
