//! Durable ledger key and entry codec.
//!
//! Ledger entries live in a persisted key-value store under keys of the form
//! `tus::<content-descriptor>::<fingerprint>`. The value is a JSON document:
//!
//! ```json
//! {"size": 1000, "metadata": {"title": "RXBpc29kZSAx"},
//!  "creationTime": "2024-05-01T10:00:00Z", "uploadUrl": "https://.../abc123"}
//! ```
//!
//! Metadata values are base64 encoded (standard alphabet) at rest.

use crate::upload::{Metadata, UploadId};
use crate::{Error, Result};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Leading segment shared by every upload-session key.
pub const LEDGER_KEY_PREFIX: &str = "tus";

/// Separator between key segments.
pub const KEY_SEPARATOR: &str = "::";

/// Parsed ledger key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    descriptor: String,
    fingerprint: String,
}

impl LedgerKey {
    /// Build a key from its parts.
    pub fn new(descriptor: impl Into<String>, fingerprint: impl Into<String>) -> Result<Self> {
        let descriptor = descriptor.into();
        let fingerprint = fingerprint.into();

        if descriptor.is_empty() {
            return Err(Error::InvalidLedgerKey("empty content descriptor".into()));
        }
        if fingerprint.is_empty() || fingerprint.contains(KEY_SEPARATOR) {
            return Err(Error::InvalidLedgerKey(format!(
                "invalid fingerprint segment: {fingerprint:?}"
            )));
        }

        Ok(Self {
            descriptor,
            fingerprint,
        })
    }

    /// Build a key for a new session with a random fingerprint.
    pub fn generate(descriptor: impl Into<String>) -> Result<Self> {
        Self::new(descriptor, Uuid::new_v4().simple().to_string())
    }

    /// Parse a raw storage key.
    ///
    /// The fingerprint is the final `::` segment; everything between the
    /// prefix and the fingerprint is the content descriptor.
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix(LEDGER_KEY_PREFIX)
            .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR))
            .ok_or_else(|| Error::InvalidLedgerKey(format!("missing tus prefix: {raw}")))?;

        let (descriptor, fingerprint) = rest
            .rsplit_once(KEY_SEPARATOR)
            .ok_or_else(|| Error::InvalidLedgerKey(format!("missing fingerprint: {raw}")))?;

        Self::new(descriptor, fingerprint)
    }

    /// Check whether a raw key uses the upload-session naming convention.
    pub fn matches(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    /// Content descriptor segment.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Trailing fingerprint segment.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{LEDGER_KEY_PREFIX}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.descriptor, self.fingerprint
        )
    }
}

impl fmt::Debug for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LedgerKey({self})")
    }
}

/// One resumable session known to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: LedgerKey,
    /// Expected upload size in bytes.
    pub size: u64,
    /// Decoded metadata.
    pub metadata: Metadata,
    /// RFC 3339 timestamp of session creation.
    pub creation_time: String,
    /// Resumable-upload session URL.
    pub session_url: String,
}

/// On-disk representation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    size: Option<u64>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    creation_time: String,
    upload_url: Option<String>,
}

impl LedgerEntry {
    /// Create an entry stamped with the current time.
    pub fn new(key: LedgerKey, size: u64, metadata: Metadata, session_url: String) -> Self {
        let creation_time = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            key,
            size,
            metadata,
            creation_time,
            session_url,
        }
    }

    /// Decode a stored JSON value.
    pub fn decode(key: LedgerKey, raw: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidLedgerEntry {
            key: key.to_string(),
            reason,
        };

        let stored: StoredEntry =
            serde_json::from_str(raw).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
        let size = stored.size.ok_or_else(|| invalid("missing size".into()))?;
        let session_url = stored
            .upload_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| invalid("missing uploadUrl".into()))?;
        let metadata = decode_metadata(&stored.metadata).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            key,
            size,
            metadata,
            creation_time: stored.creation_time,
            session_url,
        })
    }

    /// Encode into the stored JSON value.
    pub fn encode(&self) -> Result<String> {
        let stored = StoredEntry {
            size: Some(self.size),
            metadata: encode_metadata(&self.metadata),
            creation_time: self.creation_time.clone(),
            upload_url: Some(self.session_url.clone()),
        };
        serde_json::to_string(&stored).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Upload ID derived from the session URL.
    pub fn upload_id(&self) -> Result<UploadId> {
        UploadId::from_session_url(&self.session_url)
    }

    /// Creation time in epoch milliseconds, if the stored timestamp parses.
    pub fn creation_millis(&self) -> Option<u64> {
        let parsed = OffsetDateTime::parse(&self.creation_time, &Rfc3339).ok()?;
        u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
    }
}

/// Base64-encode every metadata value.
pub fn encode_metadata(metadata: &Metadata) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), general_purpose::STANDARD.encode(v)))
        .collect()
}

/// Base64-decode every metadata value.
pub fn decode_metadata(encoded: &BTreeMap<String, String>) -> Result<Metadata> {
    encoded
        .iter()
        .map(|(k, v)| {
            let bytes = general_purpose::STANDARD
                .decode(v)
                .map_err(|e| Error::InvalidMetadata(format!("{k}: {e}")))?;
            let value = String::from_utf8(bytes)
                .map_err(|e| Error::InvalidMetadata(format!("{k}: {e}")))?;
            Ok((k.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_takes_final_segment_as_fingerprint() {
        let key = LedgerKey::parse("tus::reelup-abc::f00d").unwrap();
        assert_eq!(key.descriptor(), "reelup-abc");
        assert_eq!(key.fingerprint(), "f00d");
        assert_eq!(key.to_string(), "tus::reelup-abc::f00d");

        let key = LedgerKey::parse("tus::tus-br-a::b.mp4-1000::9a8b").unwrap();
        assert_eq!(key.descriptor(), "tus-br-a::b.mp4-1000");
        assert_eq!(key.fingerprint(), "9a8b");
    }

    #[test]
    fn parse_key_rejects_foreign_keys() {
        for raw in [
            "settings",
            "tus",
            "tus::",
            "tus::only-descriptor",
            "tus::::fp",
            "tus::desc::",
            "other::desc::fp",
        ] {
            assert!(LedgerKey::parse(raw).is_err(), "{raw} should not parse");
            assert!(!LedgerKey::matches(raw));
        }
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = LedgerKey::generate("reelup-abc").unwrap();
        let b = LedgerKey::generate("reelup-abc").unwrap();
        assert_ne!(a, b);
        assert_eq!(LedgerKey::parse(&a.to_string()).unwrap(), a);
    }

    #[test]
    fn decode_stored_entry() {
        let key = LedgerKey::parse("tus::reelup-abc::1").unwrap();
        let raw = r#"{
            "size": 1000,
            "metadata": {"filename": "ZXAxLm1wNA==", "episode": "Mw=="},
            "creationTime": "2024-05-01T10:00:00Z",
            "uploadUrl": "https://up.example.com/files/abc123"
        }"#;

        let entry = LedgerEntry::decode(key, raw).unwrap();
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.metadata["filename"], "ep1.mp4");
        assert_eq!(entry.metadata["episode"], "3");
        assert_eq!(entry.upload_id().unwrap().as_str(), "abc123");
        assert_eq!(entry.creation_millis(), Some(1_714_557_600_000));
    }

    #[test]
    fn decode_rejects_malformed_entries() {
        let key = LedgerKey::parse("tus::reelup-abc::1").unwrap();
        let cases = [
            "not json",
            r#"{"metadata": {}, "uploadUrl": "https://x/files/a"}"#,
            r#"{"size": 5, "metadata": {}, "uploadUrl": null}"#,
            r#"{"size": 5, "metadata": {"k": "%%%"}, "uploadUrl": "https://x/files/a"}"#,
        ];
        for raw in cases {
            match LedgerEntry::decode(key.clone(), raw) {
                Err(Error::InvalidLedgerEntry { key, .. }) => {
                    assert_eq!(key, "tus::reelup-abc::1");
                }
                other => panic!("expected InvalidLedgerEntry for {raw}, got {other:?}"),
            }
        }
    }

    #[test]
    fn encode_base64_encodes_metadata_values() {
        let key = LedgerKey::parse("tus::reelup-abc::1").unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("title".into(), "Pilot".into());
        let entry = LedgerEntry::new(
            key.clone(),
            42,
            metadata,
            "https://up.example.com/files/zz".into(),
        );

        let raw = entry.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["metadata"]["title"], "UGlsb3Q=");
        assert_eq!(value["uploadUrl"], "https://up.example.com/files/zz");
        assert_eq!(value["size"], 42);

        assert_eq!(LedgerEntry::decode(key, &raw).unwrap(), entry);
        assert!(entry.creation_millis().is_some());
    }
}
