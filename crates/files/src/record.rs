//! Content record data model: the immutable description of one audio object.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FileError;

const MAX_TEXT_LEN: usize = 256;
const MAX_METADATA_HASHES: usize = 16;

/// Content hash for audio bytes (BLAKE3, 32 bytes).
///
/// Rendered and serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash the given data using BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, FileError> {
        if hex_str.len() != 64 {
            return Err(FileError::InvalidHash(format!(
                "content hash hex must be 64 characters, got {}",
                hex_str.len()
            )));
        }
        let mut arr = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut arr)
            .map_err(|e| FileError::InvalidHash(format!("invalid hex: {e}")))?;
        Ok(Self(arr))
    }

    /// Shard directory name: the first two hex characters.
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

/// Deterministic digest of `bytes`.
pub fn compute_hash(bytes: &[u8]) -> ContentHash {
    ContentHash::from_data(bytes)
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = FileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ContentHash::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Caller-supplied metadata for a new piece of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// Duration in seconds.
    pub duration: f64,
}

impl TrackMetadata {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, duration: f64) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }
}

/// Immutable metadata record for one piece of audio.
///
/// The wire form is exactly `{title, artist, album, duration, content_hash,
/// size, created_at}`; `metadata_hashes` only appears when non-empty. Any edit
/// means a new record with a new hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentRecord {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// Duration in seconds.
    pub duration: f64,
    pub content_hash: ContentHash,
    /// Byte length of the content.
    pub size: u64,
    /// Creation timestamp, unix seconds.
    pub created_at: u64,
    /// Opaque watermark/fingerprint identifiers attached by the audio pipeline.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_hashes: BTreeMap<String, String>,
}

impl ContentRecord {
    /// Build a record for `bytes`, hashing them and stamping the current time.
    pub fn from_bytes(metadata: TrackMetadata, bytes: &[u8]) -> Self {
        Self::from_bytes_at(metadata, bytes, unix_now())
    }

    /// Build a record with an explicit creation timestamp.
    pub fn from_bytes_at(metadata: TrackMetadata, bytes: &[u8], created_at: u64) -> Self {
        Self {
            title: metadata.title,
            artist: metadata.artist,
            album: metadata.album,
            duration: metadata.duration,
            content_hash: compute_hash(bytes),
            size: bytes.len() as u64,
            created_at,
            metadata_hashes: BTreeMap::new(),
        }
    }

    /// Attach an opaque identifier produced by the audio-processing subsystem.
    pub fn with_metadata_hash(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_hashes.insert(kind.into(), value.into());
        self
    }

    /// Check `bytes` against the stored hash and size.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), FileError> {
        let actual = compute_hash(bytes);
        if actual != self.content_hash {
            return Err(FileError::ContentMismatch {
                expected: self.content_hash,
                actual,
            });
        }
        if bytes.len() as u64 != self.size {
            return Err(FileError::InvalidRecord(format!(
                "record claims {} bytes, content has {}",
                self.size,
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Validate the metadata fields.
    pub fn validate(&self) -> Result<(), FileError> {
        if self.title.trim().is_empty() || self.title.len() > MAX_TEXT_LEN {
            return Err(FileError::InvalidRecord(format!(
                "title must be 1-{MAX_TEXT_LEN} characters"
            )));
        }
        if self.artist.trim().is_empty() || self.artist.len() > MAX_TEXT_LEN {
            return Err(FileError::InvalidRecord(format!(
                "artist must be 1-{MAX_TEXT_LEN} characters"
            )));
        }
        if let Some(album) = &self.album {
            if album.len() > MAX_TEXT_LEN {
                return Err(FileError::InvalidRecord("album name too long".to_string()));
            }
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(FileError::InvalidRecord(
                "duration must be a finite, non-negative number of seconds".to_string(),
            ));
        }
        if self.metadata_hashes.len() > MAX_METADATA_HASHES {
            return Err(FileError::InvalidRecord(format!(
                "too many metadata hashes (max {MAX_METADATA_HASHES})"
            )));
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ContentRecord {
        ContentRecord::from_bytes_at(
            TrackMetadata::new("Night Drive", "Low Tide", 212.5).with_album("Coastlines"),
            b"fake pcm frames",
            1_700_000_000,
        )
    }

    #[test]
    fn hash_is_deterministic_and_distinct() {
        let corpus: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"a".to_vec(),
            b"b".to_vec(),
            b"abc".to_vec(),
            b"abd".to_vec(),
            vec![0u8; 4096],
            vec![0xffu8; 4096],
            (0..=255u8).collect(),
        ];
        for bytes in &corpus {
            assert_eq!(compute_hash(bytes), compute_hash(bytes));
        }
        for (i, a) in corpus.iter().enumerate() {
            for b in corpus.iter().skip(i + 1) {
                assert_ne!(compute_hash(a), compute_hash(b));
            }
        }
    }

    #[test]
    fn hex_roundtrip_and_rejects_garbage() {
        let hash = compute_hash(b"abc");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), hash);
        assert_eq!(hex.parse::<ContentHash>().unwrap(), hash);

        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn shard_is_first_two_hex_chars() {
        let hash = compute_hash(b"shard me");
        assert_eq!(hash.shard(), hash.to_hex()[..2]);
    }

    #[test]
    fn record_survives_json_roundtrip() {
        let record = sample_record().with_metadata_hash("fingerprint", "fp-01");
        let json = serde_json::to_string(&record).unwrap();
        let decoded: ContentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn wire_shape_matches_catalog_contract() {
        let record = sample_record();
        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["album", "artist", "content_hash", "created_at", "duration", "size", "title"]
        );
        assert!(object["size"].is_u64());
        assert!(object["created_at"].is_u64());
        assert_eq!(object["content_hash"], record.content_hash.to_hex());
    }

    #[test]
    fn metadata_hashes_ride_along_only_when_present() {
        let plain = serde_json::to_value(sample_record()).unwrap();
        assert!(plain.get("metadata_hashes").is_none());
        let decoded: ContentRecord = serde_json::from_value(plain).unwrap();
        assert!(decoded.metadata_hashes.is_empty());

        let tagged = sample_record()
            .with_metadata_hash("fingerprint", "fp-01")
            .with_metadata_hash("watermark", "wm-07");
        let value = serde_json::to_value(&tagged).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 8);
        assert_eq!(
            value["metadata_hashes"],
            serde_json::json!({"fingerprint": "fp-01", "watermark": "wm-07"})
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut value = serde_json::to_value(sample_record()).unwrap();
        value["bitrate"] = serde_json::json!(320);
        assert!(serde_json::from_value::<ContentRecord>(value).is_err());
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut value = serde_json::to_value(sample_record()).unwrap();
        value.as_object_mut().unwrap().remove("size");
        assert!(serde_json::from_value::<ContentRecord>(value).is_err());
    }

    #[test]
    fn verify_detects_tampered_bytes() {
        let record = sample_record();
        assert!(record.verify(b"fake pcm frames").is_ok());
        assert!(matches!(
            record.verify(b"tampered frames"),
            Err(FileError::ContentMismatch { .. })
        ));
    }

    #[test]
    fn validation_rules() {
        assert!(sample_record().validate().is_ok());

        let mut blank_title = sample_record();
        blank_title.title = "  ".into();
        assert!(blank_title.validate().is_err());

        let mut negative = sample_record();
        negative.duration = -1.0;
        assert!(negative.validate().is_err());

        let mut nan = sample_record();
        nan.duration = f64::NAN;
        assert!(nan.validate().is_err());
    }
}
