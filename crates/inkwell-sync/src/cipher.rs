//! Per-field cipher envelope.
//!
//! The engine only ever talks to [`CipherEnvelope`]; what sits behind it is up
//! to the embedding application. [`MasterKeyEnvelope`] is the stock
//! implementation: AES-GCM under a master key held in memory only.
//!
//! ## Wire format
//!
//! - Structured: `{"v": 1, "iv_b64": "...", "ct_b64": "...", "aad_b64": "..."}`
//! - Packed (inside note `title`/`text`): base64 of `iv || ciphertext+tag`.
//!   The AAD is not packed; the receiver rebuilds it from the note id.

use std::sync::RwLock;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ring::aead::{AES_128_GCM, AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::CipherError;
use crate::models::{FieldKind, Note, SealedNote, SealedText};

/// Current blob format tag.
pub const BLOB_VERSION: u8 = 1;

/// AES-GCM tag length in bytes.
const TAG_LEN: usize = 16;

/// An authenticated ciphertext for one note field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherBlob {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "iv_b64", with = "b64_nonce")]
    pub iv: [u8; NONCE_LEN],
    /// Ciphertext with the authentication tag appended.
    #[serde(rename = "ct_b64", with = "b64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(
        rename = "aad_b64",
        default,
        skip_serializing_if = "Option::is_none",
        with = "b64_opt_bytes"
    )]
    pub aad: Option<Vec<u8>>,
}

impl CipherBlob {
    /// Pack into the wire string carried in note fields.
    pub fn pack(&self) -> SealedText {
        let mut raw = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        raw.extend_from_slice(&self.iv);
        raw.extend_from_slice(&self.ciphertext);
        SealedText(BASE64.encode(raw))
    }

    /// Parse a packed wire string. The result carries no AAD.
    pub fn unpack(packed: &SealedText) -> Result<Self, CipherError> {
        let raw = BASE64
            .decode(packed.as_str().trim())
            .map_err(|e| CipherError::Malformed(e.to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Malformed(format!(
                "packed blob is {} bytes, need at least {}",
                raw.len(),
                NONCE_LEN + TAG_LEN
            )));
        }
        let (iv, ciphertext) = raw.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(iv);
        Ok(Self {
            version: BLOB_VERSION,
            iv: nonce,
            ciphertext: ciphertext.to_vec(),
            aad: None,
        })
    }
}

/// Wraps and unwraps note fields.
pub trait CipherEnvelope: Send + Sync {
    /// Whether key material is loaded.
    fn is_unlocked(&self) -> bool;

    /// Load base64 master key material into memory, replacing any previous key.
    fn import_key(&self, key_b64: &str) -> Result<(), CipherError>;

    /// Encrypt `plaintext`, binding it to `aad`.
    fn encrypt_field(&self, plaintext: &str, aad: &[u8]) -> Result<CipherBlob, CipherError>;

    /// Decrypt a blob that was bound to `aad`.
    fn decrypt_field(&self, blob: &CipherBlob, aad: &[u8]) -> Result<String, CipherError>;
}

/// Encrypt a note's title and text for transport.
///
/// A missing title is sealed as the empty string so the server always stores
/// both fields.
pub fn seal_note(envelope: &dyn CipherEnvelope, mut note: Note) -> Result<SealedNote, CipherError> {
    if note.title.is_none() {
        note.title = Some(String::new());
    }
    let id = note.id.clone();
    note.try_map_fields(|plain, kind| {
        envelope
            .encrypt_field(&plain, &kind.aad(&id))
            .map(|blob| blob.pack())
    })
}

/// Decrypt a note received from the server.
///
/// An absent or empty remote title decrypts to the empty string.
pub fn open_note(envelope: &dyn CipherEnvelope, note: SealedNote) -> Result<Note, CipherError> {
    let id = note.id.clone();
    let mut opened = note.try_map_fields(|sealed, kind| {
        if kind == FieldKind::Title && sealed.is_empty() {
            return Ok(String::new());
        }
        let blob = CipherBlob::unpack(&sealed)?;
        envelope.decrypt_field(&blob, &kind.aad(&id))
    })?;
    if opened.title.is_none() {
        opened.title = Some(String::new());
    }
    Ok(opened)
}

/// AES-GCM envelope keyed by an in-memory master key.
///
/// 16-byte keys select AES-128-GCM, 32-byte keys AES-256-GCM.
pub struct MasterKeyEnvelope {
    key: RwLock<Option<LessSafeKey>>,
    rng: SystemRandom,
}

impl MasterKeyEnvelope {
    /// A locked envelope.
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
            rng: SystemRandom::new(),
        }
    }

    /// An envelope unlocked with raw key bytes.
    pub fn with_key(key: &[u8]) -> Result<Self, CipherError> {
        let envelope = Self::new();
        envelope.set_key(key)?;
        Ok(envelope)
    }

    /// Forget the master key.
    pub fn lock(&self) {
        if let Ok(mut guard) = self.key.write() {
            *guard = None;
        }
    }

    fn set_key(&self, key: &[u8]) -> Result<(), CipherError> {
        let algorithm = match key.len() {
            16 => &AES_128_GCM,
            32 => &AES_256_GCM,
            n => {
                return Err(CipherError::InvalidKey(format!(
                    "expected 16 or 32 bytes, got {n}"
                )));
            }
        };
        let unbound = UnboundKey::new(algorithm, key)
            .map_err(|_| CipherError::InvalidKey("rejected by AEAD".into()))?;
        let mut guard = self
            .key
            .write()
            .map_err(|_| CipherError::InvalidKey("key lock poisoned".into()))?;
        *guard = Some(LessSafeKey::new(unbound));
        Ok(())
    }
}

impl Default for MasterKeyEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MasterKeyEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyEnvelope")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

impl CipherEnvelope for MasterKeyEnvelope {
    fn is_unlocked(&self) -> bool {
        self.key.read().map(|k| k.is_some()).unwrap_or(false)
    }

    fn import_key(&self, key_b64: &str) -> Result<(), CipherError> {
        let bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        self.set_key(&bytes)
    }

    fn encrypt_field(&self, plaintext: &str, aad: &[u8]) -> Result<CipherBlob, CipherError> {
        let guard = self.key.read().map_err(|_| CipherError::Locked)?;
        let key = guard.as_ref().ok_or(CipherError::Locked)?;

        let mut iv = [0u8; NONCE_LEN];
        self.rng.fill(&mut iv).map_err(|_| CipherError::Encrypt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CipherError::Encrypt)?;

        Ok(CipherBlob {
            version: BLOB_VERSION,
            iv,
            ciphertext: in_out,
            aad: (!aad.is_empty()).then(|| aad.to_vec()),
        })
    }

    fn decrypt_field(&self, blob: &CipherBlob, aad: &[u8]) -> Result<String, CipherError> {
        if blob.version != BLOB_VERSION {
            return Err(CipherError::UnsupportedVersion(blob.version));
        }
        if let Some(bound) = &blob.aad {
            if bound.as_slice() != aad {
                return Err(CipherError::Decrypt);
            }
        }

        let guard = self.key.read().map_err(|_| CipherError::Locked)?;
        let key = guard.as_ref().ok_or(CipherError::Locked)?;

        let mut buf = blob.ciphertext.clone();
        let plain = key
            .open_in_place(Nonce::assume_unique_for_key(blob.iv), Aad::from(aad), &mut buf)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plain.to_vec()).map_err(|e| CipherError::Malformed(e.to_string()))
    }
}

mod b64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        BASE64.decode(raw).map_err(serde::de::Error::custom)
    }
}

mod b64_opt_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) => BASE64
                .decode(raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

mod b64_nonce {
    use super::{BASE64, NONCE_LEN};
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(iv: &[u8; NONCE_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(iv))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; NONCE_LEN], D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = BASE64.decode(raw).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("iv must be {NONCE_LEN} bytes, got {}", v.len()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> MasterKeyEnvelope {
        MasterKeyEnvelope::with_key(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_with_aad() {
        let env = envelope();
        let blob = env.encrypt_field("hello", b"n1").unwrap();
        assert_eq!(blob.version, BLOB_VERSION);
        assert_eq!(blob.aad.as_deref(), Some(&b"n1"[..]));
        assert_eq!(env.decrypt_field(&blob, b"n1").unwrap(), "hello");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let env = envelope();
        let blob = env.encrypt_field("hello", b"n1").unwrap();
        let unpacked = CipherBlob::unpack(&blob.pack()).unwrap();
        assert_eq!(env.decrypt_field(&unpacked, b"n2"), Err(CipherError::Decrypt));
        assert_eq!(
            env.decrypt_field(&unpacked, b"n1#title"),
            Err(CipherError::Decrypt)
        );
    }

    #[test]
    fn test_nonce_unique_per_encryption() {
        let env = envelope();
        let a = env.encrypt_field("same", b"n1").unwrap();
        let b = env.encrypt_field("same", b"n1").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_locked_envelope() {
        let env = MasterKeyEnvelope::new();
        assert!(!env.is_unlocked());
        assert_eq!(env.encrypt_field("x", b"n1"), Err(CipherError::Locked));

        env.import_key(&BASE64.encode([1u8; 32])).unwrap();
        assert!(env.is_unlocked());
        let blob = env.encrypt_field("x", b"n1").unwrap();

        env.lock();
        assert_eq!(env.decrypt_field(&blob, b"n1"), Err(CipherError::Locked));
    }

    #[test]
    fn test_import_rejects_bad_length() {
        let env = MasterKeyEnvelope::new();
        assert!(matches!(
            env.import_key(&BASE64.encode([1u8; 20])),
            Err(CipherError::InvalidKey(_))
        ));
        assert!(matches!(
            env.import_key("!!not base64!!"),
            Err(CipherError::InvalidKey(_))
        ));
        env.import_key(&BASE64.encode([1u8; 16])).unwrap();
    }

    #[test]
    fn test_structured_wire_form() {
        let env = envelope();
        let blob = env.encrypt_field("hi", b"n1").unwrap();
        let value = serde_json::to_value(&blob).unwrap();
        assert_eq!(value["v"], serde_json::json!(1));
        assert_eq!(value["aad_b64"], serde_json::json!(BASE64.encode(b"n1")));
        assert_eq!(
            BASE64
                .decode(value["iv_b64"].as_str().unwrap())
                .unwrap()
                .len(),
            NONCE_LEN
        );
        let back: CipherBlob = serde_json::from_value(value).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn test_unpack_rejects_short_input() {
        let short = SealedText(BASE64.encode([0u8; 10]));
        assert!(matches!(
            CipherBlob::unpack(&short),
            Err(CipherError::Malformed(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let env = envelope();
        let mut blob = env.encrypt_field("x", b"n1").unwrap();
        blob.version = 2;
        assert_eq!(
            env.decrypt_field(&blob, b"n1"),
            Err(CipherError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_seal_and_open_note() {
        let env = envelope();
        let mut note = Note::new("n1", "Groceries", "milk, eggs", 100);
        note.title = None;

        let sealed = seal_note(&env, note.clone()).unwrap();
        assert_eq!(sealed.id, "n1");
        assert_eq!(sealed.last_modified, Some(100));
        assert!(!sealed.text.as_str().contains("milk"));

        let opened = open_note(&env, sealed).unwrap();
        assert_eq!(opened.text, "milk, eggs");
        assert_eq!(opened.title.as_deref(), Some(""));
    }

    #[test]
    fn test_open_note_detects_field_swap() {
        let env = envelope();
        let note = Note::new("n1", "title", "body", 1);
        let mut sealed = seal_note(&env, note).unwrap();
        let title = sealed.title.take().unwrap();
        sealed.title = Some(sealed.text.clone());
        sealed.text = title;
        assert_eq!(open_note(&env, sealed), Err(CipherError::Decrypt));
    }
}
