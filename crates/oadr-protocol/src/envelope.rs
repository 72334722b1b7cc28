//! Signed message envelopes, key material and certificate fingerprints.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::Signer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::Codec;
use crate::error::OadrError;
use crate::message::Message;
use crate::replay::{ReplayCache, DEFAULT_MAX_SKEW};
use crate::types::{now, MessageType};

/// DER prefix of an Ed25519 SubjectPublicKeyInfo.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Bytes of the SHA-256 digest kept in a short fingerprint.
const FINGERPRINT_LEN: usize = 10;

// ── Fingerprints ─────────────────────────────────────────────────────

/// Short fingerprint of a DER blob: last 10 bytes of its SHA-256 digest,
/// upper-case hex, colon-delimited.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest[digest.len() - FINGERPRINT_LEN..]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Fingerprint of a certificate or public key file, PEM or raw DER.
pub fn certificate_fingerprint(contents: &[u8]) -> Result<String, OadrError> {
    match std::str::from_utf8(contents) {
        Ok(text) if text.contains("-----BEGIN") => Ok(fingerprint(&pem_to_der(text)?)),
        _ => Ok(fingerprint(contents)),
    }
}

/// Decodes the first PEM block in `text`.
pub fn pem_to_der(text: &str) -> Result<Vec<u8>, OadrError> {
    let body: String = text
        .lines()
        .skip_while(|line| !line.starts_with("-----BEGIN"))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END"))
        .map(str::trim)
        .collect();
    if body.is_empty() {
        return Err(OadrError::Key("no PEM block found".into()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| OadrError::Key(format!("invalid PEM body: {e}")))
}

fn normalize_fingerprint(fp: &str) -> String {
    fp.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn fingerprints_match(a: &str, b: &str) -> bool {
    normalize_fingerprint(a) == normalize_fingerprint(b)
}

// ── Keys ─────────────────────────────────────────────────────────────

/// Ed25519 signing identity of a VEN or VTN.
#[derive(Clone)]
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Parses a 64-character hex seed, as written by `oadr keygen`.
    pub fn from_hex(text: &str) -> Result<Self, OadrError> {
        let bytes = hex::decode(text.trim()).map_err(|e| OadrError::Key(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OadrError::Key("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        public_key_der(&self.public_key())
    }

    pub fn public_key_pem(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.public_key_der());
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        for chunk in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_der())
    }

    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing.sign(bytes).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn public_key_der(public_key: &[u8; 32]) -> Vec<u8> {
    let mut der = ED25519_SPKI_PREFIX.to_vec();
    der.extend_from_slice(public_key);
    der
}

// ── Envelope ─────────────────────────────────────────────────────────

/// An encoded message plus its signature block.
///
/// Unsigned envelopes leave `signer` and `signature` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub message_type: MessageType,
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
    pub signer: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    pub fn seal(message_type: MessageType, body: Vec<u8>, keypair: Option<&Keypair>) -> Self {
        let mut envelope = Self {
            message_type,
            body,
            timestamp: now(),
            nonce: uuid::Uuid::new_v4().to_string(),
            signer: Vec::new(),
            signature: Vec::new(),
        };
        if let Some(keypair) = keypair {
            envelope.signer = keypair.public_key().to_vec();
            envelope.signature = keypair.sign(&envelope.signing_bytes());
        }
        envelope
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OadrError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, OadrError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Deterministic bytes covered by the signature: every field but the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let signable = SignableEnvelope {
            message_type: self.message_type.as_str(),
            body: &self.body,
            timestamp_ms: self.timestamp.timestamp_millis(),
            timestamp_ns: self.timestamp.timestamp_subsec_nanos(),
            nonce: &self.nonce,
            signer: &self.signer,
        };
        // Plain scalars and byte slices always encode.
        rmp_serde::to_vec(&signable).unwrap_or_default()
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn verify_signature(&self) -> Result<(), OadrError> {
        let key_bytes: [u8; 32] = self
            .signer
            .as_slice()
            .try_into()
            .map_err(|_| OadrError::InvalidSignature)?;
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| OadrError::InvalidSignature)?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| OadrError::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify_strict(&self.signing_bytes(), &signature)
            .map_err(|_| OadrError::InvalidSignature)
    }

    /// Fingerprint of the signing key, if signed.
    pub fn signer_fingerprint(&self) -> Option<String> {
        let key: [u8; 32] = self.signer.as_slice().try_into().ok()?;
        Some(fingerprint(&public_key_der(&key)))
    }
}

#[derive(Serialize)]
struct SignableEnvelope<'a> {
    message_type: &'a str,
    body: &'a [u8],
    timestamp_ms: i64,
    timestamp_ns: u32,
    nonce: &'a str,
    signer: &'a [u8],
}

// ── Codec with security policy ───────────────────────────────────────

/// A decoded incoming message and who signed it.
#[derive(Debug, Clone)]
pub struct Opened {
    pub message: Message,
    pub signer_fingerprint: Option<String>,
}

/// Wraps a [`Codec`] with signing, signature checks and replay protection.
pub struct EnvelopeCodec {
    codec: Arc<dyn Codec>,
    keypair: Option<Keypair>,
    replay: Mutex<ReplayCache>,
    require_signatures: bool,
}

impl EnvelopeCodec {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            keypair: None,
            replay: Mutex::new(ReplayCache::new(DEFAULT_MAX_SKEW)),
            require_signatures: false,
        }
    }

    pub fn with_keypair(mut self, keypair: Option<Keypair>) -> Self {
        self.keypair = keypair;
        self
    }

    pub fn with_replay_window(mut self, max_skew: Duration) -> Self {
        self.replay = Mutex::new(ReplayCache::new(max_skew));
        self
    }

    /// Reject unsigned messages even when no fingerprint is expected.
    pub fn require_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    pub fn content_type(&self) -> &'static str {
        self.codec.content_type()
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.keypair.as_ref().map(Keypair::fingerprint)
    }

    pub fn seal(&self, message: &Message) -> Result<Vec<u8>, OadrError> {
        let body = self.codec.encode(message)?;
        SignedEnvelope::seal(message.message_type(), body, self.keypair.as_ref()).to_bytes()
    }

    pub fn open(&self, bytes: &[u8], expected_fingerprint: Option<&str>) -> Result<Opened, OadrError> {
        let expected = expected_fingerprint.map(str::to_string);
        self.open_with(bytes, |_| expected)
    }

    /// Opens an envelope whose expected signer depends on its content.
    ///
    /// `expected` sees the decoded message and returns the fingerprint the
    /// signer must have, if any.
    ///
    /// Only signed envelopes go through the replay cache. An unsigned
    /// envelope carries no authenticated timestamp or nonce, so one
    /// accepted without `require_signatures` can be replayed.
    pub fn open_with<F>(&self, bytes: &[u8], expected: F) -> Result<Opened, OadrError>
    where
        F: FnOnce(&Message) -> Option<String>,
    {
        let envelope = SignedEnvelope::from_bytes(bytes)?;
        if envelope.is_signed() {
            envelope.verify_signature()?;
        }

        let message = self.codec.decode(&envelope.body)?;
        if message.message_type() != envelope.message_type {
            return Err(OadrError::Deserialization(format!(
                "envelope says {} but body is {}",
                envelope.message_type,
                message.message_type()
            )));
        }

        let expected = expected(&message);
        let signer_fingerprint = envelope.signer_fingerprint();
        if !envelope.is_signed() {
            if expected.is_some() || self.require_signatures {
                return Err(OadrError::Unsigned);
            }
            return Ok(Opened {
                message,
                signer_fingerprint: None,
            });
        }

        if let (Some(expected), Some(actual)) = (&expected, &signer_fingerprint) {
            if !fingerprints_match(expected, actual) {
                return Err(OadrError::FingerprintMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }

        self.replay
            .lock()
            .verify(envelope.timestamp, &envelope.nonce)?;

        Ok(Opened {
            message,
            signer_fingerprint,
        })
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("content_type", &self.codec.content_type())
            .field("keypair", &self.keypair)
            .field("require_signatures", &self.require_signatures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::message::Poll;
    use crate::replay::ReplayError;

    fn poll() -> Message {
        Message::Poll(Poll {
            ven_id: "ven1".into(),
        })
    }

    fn codec(keypair: Option<Keypair>) -> EnvelopeCodec {
        EnvelopeCodec::new(Arc::new(MsgPackCodec)).with_keypair(keypair)
    }

    #[test]
    fn fingerprint_is_ten_colon_separated_bytes() {
        let fp = fingerprint(b"certificate");
        assert_eq!(fp.len(), 10 * 2 + 9);
        assert_eq!(fp.split(':').count(), 10);
        assert!(fp
            .chars()
            .all(|c| c == ':' || c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn pem_and_der_fingerprints_agree() {
        let keypair = Keypair::from_seed(&[7u8; 32]);
        let pem = keypair.public_key_pem();
        assert_eq!(
            certificate_fingerprint(pem.as_bytes()).unwrap(),
            keypair.fingerprint()
        );
        assert_eq!(
            certificate_fingerprint(&keypair.public_key_der()).unwrap(),
            keypair.fingerprint()
        );
    }

    #[test]
    fn fingerprint_comparison_ignores_case_and_separators() {
        assert!(fingerprints_match("AA:BB:0c", "aabb0C"));
        assert!(!fingerprints_match("AA:BB", "AA:BC"));
    }

    #[test]
    fn hex_seed_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_hex(&keypair.seed_hex()).unwrap();
        assert_eq!(restored.public_key(), keypair.public_key());
        assert!(Keypair::from_hex("abcd").is_err());
    }

    #[test]
    fn signed_message_opens_with_the_right_fingerprint() {
        let vtn_key = Keypair::from_seed(&[1u8; 32]);
        let fp = vtn_key.fingerprint();
        let sender = codec(Some(vtn_key));
        let receiver = codec(None);

        let bytes = sender.seal(&poll()).unwrap();
        let opened = receiver.open(&bytes, Some(&fp)).unwrap();
        assert_eq!(opened.message, poll());
        assert_eq!(opened.signer_fingerprint.as_deref(), Some(fp.as_str()));
    }

    #[test]
    fn wrong_fingerprint_is_rejected() {
        let sender = codec(Some(Keypair::from_seed(&[1u8; 32])));
        let other = Keypair::from_seed(&[2u8; 32]).fingerprint();
        let bytes = sender.seal(&poll()).unwrap();
        let err = codec(None).open(&bytes, Some(&other)).unwrap_err();
        assert!(matches!(err, OadrError::FingerprintMismatch { .. }));
    }

    #[test]
    fn tampered_body_fails_signature() {
        let sender = codec(Some(Keypair::from_seed(&[1u8; 32])));
        let mut envelope = SignedEnvelope::from_bytes(&sender.seal(&poll()).unwrap()).unwrap();
        envelope.body = MsgPackCodec
            .encode(&Message::Poll(Poll {
                ven_id: "ven2".into(),
            }))
            .unwrap();
        let err = codec(None)
            .open(&envelope.to_bytes().unwrap(), None)
            .unwrap_err();
        assert!(matches!(err, OadrError::InvalidSignature));
    }

    #[test]
    fn replayed_envelope_is_rejected() {
        let sender = codec(Some(Keypair::from_seed(&[1u8; 32])));
        let receiver = codec(None);
        let bytes = sender.seal(&poll()).unwrap();
        receiver.open(&bytes, None).unwrap();
        let err = receiver.open(&bytes, None).unwrap_err();
        assert!(matches!(err, OadrError::Replay(ReplayError::AlreadyUsed)));
    }

    #[test]
    fn unsigned_envelopes_bypass_the_replay_cache() {
        let receiver = codec(None);
        let bytes = codec(None).seal(&poll()).unwrap();
        assert!(receiver.open(&bytes, None).is_ok());
        assert!(receiver.open(&bytes, None).is_ok());
        assert!(matches!(
            receiver.require_signatures(true).open(&bytes, None),
            Err(OadrError::Unsigned)
        ));
    }

    #[test]
    fn unsigned_message_needs_no_expectation() {
        let bytes = codec(None).seal(&poll()).unwrap();
        assert!(codec(None).open(&bytes, None).is_ok());
        assert!(matches!(
            codec(None).open(&bytes, Some("AA:BB")),
            Err(OadrError::Unsigned)
        ));
        assert!(matches!(
            codec(None).require_signatures(true).open(&bytes, None),
            Err(OadrError::Unsigned)
        ));
    }
}
