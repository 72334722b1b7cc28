use std::sync::Arc;

use proptest::prelude::*;

use oadr_protocol::message::{Message, Poll};
use oadr_protocol::{EnvelopeCodec, Keypair, MsgPackCodec, OadrError, SignedEnvelope};

fn codec(seed: u8) -> EnvelopeCodec {
    EnvelopeCodec::new(Arc::new(MsgPackCodec)).with_keypair(Some(Keypair::from_seed(&[seed; 32])))
}

fn poll(ven_id: &str) -> Message {
    Message::Poll(Poll {
        ven_id: ven_id.to_string(),
    })
}

proptest! {
    /// Signed messages open on the other side with the signer pinned.
    #[test]
    fn signed_message_opens_with_its_fingerprint(seed in 1u8..=255, ven_id in "[a-zA-Z0-9_-]{1,40}") {
        let sender = codec(seed);
        let receiver = EnvelopeCodec::new(Arc::new(MsgPackCodec));
        let bytes = sender.seal(&poll(&ven_id)).unwrap();

        let fingerprint = sender.fingerprint().unwrap();
        let opened = receiver.open(&bytes, Some(&fingerprint)).unwrap();
        prop_assert_eq!(opened.message, poll(&ven_id));
        prop_assert_eq!(opened.signer_fingerprint, Some(fingerprint));
    }

    /// Flipping any bit of the signed body breaks the signature.
    #[test]
    fn tampered_body_is_rejected(index in any::<prop::sample::Index>(), bit in 0u8..8) {
        let sender = codec(3);
        let receiver = EnvelopeCodec::new(Arc::new(MsgPackCodec));
        let mut envelope = SignedEnvelope::from_bytes(&sender.seal(&poll("ven1")).unwrap()).unwrap();

        let at = index.index(envelope.body.len());
        envelope.body[at] ^= 1 << bit;
        let result = receiver.open(&envelope.to_bytes().unwrap(), None);
        prop_assert!(matches!(result, Err(OadrError::InvalidSignature)));
    }

    /// A valid signature from the wrong key is still refused.
    #[test]
    fn other_signer_is_refused(a in 1u8..=255, b in 1u8..=255) {
        prop_assume!(a != b);
        let expected = codec(b).fingerprint().unwrap();
        let bytes = codec(a).seal(&poll("ven1")).unwrap();
        let receiver = EnvelopeCodec::new(Arc::new(MsgPackCodec));
        let result = receiver.open(&bytes, Some(&expected));
        let is_mismatch = matches!(result, Err(OadrError::FingerprintMismatch { .. }));
        prop_assert!(is_mismatch);
    }
}

#[test]
fn replayed_envelope_is_refused() {
    let bytes = codec(9).seal(&poll("ven1")).unwrap();
    let receiver = EnvelopeCodec::new(Arc::new(MsgPackCodec));
    assert!(receiver.open(&bytes, None).is_ok());
    assert!(matches!(
        receiver.open(&bytes, None),
        Err(OadrError::Replay(_))
    ));
}
