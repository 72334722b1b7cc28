use crate::error::OadrError;
use crate::message::Message;

/// Converts typed messages to bytes and back.
///
/// Implementations must satisfy `decode(encode(m)) == m` for every message.
pub trait Codec: Send + Sync {
    /// MIME type sent with encoded bodies.
    fn content_type(&self) -> &'static str;

    fn encode(&self, message: &Message) -> Result<Vec<u8>, OadrError>;

    fn decode(&self, bytes: &[u8]) -> Result<Message, OadrError>;
}

/// MessagePack with named fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, OadrError> {
        rmp_serde::to_vec_named(message).map_err(Into::into)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, OadrError> {
        rmp_serde::from_slice(bytes).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Poll, QueryRegistration};

    #[test]
    fn roundtrip_simple_messages() {
        let codec = MsgPackCodec;
        for message in [
            Message::Poll(Poll {
                ven_id: "ven1".into(),
            }),
            Message::QueryRegistration(QueryRegistration::new()),
            Message::empty_response(None),
        ] {
            let bytes = codec.encode(&message).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn roundtrip_multi_signal_event() {
        use std::time::Duration;

        use crate::event::{Event, EventSignal, SignalInterval};
        use crate::message::DistributeEvent;
        use crate::target::Target;
        use crate::types::{SignalName, SignalType};

        let start = chrono::DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap();
        let event = Event::builder()
            .signal(EventSignal::new(
                SignalName::Simple,
                SignalType::Level,
                vec![
                    SignalInterval::new(0, Duration::from_secs(900), 1.0).starting_at(start),
                    SignalInterval::new(1, Duration::from_millis(1500), 2.0),
                ],
            ))
            .signal(EventSignal::new(
                SignalName::ElectricityPrice,
                SignalType::Price,
                vec![SignalInterval::new(0, Duration::from_secs(900), 0.31).starting_at(start)],
            ))
            .targets(vec![Target::ven_id("ven1"), Target::group_id("north")])
            .ramp_up_period(Duration::from_secs(60))
            .build()
            .unwrap();
        let message = Message::DistributeEvent(DistributeEvent::new("vtn", vec![event]));

        let bytes = MsgPackCodec.encode(&message).unwrap();
        assert_eq!(MsgPackCodec.decode(&bytes).unwrap(), message);
    }

    #[test]
    fn garbage_is_a_deserialization_error() {
        let err = MsgPackCodec.decode(&[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err, OadrError::Deserialization(_)));
    }
}
