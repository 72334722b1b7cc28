//! OpenADR 2.0b protocol layer.
//!
//! Implements the event and report models and the VEN and VTN engines
//! on top of `oadr-transport` (simpleHttp).
//!
//! Wire format: MessagePack by default, behind the [`Codec`] trait.
//! Security: Ed25519-signed envelopes with replay protection.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod event;
pub mod message;
pub mod replay;
pub mod reply;
pub mod report;
pub mod scheduler;
pub mod target;
pub mod transport;
pub mod types;
pub mod ven;
pub mod vtn;

pub use codec::{Codec, MsgPackCodec};
pub use envelope::{
    certificate_fingerprint, fingerprint, fingerprints_match, EnvelopeCodec, Keypair, Opened,
    SignedEnvelope,
};
pub use error::{OadrError, ValidationError};
pub use event::{
    derive_status, order_events, ActivePeriod, Event, EventBuilder, EventSignal, SignalInterval,
    UNKNOWN_MARKET_CONTEXT,
};
pub use message::{Message, ResponseStatus};
pub use replay::{ReplayCache, ReplayError, DEFAULT_MAX_SKEW};
pub use reply::Reply;
pub use report::{
    Measurement, ReportCapability, ReportDelivery, ReportDescription, ReportInterval,
    ReportRequest, Sample, SamplingRate,
};
pub use scheduler::{Schedule, Scheduler};
pub use target::{Target, TargetsByType};
pub use transport::{Loopback, Transport};
pub use types::{
    DataCollectionMode, EventStatus, MessageType, OptReason, OptType, ReadingType, ReportName,
    ReportType, ResponseCode, ResponseRequired, Service, SignalName, SignalType, TargetKind,
};
pub use ven::{
    ReportDefinition, SampleRequest, VenClient, VenConfig, VenHandle, VenState, VenStats,
};
pub use vtn::{
    OptCallback, ReportSelector, ReportValues, SelectionElement, VenInfo, VtnConfig, VtnHandlers,
    VtnServer, VtnStats,
};
