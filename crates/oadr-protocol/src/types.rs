use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use oadr_transport::Service;

/// Prefix that marks a vendor extension value in the open enumerations.
pub const EXTENSION_PREFIX: &str = "x-";

/// Current wall-clock time in UTC. Every timestamp the engines produce goes through here.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// `ts + by`, saturating at the representable maximum.
pub fn add_duration(ts: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| ts.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `ts - by`, saturating at the representable minimum.
pub fn sub_duration(ts: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| ts.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Non-negative distance from `earlier` to `later`; zero when the order is reversed.
pub fn elapsed(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

// ── Wire enumerations ────────────────────────────────────────────────

/// Defines a string-valued wire enumeration.
///
/// `closed` enumerations reject anything outside their table. `open`
/// enumerations additionally accept values carrying the `x-` prefix.
macro_rules! wire_enum {
    (
        closed
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const VALUES: &'static [&'static str] = &[$($text,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ValidationError::UnknownEnumValue {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        wire_enum!(@common $name);
    };

    (
        open
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// Vendor extension, always starting with `x-`.
            Extension(String),
        }

        impl $name {
            pub const VALUES: &'static [&'static str] = &[$($text,)+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Extension(value) => value,
                }
            }

            /// Checks that an [`Extension`](Self::Extension) value carries the `x-` prefix.
            pub fn validate(&self) -> Result<(), ValidationError> {
                match self {
                    Self::Extension(value) if !value.starts_with(EXTENSION_PREFIX) => {
                        Err(ValidationError::UnknownEnumValue {
                            kind: stringify!($name),
                            value: value.clone(),
                        })
                    }
                    _ => Ok(()),
                }
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other if other.starts_with(EXTENSION_PREFIX) => {
                        Ok(Self::Extension(other.to_string()))
                    }
                    other => Err(ValidationError::UnknownEnumValue {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        wire_enum!(@common $name);
    };

    (@common $name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }
    };
}

wire_enum!(closed
    /// Every payload type exchanged between a VEN and a VTN.
    MessageType {
        Poll => "oadrPoll",
        Response => "oadrResponse",
        QueryRegistration => "oadrQueryRegistration",
        CreatePartyRegistration => "oadrCreatePartyRegistration",
        CreatedPartyRegistration => "oadrCreatedPartyRegistration",
        CancelPartyRegistration => "oadrCancelPartyRegistration",
        CanceledPartyRegistration => "oadrCanceledPartyRegistration",
        RequestReregistration => "oadrRequestReregistration",
        RequestEvent => "oadrRequestEvent",
        DistributeEvent => "oadrDistributeEvent",
        CreatedEvent => "oadrCreatedEvent",
        RegisterReport => "oadrRegisterReport",
        RegisteredReport => "oadrRegisteredReport",
        CreateReport => "oadrCreateReport",
        CreatedReport => "oadrCreatedReport",
        UpdateReport => "oadrUpdateReport",
        UpdatedReport => "oadrUpdatedReport",
        CancelReport => "oadrCancelReport",
        CanceledReport => "oadrCanceledReport",
        CreateOpt => "oadrCreateOpt",
        CreatedOpt => "oadrCreatedOpt",
        CancelOpt => "oadrCancelOpt",
        CanceledOpt => "oadrCanceledOpt",
    }
);

impl MessageType {
    /// The service endpoint this message type belongs to.
    ///
    /// `oadrResponse` acknowledges whatever service it answers and has no
    /// fixed endpoint.
    pub fn service(&self) -> Option<Service> {
        use MessageType::*;
        match self {
            Poll => Some(Service::OadrPoll),
            Response => None,
            QueryRegistration
            | CreatePartyRegistration
            | CreatedPartyRegistration
            | CancelPartyRegistration
            | CanceledPartyRegistration
            | RequestReregistration => Some(Service::EiRegisterParty),
            RequestEvent | DistributeEvent | CreatedEvent => Some(Service::EiEvent),
            RegisterReport | RegisteredReport | CreateReport | CreatedReport | UpdateReport
            | UpdatedReport | CancelReport | CanceledReport => Some(Service::EiReport),
            CreateOpt | CreatedOpt | CancelOpt | CanceledOpt => Some(Service::EiOpt),
        }
    }

    /// Whether a message of this type may arrive on `service`.
    pub fn accepted_on(&self, service: Service) -> bool {
        match self.service() {
            Some(expected) => expected == service,
            None => true,
        }
    }
}

wire_enum!(closed
    /// A VEN's participation decision for an event.
    OptType {
        OptIn => "optIn",
        OptOut => "optOut",
    }
);

wire_enum!(closed
    OptReason {
        Economic => "economic",
        Emergency => "emergency",
        MustRun => "mustRun",
        NotParticipating => "notParticipating",
        OutageRunStatus => "outageRunStatus",
        OverrideStatus => "overrideStatus",
        Participating => "participating",
        Schedule => "x-schedule",
    }
);

wire_enum!(closed
    ResponseRequired {
        Always => "always",
        Never => "never",
    }
);

wire_enum!(closed
    /// Lifecycle of an event as seen at a given instant.
    EventStatus {
        None => "none",
        Far => "far",
        Near => "near",
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

impl EventStatus {
    /// Completed and cancelled events never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }
}

wire_enum!(closed
    DataCollectionMode {
        Incremental => "incremental",
        Full => "full",
    }
);

wire_enum!(closed
    /// Kinds of identifiers an event or report can target.
    TargetKind {
        VenId => "ven_id",
        GroupId => "group_id",
        GroupName => "group_name",
        ResourceId => "resource_id",
        PartyId => "party_id",
        EndDeviceAsset => "end_device_asset",
    }
);

wire_enum!(open
    SignalName {
        Simple => "SIMPLE",
        SimpleLower => "simple",
        ElectricityPrice => "ELECTRICITY_PRICE",
        EnergyPrice => "ENERGY_PRICE",
        DemandCharge => "DEMAND_CHARGE",
        BidPrice => "BID_PRICE",
        BidLoad => "BID_LOAD",
        BidEnergy => "BID_ENERGY",
        ChargeState => "CHARGE_STATE",
        LoadDispatch => "LOAD_DISPATCH",
        LoadControl => "LOAD_CONTROL",
    }
);

wire_enum!(open
    SignalType {
        Delta => "delta",
        Level => "level",
        Multiplier => "multiplier",
        Price => "price",
        PriceMultiplier => "priceMultiplier",
        PriceRelative => "priceRelative",
        Setpoint => "setpoint",
        LoadControlCapacity => "x-loadControlCapacity",
        LoadControlLevelOffset => "x-loadControlLevelOffset",
        LoadControlPercentOffset => "x-loadControlPercentOffset",
        LoadControlSetpoint => "x-loadControlSetpoint",
    }
);

wire_enum!(open
    ReportName {
        MetadataHistoryUsage => "METADATA_HISTORY_USAGE",
        HistoryUsage => "HISTORY_USAGE",
        MetadataHistoryGreenbutton => "METADATA_HISTORY_GREENBUTTON",
        HistoryGreenbutton => "HISTORY_GREENBUTTON",
        MetadataTelemetryUsage => "METADATA_TELEMETRY_USAGE",
        TelemetryUsage => "TELEMETRY_USAGE",
        MetadataTelemetryStatus => "METADATA_TELEMETRY_STATUS",
        TelemetryStatus => "TELEMETRY_STATUS",
    }
);

impl ReportName {
    /// Metadata reports describe capabilities. The VTN answers them with
    /// requests for the matching data report.
    pub fn is_metadata(&self) -> bool {
        self.as_str().starts_with("METADATA_")
    }

    /// Name of the data report delivered for a metadata report.
    pub fn data_report(&self) -> ReportName {
        match self {
            ReportName::MetadataHistoryUsage => ReportName::HistoryUsage,
            ReportName::MetadataHistoryGreenbutton => ReportName::HistoryGreenbutton,
            ReportName::MetadataTelemetryUsage => ReportName::TelemetryUsage,
            ReportName::MetadataTelemetryStatus => ReportName::TelemetryStatus,
            other => other.clone(),
        }
    }
}

wire_enum!(open
    ReadingType {
        DirectRead => "Direct Read",
        Net => "Net",
        Allocated => "Allocated",
        Estimated => "Estimated",
        Summed => "Summed",
        Derived => "Derived",
        Mean => "Mean",
        Peak => "Peak",
        Hybrid => "Hybrid",
        Contract => "Contract",
        Projected => "Projected",
    }
);

wire_enum!(open
    ReportType {
        Reading => "reading",
        Usage => "usage",
        Demand => "demand",
        SetPoint => "setPoint",
        DeltaUsage => "deltaUsage",
        DeltaSetPoint => "deltaSetPoint",
        DeltaDemand => "deltaDemand",
        Baseline => "baseline",
        Deviation => "deviation",
        AvgUsage => "avgUsage",
        AvgDemand => "avgDemand",
        OperatingState => "operatingState",
        UpRegulationCapacityAvailable => "upRegulationCapacityAvailable",
        DownRegulationCapacityAvailable => "downRegulationCapacityAvailable",
        RegulationSetpoint => "regulationSetpoint",
        StoredEnergy => "storedEnergy",
        TargetEnergyStorage => "targetEnergyStorage",
        AvailableEnergyStorage => "availableEnergyStorage",
        Price => "price",
        Level => "level",
        PowerFactor => "powerFactor",
        PercentUsage => "percentUsage",
        PercentDemand => "percentDemand",
        ResourceStatus => "x-resourceStatus",
    }
);

// ── Response codes ───────────────────────────────────────────────────

/// Status codes carried in every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ResponseCode {
    Ok,
    OutOfSequence,
    NotAllowed,
    InvalidId,
    NotRecognized,
    InvalidData,
    ComplianceError,
    SignalNotSupported,
    ReportNotSupported,
    TargetMismatch,
    NotRegisteredOrAuthorized,
    DeploymentError,
}

impl ResponseCode {
    pub fn code(&self) -> u16 {
        match self {
            ResponseCode::Ok => 200,
            ResponseCode::OutOfSequence => 450,
            ResponseCode::NotAllowed => 451,
            ResponseCode::InvalidId => 452,
            ResponseCode::NotRecognized => 453,
            ResponseCode::InvalidData => 454,
            ResponseCode::ComplianceError => 459,
            ResponseCode::SignalNotSupported => 460,
            ResponseCode::ReportNotSupported => 461,
            ResponseCode::TargetMismatch => 462,
            ResponseCode::NotRegisteredOrAuthorized => 463,
            ResponseCode::DeploymentError => 469,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::OutOfSequence => "Out of sequence",
            ResponseCode::NotAllowed => "Not allowed",
            ResponseCode::InvalidId => "Invalid ID",
            ResponseCode::NotRecognized => "Not recognized",
            ResponseCode::InvalidData => "Invalid data",
            ResponseCode::ComplianceError => "Compliance error",
            ResponseCode::SignalNotSupported => "Signal not supported",
            ResponseCode::ReportNotSupported => "Report not supported",
            ResponseCode::TargetMismatch => "Target mismatch",
            ResponseCode::NotRegisteredOrAuthorized => "Not registered or authorized",
            ResponseCode::DeploymentError => "Deployment error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseCode::Ok)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.description())
    }
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> u16 {
        code.code()
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = ValidationError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            200 => ResponseCode::Ok,
            450 => ResponseCode::OutOfSequence,
            451 => ResponseCode::NotAllowed,
            452 => ResponseCode::InvalidId,
            453 => ResponseCode::NotRecognized,
            454 => ResponseCode::InvalidData,
            459 => ResponseCode::ComplianceError,
            460 => ResponseCode::SignalNotSupported,
            461 => ResponseCode::ReportNotSupported,
            462 => ResponseCode::TargetMismatch,
            463 => ResponseCode::NotRegisteredOrAuthorized,
            469 => ResponseCode::DeploymentError,
            other => {
                return Err(ValidationError::UnknownEnumValue {
                    kind: "ResponseCode",
                    value: other.to_string(),
                })
            }
        })
    }
}
