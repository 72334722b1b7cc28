use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::OadrTransportError;

/// OpenADR 2.0b logical service. Each one is a sub-path under the VTN prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    EiRegisterParty,
    EiEvent,
    EiReport,
    EiOpt,
    OadrPoll,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::EiRegisterParty,
        Service::EiEvent,
        Service::EiReport,
        Service::EiOpt,
        Service::OadrPoll,
    ];

    /// Path segment appended to the VTN prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::EiRegisterParty => "EiRegisterParty",
            Service::EiEvent => "EiEvent",
            Service::EiReport => "EiReport",
            Service::EiOpt => "EiOpt",
            Service::OadrPoll => "OadrPoll",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = OadrTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|svc| svc.as_str() == s)
            .ok_or_else(|| OadrTransportError::UnknownService(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_every_service_name() {
        for svc in Service::ALL {
            assert_eq!(svc.as_str().parse::<Service>().unwrap(), svc);
        }
    }

    #[test]
    fn unknown_service_is_an_error() {
        let err = "EiSomething".parse::<Service>().unwrap_err();
        assert_eq!(err.to_string(), "unknown service: EiSomething");
    }
}
