//! RPC and service-center messages.
//!
//! Identifiers live in `0xFE00..=0xFEFF`, below the inner range.

use crate::schedule::ScheduleSpec;
use crate::value::RpcValue;
use gamewire_protocol::{Message, MessageId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome code carried by [`RpcResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcErrorCode(pub u16);

impl RpcErrorCode {
    pub const OK: RpcErrorCode = RpcErrorCode(0);
    /// No service is bound under the requested name.
    pub const NO_SUCH_MODULE: RpcErrorCode = RpcErrorCode(1);
    /// The service has no method with the requested signature.
    pub const NO_SUCH_METHOD: RpcErrorCode = RpcErrorCode(2);
    /// The method ran and failed.
    pub const METHOD_FAILED: RpcErrorCode = RpcErrorCode(3);
    /// Arguments did not match the declared parameter types.
    pub const INVALID_ARGUMENTS: RpcErrorCode = RpcErrorCode(4);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::NO_SUCH_MODULE => "NO_SUCH_MODULE",
            Self::NO_SUCH_METHOD => "NO_SUCH_METHOD",
            Self::METHOD_FAILED => "METHOD_FAILED",
            Self::INVALID_ARGUMENTS => "INVALID_ARGUMENTS",
            RpcErrorCode(code) => return write!(f, "ERROR({})", code),
        };
        f.write_str(name)
    }
}

/// Caller to provider: invoke one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcExecute {
    pub request_id: u32,
    pub service_name: String,
    pub method_signature: String,
    pub args: Vec<RpcValue>,
}

impl Message for RpcExecute {
    const ID: MessageId = 0xFE01;
}

/// Provider to caller: the outcome of one [`RpcExecute`].
///
/// `return_type` and `value` are both absent for errors and for methods that
/// return `void`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub request_id: u32,
    pub error_code: RpcErrorCode,
    pub return_type: Option<String>,
    pub value: Option<RpcValue>,
}

impl RpcResult {
    pub fn ok(request_id: u32, return_type: String, value: RpcValue) -> Self {
        Self {
            request_id,
            error_code: RpcErrorCode::OK,
            return_type: Some(return_type),
            value: Some(value),
        }
    }

    pub fn void(request_id: u32) -> Self {
        Self::error(request_id, RpcErrorCode::OK)
    }

    pub fn error(request_id: u32, error_code: RpcErrorCode) -> Self {
        Self {
            request_id,
            error_code,
            return_type: None,
            value: None,
        }
    }
}

impl Message for RpcResult {
    const ID: MessageId = 0xFE02;
}

/// Provider to center: the full list of services this provider hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushServices {
    pub provider_id: u32,
    pub ip: String,
    pub port: u16,
    pub services: Vec<String>,
}

impl Message for PushServices {
    const ID: MessageId = 0xFE03;
}

/// Center to provider: asks for the service list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchServices;

impl Message for FetchServices {
    const ID: MessageId = 0xFE04;
}

/// Provider to center: reply to [`FetchServices`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchServicesResult {
    pub provider_id: u32,
    pub services: Vec<String>,
}

impl Message for FetchServicesResult {
    const ID: MessageId = 0xFE05;
}

/// Provider to center: register a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSchedule {
    pub job_name: String,
    pub provider_id: u32,
    pub spec: ScheduleSpec,
}

impl Message for AddSchedule {
    const ID: MessageId = 0xFE06;
}

/// Center to provider: a job fired. `end` marks its last firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSchedule {
    pub job_name: String,
    pub end: bool,
}

impl Message for TriggerSchedule {
    const ID: MessageId = 0xFE07;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamewire_protocol::{is_inner, Decoder, Encoder};

    #[test]
    fn test_ids_are_rpc_range() {
        for id in [
            RpcExecute::ID,
            RpcResult::ID,
            PushServices::ID,
            FetchServices::ID,
            FetchServicesResult::ID,
            AddSchedule::ID,
            TriggerSchedule::ID,
        ] {
            assert_eq!(id & 0xFF00, 0xFE00);
            assert!(!is_inner(id));
        }
    }

    #[test]
    fn test_execute_through_codec() {
        let msg = RpcExecute {
            request_id: 42,
            service_name: "battle@Matchmaker".to_string(),
            method_signature: "enqueue(i64,list<string>)".to_string(),
            args: vec![
                RpcValue::I64(7),
                RpcValue::List(vec!["eu".into(), "ranked".into()]),
            ],
        };

        let frame = Encoder::default().encode(&msg).unwrap();
        let mut decoder = Decoder::default();
        decoder.extend(&frame);
        let raw = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(raw.decode::<RpcExecute>().unwrap(), msg);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(RpcErrorCode::NO_SUCH_MODULE.to_string(), "NO_SUCH_MODULE");
        assert_eq!(RpcErrorCode(99).to_string(), "ERROR(99)");
        assert!(RpcResult::void(1).error_code.is_ok());
        assert!(!RpcResult::error(1, RpcErrorCode::METHOD_FAILED).error_code.is_ok());
    }
}
