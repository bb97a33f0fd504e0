//! The service handler contract and the per-endpoint call result.

use std::sync::Arc;

use crate::{CallState, EndpointDescriptor, ResponseEnvelope};

/// Identity a server stamps into every response envelope.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub host_name: String,
    pub service_name: String,
    pub service_id: String,
}

/// What a service callback returns for one invocation.
#[derive(Debug, Clone)]
pub struct ServiceCallResponse {
    pub payload: Vec<u8>,
    pub call_state: CallState,
    pub ret_state: i32,
    /// Non-empty when `call_state` is `Failed`; transported inside a
    /// well-formed response frame, never as a transport failure.
    pub error: String,
}

impl ServiceCallResponse {
    pub fn executed(payload: impl Into<Vec<u8>>, ret_state: i32) -> Self {
        Self {
            payload: payload.into(),
            call_state: CallState::Executed,
            ret_state,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>, ret_state: i32) -> Self {
        Self {
            payload: Vec::new(),
            call_state: CallState::Failed,
            ret_state,
            error: error.into(),
        }
    }
}

/// Handler invoked by a server session for every complete request frame.
///
/// Arguments are the decoded method name and the opaque request bytes. The
/// callback runs on the session task: a slow handler stalls its session and
/// occupies a runtime worker thread for the duration.
pub type ServiceCallback = Arc<dyn Fn(&str, &[u8]) -> ServiceCallResponse + Send + Sync>;

/// One per-endpoint outcome of a service call, as seen by the caller.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub host_name: String,
    pub service_name: String,
    pub service_id: String,
    pub method_name: String,
    pub error_msg: String,
    pub ret_state: i32,
    pub call_state: CallState,
    pub payload: Vec<u8>,
}

impl ServiceResponse {
    /// A failed slot carrying endpoint identity and an error message. Result
    /// vectors are pre-populated with `failure(.., "Timeout")` so endpoints
    /// that never answer keep that value.
    pub fn failure(
        endpoint: &EndpointDescriptor,
        method_name: impl Into<String>,
        error_msg: impl Into<String>,
    ) -> Self {
        Self {
            host_name: endpoint.host_name.clone(),
            service_name: endpoint.service_name.clone(),
            service_id: endpoint.service_id.clone(),
            method_name: method_name.into(),
            error_msg: error_msg.into(),
            ret_state: 0,
            call_state: CallState::Failed,
            payload: Vec::new(),
        }
    }

    /// A failed slot with no endpoint behind it, for errors reported before
    /// any dispatch happened.
    pub fn synthetic_failure(method_name: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            host_name: String::new(),
            service_name: String::new(),
            service_id: String::new(),
            method_name: method_name.into(),
            error_msg: error_msg.into(),
            ret_state: 0,
            call_state: CallState::Failed,
            payload: Vec::new(),
        }
    }
}

impl From<ResponseEnvelope> for ServiceResponse {
    fn from(env: ResponseEnvelope) -> Self {
        Self {
            host_name: env.host_name,
            service_name: env.service_name,
            service_id: env.service_id,
            method_name: env.method,
            error_msg: env.error,
            ret_state: env.ret_state,
            call_state: env.call_state,
            payload: env.payload,
        }
    }
}
