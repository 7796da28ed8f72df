//! Network control (Change of Authorization) dispatch.

pub mod client;
pub mod packet;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::services::metrics::record_coa_request;
use crate::services::SessionDirectory;

pub use client::RadiusCoaClient;
pub use worker::{CoaCommand, CoaQueue, CoaWorkerPool};

/// Outcome of one network control call. Not an error: the caller decides
/// what to do with each value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoaResult {
    Success,
    NoActiveSession,
    DeviceUnreachable,
    Rejected,
}

impl CoaResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoaResult::Success => "success",
            CoaResult::NoActiveSession => "no_active_session",
            CoaResult::DeviceUnreachable => "device_unreachable",
            CoaResult::Rejected => "rejected",
        }
    }

    /// Whether the device failed to apply the action.
    pub fn is_failure(&self) -> bool {
        matches!(self, CoaResult::DeviceUnreachable | CoaResult::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "rate")]
pub enum CoaAction {
    Disconnect,
    SetRateLimit(String),
}

impl CoaAction {
    pub fn label(&self) -> &'static str {
        match self {
            CoaAction::Disconnect => "disconnect",
            CoaAction::SetRateLimit(_) => "rate_limit",
        }
    }
}

/// Where and how to reach the device serving a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoaTarget {
    pub nas_address: String,
    pub port: u16,
    pub secret: String,
    pub session_id: String,
    pub framed_ip: Option<String>,
}

/// What the device answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceReply {
    Ack,
    Nak { error_cause: Option<u32> },
    NoResponse,
}

/// Sends one control request to a device.
#[async_trait]
pub trait CoaTransport: Send + Sync {
    async fn send(&self, target: &CoaTarget, username: &str, action: &CoaAction) -> DeviceReply;
}

/// Looks up the live session and sends a single control request to its device.
pub struct CoaDispatcher {
    sessions: Arc<dyn SessionDirectory>,
    transport: Arc<dyn CoaTransport>,
    default_port: u16,
    default_secret: Option<String>,
    timeout: Duration,
}

impl CoaDispatcher {
    pub fn new(
        sessions: Arc<dyn SessionDirectory>,
        transport: Arc<dyn CoaTransport>,
        default_port: u16,
        default_secret: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            transport,
            default_port,
            default_secret,
            timeout,
        }
    }

    pub async fn disconnect(&self, username: &str) -> CoaResult {
        self.dispatch(username, &CoaAction::Disconnect).await
    }

    pub async fn set_rate_limit(&self, username: &str, rate: &str) -> CoaResult {
        self.dispatch(username, &CoaAction::SetRateLimit(rate.to_string()))
            .await
    }

    #[instrument(skip(self), fields(action = action.label()))]
    pub async fn dispatch(&self, username: &str, action: &CoaAction) -> CoaResult {
        let session = match self.sessions.find_active_session(username).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                info!(username = %username, "No active session, nothing to send");
                record_coa_request(action.label(), CoaResult::NoActiveSession.as_str(), 0.0);
                return CoaResult::NoActiveSession;
            }
            Err(e) => {
                warn!(username = %username, error = %e, "Session lookup failed");
                record_coa_request(action.label(), CoaResult::DeviceUnreachable.as_str(), 0.0);
                return CoaResult::DeviceUnreachable;
            }
        };

        let device = match self.sessions.find_nas(&session.nas_address).await {
            Ok(device) => device,
            Err(e) => {
                warn!(nas_address = %session.nas_address, error = %e, "NAS lookup failed");
                None
            }
        };
        let (secret, port) = match (device, &self.default_secret) {
            (Some(device), _) => {
                let port = device
                    .coa_port
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(self.default_port);
                (device.secret, port)
            }
            (None, Some(secret)) => (secret.clone(), self.default_port),
            (None, None) => {
                warn!(
                    username = %username,
                    nas_address = %session.nas_address,
                    "No shared secret for device"
                );
                record_coa_request(action.label(), CoaResult::DeviceUnreachable.as_str(), 0.0);
                return CoaResult::DeviceUnreachable;
            }
        };

        let target = CoaTarget {
            nas_address: session.nas_address,
            port,
            secret,
            session_id: session.session_id,
            framed_ip: session.framed_ip,
        };

        let start = Instant::now();
        // Upper bound on the transport, slightly above its own timeout.
        let reply = tokio::time::timeout(
            self.timeout + Duration::from_millis(250),
            self.transport.send(&target, username, action),
        )
        .await
        .unwrap_or(DeviceReply::NoResponse);

        let result = match reply {
            DeviceReply::Ack => CoaResult::Success,
            DeviceReply::Nak { error_cause } => {
                warn!(
                    username = %username,
                    nas_address = %target.nas_address,
                    error_cause = ?error_cause,
                    "Device rejected request"
                );
                CoaResult::Rejected
            }
            DeviceReply::NoResponse => {
                warn!(
                    username = %username,
                    nas_address = %target.nas_address,
                    "Device did not answer"
                );
                CoaResult::DeviceUnreachable
            }
        };

        record_coa_request(action.label(), result.as_str(), start.elapsed().as_secs_f64());
        info!(
            username = %username,
            nas_address = %target.nas_address,
            result = result.as_str(),
            "CoA request completed"
        );

        result
    }
}
