//! Live session and NAS device models read from the RADIUS database.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A subscriber's currently open accounting session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ActiveSession {
    pub nas_address: String,
    pub session_id: String,
    pub framed_ip: Option<String>,
}

/// A registered access device and its CoA shared secret.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NasDevice {
    pub nas_address: String,
    pub secret: String,
    /// Overrides the configured CoA port for this device.
    pub coa_port: Option<i32>,
}
