//! Wire format.
//!
//! Each connection opens with one envelope line:
//!
//! ```text
//! {"type":"worker.on_duty","id":"ana","capability":["grill","fry"]}
//! {"type":"worker.off_duty","id":"ana"}
//! {"type":"job","capability":"grill"}
//! ```
//!
//! A worker that goes on duty gets no reply on success: from then on every
//! line it reads is a job payload, and every line it writes is the result
//! for the payload it last read. A rejected registration is answered with an
//! error line and the connection is closed.
//!
//! An off-duty request is answered with `{"status":"off_duty"}`. An
//! envelope or job payload line that is not the expected JSON is answered
//! with an `invalid_request` error.
//!
//! A job connection sends its payload as the next line after the envelope
//! and reads back either the worker's result line or an error line:
//!
//! ```text
//! {"error":"no_available_worker","message":"No worker available for capability \"grill\""}
//! ```

use brigade::{Error, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First line on every connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Register the connection as a worker.
    #[serde(rename = "worker.on_duty")]
    OnDuty {
        id: WorkerId,
        /// Kept raw so shape errors surface as `invalid_capability`.
        capability: Value,
    },
    /// Take another connection's worker off duty.
    #[serde(rename = "worker.off_duty")]
    OffDuty { id: WorkerId },
    /// Run one job on the next worker serving `capability`.
    #[serde(rename = "job")]
    Job { capability: String },
}

/// Server-originated reply line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Status { status: &'static str },
    Error { error: &'static str, message: String },
}

impl Reply {
    pub const OFF_DUTY: Self = Self::Status { status: "off_duty" };
}

impl From<&Error> for Reply {
    fn from(error: &Error) -> Self {
        Self::Error {
            error: error.kind(),
            message: error.to_string(),
        }
    }
}
