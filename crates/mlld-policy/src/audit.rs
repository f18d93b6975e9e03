// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit trail for flow decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FlowChannel, FlowDecision};

/// The flow a decision was made about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Interception point.
    pub channel: FlowChannel,
    /// Colon-joined operation string.
    pub operation: String,
    /// Label and taint spellings on the input.
    pub labels: Vec<String>,
}

/// A single recorded policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// What was judged.
    pub flow: FlowRecord,
    /// The outcome.
    pub decision: FlowDecision,
}

impl AuditEntry {
    /// Entry stamped with the current time.
    #[must_use]
    pub fn now(flow: FlowRecord, decision: FlowDecision) -> Self {
        Self {
            timestamp: Utc::now(),
            flow,
            decision,
        }
    }
}
