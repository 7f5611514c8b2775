//! Per-request bookkeeping: identity, timing, and the phase state machine.
//!
//! ```text
//! Received → Decoding → Processing → Encoding → Responded
//!     │          │           │   └────────────→ Responded (no image to encode)
//!     └──────────┴───────────┴──────────┴──────→ Failed
//! ```
//!
//! The phase lives in an atomic cell shared with the worker job so a timeout
//! on the async side can report which phase it interrupted, and the worker
//! can notice that nobody is waiting any more.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RequestPhase {
    Received = 0,
    Decoding = 1,
    Processing = 2,
    Encoding = 3,
    Responded = 4,
    Failed = 5,
}

impl RequestPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestPhase::Received,
            1 => RequestPhase::Decoding,
            2 => RequestPhase::Processing,
            3 => RequestPhase::Encoding,
            4 => RequestPhase::Responded,
            _ => RequestPhase::Failed,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RequestPhase::Received => "received",
            RequestPhase::Decoding => "decoding",
            RequestPhase::Processing => "processing",
            RequestPhase::Encoding => "encoding",
            RequestPhase::Responded => "responded",
            RequestPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Responded | RequestPhase::Failed)
    }

    pub fn can_advance_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Received, Decoding)
                | (Decoding, Processing)
                | (Processing, Encoding)
                | (Processing, Responded)
                | (Encoding, Responded)
                | (Received | Decoding | Processing | Encoding, Failed)
        )
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Atomic holder of a request's current phase.
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(RequestPhase::Received as u8))
    }

    pub fn get(&self) -> RequestPhase {
        RequestPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if that transition is legal from the current phase.
    /// Returns `false` when the request already reached a terminal phase or
    /// the transition is not allowed.
    pub fn advance(&self, next: RequestPhase) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !RequestPhase::from_u8(current).can_advance_to(next) {
                return false;
            }
            match self.0.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the request failed and return the phase it failed in. A request
    /// that already reached a terminal phase is left as is.
    pub fn fail(&self) -> RequestPhase {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let phase = RequestPhase::from_u8(current);
            if phase.is_terminal() {
                return phase;
            }
            match self.0.compare_exchange(
                current,
                RequestPhase::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return phase,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity and clock of one HTTP request-response cycle.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub received_at: DateTime<Utc>,
    pub started: Instant,
    pub phase: Arc<PhaseCell>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            started: Instant::now(),
            phase: Arc::new(PhaseCell::new()),
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase.get()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1_000.0
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
