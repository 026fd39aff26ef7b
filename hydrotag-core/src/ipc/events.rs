//! Event types broadcast by the acquisition engine.
//!
//! | Event | Receiver |
//! |-------|----------|
//! | `StatusEvent` | `AcquisitionEngine::subscribe_status` |
//! | `PagePersistedEvent` | `AcquisitionEngine::subscribe_pages` |
//!
//! Both serialise as camelCase JSON so the daemon can print them verbatim.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted whenever the acquisition state machine changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub status: AcquisitionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
    /// Where an overflow was detected, for `Overflowed`.
    pub overflow_location: Option<OverflowLocation>,
}

/// Acquisition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionStatus {
    /// No session running.
    Idle,
    /// Programming geometry, resetting the FIFO, opening the first file.
    Priming,
    /// Producer draining the FIFO into the ring.
    Streaming,
    /// Stop requested; flushing the partial page.
    Stopping,
    /// Overflow declared; tearing the session down.
    Overflowed,
    /// Transport failure or startup error.
    Error,
}

/// Check point at which the producer observed an overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowLocation {
    /// Top of the loop, before waiting for data ready.
    BeforeWait,
    /// Between the two halves of a block transfer.
    MidTransfer,
    /// After the transfer, before committing the block.
    AfterTransfer,
    /// Forced from the command surface and seen while polling for data.
    Commanded,
    /// The writer caught up with a page the consumer still holds.
    RingOverrun,
}

impl OverflowLocation {
    /// Numeric code written to the status log.
    pub const fn code(self) -> u8 {
        match self {
            OverflowLocation::BeforeWait => 1,
            OverflowLocation::MidTransfer => 2,
            OverflowLocation::AfterTransfer => 3,
            OverflowLocation::Commanded => 4,
            OverflowLocation::RingOverrun => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence events
// ---------------------------------------------------------------------------

/// Emitted after the persistence engine finishes writing one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagePersistedEvent {
    pub seq: u64,
    /// Ring page index (0 or 1).
    pub page: usize,
    /// Valid blocks in the page (fewer than a full page for the final flush).
    pub blocks: usize,
    /// Samples handed to the encoder (0 if the page was dropped).
    pub samples: usize,
    /// File the page was written to.
    pub file: String,
    /// Encoded sample bytes in that file so far.
    pub file_bytes: u64,
    /// New file opened after this page, if the write crossed the threshold.
    pub rotated_to: Option<String>,
    /// `true` for the partial page flushed at shutdown.
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = StatusEvent {
            seq: 4,
            status: AcquisitionStatus::Overflowed,
            detail: Some("overflow line asserted".into()),
            overflow_location: Some(OverflowLocation::MidTransfer),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["status"], "overflowed");
        assert_eq!(json["overflowLocation"], "mid-transfer");

        let round_trip: StatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, AcquisitionStatus::Overflowed);
        assert_eq!(round_trip.overflow_location, Some(OverflowLocation::MidTransfer));
    }

    #[test]
    fn overflow_codes_are_stable() {
        assert_eq!(OverflowLocation::BeforeWait.code(), 1);
        assert_eq!(OverflowLocation::MidTransfer.code(), 2);
        assert_eq!(OverflowLocation::AfterTransfer.code(), 3);
        assert_eq!(OverflowLocation::Commanded.code(), 4);
        assert_eq!(OverflowLocation::RingOverrun.code(), 5);
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<AcquisitionStatus>(r#""Streaming""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn page_event_serializes_with_camel_case_fields() {
        let event = PagePersistedEvent {
            seq: 1,
            page: 0,
            blocks: 12,
            samples: 12_276,
            file: "/data/1700000000000.wav".into(),
            file_bytes: 24_552,
            rotated_to: None,
            partial: false,
        };

        let json = serde_json::to_value(&event).expect("serialize page event");
        assert_eq!(json["fileBytes"], 24_552);
        assert_eq!(json["rotatedTo"], serde_json::Value::Null);
        assert_eq!(json["partial"], false);
    }
}
