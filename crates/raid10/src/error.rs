//! Error types for the RAID-10 engine.

use thiserror::Error;

use crate::device::DeviceId;

/// Result type alias for array operations.
pub type RaidResult<T> = Result<T, RaidError>;

/// Error variants for array operations.
#[derive(Debug, Clone, Error)]
pub enum RaidError {
    /// The geometry or configuration is not usable.
    #[error("Invalid geometry: {reason}")]
    InvalidGeometry {
        /// Description of the problem.
        reason: String,
    },

    /// Configuration could not be parsed.
    #[error("Config error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// The request extends past the end of the array.
    #[error("Out of range: sector {sector} + {sectors} exceeds array size {array_sectors}")]
    OutOfRange {
        /// First requested sector.
        sector: u64,
        /// Requested length in sectors.
        sectors: u64,
        /// Array size in sectors.
        array_sectors: u64,
    },

    /// Payload length is not a whole number of sectors.
    #[error("Misaligned payload: {len} bytes is not a multiple of 512")]
    Misaligned {
        /// Payload length in bytes.
        len: usize,
    },

    /// No replica sub-request set could be allocated. Retryable.
    #[error("Replica set pool exhausted ({capacity} sets in use)")]
    PoolExhausted {
        /// Pool capacity.
        capacity: usize,
    },

    /// I/O to a single device failed.
    #[error("I/O error on device {device} at sector {sector} (+{sectors}): {reason}")]
    Io {
        /// Device the I/O was sent to.
        device: DeviceId,
        /// Physical sector.
        sector: u64,
        /// Length in sectors.
        sectors: u64,
        /// Description of the failure.
        reason: String,
    },

    /// No replica could satisfy the request.
    #[error("Unrecoverable I/O error at sector {sector} (+{sectors})")]
    Unrecoverable {
        /// Virtual sector.
        sector: u64,
        /// Length in sectors.
        sectors: u64,
    },

    /// The array lacks a live replica for some region.
    #[error("Not enough working devices: {reason}")]
    NotEnoughDevices {
        /// Description of the coverage gap.
        reason: String,
    },

    /// Device lookup failed.
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),

    /// The mirror slot cannot take the device.
    #[error("Slot {slot} busy: {reason}")]
    SlotBusy {
        /// Mirror slot index.
        slot: usize,
        /// Why the slot refused.
        reason: String,
    },

    /// A resync or recovery pass is already running.
    #[error("Sync pass already running: {mode}")]
    SyncInProgress {
        /// Mode of the running pass.
        mode: String,
    },

    /// The array has been stopped.
    #[error("Array stopped")]
    Stopped,
}

impl RaidError {
    /// Returns true if the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaidError::PoolExhausted { .. })
    }
}
