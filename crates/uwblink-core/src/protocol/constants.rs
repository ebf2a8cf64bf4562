//! Link-layer constants of the HSSPI protocol.
//!
//! Values follow the QM35 host interface: a 4-byte header exchanged
//! full-duplex in front of every payload.

// ============================================================================
// Host header flags (host -> device)
// ============================================================================

/// Read request: the data phase carries the announced inbound frame.
pub const HOST_FLAG_RD: u8 = 1 << 5;
/// Pre-read request: header-only probe for pending inbound data.
pub const HOST_FLAG_PRD: u8 = 1 << 6;
/// Write request: the data phase carries an outbound frame.
pub const HOST_FLAG_WR: u8 = 1 << 7;

// ============================================================================
// Device header flags (device -> host)
// ============================================================================

/// Boot ROM reports an error.
pub const SOC_FLAG_BOOTROM_ERR: u8 = 1 << 0;
/// Boot ROM is answering (firmware not running yet).
pub const SOC_FLAG_BOOTROM_RDY: u8 = 1 << 1;
/// Boot ROM output active.
pub const SOC_FLAG_BOOTROM_OA: u8 = 1 << 2;
/// Boot ROM output data waiting.
pub const SOC_FLAG_BOOTROM_ODW: u8 = 1 << 3;
/// Firmware reports an error.
pub const SOC_FLAG_ERR: u8 = 1 << 4;
/// Firmware ready to accept a transaction.
pub const SOC_FLAG_RDY: u8 = 1 << 5;
/// Output active: the data phase of this exchange is valid.
pub const SOC_FLAG_OA: u8 = 1 << 6;
/// Output data waiting: the device has a frame for the host.
pub const SOC_FLAG_ODW: u8 = 1 << 7;

/// Flag patterns read back from a sleeping or unpowered device.
pub const SOC_FLAGS_ASLEEP: [u8; 2] = [0x00, 0xFF];

// ============================================================================
// Sizes
// ============================================================================

/// Largest frame exchanged in either direction.
pub const MAX_PACKET_SIZE: usize = 1024;

// ============================================================================
// Timing defaults (microseconds unless stated otherwise)
// ============================================================================

/// Total attempts for a send or receive before giving up.
pub const RETRY_COUNT: u32 = 3;
/// First backoff delay between attempts, doubled after each one.
pub const RETRY_DELAY_US: u64 = 50;
/// Ready-line polling timeout.
pub const READY_TIMEOUT_US: u64 = 1000;
/// Ready-line polling interval.
pub const READY_POLL_US: u64 = 10;
/// Wake pulse width.
pub const WAKEUP_DURATION_US: u64 = 500;
/// Settle time after a wake pulse.
pub const WAKEUP_DELAY_US: u64 = 5000;
/// Reset pulse width.
pub const RESET_DURATION_US: u64 = 2000;
/// Minimum time between reset release and the first exchange.
pub const RESET_BACKOFF_US: u64 = 25_000;
/// Flag polls performed while waiting for firmware after a reset.
pub const RESET_READY_POLLS: u32 = 100;
/// Delay before each of those polls, in milliseconds.
pub const RESET_POLL_INTERVAL_MS: u64 = 10;
/// Grace period when the device announces a core dump during reset, in milliseconds.
pub const COREDUMP_GRACE_MS: u64 = 750;
/// Wait for a probing command response, in milliseconds.
pub const PROBE_TIMEOUT_MS: u64 = 1000;
/// Wait for a lifecycle state change, in milliseconds.
pub const STATE_TIMEOUT_MS: u64 = 1000;
