//! Protocol constants for onetp.
//!
//! Wire codes are fixed by the session protocol and MUST NOT be changed.
//! Timing values are defaults; every one of them can be overridden through
//! the matching configuration struct.

use std::time::Duration;

// =============================================================================
// VERSIONING
// =============================================================================

/// Version string carried in every session packet and descriptor.
pub const PROTOCOL_VERSION: &str = "0.1";

// =============================================================================
// TRANSPORT TYPE TAGS
// =============================================================================

/// Direct UDP transport tag.
pub const TRANSPORT_UDP: &str = "udp";

/// Direct TCP transport tag.
pub const TRANSPORT_TCP: &str = "tcp";

/// TURN relay over UDP transport tag.
pub const TRANSPORT_TURN_UDP: &str = "turn-udp";

/// TURN relay over TCP transport tag.
pub const TRANSPORT_TURN_TCP: &str = "turn-tcp";

// =============================================================================
// SESSION MESSAGE TYPES
// =============================================================================

/// Session open request.
pub const MSG_SYN: u16 = 0x0000;

/// Session open acknowledgment.
pub const MSG_SYN_ACK: u16 = 0x0001;

/// Application payload.
pub const MSG_DATA: u16 = 0x0010;

/// Half-close request.
pub const MSG_FIN: u16 = 0x0011;

/// Hard-close request.
pub const MSG_RST: u16 = 0x0100;

/// Generic acknowledgment of a control transaction.
pub const MSG_ACK: u16 = 0x0101;

/// Rendezvous ping on an established stream.
pub const MSG_PING: u16 = 0x0111;

/// Rendezvous ping answer.
pub const MSG_PONG: u16 = 0x1000;

// =============================================================================
// SIZES
// =============================================================================

/// Largest application payload carried by a single DATA datagram.
pub const MAX_DATA_CHUNK: usize = 1200;

/// Largest outer frame accepted on a byte stream (1 MiB).
pub const MAX_STREAM_FRAME: usize = 1 << 20;

/// Receive buffer for datagram sockets.
pub const DATAGRAM_BUFFER_SIZE: usize = 65535;

/// Capacity of the in-memory pipe behind every `NetStream`.
pub const STREAM_PIPE_CAPACITY: usize = 64 * 1024;

/// Length of generated session identifiers, in bytes of entropy.
pub const SESSION_ID_BYTES: usize = 8;

/// Length of generated transaction identifiers, in bytes of entropy.
pub const TRANSACTION_ID_BYTES: usize = 4;

// =============================================================================
// RETRY PRIMITIVE DEFAULTS
// =============================================================================

/// Retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Delay before the first retransmission.
pub const DEFAULT_TIMEOUT_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

// =============================================================================
// UDP SESSION TIMING
// =============================================================================

/// Retransmission delay for SYN, SYN_ACK, FIN and RST.
pub const UDP_RETRANSMISSION_DELAY: Duration = Duration::from_millis(100);

/// Retransmissions for SYN, SYN_ACK, FIN and RST.
pub const UDP_RETRIES: u32 = 5;

/// Recommended per-attempt timeout for UDP connects.
pub const UDP_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Recommended per-attempt timeout for TCP connects.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

// =============================================================================
// TURN TIMING (RFC 5766 lifetimes)
// =============================================================================

/// Allocation lifetime requested when the server did not report one.
pub const TURN_DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);

/// Permission lifetime fixed by the TURN protocol.
pub const TURN_PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Channel binding lifetime fixed by the TURN protocol.
pub const TURN_CHANNEL_LIFETIME: Duration = Duration::from_secs(600);

/// Refresh this long before a lease expires.
pub const TURN_REFRESH_MARGIN: Duration = Duration::from_millis(10000);

/// Recommended per-attempt timeout for TURN connects.
pub const TURN_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

// =============================================================================
// RELAYED DATAGRAM PREFIXES
// =============================================================================

/// Relayed half-close.
pub const RELAY_FIN: u8 = 0x00;

/// Relayed hard-close.
pub const RELAY_RST: u8 = 0x01;

/// Relayed payload bytes follow.
pub const RELAY_DATA: u8 = 0x02;
