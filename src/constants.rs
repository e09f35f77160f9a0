//! Protocol timing, buffer bounds, and port conventions.
//!
//! The timing values follow the reference deployment: elections fire after
//! a randomized 150–300 ms silence, leaders heartbeat every 50 ms, and every
//! RPC is bounded below the election minimum so a dead peer cannot stall a
//! round.

use std::time::Duration;

/// Lower bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);

/// Upper bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(300);

/// Interval between leader heartbeats. Must stay below the election minimum.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

/// Per-call budget for RequestVote and AppendEntries RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for establishing a TCP connection to a peer.
pub const RPC_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum number of log entries shipped in a single AppendEntries RPC.
pub const MAX_APPEND_ENTRIES: usize = 100;

/// Capacity of the committed-entry channel between the node and the
/// application adapter. The node's apply loop blocks once the adapter lags
/// this far behind.
pub const APPLY_CHANNEL_CAPACITY: usize = 1000;

/// Default budget for `perform` to wait for its entry to be applied.
pub const DEFAULT_PERFORM_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on result-slot occupancy before the janitor starts evicting.
pub const RESULT_SLOT_LIMIT: usize = 1000;

/// Age past which an unclaimed result slot is evicted.
pub const RESULT_SLOT_TTL: Duration = Duration::from_secs(60);

/// Interval between janitor sweeps over the result slots.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between cluster coordinator health sweeps.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-peer budget for a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Default number of entries returned by the admin log endpoint.
pub const DEFAULT_LOG_TAIL: usize = 10;

/// Base port for derived Raft listen addresses (`8080 + node digit`).
pub const RAFT_PORT_BASE: u16 = 8080;

/// Base port for derived coordinator addresses (`8090 + node digit`).
pub const COORDINATOR_PORT_BASE: u16 = 8090;

/// Offset from a peer's Raft port to its business port in derived mode.
pub const BUSINESS_PORT_OFFSET: u16 = 920;

/// Largest HTTP request the gateway and coordinator will buffer.
pub const MAX_HTTP_REQUEST_BYTES: usize = 64 * 1024;
