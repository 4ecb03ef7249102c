//! Protocol constants and tuning parameters.
//!
//! Sockets, watermarks, and timeouts follow the values the swarm logic
//! was tuned against; changing them shifts behavior under churn, so
//! they live in one place.

use std::time::Duration;

// ============================================================================
// Client identity
// ============================================================================

/// Azureus-style peer id prefix.
pub const PEER_ID_PREFIX: &[u8] = b"-SH0001-";

/// The `v` field of our extension handshake.
pub const CLIENT_NAME: &str = "shoal 0.1.0";

/// Listen address when none is configured. IPv6 is left off by default
/// because the blocklist only understands IPv4 ranges.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50007";

// ============================================================================
// Transfer units
// ============================================================================

/// The wire unit of transfer: one chunk of a piece.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Upload requests above this are treated as hostile (BEP-3 allows
/// nothing close to it).
pub const MAX_UPLOAD_REQUEST_LEN: u32 = 128 * 1024;

// ============================================================================
// Per-connection request bounds
// ============================================================================

/// Hard cap on our outstanding requests to one peer, whatever its
/// advertised `reqq`.
pub const MAX_OUTSTANDING_REQUESTS: usize = 64;

/// Assumed request-queue depth for peers that never sent `reqq`.
pub const DEFAULT_PEER_REQQ: usize = 250;

/// What we advertise as `reqq`. Uploads are served synchronously with
/// no real queue, so advertise depth 1; when uploads are disabled the
/// number is free, so look normal.
pub const OUR_REQQ_UPLOADING: i64 = 1;
pub const OUR_REQQ_NO_UPLOAD: i64 = 250;

// ============================================================================
// Swarm sizing
// ============================================================================

/// Connections per torrent, eviction above it.
pub const SOCKETS_PER_TORRENT: usize = 40;

/// In-flight dials per torrent.
pub const HALF_OPEN_LIMIT: usize = 40;

/// Below this many known peers the announce loops actively hunt.
pub const PEERS_LOW_WATER: usize = 50;

/// Above this many known peers discovery stops accepting more.
pub const PEERS_HIGH_WATER: usize = 200;

// ============================================================================
// Timeouts
// ============================================================================

/// MSE plus BT handshake budget. Tight: it sheds about 1% of real
/// handshakes along with most of the junk connections.
pub const BT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// Ceiling on the whole connection setup, dial included.
pub const HANDSHAKES_TIMEOUT: Duration = Duration::from_secs(20);

/// Nominal dial timeout before half-open crowding scales it down.
pub const NOMINAL_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Floor for the scaled-down dial timeout.
pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Keep-alives arrive every two minutes; allow grace on top.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(150);

/// How often the writer emits keep-alives on an idle connection.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

// ============================================================================
// Maintenance intervals
// ============================================================================

/// Connection pruner cadence.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// A connection younger than this is never pruned, and one that fed us
/// a chunk within it is considered alive.
pub const CONN_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Sleep after a full round of tracker failures.
pub const TRACKER_RETRY_DELAY: Duration = Duration::from_secs(10);

// ============================================================================
// Reading
// ============================================================================

/// Bytes of readahead a blocking read requests beyond its position.
pub const DEFAULT_READAHEAD: u64 = 5 * 1024 * 1024;
