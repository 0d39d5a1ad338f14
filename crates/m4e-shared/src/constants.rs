/// Application name
pub const APP_NAME: &str = "Meet4Eat";

/// Prefix of every REST resource exposed by the webapp
pub const REST_ROOT: &str = "rest";

/// Envelope status of a successful REST response
pub const STATUS_OK: &str = "ok";

/// Default webapp base URL (local development server)
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080/m4e";

/// Default notification endpoint, relative to the server URL
pub const DEFAULT_NOTIFY_PATH: &str = "/ws";

/// Default per-request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default number of transport level retries
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Default interval between voting window evaluations in seconds
pub const DEFAULT_VOTING_TICK_SECS: u64 = 5;

/// Maximum location name length accepted by the server
pub const MAX_LOCATION_NAME_LEN: usize = 32;

/// Maximum location description length accepted by the server
pub const MAX_LOCATION_DESCRIPTION_LEN: usize = 1000;

/// Capacity of the session command and notification queues
pub const CHANNEL_CAPACITY: usize = 256;
