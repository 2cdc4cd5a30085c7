pub const SECONDS: u64 = 1;
pub const MINUTES: u64 = 60 * SECONDS;
pub const HOURS: u64 = 60 * MINUTES;
pub const DAYS: u64 = 24 * HOURS;

/// Storage keys are namespaced per protocol version so incompatible persisted
/// layouts never collide across releases.
pub const CORE_PROTOCOL: &str = "wc_core";
pub const CORE_VERSION: &str = "1";
pub const RELAY_PROTOCOL: &str = "irn";
pub const URI_VERSION: u32 = 2;

pub fn storage_key(name: &str) -> String {
    format!("{CORE_PROTOCOL}:{CORE_VERSION}:{name}")
}

pub const HEARTBEAT_INTERVAL: u64 = 5 * SECONDS;

// Relay RPC bounds. A failure inside these windows does not surface to the
// caller, it feeds the stall/reconnect path instead.
pub const PUBLISH_TIMEOUT: u64 = 45 * SECONDS;
pub const SUBSCRIBE_TIMEOUT: u64 = 20 * SECONDS;
pub const BATCH_SUBSCRIBE_SIZE: usize = 500;
pub const RECONNECT_DELAY: u64 = SECONDS;

// Entity lifetimes.
pub const PROPOSAL_EXPIRY: u64 = 5 * MINUTES;
pub const PAIRING_PENDING_EXPIRY: u64 = 5 * MINUTES;
pub const PAIRING_ACTIVE_EXPIRY: u64 = 30 * DAYS;
pub const SESSION_EXPIRY: u64 = 7 * DAYS;

pub const DID_DELIMITER: &str = ":";
pub const DID_PREFIX: &str = "did";
pub const DID_METHOD: &str = "key";

pub const MULTICODEC_ED25519_BASE: &str = "z";
pub const MULTICODEC_ED25519_HEADER: &str = "K36";

pub const CRYPTO_CLIENT_SEED: &str = "client_ed25519_seed";
pub const CRYPTO_JWT_TTL: u64 = DAYS;
