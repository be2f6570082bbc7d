use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use limeshare_types::DEFAULT_CHUNK_SIZE;

use crate::tracker::REQUEST_TIMEOUT;

/// Outbound relay bytes above which chunk streaming pauses (1 MiB).
pub const RELAY_HIGH_WATER: usize = 1024 * 1024;

/// Largest file a session accepts, in chunks: 4 GiB at the default chunk size.
pub const MAX_CHUNKS: u32 = 262_144;

#[derive(Debug, thiserror::Error)]
#[error("{var}={value:?} is not a valid value")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Tunables for one orchestrator and every session it runs.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Base URL of the signaling relay; rooms live under `/room/<name>`.
    pub relay_url: String,
    /// Base URL of the keystream provider; streams live under `/ws/key/<size>`.
    pub keystream_url: String,
    pub chunk_size: usize,
    /// Upper bound on `total_chunks` for shared files and incoming metadata.
    pub max_chunks: u32,
    pub request_timeout: Duration,
    /// How often receivers sweep expired requests.
    pub sweep_interval: Duration,
    pub relay_high_water: usize,
    /// Sleep between buffer checks while the relay is above high water.
    pub backpressure_poll: Duration,
    /// Host announces its have-list to ready peers every this many chunks.
    pub announce_every: u32,
    /// Frames streamed before the session task yields to other events.
    pub yield_every: u32,
    /// Cap on live peer requests per receiver.
    pub request_batch: usize,
    /// Max indices per `have_chunks` frame.
    pub announce_batch: usize,
    /// Address TCP peer links listen on.
    pub link_bind: IpAddr,
    /// Addresses advertised as link candidates. Empty means derive from `link_bind`.
    pub link_advertise: Vec<IpAddr>,
    /// Per-link outbound frame queue; a full queue reports congestion.
    pub link_queue: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787".into(),
            keystream_url: "ws://127.0.0.1:8788".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks: MAX_CHUNKS,
            request_timeout: REQUEST_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            relay_high_water: RELAY_HIGH_WATER,
            backpressure_poll: Duration::from_millis(10),
            announce_every: 10,
            yield_every: 10,
            request_batch: 10,
            announce_batch: 500,
            link_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            link_advertise: Vec::new(),
            link_queue: 256,
        }
    }
}

impl SwarmConfig {
    /// Defaults overridden by `LIMESHARE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("LIMESHARE_RELAY_URL") {
            config.relay_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("LIMESHARE_KEYSTREAM_URL") {
            config.keystream_url = url.trim_end_matches('/').to_string();
        }
        if let Some(size) = parsed::<usize>(&lookup, "LIMESHARE_CHUNK_SIZE")? {
            if size == 0 {
                return Err(ConfigError {
                    var: "LIMESHARE_CHUNK_SIZE",
                    value: size.to_string(),
                });
            }
            config.chunk_size = size;
        }
        if let Some(chunks) = parsed::<u32>(&lookup, "LIMESHARE_MAX_CHUNKS")? {
            config.max_chunks = chunks;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "LIMESHARE_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parsed::<usize>(&lookup, "LIMESHARE_RELAY_HIGH_WATER")? {
            config.relay_high_water = bytes;
        }
        if let Some(ip) = parsed::<IpAddr>(&lookup, "LIMESHARE_LINK_BIND")? {
            config.link_bind = ip;
        }
        if let Some(list) = lookup("LIMESHARE_LINK_ADVERTISE") {
            config.link_advertise = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse().map_err(|_| ConfigError {
                        var: "LIMESHARE_LINK_ADVERTISE",
                        value: s.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(config)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}
