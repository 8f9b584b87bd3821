use std::env;
use std::num::ParseIntError;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP/WebSocket server.
    pub host: String,
    /// Port for the HTTP/WebSocket server.
    pub port: u16,
    /// Logging level (e.g., "info", "debug").
    pub rust_log: String,

    /// Upper bound on concurrently live rooms.
    pub max_rooms: usize,
    /// Upper bound on peers per room.
    pub max_peers_per_room: usize,
    /// CORS allow-list; empty means `*`.
    pub allowed_origins: Vec<String>,
    /// Grace period for draining client write queues on shutdown.
    pub shutdown_timeout: Duration,

    /// ICE server URLs, entries as `url` or `url|username|credential`.
    pub ice_servers: Vec<IceServerConfig>,
    /// Ephemeral UDP port range for media, inclusive. Zeroes mean OS default.
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Public IP advertised in host candidates (NAT 1:1 mapping).
    pub public_ip: Option<String>,

    /// Receive bitrate caps signalled to publishers, bits/s.
    pub max_video_bitrate: u32,
    pub max_audio_bitrate: u32,
    /// Consecutive RTP read/write errors tolerated before a track is dropped.
    pub max_rtp_errors: u32,
    /// Debounce for coalescing renegotiation triggers.
    pub renegotiation_delay: Duration,

    /// Maximum inbound WebSocket payload size, bytes.
    pub ws_read_limit: usize,
    /// Per-frame write deadline.
    pub ws_write_timeout: Duration,
    /// Pong deadline, refreshed on each pong.
    pub ws_pong_timeout: Duration,
    /// Application-level ping cadence.
    pub ws_ping_interval: Duration,

    /// Token bucket refill rate and burst per client.
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,

    /// Validation bounds for identifiers.
    pub max_room_id_length: usize,
    pub max_user_id_length: usize,

    pub simulcast_enabled: bool,
    pub speaker_detection_interval: Duration,
    pub stats_interval: Duration,
    /// TTL for suspended sessions awaiting resume.
    pub session_ttl: Duration,
    /// true: every subscriber receives every track; false: explicit subscriptions.
    pub auto_subscribe: bool,

    /// State store address (`redis://...`); None disables cross-instance features.
    pub store_addr: Option<String>,
    pub store_password: Option<String>,
    pub store_db: i64,
}

/// One ICE server entry for the RTCConfiguration.
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// A port value could not be parsed as a 16-bit integer.
    InvalidPort(String, ParseIntError),
    /// A numeric value could not be parsed.
    InvalidNumber(String, ParseIntError),
    /// A port value was 0, which is logically invalid for this application.
    PortOutOfRange(u16),
    /// UDP_PORT_MIN exceeds UDP_PORT_MAX.
    InvalidPortRange(u16, u16),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort(var, err) => {
                write!(f, "{} must be a valid port number ({})", var, err)
            }
            ConfigError::InvalidNumber(var, err) => {
                write!(f, "{} must be a valid number ({})", var, err)
            }
            ConfigError::PortOutOfRange(port) => {
                write!(f, "PORT must be between 1 and 65535 (got {})", port)
            }
            ConfigError::InvalidPortRange(min, max) => {
                write!(f, "UDP_PORT_MIN ({}) must not exceed UDP_PORT_MAX ({})", min, max)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_u16(var: &str, default: u16) -> Result<u16, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidPort(var.to_string(), e)),
        Err(_) => Ok(default),
    }
}

fn env_u32(var: &str, default: u32) -> Result<u32, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidNumber(var.to_string(), e)),
        Err(_) => Ok(default),
    }
}

fn env_u64(var: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidNumber(var.to_string(), e)),
        Err(_) => Ok(default),
    }
}

fn env_usize(var: &str, default: usize) -> Result<usize, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidNumber(var.to_string(), e)),
        Err(_) => Ok(default),
    }
}

fn env_bool(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn parse_ice_servers(raw: &str) -> Vec<IceServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.split('|');
            let url = parts.next().unwrap_or_default().to_string();
            let username = parts.next().map(str::to_string);
            let credential = parts.next().map(str::to_string);
            IceServerConfig {
                url,
                username,
                credential,
            }
        })
        .collect()
}

/// Validates environment variables and returns a Config object.
/// Returns an error if any present variable is invalid.
pub fn validate_env() -> Result<Config, ConfigError> {
    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

    let port = env_u16("PORT", 8080)?;
    if port == 0 {
        return Err(ConfigError::PortOutOfRange(port));
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        eprintln!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let ice_servers = env::var("ICE_SERVERS")
        .map(|raw| parse_ice_servers(&raw))
        .unwrap_or_else(|_| {
            vec![IceServerConfig {
                url: "stun:stun.l.google.com:19302".to_string(),
                username: None,
                credential: None,
            }]
        });

    let udp_port_min = env_u16("UDP_PORT_MIN", 0)?;
    let udp_port_max = env_u16("UDP_PORT_MAX", 0)?;
    if udp_port_min > udp_port_max {
        return Err(ConfigError::InvalidPortRange(udp_port_min, udp_port_max));
    }

    let allowed_origins = env::var("ALLOWED_ORIGINS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let config = Config {
        host,
        port,
        rust_log,
        max_rooms: env_usize("MAX_ROOMS", 1000)?,
        max_peers_per_room: env_usize("MAX_PEERS_PER_ROOM", 50)?,
        allowed_origins,
        shutdown_timeout: Duration::from_secs(env_u64("SHUTDOWN_TIMEOUT_SECS", 10)?),
        ice_servers,
        udp_port_min,
        udp_port_max,
        public_ip: env::var("PUBLIC_IP").ok().filter(|s| !s.is_empty()),
        max_video_bitrate: env_u32("MAX_VIDEO_BITRATE", 2_500_000)?,
        max_audio_bitrate: env_u32("MAX_AUDIO_BITRATE", 128_000)?,
        max_rtp_errors: env_u32("MAX_RTP_ERRORS", 10)?,
        renegotiation_delay: Duration::from_millis(env_u64("RENEGOTIATION_DELAY_MS", 150)?),
        ws_read_limit: env_usize("WS_READ_LIMIT", 512 * 1024)?,
        ws_write_timeout: Duration::from_secs(env_u64("WS_WRITE_TIMEOUT_SECS", 10)?),
        ws_pong_timeout: Duration::from_secs(env_u64("WS_PONG_TIMEOUT_SECS", 60)?),
        ws_ping_interval: Duration::from_secs(env_u64("WS_PING_INTERVAL_SECS", 54)?),
        rate_limit_per_sec: env_u32("RATE_LIMIT_PER_SEC", 20)?,
        rate_limit_burst: env_u32("RATE_LIMIT_BURST", 40)?,
        max_room_id_length: env_usize("MAX_ROOM_ID_LENGTH", 64)?,
        max_user_id_length: env_usize("MAX_USER_ID_LENGTH", 64)?,
        simulcast_enabled: env_bool("SIMULCAST_ENABLED", true),
        speaker_detection_interval: Duration::from_millis(env_u64(
            "SPEAKER_DETECTION_INTERVAL_MS",
            200,
        )?),
        stats_interval: Duration::from_secs(env_u64("STATS_INTERVAL_SECS", 3)?),
        session_ttl: Duration::from_secs(env_u64("SESSION_TTL_SECS", 120)?),
        auto_subscribe: env_bool("AUTO_SUBSCRIBE", true),
        store_addr: env::var("STORE_ADDR").ok().filter(|s| !s.is_empty()),
        store_password: env::var("STORE_PASSWORD").ok().filter(|s| !s.is_empty()),
        store_db: env::var("STORE_DB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    };

    Ok(config)
}

impl Default for Config {
    /// Defaults used by tests; equivalent to an empty environment.
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rust_log: "info".to_string(),
            max_rooms: 1000,
            max_peers_per_room: 50,
            allowed_origins: Vec::new(),
            shutdown_timeout: Duration::from_secs(10),
            ice_servers: Vec::new(),
            udp_port_min: 0,
            udp_port_max: 0,
            public_ip: None,
            max_video_bitrate: 2_500_000,
            max_audio_bitrate: 128_000,
            max_rtp_errors: 10,
            renegotiation_delay: Duration::from_millis(150),
            ws_read_limit: 512 * 1024,
            ws_write_timeout: Duration::from_secs(10),
            ws_pong_timeout: Duration::from_secs(60),
            ws_ping_interval: Duration::from_secs(54),
            rate_limit_per_sec: 20,
            rate_limit_burst: 40,
            max_room_id_length: 64,
            max_user_id_length: 64,
            simulcast_enabled: true,
            speaker_detection_interval: Duration::from_millis(200),
            stats_interval: Duration::from_secs(3),
            session_ttl: Duration::from_secs(120),
            auto_subscribe: true,
            store_addr: None,
            store_password: None,
            store_db: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    // Helper to set up and tear down environment variables for tests
    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap();
            EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_validate_env_defaults() {
        let mut guard = EnvGuard::new();
        guard.unset("PORT");
        guard.unset("STORE_ADDR");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit_per_sec, 20);
        assert_eq!(config.session_ttl, Duration::from_secs(120));
        assert!(config.store_addr.is_none());
        assert!(config.auto_subscribe);
    }

    #[test]
    fn test_validate_env_valid_configuration() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "9000");
        guard.set("RUST_LOG", "debug");
        guard.set("MAX_PEERS_PER_ROOM", "8");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.port, 9000);
        assert_eq!(config.rust_log, "debug");
        assert_eq!(config.max_peers_per_room, 8);
    }

    #[test]
    fn test_validate_env_invalid_port() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "not-a-number");

        let result = validate_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(_, _)));
        assert!(err.to_string().contains("PORT must be a valid port number"));
    }

    #[test]
    fn test_validate_env_port_zero() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "0");

        let result = validate_env();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::PortOutOfRange(0)));
    }

    #[test]
    fn test_validate_env_bad_udp_range() {
        let mut guard = EnvGuard::new();
        guard.set("UDP_PORT_MIN", "50000");
        guard.set("UDP_PORT_MAX", "40000");

        let result = validate_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidPortRange(50000, 40000)
        ));
    }

    #[test]
    fn test_parse_ice_servers_with_credentials() {
        let servers =
            parse_ice_servers("stun:stun.example.org:3478, turn:turn.example.org:3478|alice|s3cret");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].url, "stun:stun.example.org:3478");
        assert!(servers[0].username.is_none());
        assert_eq!(servers[1].username.as_deref(), Some("alice"));
        assert_eq!(servers[1].credential.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_validate_env_bool_flags() {
        let mut guard = EnvGuard::new();
        guard.set("SIMULCAST_ENABLED", "false");
        guard.set("AUTO_SUBSCRIBE", "0");

        let config = validate_env().expect("Expected valid configuration");
        assert!(!config.simulcast_enabled);
        assert!(!config.auto_subscribe);
    }
}
