use clap::Parser;

use crate::capture::transport::TransportMode;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Transcript Store Args ---
    /// Transcript store type (supabase, redis, memory)
    #[arg(long, env = "STORE_TYPE", default_value = "supabase")]
    pub store_type: String,

    /// Transcript store endpoint (e.g., https://<project>.supabase.co or redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_URL", default_value = "http://127.0.0.1:54321")]
    pub store_url: String,

    /// API key forwarded to the table store as `apikey` / bearer header.
    #[arg(long, env = "STORE_API_KEY")]
    pub store_api_key: Option<String>,

    /// Table (PostgREST resource) receiving transcript rows.
    #[arg(long, env = "STORE_TABLE", default_value = "transcripts")]
    pub store_table: String,

    /// Prefix for Redis transcript keys.
    #[arg(long, env = "REDIS_PREFIX", default_value = "transcripts:")]
    pub redis_prefix: String,

    // --- Capture Args ---
    /// Optional JSON file overriding the origin allow-list, noise rules and content ceiling.
    #[arg(long, env = "CAPTURE_CONFIG")]
    pub capture_config: Option<String>,

    /// Also persist a System line for conversation start/end events.
    #[arg(long, env = "ANNOUNCE_LIFECYCLE", default_value = "false")]
    pub announce_lifecycle: bool,

    /// Preferred widget transport (sdk, iframe); the other one is the single fallback.
    #[arg(long, env = "WIDGET_TRANSPORT", default_value = "sdk")]
    pub widget_transport: TransportMode,

    /// Origin the browser shim should address init probes to.
    #[arg(long, env = "WIDGET_ORIGIN", default_value = "https://labs.heygen.com")]
    pub widget_origin: String,

    /// Delay before the first init probe after mount, in milliseconds.
    #[arg(long, env = "PROBE_DELAY_MS", default_value = "2000")]
    pub probe_delay_ms: u64,

    /// Spacing between init probes, in milliseconds.
    #[arg(long, env = "PROBE_INTERVAL_MS", default_value = "1000")]
    pub probe_interval_ms: u64,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Host address and port for the WebSocket capture server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP listing API. Disabled when not set.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Optional shared secret. When set, clients must sign the handshake timestamp with it.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}
