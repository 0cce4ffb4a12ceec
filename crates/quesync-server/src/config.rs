use serde::Deserialize;

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port reserved for the external control plane.
    #[serde(default = "default_session_port")]
    pub session_port: u16,

    /// UDP port for voice traffic.
    #[serde(default = "default_voice_port")]
    pub voice_port: u16,

    /// TLS port for file transfers.
    #[serde(default = "default_files_port")]
    pub files_port: u16,

    /// Directory completed uploads are stored under.
    #[serde(default = "default_files_dir")]
    pub files_dir: String,

    /// Path to TLS certificate file (PEM).
    #[serde(default = "default_cert_path")]
    pub cert_path: String,

    /// Path to TLS private key file (PEM).
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_session_port() -> u16 {
    61110
}

fn default_voice_port() -> u16 {
    61111
}

fn default_files_port() -> u16 {
    61112
}

fn default_files_dir() -> String {
    "files".into()
}

fn default_cert_path() -> String {
    "certs/server.crt".into()
}

fn default_key_path() -> String {
    "certs/server.key".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            session_port: default_session_port(),
            voice_port: default_voice_port(),
            files_port: default_files_port(),
            files_dir: default_files_dir(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}
