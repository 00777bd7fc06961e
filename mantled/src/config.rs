use std::fs::File;
use std::io;
use std::path::Path;

use serde::Deserialize;

/// On-disk configuration. Every field is optional; command-line flags win
/// over file values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: Option<ServerHosts>,
    pub server_port: Option<u16>,
    pub password: Option<String>,
    pub method: Option<String>,
    pub timeout: Option<u64>,
    pub auth: Option<bool>,
    pub fast_open: Option<bool>,
    pub nameserver: Option<String>,
}

/// `"server"` may be a single address or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ServerHosts {
    One(String),
    Many(Vec<String>),
}

impl ServerHosts {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ServerHosts::One(host) => vec![host],
            ServerHosts::Many(hosts) => hosts,
        }
    }
}

pub fn load(path: &Path) -> io::Result<FileConfig> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> FileConfig {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"{
                "server": "0.0.0.0",
                "server_port": 8388,
                "password": "barfoo!",
                "method": "aes-256-cfb",
                "timeout": 120,
                "auth": true,
                "fast_open": true,
                "nameserver": "8.8.8.8"
            }"#,
        );

        assert_eq!(config.server.unwrap().into_vec(), vec!["0.0.0.0"]);
        assert_eq!(config.server_port, Some(8388));
        assert_eq!(config.password.as_deref(), Some("barfoo!"));
        assert_eq!(config.method.as_deref(), Some("aes-256-cfb"));
        assert_eq!(config.timeout, Some(120));
        assert_eq!(config.auth, Some(true));
        assert_eq!(config.fast_open, Some(true));
        assert_eq!(config.nameserver.as_deref(), Some("8.8.8.8"));
    }

    #[test]
    fn test_server_list() {
        let config = parse(r#"{"server": ["::1", "127.0.0.1"]}"#);
        assert_eq!(
            config.server.unwrap().into_vec(),
            vec!["::1", "127.0.0.1"]
        );
    }

    #[test]
    fn test_missing_fields_default_to_none() {
        let config = parse("{}");
        assert!(config.server.is_none());
        assert!(config.server_port.is_none());
        assert!(config.password.is_none());
        assert!(config.auth.is_none());
    }
}
