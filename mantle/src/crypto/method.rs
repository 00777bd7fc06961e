use std::fmt;

/// The cipher catalog. Both endpoints are configured with the same method
/// name; there is no negotiation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Method {
    Table,
    Rc4,
    Rc4Md5,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    BfCfb,
    Camellia128Cfb,
    Camellia192Cfb,
    Camellia256Cfb,
    Cast5Cfb,
    DesCfb,
    IdeaCfb,
    Rc2Cfb,
    Salsa20,
    ChaCha20,
    ChaCha20Ietf,
}

impl Method {
    pub const ALL: [Method; 17] = [
        Method::Table,
        Method::Rc4,
        Method::Rc4Md5,
        Method::Aes128Cfb,
        Method::Aes192Cfb,
        Method::Aes256Cfb,
        Method::BfCfb,
        Method::Camellia128Cfb,
        Method::Camellia192Cfb,
        Method::Camellia256Cfb,
        Method::Cast5Cfb,
        Method::DesCfb,
        Method::IdeaCfb,
        Method::Rc2Cfb,
        Method::Salsa20,
        Method::ChaCha20,
        Method::ChaCha20Ietf,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Table => "table",
            Method::Rc4 => "rc4",
            Method::Rc4Md5 => "rc4-md5",
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::BfCfb => "bf-cfb",
            Method::Camellia128Cfb => "camellia-128-cfb",
            Method::Camellia192Cfb => "camellia-192-cfb",
            Method::Camellia256Cfb => "camellia-256-cfb",
            Method::Cast5Cfb => "cast5-cfb",
            Method::DesCfb => "des-cfb",
            Method::IdeaCfb => "idea-cfb",
            Method::Rc2Cfb => "rc2-cfb",
            Method::Salsa20 => "salsa20",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Method::Table => 0,
            Method::Rc4 | Method::Rc4Md5 => 16,
            Method::Aes128Cfb => 16,
            Method::Aes192Cfb => 24,
            Method::Aes256Cfb => 32,
            Method::BfCfb => 16,
            Method::Camellia128Cfb => 16,
            Method::Camellia192Cfb => 24,
            Method::Camellia256Cfb => 32,
            Method::Cast5Cfb => 16,
            Method::DesCfb => 8,
            Method::IdeaCfb => 16,
            Method::Rc2Cfb => 16,
            Method::Salsa20 | Method::ChaCha20 | Method::ChaCha20Ietf => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            Method::Table | Method::Rc4 => 0,
            Method::Rc4Md5 => 16,
            Method::Aes128Cfb | Method::Aes192Cfb | Method::Aes256Cfb => 16,
            Method::BfCfb => 8,
            Method::Camellia128Cfb | Method::Camellia192Cfb | Method::Camellia256Cfb => 16,
            Method::Cast5Cfb => 8,
            Method::DesCfb => 8,
            Method::IdeaCfb => 8,
            Method::Rc2Cfb => 8,
            Method::Salsa20 | Method::ChaCha20 => 8,
            Method::ChaCha20Ietf => 12,
        }
    }

    /// Stream ciphers whose keystream position is an explicit block counter.
    pub fn is_counter(self) -> bool {
        matches!(self, Method::Salsa20 | Method::ChaCha20 | Method::ChaCha20Ietf)
    }

    pub fn from_name(name: &str) -> Option<Method> {
        Method::ALL.iter().copied().find(|m| m.name() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
