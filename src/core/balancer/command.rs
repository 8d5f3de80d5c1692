//! Administrative node commands (`up`, `down`, `takeout`) and their
//! authentication.
//!
//! Commands travel as query strings. A deployment may require them to be
//! AES encrypted (`data=<base64>`), HMAC signed (`signature=<hex>`), recent
//! (`time`) and unique (`nonce`). Every check runs before any state is
//! touched, so a rejected command never mutates a cluster.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use aes::{Aes128, Aes192, Aes256};
use base64::{Engine, engine::general_purpose::STANDARD};
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use http::StatusCode;
use sha2::Sha256;
use thiserror::Error;

use crate::core::balancer::{DEFAULT_BALANCER, cluster::DEFAULT_CLUSTER, node::NodeStatus};

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while parsing or authenticating a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("missing parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: &'static str, value: String },

    #[error("encrypted payload required")]
    EncryptionRequired,

    #[error("payload could not be decrypted")]
    Decryption,

    #[error("signature required")]
    SignatureRequired,

    #[error("signature mismatch")]
    BadSignature,

    #[error("command expired")]
    Expired,

    #[error("nonce already used")]
    ReplayedNonce,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl CommandError {
    /// 403 for authenticity failures, 400 for malformed commands.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownCommand(_) | Self::MissingParameter(_) | Self::InvalidParameter { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::FORBIDDEN,
        }
    }
}

/// Result type for command operations
pub type CommandResult<T> = Result<T, CommandError>;

/// What a command does to its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Up,
    Down,
    Takeout,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Up => "up",
            CommandKind::Down => "down",
            CommandKind::Takeout => "takeout",
        }
    }

    pub fn target_status(self) -> NodeStatus {
        match self {
            CommandKind::Up => NodeStatus::Up,
            CommandKind::Down => NodeStatus::Down,
            CommandKind::Takeout => NodeStatus::Takeout,
        }
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(CommandKind::Up),
            "down" => Ok(CommandKind::Down),
            "takeout" => Ok(CommandKind::Takeout),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node state change addressed to `balancer/cluster/host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCommand {
    pub kind: CommandKind,
    pub balancer: String,
    pub cluster: String,
    pub host: String,
    pub port: u16,
    /// Unix millis when the command was issued
    pub time: Option<i64>,
    pub nonce: Option<String>,
}

impl ClusterCommand {
    /// A command for the default balancer and cluster, stamped with the
    /// current time.
    pub fn new(kind: CommandKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            balancer: DEFAULT_BALANCER.to_string(),
            cluster: DEFAULT_CLUSTER.to_string(),
            host: host.into(),
            port,
            time: Some(chrono::Utc::now().timestamp_millis()),
            nonce: None,
        }
    }

    pub fn with_balancer(mut self, balancer: impl Into<String>) -> Self {
        self.balancer = balancer.into();
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Build from decoded query parameters. `balancer` and `cluster` default
    /// to `Default`, `port` to 80.
    pub fn from_params(kind: CommandKind, params: &HashMap<String, String>) -> CommandResult<Self> {
        let host = params
            .get("host")
            .filter(|h| !h.is_empty())
            .ok_or(CommandError::MissingParameter("host"))?
            .clone();
        let port = match params.get("port") {
            Some(p) => p.parse().map_err(|_| CommandError::InvalidParameter {
                name: "port",
                value: p.clone(),
            })?,
            None => 80,
        };
        let time = params
            .get("time")
            .map(|t| {
                t.parse().map_err(|_| CommandError::InvalidParameter {
                    name: "time",
                    value: t.clone(),
                })
            })
            .transpose()?;

        Ok(Self {
            kind,
            balancer: non_empty(params.get("balancer")).unwrap_or(DEFAULT_BALANCER).to_string(),
            cluster: non_empty(params.get("cluster")).unwrap_or(DEFAULT_CLUSTER).to_string(),
            host,
            port,
            time,
            nonce: params.get("nonce").cloned(),
        })
    }

    /// Query string carrying the command's parameters in a fixed order.
    pub fn to_query(&self) -> String {
        let mut query = format!(
            "balancer={}&cluster={}&host={}&port={}",
            urlencoding::encode(&self.balancer),
            urlencoding::encode(&self.cluster),
            urlencoding::encode(&self.host),
            self.port
        );
        if let Some(time) = self.time {
            query.push_str(&format!("&time={time}"));
        }
        if let Some(nonce) = &self.nonce {
            query.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
        }
        query
    }

    /// The text covered by an HMAC signature.
    pub fn signing_payload(&self) -> String {
        format!("{}?{}", self.kind, self.to_query())
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Decode an `application/x-www-form-urlencoded` query into a map; later
/// duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// AES (ECB, PKCS#7 padding) over the command query string, base64 encoded.
#[derive(Clone)]
pub struct CommandCipher {
    key: Vec<u8>,
}

impl fmt::Debug for CommandCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCipher")
            .field("key_bits", &(self.key.len() * 8))
            .finish()
    }
}

impl CommandCipher {
    /// Key given as hex; 16, 24 or 32 bytes.
    pub fn from_hex(key: &str) -> CommandResult<Self> {
        let key = hex::decode(key.trim()).map_err(|e| CommandError::InvalidKey(e.to_string()))?;
        Self::new(key)
    }

    pub fn new(key: Vec<u8>) -> CommandResult<Self> {
        match key.len() {
            16 | 24 | 32 => Ok(Self { key }),
            n => Err(CommandError::InvalidKey(format!(
                "AES keys are 16, 24 or 32 bytes, got {n}"
            ))),
        }
    }

    pub fn encrypt(&self, plain: &str) -> CommandResult<String> {
        let bytes = match self.key.len() {
            16 => encrypt_with::<ecb::Encryptor<Aes128>>(&self.key, plain.as_bytes())?,
            24 => encrypt_with::<ecb::Encryptor<Aes192>>(&self.key, plain.as_bytes())?,
            _ => encrypt_with::<ecb::Encryptor<Aes256>>(&self.key, plain.as_bytes())?,
        };
        Ok(STANDARD.encode(bytes))
    }

    pub fn decrypt(&self, encoded: &str) -> CommandResult<String> {
        let cipher_text = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CommandError::Decryption)?;
        let plain = match self.key.len() {
            16 => decrypt_with::<ecb::Decryptor<Aes128>>(&self.key, &cipher_text)?,
            24 => decrypt_with::<ecb::Decryptor<Aes192>>(&self.key, &cipher_text)?,
            _ => decrypt_with::<ecb::Decryptor<Aes256>>(&self.key, &cipher_text)?,
        };
        String::from_utf8(plain).map_err(|_| CommandError::Decryption)
    }
}

fn encrypt_with<C: BlockEncryptMut + KeyInit>(key: &[u8], plain: &[u8]) -> CommandResult<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(|e| CommandError::InvalidKey(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain))
}

fn decrypt_with<C: BlockDecryptMut + KeyInit>(key: &[u8], data: &[u8]) -> CommandResult<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(|e| CommandError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| CommandError::Decryption)
}

/// HMAC-SHA256 signatures in lowercase hex.
#[derive(Clone)]
pub struct CommandSigner {
    mac: HmacSha256,
}

impl fmt::Debug for CommandSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandSigner(..)")
    }
}

impl CommandSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> CommandResult<Self> {
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.as_ref())
            .map_err(|e| CommandError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    pub fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison against a hex signature.
    pub fn verify(&self, payload: &str, signature: &str) -> CommandResult<()> {
        let expected = hex::decode(signature.trim()).map_err(|_| CommandError::BadSignature)?;
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| CommandError::BadSignature)
    }
}

/// Nonces remembered for replay protection when no timeout bounds them.
pub const DEFAULT_NONCE_CAPACITY: usize = 10_000;

/// Nonces already accepted, oldest first. Entries leave once older than the
/// command timeout, or when the store is full.
#[derive(Debug)]
struct NonceStore {
    seen: HashMap<String, i64>,
    order: VecDeque<String>,
    capacity: usize,
}

impl NonceStore {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn expire_before(&mut self, horizon: i64) {
        while let Some(oldest) = self.order.front() {
            if self.seen.get(oldest).is_some_and(|at| *at >= horizon) {
                break;
            }
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    /// Record `nonce`; false when it was already seen.
    fn insert(&mut self, nonce: String, now: i64) -> bool {
        if self.seen.contains_key(&nonce) {
            return false;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(evicted) => {
                    self.seen.remove(&evicted);
                }
                None => break,
            }
        }
        self.order.push_back(nonce.clone());
        self.seen.insert(nonce, now);
        true
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Authenticates incoming commands before they are applied.
#[derive(Debug)]
pub struct CommandVerifier {
    cipher: Option<CommandCipher>,
    signer: Option<CommandSigner>,
    require_encryption: bool,
    timeout: Duration,
    seen_nonces: Mutex<NonceStore>,
}

impl Default for CommandVerifier {
    fn default() -> Self {
        Self {
            cipher: None,
            signer: None,
            require_encryption: false,
            timeout: Duration::ZERO,
            seen_nonces: Mutex::new(NonceStore::new(DEFAULT_NONCE_CAPACITY)),
        }
    }
}

impl CommandVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nonces kept for replay detection.
    pub fn with_nonce_capacity(mut self, capacity: usize) -> Self {
        self.seen_nonces = Mutex::new(NonceStore::new(capacity));
        self
    }

    pub fn remembered_nonces(&self) -> usize {
        self.seen_nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn with_cipher(mut self, cipher: CommandCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_signer(mut self, signer: CommandSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Reject commands that are not sent as an encrypted `data` parameter.
    pub fn require_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }

    /// Maximum age of a command's `time`; zero disables the check.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse and authenticate a raw query string.
    pub fn verify(&self, kind: CommandKind, query: &str) -> CommandResult<ClusterCommand> {
        self.verify_at(kind, query, chrono::Utc::now().timestamp_millis())
    }

    fn verify_at(&self, kind: CommandKind, query: &str, now: i64) -> CommandResult<ClusterCommand> {
        let mut params = parse_query(query);
        let encrypted = match params.remove("data") {
            Some(data) => {
                let cipher = self.cipher.as_ref().ok_or(CommandError::Decryption)?;
                params = parse_query(&cipher.decrypt(&data)?);
                true
            }
            None if self.require_encryption => return Err(CommandError::EncryptionRequired),
            None => false,
        };

        let signature = params.remove("signature");
        let command = ClusterCommand::from_params(kind, &params)?;

        if let Some(signer) = &self.signer {
            let signature = signature.ok_or(CommandError::SignatureRequired)?;
            signer.verify(&command.signing_payload(), &signature)?;
        }

        if !self.timeout.is_zero() {
            let issued = command.time.ok_or(CommandError::Expired)?;
            if now.saturating_sub(issued) > self.timeout.as_millis() as i64 {
                return Err(CommandError::Expired);
            }
        }

        if encrypted {
            let nonce = command
                .nonce
                .clone()
                .ok_or(CommandError::MissingParameter("nonce"))?;
            self.remember_nonce(nonce, now)?;
        }

        Ok(command)
    }

    fn remember_nonce(&self, nonce: String, now: i64) -> CommandResult<()> {
        let mut seen = self
            .seen_nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.timeout.is_zero() {
            seen.expire_before(now - self.timeout.as_millis() as i64);
        }
        if !seen.insert(nonce, now) {
            return Err(CommandError::ReplayedNonce);
        }
        Ok(())
    }
}
