//! Local identity: keypair, peer ID, and persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::peer::PeerIdentity;

/// Key the identity blob is stored under.
pub const IDENTITY_KEY: &str = "PeerID";

const IDENTITY_RECORD_VERSION: u8 = 1;

/// Device public key (32 bytes, X25519). Sent in beacons and the link handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: first 16 bytes of SHA-256 over the public key. Stable as long as the key is.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// X25519 keypair. Only the public key and peer ID leave this type.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 shared secret with another device. Input to the link key schedule.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// This device on the proximity network. Immutable once created.
#[derive(Clone)]
pub struct LocalIdentity {
    keypair: Keypair,
    display_name: String,
}

impl LocalIdentity {
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            keypair: Keypair::generate(),
            display_name: display_name.into(),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// How remote peers see us.
    pub fn peer(&self) -> PeerIdentity {
        PeerIdentity::new(self.peer_id(), self.display_name.clone())
    }

    fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            version: IDENTITY_RECORD_VERSION,
            display_name: self.display_name.clone(),
            secret: self.keypair.secret_bytes(),
        }
    }

    fn from_record(record: IdentityRecord) -> Result<Self, IdentityError> {
        if record.version != IDENTITY_RECORD_VERSION {
            return Err(IdentityError::UnsupportedVersion(record.version));
        }
        Ok(Self {
            keypair: Keypair::from_secret_bytes(record.secret),
            display_name: record.display_name,
        })
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("peer_id", &self.peer_id())
            .field("display_name", &self.display_name)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    version: u8,
    display_name: String,
    secret: [u8; 32],
}

/// Key/value blob storage for the identity. Hosts back it with a file, tests with memory.
pub trait IdentityStore {
    fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, bytes: &[u8]) -> std::io::Result<()>;
}

/// In-process store. Survives as long as the value does.
#[derive(Default)]
pub struct MemoryIdentityStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "store poisoned"))?;
        Ok(blobs.get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> std::io::Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "store poisoned"))?;
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Load the persisted identity, or create one named `device_name` and persist it.
///
/// Re-creating the identity on every launch makes one device show up as several
/// peers in other devices' discovery lists, so the stored blob always wins.
pub fn load_or_create_identity<S: IdentityStore + ?Sized>(
    store: &S,
    device_name: &str,
) -> Result<LocalIdentity, IdentityError> {
    if let Some(bytes) = store.load(IDENTITY_KEY)? {
        let record: IdentityRecord = bincode::deserialize(&bytes)?;
        let identity = LocalIdentity::from_record(record)?;
        tracing::debug!(peer = %identity.peer_id(), "loaded stored identity");
        return Ok(identity);
    }
    let identity = LocalIdentity::generate(device_name);
    let bytes = bincode::serialize(&identity.to_record())?;
    store.save(IDENTITY_KEY, &bytes)?;
    tracing::info!(peer = %identity.peer_id(), name = device_name, "created new identity");
    Ok(identity)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity store: {0}")]
    Store(#[from] std::io::Error),
    #[error("corrupt identity record: {0}")]
    Corrupt(#[from] bincode::Error),
    #[error("unsupported identity record version {0}")]
    UnsupportedVersion(u8),
}
