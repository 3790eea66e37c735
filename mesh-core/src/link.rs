//! Link encryption. Every link runs its own key schedule: the X25519 secret
//! between the two devices, mixed with a fresh salt from each end, gives one
//! ChaCha20-Poly1305 key per direction. Nonces count up from zero per key, so a
//! (key, nonce) pair is never reused even when the same two devices reconnect.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::wire::{LEN_SIZE, MAX_FRAME_LEN};

pub const SALT_LEN: usize = 32;
/// Poly1305 tag appended to every sealed frame.
pub const TAG_LEN: usize = 16;
/// Largest sealed body: one full protocol frame plus the tag.
pub const MAX_SEALED_LEN: u32 = MAX_FRAME_LEN + (LEN_SIZE + TAG_LEN) as u32;

const SCHEDULE_LABEL: &[u8] = b"meshchat-link-v2";

pub type LinkSalt = [u8; SALT_LEN];

/// Random per-link salt, sent in the handshake.
pub fn fresh_salt() -> LinkSalt {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    Dialer,
    Acceptor,
}

/// The two salts of one handshake.
#[derive(Debug, Clone, Copy)]
pub struct LinkSalts {
    pub dialer: LinkSalt,
    pub acceptor: LinkSalt,
}

struct Direction {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl Direction {
    fn new(key: [u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
            counter: 0,
        }
    }

    fn nonce(&self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.counter.to_le_bytes());
        Nonce::clone_from_slice(&bytes)
    }

    fn advance(&mut self) -> Result<(), LinkCryptoError> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(LinkCryptoError::Exhausted)?;
        Ok(())
    }
}

/// Outbound half: seals frames in order.
pub struct LinkSealer(Direction);

impl LinkSealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
        let sealed = self
            .0
            .aead
            .encrypt(&self.0.nonce(), plaintext)
            .map_err(|_| LinkCryptoError::Seal)?;
        self.0.advance()?;
        Ok(sealed)
    }
}

/// Inbound half: frames must be opened in the order they were sealed.
pub struct LinkOpener(Direction);

impl LinkOpener {
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
        let plain = self
            .0
            .aead
            .decrypt(&self.0.nonce(), sealed)
            .map_err(|_| LinkCryptoError::Open)?;
        self.0.advance()?;
        Ok(plain)
    }
}

/// Sealing and opening state for one end of one link.
pub struct LinkCipher {
    sealer: LinkSealer,
    opener: LinkOpener,
}

impl LinkCipher {
    pub fn new(shared_secret: &[u8; 32], salts: &LinkSalts, side: LinkSide) -> Self {
        let to_acceptor = direction_key(shared_secret, salts, b"dialer->acceptor");
        let to_dialer = direction_key(shared_secret, salts, b"acceptor->dialer");
        let (outbound, inbound) = match side {
            LinkSide::Dialer => (to_acceptor, to_dialer),
            LinkSide::Acceptor => (to_dialer, to_acceptor),
        };
        Self {
            sealer: LinkSealer(Direction::new(outbound)),
            opener: LinkOpener(Direction::new(inbound)),
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
        self.sealer.seal(plaintext)
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
        self.opener.open(sealed)
    }

    /// Separate halves for a writer task and a reader task.
    pub fn split(self) -> (LinkSealer, LinkOpener) {
        (self.sealer, self.opener)
    }
}

fn direction_key(shared_secret: &[u8; 32], salts: &LinkSalts, direction: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SCHEDULE_LABEL);
    hasher.update(direction);
    hasher.update(shared_secret);
    hasher.update(salts.dialer);
    hasher.update(salts.acceptor);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum LinkCryptoError {
    #[error("sealing failed")]
    Seal,
    #[error("frame failed authentication")]
    Open,
    #[error("nonce counter exhausted")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn ends(a: &Keypair, b: &Keypair, salts: &LinkSalts) -> (LinkCipher, LinkCipher) {
        (
            LinkCipher::new(&a.shared_secret(b.public_key()), salts, LinkSide::Dialer),
            LinkCipher::new(&b.shared_secret(a.public_key()), salts, LinkSide::Acceptor),
        )
    }

    fn salts() -> LinkSalts {
        LinkSalts {
            dialer: fresh_salt(),
            acceptor: fresh_salt(),
        }
    }

    #[test]
    fn both_directions_open() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut dialer, mut acceptor) = ends(&a, &b, &salts());
        for word in ["one", "two", "three"] {
            let sealed = dialer.seal(word.as_bytes()).unwrap();
            assert_eq!(acceptor.open(&sealed).unwrap(), word.as_bytes());
        }
        let back = acceptor.seal(b"reply").unwrap();
        assert_eq!(dialer.open(&back).unwrap(), b"reply");
    }

    #[test]
    fn reconnect_uses_fresh_keys() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut first, _) = ends(&a, &b, &salts());
        let (mut second, mut second_peer) = ends(&a, &b, &salts());
        let old = first.seal(b"same words").unwrap();
        let new = second.seal(b"same words").unwrap();
        assert_ne!(old, new);
        // A frame from the earlier link does not open on the new one.
        assert!(second_peer.open(&old).is_err());
        assert_eq!(second_peer.open(&new).unwrap(), b"same words");
    }

    #[test]
    fn directions_use_different_keys() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut dialer, mut acceptor) = ends(&a, &b, &salts());
        let sealed = dialer.seal(b"mine").unwrap();
        // Reflecting a frame back at its sender fails.
        assert!(dialer.open(&sealed).is_err());
        assert!(acceptor.open(&sealed).is_ok());
    }

    #[test]
    fn replayed_or_reordered_frames_fail() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut dialer, mut acceptor) = ends(&a, &b, &salts());
        let first = dialer.seal(b"first").unwrap();
        let second = dialer.seal(b"second").unwrap();
        assert!(acceptor.open(&second).is_err());
        assert!(acceptor.open(&first).is_ok());
        assert!(acceptor.open(&first).is_err());
        assert!(acceptor.open(&second).is_ok());
    }

    #[test]
    fn sealed_size_bound_fits_a_full_frame() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut dialer, _) = ends(&a, &b, &salts());
        let body = vec![0u8; MAX_FRAME_LEN as usize + LEN_SIZE];
        assert_eq!(dialer.seal(&body).unwrap().len() as u32, MAX_SEALED_LEN);
    }
}
