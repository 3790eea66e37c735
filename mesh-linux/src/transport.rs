//! Peer links: TCP listener for incoming links, dialer for the ones the core asks
//! for. Each link opens with a salted key handshake, then carries sealed frames.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use mesh_core::link::{fresh_salt, LinkSalt, MAX_SEALED_LEN, SALT_LEN};
use mesh_core::wire::{self, LEN_SIZE};
use mesh_core::{
    Keypair, LinkCipher, LinkOpener, LinkSalts, LinkSealer, LinkSide, PeerId, PublicKey,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::node::{Dial, LinkCommand, LinkId, Node};

const HANDSHAKE_SIZE: usize = 1 + 16 + 32 + SALT_LEN; // version + peer_id + public_key + salt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a link keeps reading after our side stopped writing.
const LINGER: Duration = Duration::from_secs(10);

/// The other end's half of the handshake.
struct Hello {
    peer_id: PeerId,
    public_key: PublicKey,
    salt: LinkSalt,
}

pub async fn run_transport(
    node: Node,
    port: u16,
    mut dials: mpsc::UnboundedReceiver<Dial>,
) -> io::Result<()> {
    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
        Ok(l) => l,
        Err(e) => {
            let reason = format!("link listener on port {port}: {e}");
            node.with_core(|c| c.on_advertising_failed(reason)).await;
            return Err(e);
        }
    };
    tracing::info!(port, "link listener running");

    let accept_node = node.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    let node = accept_node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_link(stream, node).await {
                            tracing::debug!(%from, error = %e, "inbound handshake failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    });

    while let Some(dial) = dials.recv().await {
        let node = node.clone();
        tokio::spawn(dial_link(node, dial));
    }
    Ok(())
}

async fn accept_link(mut stream: TcpStream, node: Node) -> io::Result<()> {
    let (peer, cipher) = acceptor_handshake(&mut stream, node.keypair()).await?;
    let (link, rx) = node.register_link(peer.peer_id).await;
    tracing::debug!(peer = %peer.peer_id, link, "inbound link up");
    run_link(stream, node, peer.peer_id, link, rx, cipher).await;
    Ok(())
}

async fn dial_link(node: Node, dial: Dial) {
    let Dial {
        peer_id,
        addr,
        link,
        rx,
    } = dial;
    match connect(&node, peer_id, addr).await {
        Ok((stream, cipher)) => {
            tracing::debug!(peer = %peer_id, %addr, link, "outbound link up");
            run_link(stream, node, peer_id, link, rx, cipher).await;
        }
        Err(e) => {
            tracing::warn!(peer = %peer_id, %addr, error = %e, "cannot reach peer");
            node.link_closed(peer_id, link).await;
        }
    }
}

async fn connect(
    node: &Node,
    expected: PeerId,
    addr: SocketAddr,
) -> io::Result<(TcpStream, LinkCipher)> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let (peer, cipher) = dialer_handshake(&mut stream, node.keypair()).await?;
    if peer.peer_id != expected {
        return Err(invalid("peer answered with a different identity"));
    }
    if let Some(advertised) = node.directory().public_key(&peer.peer_id).await {
        if advertised != peer.public_key {
            return Err(invalid("peer key differs from its beacon"));
        }
    }
    Ok((stream, cipher))
}

/// Send our hello first, then read theirs.
async fn dialer_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keypair: &Keypair,
) -> io::Result<(Hello, LinkCipher)> {
    let salt = fresh_salt();
    write_hello(stream, keypair, &salt).await?;
    let peer = read_hello(stream).await?;
    let salts = LinkSalts {
        dialer: salt,
        acceptor: peer.salt,
    };
    let secret = keypair.shared_secret(&peer.public_key);
    Ok((peer, LinkCipher::new(&secret, &salts, LinkSide::Dialer)))
}

/// Read the dialer's hello, then answer with ours.
async fn acceptor_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keypair: &Keypair,
) -> io::Result<(Hello, LinkCipher)> {
    let peer = read_hello(stream).await?;
    let salt = fresh_salt();
    write_hello(stream, keypair, &salt).await?;
    let salts = LinkSalts {
        dialer: peer.salt,
        acceptor: salt,
    };
    let secret = keypair.shared_secret(&peer.public_key);
    Ok((peer, LinkCipher::new(&secret, &salts, LinkSide::Acceptor)))
}

fn hello_bytes(keypair: &Keypair, salt: &LinkSalt) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.peer_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out[49..].copy_from_slice(salt);
    out
}

async fn write_hello<W: AsyncWrite + Unpin>(
    w: &mut W,
    keypair: &Keypair,
    salt: &LinkSalt,
) -> io::Result<()> {
    w.write_all(&hello_bytes(keypair, salt)).await?;
    w.flush().await
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Hello> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    r.read_exact(&mut buf).await?;
    parse_hello(&buf)
}

/// Check the version and that the claimed id is the one the key derives.
fn parse_hello(buf: &[u8; HANDSHAKE_SIZE]) -> io::Result<Hello> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(invalid("unsupported protocol version"));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[1..17]);
    let mut public = [0u8; 32];
    public.copy_from_slice(&buf[17..49]);
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&buf[49..]);
    let peer_id = PeerId::from_bytes(id);
    if PeerId::from_public_key(&public) != peer_id {
        return Err(invalid("peer id does not match key"));
    }
    Ok(Hello {
        peer_id,
        public_key: PublicKey::from_bytes(public),
        salt,
    })
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn bad_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Pump one link, then tell the node. When our side stops writing (a `Close`, or
/// the node replaced this link) the read half stays open for a while so frames
/// the peer already sent on it still arrive.
async fn run_link(
    stream: TcpStream,
    node: Node,
    peer_id: PeerId,
    link: LinkId,
    rx: mpsc::UnboundedReceiver<LinkCommand>,
    cipher: LinkCipher,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (sealer, opener) = cipher.split();
    let read = read_loop(&mut reader, &node, peer_id, opener);
    tokio::pin!(read);
    let outcome = tokio::select! {
        r = &mut read => r,
        w = write_loop(&mut writer, rx, sealer) => {
            if let Err(e) = w {
                tracing::debug!(peer = %peer_id, link, error = %e, "link write ended");
            }
            match tokio::time::timeout(LINGER, &mut read).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "peer kept the link open")),
            }
        }
    };
    if let Err(e) = outcome {
        tracing::debug!(peer = %peer_id, link, error = %e, "link read ended");
    }
    node.link_closed(peer_id, link).await;
}

async fn write_loop<W: AsyncWrite + Unpin>(
    w: &mut W,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
    mut sealer: LinkSealer,
) -> io::Result<()> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LinkCommand::Frame(plain) => write_sealed(w, &mut sealer, &plain).await?,
            LinkCommand::Close => break,
        }
    }
    w.shutdown().await
}

async fn read_loop<R: AsyncRead + Unpin>(
    r: &mut R,
    node: &Node,
    peer_id: PeerId,
    mut opener: LinkOpener,
) -> io::Result<()> {
    loop {
        let plain = read_sealed(r, &mut opener).await?;
        node.on_frame(peer_id, &plain).await;
    }
}

async fn write_sealed<W: AsyncWrite + Unpin>(
    w: &mut W,
    sealer: &mut LinkSealer,
    plain: &[u8],
) -> io::Result<()> {
    let sealed = sealer.seal(plain).map_err(bad_data)?;
    let framed = wire::prefixed(&sealed, MAX_SEALED_LEN).map_err(bad_data)?;
    w.write_all(&framed).await?;
    w.flush().await
}

async fn read_sealed<R: AsyncRead + Unpin>(
    r: &mut R,
    opener: &mut LinkOpener,
) -> io::Result<Vec<u8>> {
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let len = wire::body_len(header, MAX_SEALED_LEN).map_err(bad_data)?;
    let mut sealed = vec![0u8; len];
    r.read_exact(&mut sealed).await?;
    opener.open(&sealed).map_err(bad_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake(a: &Keypair, b: &Keypair) -> (LinkCipher, LinkCipher) {
        let (mut dial_end, mut accept_end) = tokio::io::duplex(1024);
        let (dialer, acceptor) = tokio::join!(
            dialer_handshake(&mut dial_end, a),
            acceptor_handshake(&mut accept_end, b)
        );
        let (seen_by_dialer, dialer) = dialer.unwrap();
        let (seen_by_acceptor, acceptor) = acceptor.unwrap();
        assert_eq!(seen_by_dialer.peer_id, b.peer_id());
        assert_eq!(seen_by_acceptor.peer_id, a.peer_id());
        (dialer, acceptor)
    }

    #[test]
    fn hello_parses_own_bytes() {
        let kp = Keypair::generate();
        let salt = fresh_salt();
        let hello = parse_hello(&hello_bytes(&kp, &salt)).unwrap();
        assert_eq!(hello.peer_id, kp.peer_id());
        assert_eq!(&hello.public_key, kp.public_key());
        assert_eq!(hello.salt, salt);
    }

    #[test]
    fn hello_rejects_forged_id() {
        let kp = Keypair::generate();
        let mut bytes = hello_bytes(&kp, &fresh_salt());
        bytes[1..17].copy_from_slice(Keypair::generate().peer_id().as_bytes());
        assert!(parse_hello(&bytes).is_err());
    }

    #[test]
    fn hello_rejects_other_version() {
        let mut bytes = hello_bytes(&Keypair::generate(), &fresh_salt());
        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        assert!(parse_hello(&bytes).is_err());
    }

    #[tokio::test]
    async fn handshake_gives_matching_ends() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut dialer, mut acceptor) = handshake(&a, &b).await;
        let sealed = dialer.seal(b"hello").unwrap();
        assert_eq!(acceptor.open(&sealed).unwrap(), b"hello");
        let sealed = acceptor.seal(b"hi back").unwrap();
        assert_eq!(dialer.open(&sealed).unwrap(), b"hi back");
    }

    #[tokio::test]
    async fn each_handshake_between_the_same_devices_gets_new_keys() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (mut first, _) = handshake(&a, &b).await;
        let (mut second, mut second_acceptor) = handshake(&a, &b).await;
        let old = first.seal(b"same words").unwrap();
        let new = second.seal(b"same words").unwrap();
        assert_ne!(old, new);
        // A frame recorded on the first link is rejected on the second.
        assert!(second_acceptor.open(&old).is_err());
        assert_eq!(second_acceptor.open(&new).unwrap(), b"same words");
    }

    #[tokio::test]
    async fn sealed_frames_cross_a_pipe() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (dialer, acceptor) = handshake(&a, &b).await;
        let (mut sealer, _) = dialer.split();
        let (_, mut opener) = acceptor.split();
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        write_sealed(&mut tx, &mut sealer, b"one").await.unwrap();
        write_sealed(&mut tx, &mut sealer, b"two").await.unwrap();
        assert_eq!(read_sealed(&mut rx, &mut opener).await.unwrap(), b"one");
        assert_eq!(read_sealed(&mut rx, &mut opener).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn oversized_sealed_header_is_refused() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (_, acceptor) = handshake(&a, &b).await;
        let (_, mut opener) = acceptor.split();
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&(MAX_SEALED_LEN + 1).to_le_bytes()).await.unwrap();
        let err = read_sealed(&mut rx, &mut opener).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn close_flushes_then_shuts() {
        let (a, b) = (Keypair::generate(), Keypair::generate());
        let (dialer, acceptor) = handshake(&a, &b).await;
        let (sealer, _) = dialer.split();
        let (_, mut opener) = acceptor.split();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        cmd_tx.send(LinkCommand::Frame(b"bye".to_vec())).unwrap();
        cmd_tx.send(LinkCommand::Close).unwrap();
        write_loop(&mut tx, cmd_rx, sealer).await.unwrap();
        assert_eq!(read_sealed(&mut rx, &mut opener).await.unwrap(), b"bye");
        assert!(read_sealed(&mut rx, &mut opener).await.is_err());
    }
}
