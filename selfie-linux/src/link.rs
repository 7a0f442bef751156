//! Peer link plumbing: fixed-size key hello, then encrypted length-prefixed frames.

use std::io;

use selfie_core::identity::{decrypt_wire, derive_session_key, encrypt_wire};
use selfie_core::wire::{decode_frame, encode_frame, MAX_FRAME_LEN};
use selfie_core::{DeviceId, Keypair, Message, PublicKey, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HELLO_SIZE: usize = 1 + 16 + 32; // version + device_id + public_key
const LEN_SIZE: usize = 4;
const TAG_SIZE: usize = 16;
/// Largest ciphertext a peer may send: a full inner frame, its length prefix and the tag.
const MAX_SEALED_LEN: u32 = MAX_FRAME_LEN + (LEN_SIZE + TAG_SIZE) as u32;

/// What the remote side sent in its hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHello {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
}

fn hello_bytes(keypair: &Keypair) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.device_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn parse_hello(buf: &[u8; HELLO_SIZE]) -> io::Result<RemoteHello> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut device_id = [0u8; 16];
    device_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    Ok(RemoteHello {
        device_id: DeviceId::from_bytes(device_id),
        public_key: PublicKey::from_bytes(public_key),
    })
}

/// Inviter side: send our hello first, then read theirs.
pub async fn hello_connect<S>(stream: &mut S, keypair: &Keypair) -> io::Result<(RemoteHello, [u8; 32])>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&hello_bytes(keypair)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let remote = parse_hello(&buf)?;
    let key = derive_session_key(&keypair.shared_secret(&remote.public_key));
    Ok((remote, key))
}

/// Responder side: read the inviter's hello, then answer with ours.
pub async fn hello_accept<S>(stream: &mut S, keypair: &Keypair) -> io::Result<(RemoteHello, [u8; 32])>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let remote = parse_hello(&buf)?;
    stream.write_all(&hello_bytes(keypair)).await?;
    stream.flush().await?;
    let key = derive_session_key(&keypair.shared_secret(&remote.public_key));
    Ok((remote, key))
}

/// Writing half of a link. Nonce counts frames in this direction.
pub struct SealedWriter<W> {
    inner: W,
    key: [u8; 32],
    nonce: u64,
}

impl<W: AsyncWrite + Unpin> SealedWriter<W> {
    pub fn new(inner: W, key: [u8; 32]) -> Self {
        Self { inner, key, nonce: 0 }
    }

    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        let plain = encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let cipher = encrypt_wire(&self.key, self.nonce, &plain)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.nonce = self.nonce.saturating_add(1);
        let len = cipher.len() as u32;
        self.inner.write_all(&len.to_le_bytes()).await?;
        self.inner.write_all(&cipher).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Reading half of a link.
pub struct SealedReader<R> {
    inner: R,
    key: [u8; 32],
    nonce: u64,
}

impl<R: AsyncRead + Unpin> SealedReader<R> {
    pub fn new(inner: R, key: [u8; 32]) -> Self {
        Self { inner, key, nonce: 0 }
    }

    /// Next message, or `None` on a clean close between frames.
    pub async fn recv(&mut self) -> io::Result<Option<Message>> {
        let mut len_buf = [0u8; LEN_SIZE];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_SEALED_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        let mut cipher = vec![0u8; len as usize];
        self.inner.read_exact(&mut cipher).await?;
        let plain = decrypt_wire(&self.key, self.nonce, &cipher)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.nonce = self.nonce.saturating_add(1);
        let (msg, _) =
            decode_frame(&plain).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(msg))
    }
}
