//! Station-to-station handshake and framed AEAD stream
//!
//! Both sides send an ephemeral X25519 key, derive a shared secret, then
//! prove ownership of their long-term Ed25519 key by signing a challenge
//! bound to both ephemeral keys. Afterwards every frame is a fixed-size
//! XChaCha20-Poly1305 box so message lengths are not observable.

use crate::{NetworkError, NetworkResult, NodeId, NodeKey};
use bytes::{Buf, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

pub const DATA_LEN_SIZE: usize = 4;
pub const DATA_MAX_SIZE: usize = 1024;
pub const TOTAL_FRAME_SIZE: usize = DATA_MAX_SIZE + DATA_LEN_SIZE;
pub const AEAD_TAG_SIZE: usize = 16;
pub const SEALED_FRAME_SIZE: usize = TOTAL_FRAME_SIZE + AEAD_TAG_SIZE;

const NONCE_SIZE: usize = 24;
const EPH_KEY_SIZE: usize = 32;
const AUTH_MSG_SIZE: usize = 32 + 64;

const NONCE_CONTEXT: &str = "chain-network 2024 secret connection nonce";
const CHALLENGE_CONTEXT: &str = "chain-network 2024 secret connection challenge";
const KEY_CONTEXT: &str = "chain-network 2024 secret connection key";

type Nonce = [u8; NONCE_SIZE];

/// Encrypted, authenticated connection to a remote node
pub struct SecretConnection<S> {
    reader: SecretReader<ReadHalf<S>>,
    writer: SecretWriter<WriteHalf<S>>,
    remote_pub_key: VerifyingKey,
}

/// Receiving half of a [`SecretConnection`]
pub struct SecretReader<R> {
    inner: R,
    cipher: XChaCha20Poly1305,
    nonce: Nonce,
    recv_buffer: BytesMut,
}

/// Sending half of a [`SecretConnection`]
pub struct SecretWriter<W> {
    inner: W,
    cipher: XChaCha20Poly1305,
    nonce: Nonce,
}

impl<S> SecretConnection<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Perform the handshake over `stream` as the holder of `local_key`.
    /// Fails with [`NetworkError::AuthenticationFailure`] if the remote does
    /// not prove ownership of the key it presents.
    pub async fn handshake(stream: S, local_key: &NodeKey) -> NetworkResult<Self> {
        Self::handshake_with_signer(stream, &local_key.public_key(), local_key.signing_key()).await
    }

    /// The presented key and the signing key are separate so tests can play
    /// an impostor
    pub(crate) async fn handshake_with_signer(
        stream: S,
        presented_key: &VerifyingKey,
        signer: &SigningKey,
    ) -> NetworkResult<Self> {
        let (mut rd, mut wr) = tokio::io::split(stream);

        let mut eph_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut eph_secret);
        let local_eph = MontgomeryPoint::mul_base_clamped(eph_secret);

        let (_, remote_eph) = tokio::try_join!(
            async {
                wr.write_all(local_eph.as_bytes()).await?;
                wr.flush().await
            },
            async {
                let mut buf = [0u8; EPH_KEY_SIZE];
                rd.read_exact(&mut buf).await.map(|_| buf)
            }
        )?;

        if remote_eph == *local_eph.as_bytes() {
            return Err(NetworkError::Handshake(
                "remote sent our own ephemeral key".to_string(),
            ));
        }

        let shared = MontgomeryPoint(remote_eph).mul_clamped(eph_secret);
        if shared.as_bytes().iter().all(|&b| b == 0) {
            return Err(NetworkError::Handshake(
                "low order ephemeral key".to_string(),
            ));
        }

        let loc_is_least = local_eph.as_bytes() < &remote_eph;
        let (lo, hi) = if loc_is_least {
            (*local_eph.as_bytes(), remote_eph)
        } else {
            (remote_eph, *local_eph.as_bytes())
        };
        let mut transcript = [0u8; 2 * EPH_KEY_SIZE];
        transcript[..EPH_KEY_SIZE].copy_from_slice(&lo);
        transcript[EPH_KEY_SIZE..].copy_from_slice(&hi);

        let (recv_nonce, send_nonce) = gen_nonces(&transcript, loc_is_least);
        let challenge = blake3::derive_key(CHALLENGE_CONTEXT, &transcript);
        let key = blake3::derive_key(KEY_CONTEXT, shared.as_bytes());

        let mut reader = SecretReader {
            inner: rd,
            cipher: XChaCha20Poly1305::new((&key).into()),
            nonce: recv_nonce,
            recv_buffer: BytesMut::new(),
        };
        let mut writer = SecretWriter {
            inner: wr,
            cipher: XChaCha20Poly1305::new((&key).into()),
            nonce: send_nonce,
        };

        let signature = signer.sign(&challenge);
        let mut auth_msg = [0u8; AUTH_MSG_SIZE];
        auth_msg[..32].copy_from_slice(presented_key.as_bytes());
        auth_msg[32..].copy_from_slice(&signature.to_bytes());

        let (_, remote_auth) = tokio::try_join!(writer.write_all(&auth_msg), async {
            let mut buf = [0u8; AUTH_MSG_SIZE];
            reader.read_exact(&mut buf).await.map(|_| buf)
        })?;

        let remote_pub_key = verify_auth(&remote_auth, &challenge)?;
        debug!(
            "Secret connection established with {}",
            NodeId::from_public_key(&remote_pub_key)
        );

        Ok(Self {
            reader,
            writer,
            remote_pub_key,
        })
    }
}

impl<S> SecretConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn remote_pub_key(&self) -> &VerifyingKey {
        &self.remote_pub_key
    }

    pub fn remote_id(&self) -> NodeId {
        NodeId::from_public_key(&self.remote_pub_key)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> NetworkResult<()> {
        self.writer.write_all(data).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> NetworkResult<usize> {
        self.reader.read(buf).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> NetworkResult<()> {
        self.reader.read_exact(buf).await
    }

    /// Split into halves that can be driven from separate tasks
    pub fn into_split(self) -> (SecretReader<ReadHalf<S>>, SecretWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

impl<S> std::fmt::Debug for SecretConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConnection")
            .field("remote_pub_key", &self.remote_pub_key)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> SecretReader<R> {
    /// Read up to `buf.len()` bytes of plaintext. Leftover bytes of a frame
    /// are returned by later reads.
    pub async fn read(&mut self, buf: &mut [u8]) -> NetworkResult<usize> {
        if !self.recv_buffer.is_empty() {
            let n = buf.len().min(self.recv_buffer.len());
            buf[..n].copy_from_slice(&self.recv_buffer[..n]);
            self.recv_buffer.advance(n);
            return Ok(n);
        }

        let mut sealed = [0u8; SEALED_FRAME_SIZE];
        self.inner.read_exact(&mut sealed).await?;

        let frame = self
            .cipher
            .decrypt(XNonce::from_slice(&self.nonce), &sealed[..])
            .map_err(|_| NetworkError::Decryption)?;
        incr2_nonce(&mut self.nonce);

        let mut len_bytes = [0u8; DATA_LEN_SIZE];
        len_bytes.copy_from_slice(&frame[..DATA_LEN_SIZE]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > DATA_MAX_SIZE {
            return Err(NetworkError::Protocol(format!(
                "frame length {} exceeds {}",
                len, DATA_MAX_SIZE
            )));
        }

        let chunk = &frame[DATA_LEN_SIZE..DATA_LEN_SIZE + len];
        let n = buf.len().min(len);
        buf[..n].copy_from_slice(&chunk[..n]);
        self.recv_buffer.extend_from_slice(&chunk[n..]);
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> NetworkResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> SecretWriter<W> {
    /// Seal `data` into as many frames as needed and send them
    pub async fn write_all(&mut self, data: &[u8]) -> NetworkResult<()> {
        for chunk in data.chunks(DATA_MAX_SIZE) {
            let mut frame = [0u8; TOTAL_FRAME_SIZE];
            frame[..DATA_LEN_SIZE].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
            frame[DATA_LEN_SIZE..DATA_LEN_SIZE + chunk.len()].copy_from_slice(chunk);

            let sealed = self
                .cipher
                .encrypt(XNonce::from_slice(&self.nonce), &frame[..])
                .map_err(|_| NetworkError::Protocol("failed to seal frame".to_string()))?;
            incr2_nonce(&mut self.nonce);

            self.inner.write_all(&sealed).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> NetworkResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

fn verify_auth(msg: &[u8; AUTH_MSG_SIZE], challenge: &[u8; 32]) -> NetworkResult<VerifyingKey> {
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&msg[..32]);
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&msg[32..]);

    let remote_pub_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| NetworkError::AuthenticationFailure(format!("invalid public key: {}", e)))?;
    let signature = Signature::from_bytes(&sig_bytes);
    remote_pub_key
        .verify_strict(challenge, &signature)
        .map_err(|_| {
            NetworkError::AuthenticationFailure("challenge verification failed".to_string())
        })?;
    Ok(remote_pub_key)
}

/// The side with the lower ephemeral key receives on the first nonce
fn gen_nonces(transcript: &[u8], loc_is_least: bool) -> (Nonce, Nonce) {
    let digest = blake3::derive_key(NONCE_CONTEXT, transcript);
    let mut nonce1 = [0u8; NONCE_SIZE];
    nonce1.copy_from_slice(&digest[..NONCE_SIZE]);
    let mut nonce2 = nonce1;
    nonce2[NONCE_SIZE - 1] ^= 0x01;

    if loc_is_least {
        (nonce1, nonce2)
    } else {
        (nonce2, nonce1)
    }
}

/// Each side uses every other nonce so the two directions never collide
fn incr2_nonce(nonce: &mut Nonce) {
    incr_nonce(nonce);
    incr_nonce(nonce);
}

fn incr_nonce(nonce: &mut Nonce) {
    for byte in nonce.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn connected_pair(
        a: &NodeKey,
        b: &NodeKey,
    ) -> (SecretConnection<DuplexStream>, SecretConnection<DuplexStream>) {
        let (sa, sb) = duplex(64 * 1024);
        let (ca, cb) = tokio::join!(
            SecretConnection::handshake(sa, a),
            SecretConnection::handshake(sb, b)
        );
        (ca.unwrap(), cb.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_learns_remote_identity() {
        let a = NodeKey::generate();
        let b = NodeKey::generate();
        let (ca, cb) = connected_pair(&a, &b).await;

        assert_eq!(ca.remote_pub_key(), &b.public_key());
        assert_eq!(cb.remote_pub_key(), &a.public_key());
        assert_eq!(ca.remote_id(), b.id());
        assert_eq!(cb.remote_id(), a.id());
    }

    #[tokio::test]
    async fn test_small_and_large_messages() {
        let (mut ca, mut cb) = connected_pair(&NodeKey::generate(), &NodeKey::generate()).await;

        ca.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        cb.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Spans several frames in both directions
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (write, read) = tokio::join!(cb.write_all(&big), async {
            let mut out = vec![0u8; big.len()];
            ca.read_exact(&mut out).await.map(|_| out)
        });
        write.unwrap();
        assert_eq!(read.unwrap(), big);
    }

    #[tokio::test]
    async fn test_partial_reads_use_buffer() {
        let (mut ca, mut cb) = connected_pair(&NodeKey::generate(), &NodeKey::generate()).await;
        ca.write_all(b"abcdefgh").await.unwrap();

        let mut first = [0u8; 3];
        assert_eq!(cb.read(&mut first).await.unwrap(), 3);
        assert_eq!(&first, b"abc");

        let mut rest = [0u8; 16];
        let n = cb.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"defgh");
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (ca, cb) = connected_pair(&NodeKey::generate(), &NodeKey::generate()).await;
        let (mut ra, mut wa) = ca.into_split();
        let (mut rb, mut wb) = cb.into_split();

        let writer = tokio::spawn(async move {
            wa.write_all(b"ping").await.unwrap();
            wa
        });
        let mut buf = [0u8; 4];
        rb.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        writer.await.unwrap();

        wb.write_all(b"pong").await.unwrap();
        ra.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_impostor_is_rejected() {
        let honest = NodeKey::generate();
        let victim = NodeKey::generate();
        let attacker = NodeKey::generate();

        let (sa, sb) = duplex(64 * 1024);
        let victim_pub_key = victim.public_key();
        let (res_honest, res_impostor) = tokio::join!(
            SecretConnection::handshake(sa, &honest),
            // Present the victim's key but sign with our own
            SecretConnection::handshake_with_signer(
                sb,
                &victim_pub_key,
                attacker.signing_key()
            )
        );

        assert!(res_honest.unwrap_err().is_auth_failure());
        // The impostor still sees a valid proof from the honest side
        assert_eq!(res_impostor.unwrap().remote_id(), honest.id());
    }

    #[tokio::test]
    async fn test_tampered_frame_fails_decryption() {
        let (ca, cb) = connected_pair(&NodeKey::generate(), &NodeKey::generate()).await;
        let (_, mut wa) = ca.into_split();
        let (rb, _) = cb.into_split();

        wa.write_all(b"data").await.unwrap();
        let mut tampered = SecretReader {
            inner: rb.inner,
            cipher: rb.cipher,
            // Wrong nonce looks exactly like a modified frame to the cipher
            nonce: [9u8; NONCE_SIZE],
            recv_buffer: BytesMut::new(),
        };
        let mut buf = [0u8; 4];
        assert!(matches!(
            tampered.read(&mut buf).await,
            Err(NetworkError::Decryption)
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_during_handshake() {
        let (sa, sb) = duplex(1024);
        drop(sb);
        assert!(SecretConnection::handshake(sa, &NodeKey::generate())
            .await
            .is_err());
    }

    #[test]
    fn test_nonces() {
        let transcript = [1u8; 64];
        let (recv_lo, send_lo) = gen_nonces(&transcript, true);
        let (recv_hi, send_hi) = gen_nonces(&transcript, false);
        assert_eq!(recv_lo, send_hi);
        assert_eq!(send_lo, recv_hi);
        assert_ne!(recv_lo, send_lo);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[NONCE_SIZE - 1] = 0xff;
        incr2_nonce(&mut nonce);
        assert_eq!(nonce[NONCE_SIZE - 1], 0x01);
        assert_eq!(nonce[NONCE_SIZE - 2], 0x01);
    }
}
