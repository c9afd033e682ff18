//! Pairing handshake (component E): password-authenticated ephemeral-key
//! exchange that turns a short shared invite token into a mutually
//! authenticated stream.
//!
//! Grounded on the same telescoping X25519 + HKDF-SHA256 structure this
//! codebase already uses to derive per-hop symmetric keys, adapted to a
//! single-shot two-message exchange whose HKDF salt is the invite token
//! rather than a circuit id, and whose output key authenticates an AEAD
//! frame instead of forwarding onion layers.

use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::allowlist::{AllowListStore, Role};
use crate::error::{OverlayError, Result};
use crate::gater::ConnectionGater;
use crate::identity::PeerId;
use crate::invite::InviteToken;

const JOINER_HELLO_TAG: u8 = 0x01;
const HKDF_INFO: &[u8] = b"overlay-pairing-v1";
const NONCE_JOINER_FRAME: &[u8; 12] = b"joiner-frm01";
const NONCE_INVITER_FRAME: &[u8; 12] = b"inviter-frm1";
const MAX_FRAME_LEN: u16 = 4096;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};

/// Derive the pairing AEAD key shared by both sides, with the invite token
/// as the HKDF salt so that two sessions started from different invites
/// never derive the same key even if (improbably) the same ephemeral keys
/// were reused.
fn derive_key(shared_secret: &x25519_dalek::SharedSecret, token: &InviteToken) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(token), shared_secret.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| OverlayError::internal("invalid AEAD key length"))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| OverlayError::internal("AEAD seal failed"))
}

/// Opens an AEAD frame. On failure this collapses every possible cause
/// (wrong token, bit flip, truncated frame) into a single pairing error so
/// a wrong-token attacker cannot distinguish it from a transport fault.
fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| OverlayError::pairing_invalid_code())?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OverlayError::pairing_invalid_code())
}

async fn write_frame<S: AsyncWriteExt + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    let len: u16 = bytes
        .len()
        .try_into()
        .map_err(|_| OverlayError::protocol("pairing frame too large"))?;
    if len > MAX_FRAME_LEN {
        return Err(OverlayError::protocol("pairing frame exceeds limit"));
    }
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| OverlayError::network_transient(e.to_string()))?;
    stream
        .write_all(bytes)
        .await
        .map_err(|e| OverlayError::network_transient(e.to_string()))?;
    Ok(())
}

async fn read_frame<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| OverlayError::network_transient(e.to_string()))?;
    let len = u16::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(OverlayError::protocol("pairing frame exceeds limit"));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| OverlayError::network_transient(e.to_string()))?;
    Ok(buf)
}

/// Outcome of a successful inviter-side handshake.
pub struct PairingOutcome {
    pub joiner_name: String,
}

/// Joiner side: presents the invite token, proves knowledge of it by
/// encrypting its display name, and returns the inviter's welcome message.
///
/// `stream` is assumed to already be a mutually authenticated overlay
/// stream to the inviter; this function only speaks the pairing-specific
/// framing on top of it.
pub async fn joiner_handshake<S>(
    stream: &mut S,
    token: InviteToken,
    joiner_name: &str,
) -> Result<String>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let joiner_secret = EphemeralSecret::random_from_rng(OsRng);
    let joiner_public = PublicKey::from(&joiner_secret);

    let mut hello = Vec::with_capacity(33);
    hello.push(JOINER_HELLO_TAG);
    hello.extend_from_slice(joiner_public.as_bytes());
    write_frame(stream, &hello).await?;

    let inviter_pub_bytes = read_frame(stream).await?;
    let inviter_pub_bytes: [u8; 32] = inviter_pub_bytes
        .as_slice()
        .try_into()
        .map_err(|_| OverlayError::protocol("malformed inviter public key"))?;
    let inviter_public = PublicKey::from(inviter_pub_bytes);

    let shared = joiner_secret.diffie_hellman(&inviter_public);
    let mut key = derive_key(&shared, &token);

    let sealed_name = seal(&key, NONCE_JOINER_FRAME, joiner_name.as_bytes())?;
    write_frame(stream, &sealed_name).await?;

    let sealed_reply = read_frame(stream).await?;
    let reply = open(&key, NONCE_INVITER_FRAME, &sealed_reply)?;
    key.zeroize();

    String::from_utf8(reply).map_err(|_| OverlayError::protocol("malformed inviter reply"))
}

/// Inviter side: validates the joiner's proof of the token, appends the
/// joiner's peer identity to the allow-list, reloads the gater, and then --
/// only after both of those have happened -- replies with the welcome
/// message. `remote_id` is the peer identity the transport layer already
/// authenticated for this stream.
pub async fn inviter_handshake<S>(
    stream: &mut S,
    token: InviteToken,
    remote_id: PeerId,
    allow_list: &AllowListStore,
    gater: &ConnectionGater,
    inviter_name: &str,
) -> Result<PairingOutcome>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let hello = read_frame(stream).await?;
    if hello.first().copied() != Some(JOINER_HELLO_TAG) {
        return Err(OverlayError::pairing_invalid_code());
    }
    let joiner_pub_bytes: [u8; 32] = hello
        .get(1..33)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(OverlayError::pairing_invalid_code)?;
    let joiner_public = PublicKey::from(joiner_pub_bytes);

    let inviter_secret = EphemeralSecret::random_from_rng(OsRng);
    let inviter_public = PublicKey::from(&inviter_secret);
    write_frame(stream, inviter_public.as_bytes()).await?;

    let shared = inviter_secret.diffie_hellman(&joiner_public);
    let mut key = derive_key(&shared, &token);

    let sealed_name = read_frame(stream).await?;
    let joiner_name_bytes = open(&key, NONCE_JOINER_FRAME, &sealed_name)?;
    let joiner_name = String::from_utf8(joiner_name_bytes)
        .map_err(|_| OverlayError::pairing_invalid_code())?;

    // Ordering contract: the allow-list append and gater reload MUST both
    // complete before the AEAD reply is sent.
    allow_list.add_peer(remote_id, Some(joiner_name.clone()), Role::Member, None)?;
    gater.reload_from_file(allow_list)?;

    let reply = format!("OK {inviter_name}");
    let sealed_reply = seal(&key, NONCE_INVITER_FRAME, reply.as_bytes())?;
    write_frame(stream, &sealed_reply).await?;
    key.zeroize();

    Ok(PairingOutcome { joiner_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn peer(seed: u8) -> PeerId {
        PeerId(hex::encode([seed; 32]))
    }

    #[tokio::test]
    async fn pairing_happy_path_adds_the_joiner_and_replies_ok() {
        let dir = tempdir().unwrap();
        let allow_list = AllowListStore::new(dir.path().join("authorized_keys"));
        let gater = ConnectionGater::empty();
        let token: InviteToken = [9; 8];

        let (mut joiner_stream, mut inviter_stream) = tokio::io::duplex(4096);

        let inviter_task = tokio::spawn(async move {
            inviter_handshake(
                &mut inviter_stream,
                token,
                peer(7),
                &allow_list,
                &gater,
                "desktop",
            )
            .await
            .map(|outcome| (outcome, allow_list, gater))
        });

        let reply = joiner_handshake(&mut joiner_stream, token, "laptop")
            .await
            .unwrap();
        assert_eq!(reply, "OK desktop");

        let (outcome, allow_list, gater) = inviter_task.await.unwrap().unwrap();
        assert_eq!(outcome.joiner_name, "laptop");
        assert!(gater.should_accept(&peer(7)));
        let entries = allow_list.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].comment.as_deref(), Some("laptop"));
    }

    #[tokio::test]
    async fn wrong_token_surfaces_as_invalid_invite_code_and_changes_nothing() {
        let dir = tempdir().unwrap();
        let allow_list = AllowListStore::new(dir.path().join("authorized_keys"));
        let gater = ConnectionGater::empty();

        let (mut joiner_stream, mut inviter_stream) = tokio::io::duplex(4096);
        let inviter_token: InviteToken = [1; 8];
        let joiner_token: InviteToken = [2; 8];

        let inviter_task = tokio::spawn(async move {
            let result = inviter_handshake(
                &mut inviter_stream,
                inviter_token,
                peer(7),
                &allow_list,
                &gater,
                "desktop",
            )
            .await;
            (result, allow_list, gater)
        });

        let joiner_result = joiner_handshake(&mut joiner_stream, joiner_token, "laptop").await;
        assert!(joiner_result.is_err());

        let (inviter_result, allow_list, gater) = inviter_task.await.unwrap();
        let err = inviter_result.unwrap_err();
        assert_eq!(err.message, "invalid invite code");
        assert_eq!(err.kind, crate::error::ErrorKind::Pairing);
        assert!(allow_list.load().unwrap().is_empty());
        assert!(!gater.should_accept(&peer(7)));
    }
}
