//! Invite codec (component D): encodes and decodes the compact
//! self-describing pairing payload exchanged out-of-band (QR code, copy-paste
//! link -- the rendering itself is an external collaborator).
//!
//! Wire format (before base32): `0x01 || token[8] || len(inviter_id) ||
//! inviter_id || len(rendezvous_address) || rendezvous_address ||
//! [len(network_tag) || network_tag]`. Every variable-length field is
//! prefixed with a single length byte (max 255); the token is fixed-width
//! and carries no prefix. The trailing network tag is present only if bytes
//! remain after the rendezvous address.

use crate::error::{OverlayError, Result};

const VERSION: u8 = 0x01;
const TOKEN_LEN: usize = 8;

pub type InviteToken = [u8; TOKEN_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitePayload {
    pub token: InviteToken,
    pub inviter_peer_id: String,
    pub rendezvous_address: String,
    pub network_tag: Option<String>,
}

impl InvitePayload {
    pub fn encode(&self) -> Result<String> {
        let mut buf = Vec::new();
        buf.push(VERSION);
        buf.extend_from_slice(&self.token);
        push_field(&mut buf, self.inviter_peer_id.as_bytes())?;
        push_field(&mut buf, self.rendezvous_address.as_bytes())?;
        if let Some(tag) = &self.network_tag {
            push_field(&mut buf, tag.as_bytes())?;
        }
        Ok(base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &buf))
    }

    /// Strictly decode a base32 invite code: any non-alphabet byte, a
    /// version mismatch, a malformed field length, or trailing bytes after
    /// the last recognized field are all hard rejects. This matters because
    /// a shell or CLI tokenizer can concatenate flags into a following
    /// positional argument, and a silent accept here would poison the
    /// handshake that follows.
    pub fn decode(code: &str) -> Result<Self> {
        let buf = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, code)
            .ok_or_else(|| OverlayError::protocol("invite code is not valid base32"))?;

        let mut cursor = Cursor::new(&buf);
        let version = cursor.take_u8()?;
        if version != VERSION {
            return Err(OverlayError::protocol(format!(
                "unsupported invite version {version}"
            )));
        }
        let token: InviteToken = cursor
            .take(TOKEN_LEN)?
            .try_into()
            .map_err(|_| OverlayError::protocol("truncated invite token"))?;
        let inviter_peer_id = cursor.take_field_string()?;
        let rendezvous_address = cursor.take_field_string()?;
        let network_tag = if cursor.remaining() > 0 {
            Some(cursor.take_field_string()?)
        } else {
            None
        };

        if cursor.remaining() != 0 {
            return Err(OverlayError::protocol(
                "invite code has trailing bytes after its last field",
            ));
        }

        Ok(Self {
            token,
            inviter_peer_id,
            rendezvous_address,
            network_tag,
        })
    }
}

fn push_field(buf: &mut Vec<u8>, field: &[u8]) -> Result<()> {
    let len: u8 = field
        .len()
        .try_into()
        .map_err(|_| OverlayError::protocol("invite field exceeds 255 bytes"))?;
    buf.push(len);
    buf.extend_from_slice(field);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(OverlayError::protocol("truncated invite payload"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_field_string(&mut self) -> Result<String> {
        let len = self.take_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| OverlayError::protocol("invite field is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InvitePayload {
        InvitePayload {
            token: [1, 2, 3, 4, 5, 6, 7, 8],
            inviter_peer_id: "a".repeat(64),
            rendezvous_address: "/ip4/203.0.113.4/tcp/4242".to_string(),
            network_tag: Some("homelab".to_string()),
        }
    }

    #[test]
    fn round_trips_a_well_formed_payload() {
        let payload = sample();
        let code = payload.encode().unwrap();
        assert_eq!(InvitePayload::decode(&code).unwrap(), payload);
    }

    #[test]
    fn round_trips_without_a_network_tag() {
        let mut payload = sample();
        payload.network_tag = None;
        let code = payload.encode().unwrap();
        assert_eq!(InvitePayload::decode(&code).unwrap(), payload);
    }

    #[test]
    fn trailing_bytes_are_a_hard_reject() {
        let code = sample().encode().unwrap();
        let poisoned = format!("{code}AAAA");
        assert!(InvitePayload::decode(&poisoned).is_err());
    }

    #[test]
    fn non_alphabet_bytes_are_rejected() {
        assert!(InvitePayload::decode("not valid base32!!").is_err());
    }

    #[test]
    fn wrong_version_byte_is_rejected() {
        // Hand-encode with a bad version byte.
        let mut buf = vec![0x02u8];
        buf.extend_from_slice(&[0u8; TOKEN_LEN]);
        buf.push(0); // empty inviter id
        buf.push(0); // empty rendezvous address
        let code = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &buf);
        assert!(InvitePayload::decode(&code).is_err());
    }
}
