//! The 64-byte obfuscation header.
//!
//! Layout of the header as sent by the client:
//!
//! ```text
//!  0        8                        40              56     60     64
//!  | random | key (32)               | iv (16)       | tag  | rand |
//! ```
//!
//! Bytes `56..64` travel encrypted. The client → server cipher is keyed
//! straight from `8..56`; the server → client cipher from the same 48
//! bytes reversed as a whole. A 16-byte secret, when configured, is mixed
//! in as `key = sha256(key ‖ secret)` for both directions.

use pylon_crypto::aes::AesCtr;
use pylon_crypto::random_array;

use super::{Error, Framing};

pub const HEADER_LEN: usize = 64;

const TAG_ABRIDGED: u32 = 0xefef_efef;
const TAG_INTERMEDIATE: u32 = 0xeeee_eeee;
const TAG_PADDED: u32 = 0xdddd_dddd;

/// First words a client must avoid so the header cannot be mistaken for
/// another protocol.
const RESERVED_PREFIXES: [u32; 7] = [
    0x4441_4548, // HEAD
    0x5453_4f50, // POST
    0x2054_4547, // GET
    0x4954_504f, // OPTI
    0x0201_0316, // TLS
    TAG_INTERMEDIATE,
    TAG_PADDED,
];

/// Both ciphers of an obfuscated connection, from one side's point of view.
#[derive(Debug)]
pub struct Ciphers {
    /// Applied to bytes read from the peer.
    pub decrypt: AesCtr,
    /// Applied to bytes written to the peer.
    pub encrypt: AesCtr,
}

fn derive(key_src: &[u8], iv_src: &[u8], secret: Option<&[u8; 16]>) -> AesCtr {
    let mut key = [0u8; 32];
    key.copy_from_slice(key_src);
    if let Some(secret) = secret {
        key = pylon_crypto::sha256!(&key, secret);
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(iv_src);
    AesCtr::new(&key, &iv)
}

/// `(client → server, server → client)` ciphers for `header`.
fn directions(header: &[u8; HEADER_LEN], secret: Option<&[u8; 16]>) -> (AesCtr, AesCtr) {
    let up = derive(&header[8..40], &header[40..56], secret);
    let mut reversed = [0u8; 48];
    reversed.copy_from_slice(&header[8..56]);
    reversed.reverse();
    let down = derive(&reversed[..32], &reversed[32..], secret);
    (up, down)
}

fn framing_for(tag: u32) -> Result<Framing, Error> {
    match tag {
        TAG_ABRIDGED => Ok(Framing::Abridged),
        TAG_INTERMEDIATE => Ok(Framing::Intermediate),
        TAG_PADDED => Err(Error::UnsupportedFraming { tag }),
        _ => Err(Error::UnknownTag { tag }),
    }
}

fn tag_for(framing: Framing) -> Result<u32, Error> {
    match framing {
        Framing::Abridged => Ok(TAG_ABRIDGED),
        Framing::Intermediate => Ok(TAG_INTERMEDIATE),
        Framing::Full => Err(Error::UnsupportedFraming { tag: 0 }),
    }
}

/// Server side: reads the framing tag out of a received header.
///
/// The returned decrypt cipher has already consumed the header's 64
/// keystream bytes.
pub fn accept_header(header: &[u8; HEADER_LEN], secret: Option<&[u8; 16]>) -> Result<(Framing, Ciphers), Error> {
    let (mut decrypt, encrypt) = directions(header, secret);
    let mut plain = *header;
    decrypt.apply(&mut plain);
    let tag = u32::from_le_bytes([plain[56], plain[57], plain[58], plain[59]]);
    let framing = framing_for(tag)?;
    Ok((framing, Ciphers { decrypt, encrypt }))
}

/// Client side: a fresh header announcing `framing`, ready to be sent.
pub fn client_header(framing: Framing, secret: Option<&[u8; 16]>) -> Result<([u8; HEADER_LEN], Ciphers), Error> {
    let tag = tag_for(framing)?;
    let mut header = loop {
        let candidate: [u8; HEADER_LEN] = random_array();
        let first = u32::from_le_bytes([candidate[0], candidate[1], candidate[2], candidate[3]]);
        if candidate[0] != 0xef && !RESERVED_PREFIXES.contains(&first) && candidate[4..8] != [0; 4] {
            break candidate;
        }
    };
    header[56..60].copy_from_slice(&tag.to_le_bytes());

    let (mut encrypt, decrypt) = directions(&header, secret);
    let mut sealed = header;
    encrypt.apply(&mut sealed);
    header[56..].copy_from_slice(&sealed[56..]);
    Ok((header, Ciphers { decrypt, encrypt }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_between_sides() {
        for secret in [None, Some([7u8; 16])] {
            for framing in [Framing::Abridged, Framing::Intermediate] {
                let (header, mut client) = client_header(framing, secret.as_ref()).unwrap();
                let (seen, mut server) = accept_header(&header, secret.as_ref()).unwrap();
                assert_eq!(seen, framing);

                let mut up = *b"client says hello";
                client.encrypt.apply(&mut up);
                server.decrypt.apply(&mut up);
                assert_eq!(&up, b"client says hello");

                let mut down = *b"server answers";
                server.encrypt.apply(&mut down);
                client.decrypt.apply(&mut down);
                assert_eq!(&down, b"server answers");
            }
        }
    }

    #[test]
    fn wrong_secret_garbles_the_tag() {
        let (header, _) = client_header(Framing::Abridged, Some(&[1; 16])).unwrap();
        assert!(accept_header(&header, Some(&[2; 16])).is_err());
    }

    #[test]
    fn padded_intermediate_is_refused() {
        assert!(matches!(framing_for(TAG_PADDED), Err(Error::UnsupportedFraming { tag: TAG_PADDED })));
        assert!(matches!(framing_for(0x1234_5678), Err(Error::UnknownTag { tag: 0x1234_5678 })));
    }

    #[test]
    fn server_direction_uses_whole_reversal() {
        let mut header = [0u8; HEADER_LEN];
        for (i, b) in header.iter_mut().enumerate() {
            *b = i as u8;
        }
        let (_, mut down) = directions(&header, None);

        let key: Vec<u8> = (24..56).rev().collect();
        let iv: Vec<u8> = (8..24).rev().collect();
        let mut expected = AesCtr::new(&key.try_into().unwrap(), &iv.try_into().unwrap());

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        down.apply(&mut a);
        expected.apply(&mut b);
        assert_eq!(a, b);
    }
}
