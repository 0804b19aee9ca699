// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Length-prefixed wire framing, with an authenticated encryption envelope
//! layered on top once a pipe's handshake has produced a [`SessionCrypto`].
//!
//! Wire format per on-wire unit (§4.3):
//!
//! ```text
//! unencrypted: LEN(4, LE) | FLAGS(1) | KEYLEN(1) | KEY(KEYLEN) | PAYLOAD
//! encrypted:   LEN(4, LE) | COUNTER(8, LE) | CIPHERTEXT(FLAGS|KEYLEN|KEY|PAYLOAD) | TAG(16)
//! ```
//!
//! `LEN` covers everything after itself. The subscription-update flag is
//! kept in the wire format per the design notes, but modeled internally as
//! the `WireBody::SubUpdate` variant rather than surfaced as a raw bit.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::{SessionCrypto, COUNTER_LEN, TAG_LEN};
use crate::error::{Error, Result};
use crate::frame::{Frame, MAX_ROUTING_KEY_LEN};

pub const LEN_PREFIX: usize = 4;

#[allow(dead_code)] // reserved: no encoder path sets it yet, see DESIGN.md
const FLAG_IDENTITY: u8 = 0b0000_0001;
const FLAG_SUB_UPDATE: u8 = 0b0000_0010;

/// What a caller wants encoded: a data frame, or the socket's serialized
/// subscription set.
pub enum PlainBody<'a> {
    Data(&'a Frame),
    SubUpdate(&'a [u8]),
}

/// What the decoder produced.
pub enum WireBody {
    Data(Frame),
    SubUpdate(Vec<u8>),
}

fn plain_body(flags: u8, key: Option<&[u8]>, payload: &[u8]) -> Vec<u8> {
    let key = key.unwrap_or(&[]);
    let mut body = Vec::with_capacity(2 + key.len() + payload.len());
    body.push(flags);
    body.push(key.len() as u8);
    body.extend_from_slice(key);
    body.extend_from_slice(payload);
    body
}

fn parse_body(body: &[u8]) -> Result<WireBody> {
    if body.len() < 2 {
        return Err(Error::HandshakeFailed("short frame body"));
    }
    let flags = body[0];
    let key_len = body[1] as usize;
    if body.len() < 2 + key_len {
        return Err(Error::HandshakeFailed("short frame body"));
    }
    let key = &body[2..2 + key_len];
    let payload = &body[2 + key_len..];

    if flags & FLAG_SUB_UPDATE != 0 {
        return Ok(WireBody::SubUpdate(payload.to_vec()));
    }

    let frame = if key.is_empty() {
        Frame::new(payload.to_vec())
    } else {
        Frame::with_key(key.to_vec(), payload.to_vec())?
    };
    Ok(WireBody::Data(frame))
}

/// Encodes one outbound unit to on-wire bytes, sealing it if `crypto` is
/// supplied. `FLAG_IDENTITY` is reserved (see DESIGN.md) and never set by
/// the encoder; a peer that sets it is still decodable, with the embedded
/// identity overriding the pipe-attached one.
pub fn encode(body: PlainBody<'_>, crypto: Option<&mut SessionCrypto>, max_frame_size: usize) -> Result<Vec<u8>> {
    let plain = match body {
        PlainBody::Data(frame) => {
            if frame.payload().len() > max_frame_size {
                return Err(Error::FrameTooLarge { size: frame.payload().len(), max: max_frame_size });
            }
            plain_body(0, frame.key(), frame.payload())
        }
        PlainBody::SubUpdate(payload) => plain_body(FLAG_SUB_UPDATE, None, payload),
    };

    match crypto {
        None => {
            let mut out = vec![0u8; LEN_PREFIX];
            LittleEndian::write_u32(&mut out, plain.len() as u32);
            out.extend_from_slice(&plain);
            Ok(out)
        }
        Some(crypto) => {
            let (counter, ciphertext) = crypto.seal(&plain)?;
            let remainder_len = COUNTER_LEN + ciphertext.len();
            let mut out = vec![0u8; LEN_PREFIX + COUNTER_LEN];
            LittleEndian::write_u32(&mut out[..LEN_PREFIX], remainder_len as u32);
            LittleEndian::write_u64(&mut out[LEN_PREFIX..], counter);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
    }
}

/// Accumulates bytes read from a pipe's transport and extracts complete
/// on-wire units, retaining any short trailing remainder for the next read
/// (the pipe's "in-buffer" / parse buffer from the data model).
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> FrameDecoder {
        FrameDecoder { buf: Vec::new(), max_frame_size }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn max_remainder(&self, encrypted: bool) -> usize {
        let max_plain_body = 2 + MAX_ROUTING_KEY_LEN + self.max_frame_size;
        if encrypted {
            COUNTER_LEN + max_plain_body + TAG_LEN
        } else {
            max_plain_body
        }
    }

    /// Drains as many complete units as are currently buffered, decrypting
    /// each with `crypto` when present.
    pub fn drain_frames(&mut self, mut crypto: Option<&mut SessionCrypto>) -> Result<Vec<WireBody>> {
        let mut out = Vec::new();
        loop {
            if self.buf.len() < LEN_PREFIX {
                break;
            }
            let remainder_len = LittleEndian::read_u32(&self.buf[..LEN_PREFIX]) as usize;
            let bound = self.max_remainder(crypto.is_some());
            if remainder_len > bound {
                return Err(Error::FrameTooLarge { size: remainder_len, max: bound });
            }
            if self.buf.len() < LEN_PREFIX + remainder_len {
                break;
            }

            let frame_end = LEN_PREFIX + remainder_len;
            let remainder: Vec<u8> = self.buf[LEN_PREFIX..frame_end].to_vec();
            self.buf.drain(..frame_end);

            let plain = match &mut crypto {
                None => remainder,
                Some(session) => {
                    if remainder.len() < COUNTER_LEN {
                        return Err(Error::HandshakeFailed("short encrypted frame"));
                    }
                    let counter = LittleEndian::read_u64(&remainder[..COUNTER_LEN]);
                    session.open(counter, &remainder[COUNTER_LEN..])?
                }
            };

            out.push(parse_body(&plain)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn plain_round_trip_preserves_key_and_payload() {
        let frame = Frame::with_key(b"topic".to_vec(), b"payload".to_vec()).unwrap();
        let bytes = encode(PlainBody::Data(&frame), None, 1 << 16).unwrap();

        let mut decoder = FrameDecoder::new(1 << 16);
        decoder.feed(&bytes);
        let units = decoder.drain_frames(None).unwrap();
        assert_eq!(units.len(), 1);
        match &units[0] {
            WireBody::Data(decoded) => {
                assert_eq!(decoded.key(), Some(&b"topic"[..]));
                assert_eq!(decoded.payload(), &b"payload"[..]);
            }
            WireBody::SubUpdate(_) => panic!("expected data frame"),
        }
    }

    #[test]
    fn encrypted_round_trip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut alice_crypto = crate::crypto::SessionCrypto::derive(&alice, &bob.public_bytes());
        let mut bob_crypto = crate::crypto::SessionCrypto::derive(&bob, &alice.public_bytes());

        let frame = Frame::new(b"secret".to_vec());
        let bytes = encode(PlainBody::Data(&frame), Some(&mut alice_crypto), 1 << 16).unwrap();

        let mut decoder = FrameDecoder::new(1 << 16);
        decoder.feed(&bytes);
        let units = decoder.drain_frames(Some(&mut bob_crypto)).unwrap();
        match &units[0] {
            WireBody::Data(decoded) => assert_eq!(decoded.payload(), &b"secret"[..]),
            WireBody::SubUpdate(_) => panic!("expected data frame"),
        }
    }

    #[test]
    fn partial_reads_are_buffered_until_complete() {
        let frame = Frame::new(b"chunked".to_vec());
        let bytes = encode(PlainBody::Data(&frame), None, 1 << 16).unwrap();

        let mut decoder = FrameDecoder::new(1 << 16);
        decoder.feed(&bytes[..2]);
        assert!(decoder.drain_frames(None).unwrap().is_empty());
        decoder.feed(&bytes[2..]);
        let units = decoder.drain_frames(None).unwrap();
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut decoder = FrameDecoder::new(16);
        let mut bogus = (u32::MAX).to_le_bytes().to_vec();
        bogus.extend_from_slice(&[0u8; 8]);
        decoder.feed(&bogus);
        assert!(matches!(decoder.drain_frames(None), Err(Error::FrameTooLarge { .. })));
    }

    #[test]
    fn sub_update_round_trips_as_distinct_variant() {
        let payload = b"foo\0bar".to_vec();
        let bytes = encode(PlainBody::SubUpdate(&payload), None, 1 << 16).unwrap();
        let mut decoder = FrameDecoder::new(1 << 16);
        decoder.feed(&bytes);
        match decoder.drain_frames(None).unwrap().remove(0) {
            WireBody::SubUpdate(got) => assert_eq!(got, payload),
            WireBody::Data(_) => panic!("expected sub update"),
        }
    }
}
