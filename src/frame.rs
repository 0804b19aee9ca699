// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Routing keys are capped at 255 bytes so their length fits the wire
/// format's single-byte length prefix.
pub const MAX_ROUTING_KEY_LEN: usize = 255;

#[derive(Debug)]
struct FrameInner {
    key: Option<Vec<u8>>,
    identity: Option<Identity>,
    payload: Vec<u8>,
}

/// An immutable message: an optional routing key, an optional sender
/// identity attached by the receiving pipe, and a payload.
///
/// Cloning a `Frame` is O(1) — the underlying buffer is reference-counted
/// and freed once the last clone is dropped.
#[derive(Clone, Debug)]
pub struct Frame(Arc<FrameInner>);

impl Frame {
    pub fn new(payload: Vec<u8>) -> Frame {
        Frame(Arc::new(FrameInner { key: None, identity: None, payload }))
    }

    pub fn with_key(key: Vec<u8>, payload: Vec<u8>) -> Result<Frame> {
        if key.len() > MAX_ROUTING_KEY_LEN {
            return Err(Error::FrameTooLarge { size: key.len(), max: MAX_ROUTING_KEY_LEN });
        }
        Ok(Frame(Arc::new(FrameInner { key: Some(key), identity: None, payload })))
    }

    /// Returns a copy of this frame stamped with `identity`. Used by a pipe
    /// to attach the sender's handshake-derived identity to frames it
    /// hands off to the owning socket's receive queue.
    pub(crate) fn stamped(&self, identity: Identity) -> Frame {
        Frame(Arc::new(FrameInner {
            key: self.0.key.clone(),
            identity: Some(identity),
            payload: self.0.payload.clone(),
        }))
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.0.key.as_deref()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.0.identity
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    pub fn len(&self) -> usize {
        self.0.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_over_limit_is_rejected() {
        let key = vec![0u8; MAX_ROUTING_KEY_LEN + 1];
        match Frame::with_key(key, vec![]) {
            Err(Error::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_ROUTING_KEY_LEN + 1);
                assert_eq!(max, MAX_ROUTING_KEY_LEN);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn clone_is_cheap_and_shares_payload() {
        let frame = Frame::new(b"hello".to_vec());
        let clone = frame.clone();
        assert_eq!(frame.payload(), clone.payload());
        assert!(Arc::ptr_eq(&frame.0, &clone.0));
    }

    #[test]
    fn stamped_preserves_key_and_payload() {
        let frame = Frame::with_key(b"topic".to_vec(), b"body".to_vec()).unwrap();
        let identity = Identity::random();
        let stamped = frame.stamped(identity);
        assert_eq!(stamped.key(), Some(&b"topic"[..]));
        assert_eq!(stamped.payload(), &b"body"[..]);
        assert_eq!(stamped.identity(), Some(identity));
        assert_eq!(frame.identity(), None);
    }
}
