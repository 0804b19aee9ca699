// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::Duration;

use crate::crypto::{KeyPair, PUBLIC_KEY_LEN};
use crate::identity::Identity;

#[derive(Clone)]
pub struct CryptoOptions {
    pub secret_key: KeyPair,
    pub peer_public_key: [u8; PUBLIC_KEY_LEN],
}

/// Per-socket configuration, set once at creation and handed to every pipe
/// it owns. Unlike scaproust's post-hoc `set_option`, every field here is
/// fixed for the socket's lifetime — nothing in this design mutates an
/// option after a pipe has started using it, so a plain builder is simpler
/// and safer than threading option changes through the reactor's command
/// channel (an Open Question resolved this way; see DESIGN.md).
#[derive(Clone)]
pub struct Options {
    pub hwm_in: usize,
    pub hwm_out: usize,
    pub ident: Identity,
    pub crypto: Option<CryptoOptions>,
    pub close_linger: Duration,
    pub reconnect_interval: Duration,
    pub sub_resend_interval: Duration,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            hwm_in: 1024,
            hwm_out: 1024,
            ident: Identity::random(),
            crypto: None,
            close_linger: Duration::from_millis(1000),
            reconnect_interval: Duration::from_millis(200),
            sub_resend_interval: Duration::from_millis(5000),
            send_timeout: None,
            recv_timeout: None,
            max_frame_size: 1 << 20,
        }
    }
}

impl Options {
    pub fn with_hwm_in(mut self, hwm: usize) -> Self {
        self.hwm_in = hwm;
        self
    }

    pub fn with_hwm_out(mut self, hwm: usize) -> Self {
        self.hwm_out = hwm;
        self
    }

    pub fn with_ident(mut self, ident: Identity) -> Self {
        self.ident = ident;
        self
    }

    pub fn with_encryption(mut self, secret_key: KeyPair, peer_public_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        self.crypto = Some(CryptoOptions { secret_key, peer_public_key });
        self
    }

    pub fn with_close_linger(mut self, d: Duration) -> Self {
        self.close_linger = d;
        self
    }

    pub fn with_reconnect_interval(mut self, d: Duration) -> Self {
        self.reconnect_interval = d;
        self
    }

    pub fn with_sub_resend_interval(mut self, d: Duration) -> Self {
        self.sub_resend_interval = d;
        self
    }

    pub fn with_send_timeout(mut self, d: Duration) -> Self {
        self.send_timeout = Some(d);
        self
    }

    pub fn with_recv_timeout(mut self, d: Duration) -> Self {
        self.recv_timeout = Some(d);
        self
    }

    pub fn with_max_frame_size(mut self, n: usize) -> Self {
        self.max_frame_size = n;
        self
    }
}
