use log::warn;
use russh::keys::{HashAlg, PublicKey};

use super::*;

/// SSH client-side event handler. Only host key verification carries
/// policy; everything else keeps the russh defaults.
pub(crate) struct ClientHandler {
    identity: String,
    verification: HostVerification,
}

impl ClientHandler {
    pub(crate) fn new(identity: String, verification: HostVerification) -> Self {
        Self {
            identity,
            verification,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.verification {
            HostVerification::NoCheck => Ok(true),
            HostVerification::Fingerprint(expected) => {
                let actual = server_public_key.fingerprint(HashAlg::Sha256).to_string();
                if &actual == expected {
                    Ok(true)
                } else {
                    warn!(
                        "host key mismatch for {}: expected {}, got {}",
                        self.identity, expected, actual
                    );
                    Ok(false)
                }
            }
        }
    }
}
