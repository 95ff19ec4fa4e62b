//! SSH algorithm preferences and broker-wide defaults.
//!
//! Bastion targets include plenty of legacy network gear, so the algorithm
//! tables cover everything russh supports, modern first. The tables feed the
//! `Preferred` set of the russh client config when a dial asks for the
//! compatibility profile; the secure profile is a strict subset.

use std::borrow::Cow;
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{Preferred, cipher, compression, kex, mac};

/// Default terminal type requested for pty sessions and offered during
/// Telnet TTYPE sub-negotiation.
pub const DEFAULT_TERM_TYPE: &str = "xterm";

/// Default terminal window size (columns, rows).
pub const DEFAULT_WINDOW_SIZE: (u32, u32) = (80, 24);

/// Default transport dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard wall-clock budget for one switch-user exchange.
pub const DEFAULT_ESCALATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between pool sweep ticks.
pub const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Protocol-level keepalive period applied to every transport.
pub const TRANSPORT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// All supported key exchange algorithms in order of preference.
///
/// Includes modern algorithms like Curve25519 as well as legacy
/// Diffie-Hellman variants for compatibility with older devices.
pub const COMPAT_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// Modern key exchange algorithms only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_G14_SHA256,
    kex::DH_G16_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// All supported ciphers, including legacy CBC modes for older devices.
pub const COMPAT_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
];

/// Modern ciphers only.
pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
];

/// All supported MAC algorithms, standard HMAC and ETM variants.
pub const COMPAT_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

/// Modern MAC algorithms only.
pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
];

/// Compression preference shared by both profiles.
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] =
    &[compression::NONE, compression::ZLIB, compression::ZLIB_LEGACY];

/// All supported host key algorithms, legacy RSA/DSA included.
pub const COMPAT_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

/// Modern host key algorithms only.
pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

/// SSH algorithm profile for a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub enum AlgorithmProfile {
    /// Strict modern algorithms (default).
    #[default]
    Secure,
    /// Maximum compatibility with legacy devices.
    LegacyCompatible,
}

impl AlgorithmProfile {
    pub(crate) fn preferred(self) -> Preferred {
        match self {
            AlgorithmProfile::Secure => Preferred {
                kex: Cow::Borrowed(SECURE_KEX_ORDER),
                key: Cow::Borrowed(SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(SECURE_CIPHERS),
                mac: Cow::Borrowed(SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
            AlgorithmProfile::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(COMPAT_KEX_ORDER),
                key: Cow::Borrowed(COMPAT_KEY_TYPES),
                cipher: Cow::Borrowed(COMPAT_CIPHERS),
                mac: Cow::Borrowed(COMPAT_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_profile_is_subset_of_compat() {
        for alg in SECURE_KEX_ORDER {
            assert!(COMPAT_KEX_ORDER.contains(alg));
        }
        for alg in SECURE_CIPHERS {
            assert!(COMPAT_CIPHERS.contains(alg));
        }
        for alg in SECURE_MAC_ALGORITHMS {
            assert!(COMPAT_MAC_ALGORITHMS.contains(alg));
        }
    }

    #[test]
    fn secure_profile_excludes_legacy_algorithms() {
        let preferred = AlgorithmProfile::Secure.preferred();
        assert!(preferred.kex.iter().all(|alg| *alg != kex::DH_G1_SHA1));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::AES_256_CBC));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::HMAC_SHA1));
    }

    #[test]
    fn compat_profile_keeps_legacy_algorithms() {
        let preferred = AlgorithmProfile::LegacyCompatible.preferred();
        assert!(preferred.kex.contains(&kex::DH_G1_SHA1));
        assert!(preferred.cipher.contains(&cipher::AES_256_CBC));
        assert!(preferred.mac.contains(&mac::HMAC_SHA1));
    }
}
