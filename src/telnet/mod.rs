//! From-scratch Telnet option negotiation.
//!
//! Only the option state machine lives here; no terminal emulation. A
//! [`TelnetConnection`] negotiates against the server until the first plain
//! byte arrives, optionally answers the login dialogue, and then behaves as
//! a raw bidirectional stream.
//!
//! Byte values follow RFC 854/855 and the option RFCs for ECHO (857),
//! SGA (858), TTYPE (1091), NAWS (1073) and NEW-ENVIRON (1572).

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::transport::TerminalOptions;

mod engine;

pub use engine::TelnetConnection;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;
pub const OPT_OLD_ENVIRON: u8 = 36;
pub const OPT_NEW_ENVIRON: u8 = 39;

/// Sub-negotiation verbs shared by TTYPE and ENVIRON.
pub const SUB_IS: u8 = 0;
pub const SUB_SEND: u8 = 1;

/// NEW-ENVIRON value framing.
pub const ENV_VAR: u8 = 0;
pub const ENV_VALUE: u8 = 1;

/// One parsed negotiation unit: a plain command, an option request, or a
/// full sub-negotiation block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPacket {
    pub command: u8,
    pub option: u8,
    /// Sub-negotiation bytes between `IAC SB <option>` and `IAC SE`,
    /// with escaped `IAC IAC` pairs already collapsed. Empty otherwise.
    pub payload: Vec<u8>,
}

impl OptionPacket {
    pub fn simple(command: u8, option: u8) -> Self {
        Self {
            command,
            option,
            payload: Vec::new(),
        }
    }

    pub fn sub(option: u8, payload: Vec<u8>) -> Self {
        Self {
            command: SB,
            option,
            payload,
        }
    }

    /// Parse one unit from the head of `buf`, which must start with IAC.
    /// Returns the packet and the number of bytes consumed, or `None` when
    /// the unit is not complete yet.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        debug_assert_eq!(buf.first(), Some(&IAC));
        let command = *buf.get(1)?;
        match command {
            DO | DONT | WILL | WONT => {
                let option = *buf.get(2)?;
                Some((Self::simple(command, option), 3))
            }
            SB => {
                let option = *buf.get(2)?;
                let mut payload = Vec::new();
                let mut i = 3;
                loop {
                    let byte = *buf.get(i)?;
                    if byte == IAC {
                        match *buf.get(i + 1)? {
                            SE => return Some((Self::sub(option, payload), i + 2)),
                            IAC => {
                                payload.push(IAC);
                                i += 2;
                            }
                            other => {
                                // Stray command inside the block; keep it as
                                // payload rather than aborting the parse.
                                payload.push(IAC);
                                payload.push(other);
                                i += 2;
                            }
                        }
                    } else {
                        payload.push(byte);
                        i += 1;
                    }
                }
            }
            _ => Some((Self::simple(command, 0), 2)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self.command {
            SB => {
                let mut out = vec![IAC, SB, self.option];
                for &byte in &self.payload {
                    if byte == IAC {
                        out.push(IAC);
                    }
                    out.push(byte);
                }
                out.extend_from_slice(&[IAC, SE]);
                out
            }
            DO | DONT | WILL | WONT => vec![IAC, self.command, self.option],
            _ => vec![IAC, self.command],
        }
    }
}

/// Lifecycle of a [`TelnetConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetState {
    Negotiating,
    AutoLoggingIn,
    Ready,
    Closed,
}

/// Tunables for one Telnet connect.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TelnetSettings {
    pub term: TerminalOptions,
    /// Supervisory budget for TCP connect plus the whole handshake.
    pub timeout_secs: u64,
    /// Overrides the built-in shell-prompt pattern for login detection on
    /// targets with unusual prompts.
    pub success_pattern: Option<String>,
}

impl Default for TelnetSettings {
    fn default() -> Self {
        Self {
            term: TerminalOptions::default(),
            timeout_secs: config::DEFAULT_DIAL_TIMEOUT.as_secs(),
            success_pattern: None,
        }
    }
}

impl TelnetSettings {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
