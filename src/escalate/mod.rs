//! Interactive privilege escalation over an open shell stream.
//!
//! The driver screen-scrapes the dialogue that follows an escalation
//! command (`su`, `sudo`, `enable`, `super`) and answers username and
//! password prompts until a success or failure pattern appears. Dialects
//! are data, not subtypes: each method maps to a command template plus a
//! small set of patterns, and callers can override the start command and
//! the success pattern for unusual targets.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

mod driver;

pub use driver::{run_switch_user, run_switch_user_with_timeout, InteractiveAuthDriver};

/// Prompt labels accepted in English and Chinese.
const USERNAME_PROMPT: &str = r"(?i)(login|user\s?name|用户名)\s*[::]";
const PASSWORD_PROMPT: &str = r"(?i)(password|密码|口令)\s*[::]";
const FAILURE_PATTERN: &str =
    r"(?i)authentication fail|incorrect|denied|invalid password|sorry|失败|错误";

/// Generic interactive shell prompt, `$` or `#` at end of line.
const SHELL_PROMPT: &str = r"[$#]\s*$";
/// Huawei/H3C bracket prompt, `<hostname>` at end of line.
const BRACKET_PROMPT: &str = r"<[^<>]+>\s*$";

/// Supported escalation dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EscalateMethod {
    Su,
    Sudo,
    /// `su` without a sudo fallback; the password prompt may never appear
    /// when the current account can switch freely.
    OnlySu,
    OnlySudo,
    Enable,
    Super,
    SuperLevel,
}

impl EscalateMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "su" => Some(Self::Su),
            "sudo" => Some(Self::Sudo),
            "only_su" => Some(Self::OnlySu),
            "only_sudo" => Some(Self::OnlySudo),
            "enable" => Some(Self::Enable),
            "super" => Some(Self::Super),
            "super_level" => Some(Self::SuperLevel),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Su => "su",
            Self::Sudo => "sudo",
            Self::OnlySu => "only_su",
            Self::OnlySudo => "only_sudo",
            Self::Enable => "enable",
            Self::Super => "super",
            Self::SuperLevel => "super_level",
        }
    }

    fn start_command(&self, username: &str) -> String {
        match self {
            Self::Su | Self::OnlySu => format!("su - {username}; exit"),
            Self::Sudo | Self::OnlySudo => format!("sudo su - {username}; exit"),
            Self::Enable => "enable".to_string(),
            Self::Super => "super 15".to_string(),
            Self::SuperLevel => "super level-15".to_string(),
        }
    }

    fn success_pattern(&self, username: &str) -> String {
        match self {
            Self::Su | Self::Sudo | Self::OnlySu | Self::OnlySudo => {
                format!("{}@|{}", regex::escape(username), SHELL_PROMPT)
            }
            Self::Enable => SHELL_PROMPT.to_string(),
            Self::Super | Self::SuperLevel => BRACKET_PROMPT.to_string(),
        }
    }
}

/// Everything a switch-user attempt needs. `password: None` means the
/// method is expected to escalate without a prompt; when a prompt appears
/// anyway the exchange runs into the timeout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthPolicy {
    pub method: EscalateMethod,
    /// Target account to switch into.
    pub username: String,
    pub password: Option<String>,
    /// Replaces the dialect's built-in start command.
    pub start_command: Option<String>,
    /// Replaces the dialect's built-in success pattern.
    pub success_pattern: Option<String>,
}

impl AuthPolicy {
    pub fn new(method: EscalateMethod, username: impl Into<String>) -> Self {
        Self {
            method,
            username: username.into(),
            password: None,
            start_command: None,
            success_pattern: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// The four compiled classifiers for one dialect.
pub struct PromptMatchers {
    pub username: Regex,
    pub password: Regex,
    pub success: Regex,
    pub failure: Regex,
}

impl PromptMatchers {
    /// Compile the pattern set for `policy`. A bad pattern is a fatal
    /// configuration error, reported before anything touches the stream.
    pub fn compile(policy: &AuthPolicy) -> Result<Self, BrokerError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                BrokerError::InvalidPolicy(format!("bad pattern {pattern:?}: {e}"))
            })
        };
        let success = policy
            .success_pattern
            .clone()
            .unwrap_or_else(|| policy.method.success_pattern(&policy.username));
        Ok(Self {
            username: compile(USERNAME_PROMPT)?,
            password: compile(PASSWORD_PROMPT)?,
            success: compile(&success)?,
            failure: compile(FAILURE_PATTERN)?,
        })
    }
}
