use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::config;

use super::*;

const READ_CHUNK: usize = 4096;

enum Step {
    SendUsername,
    SendPassword,
    Failed,
    Done,
    Wait,
}

/// Drives one switch-user exchange over an already-open shell stream.
pub struct InteractiveAuthDriver {
    matchers: PromptMatchers,
    start_command: String,
    username: String,
    password: Option<String>,
}

impl InteractiveAuthDriver {
    pub fn new(policy: &AuthPolicy) -> Result<Self, BrokerError> {
        let matchers = PromptMatchers::compile(policy)?;
        let start_command = policy
            .start_command
            .clone()
            .unwrap_or_else(|| policy.method.start_command(&policy.username));
        Ok(Self {
            matchers,
            start_command,
            username: policy.username.clone(),
            password: policy.password.clone(),
        })
    }

    /// Run with the standard wall-clock budget.
    pub async fn run<S>(&self, stream: &mut S) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.run_with_timeout(stream, config::DEFAULT_ESCALATE_TIMEOUT)
            .await
    }

    /// Run with an explicit budget. On expiry the stream is left open for
    /// the caller to close; the error carries whatever the target printed.
    pub async fn run_with_timeout<S>(
        &self,
        stream: &mut S,
        budget: Duration,
    ) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut transcript = String::new();
        let outcome = timeout(budget, self.drive(stream, &mut transcript)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(BrokerError::EscalateTimeout { transcript }),
        }
    }

    async fn drive<S>(&self, stream: &mut S, transcript: &mut String) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        stream.write_all(self.start_command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        debug!("escalation started: {}", self.start_command);

        let need_auth = self.password.is_some();
        let mut username_sent = false;
        let mut auth_submitted = false;
        // Bytes since the last prompt we answered. Kept separate from the
        // transcript so a stale prompt never matches twice.
        let mut window = String::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(BrokerError::ConnectionClosed);
            }
            let text = String::from_utf8_lossy(&chunk[..n])
                .replace("\r\n", "\n")
                .replace('\r', "\n");
            transcript.push_str(&text);
            window.push_str(&text);

            match self.classify(&window, username_sent, auth_submitted, need_auth) {
                Step::SendUsername => {
                    trace!("username prompt answered");
                    stream.write_all(self.username.as_bytes()).await?;
                    stream.write_all(b"\n").await?;
                    username_sent = true;
                    window.clear();
                }
                Step::SendPassword => {
                    trace!("password prompt answered");
                    let password = self
                        .password
                        .as_deref()
                        .ok_or_else(|| BrokerError::InvalidPolicy("password required".into()))?;
                    stream.write_all(password.as_bytes()).await?;
                    stream.write_all(b"\n").await?;
                    auth_submitted = true;
                    window.clear();
                }
                Step::Failed => {
                    return Err(BrokerError::AuthFailed {
                        transcript: transcript.clone(),
                    });
                }
                Step::Done => {
                    debug!("escalation to {} succeeded", self.username);
                    return Ok(());
                }
                Step::Wait => {}
            }
        }
    }

    /// Pattern priority per read: username prompt, then password prompt,
    /// then failure, then success. Failure and success are only consulted
    /// once any required password has actually been submitted, so an
    /// un-escalated prompt that happens to look like success is ignored.
    fn classify(
        &self,
        window: &str,
        username_sent: bool,
        auth_submitted: bool,
        need_auth: bool,
    ) -> Step {
        let lines = || window.lines();
        if !username_sent && lines().any(|l| self.matchers.username.is_match(l)) {
            return Step::SendUsername;
        }
        if need_auth && !auth_submitted && lines().any(|l| self.matchers.password.is_match(l)) {
            return Step::SendPassword;
        }
        if !need_auth || auth_submitted {
            if lines().any(|l| self.matchers.failure.is_match(l)) {
                return Step::Failed;
            }
            if lines().any(|l| self.matchers.success.is_match(l)) {
                return Step::Done;
            }
        }
        Step::Wait
    }
}

/// One-shot form of the driver with the standard budget.
pub async fn run_switch_user<S>(policy: &AuthPolicy, stream: &mut S) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    InteractiveAuthDriver::new(policy)?.run(stream).await
}

/// One-shot form with a caller-chosen budget.
pub async fn run_switch_user_with_timeout<S>(
    policy: &AuthPolicy,
    stream: &mut S,
    budget: Duration,
) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    InteractiveAuthDriver::new(policy)?
        .run_with_timeout(stream, budget)
        .await
}
