//! Switch-user driver scenarios over an in-memory stream pair. One side is
//! the driver under test, the other plays the target shell.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use hopgate::escalate::{
    run_switch_user, run_switch_user_with_timeout, AuthPolicy, EscalateMethod,
};
use hopgate::BrokerError;

async fn read_until(server: &mut DuplexStream, needle: &str) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = server.read(&mut chunk).await.expect("server read");
        assert!(n > 0, "driver closed before sending {needle:?}");
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).to_string();
        if text.contains(needle) {
            return text;
        }
    }
}

#[tokio::test]
async fn su_success_writes_the_password_exactly_once() -> Result<()> {
    let (mut client, mut server) = duplex(1024);
    let policy = AuthPolicy::new(EscalateMethod::Su, "alice").with_password("s3cret");

    let shell = async {
        let command = read_until(&mut server, "su - alice; exit\n").await;
        server.write_all(b"Password: ").await.unwrap();
        let answer = read_until(&mut server, "s3cret\n").await;
        server.write_all(b"alice@host:~$ ").await.unwrap();
        (command, answer)
    };

    let (result, (command, answer)) = tokio::join!(run_switch_user(&policy, &mut client), shell);
    result?;
    assert!(!command.contains("s3cret"));
    assert_eq!(answer.matches("s3cret").count(), 1);
    Ok(())
}

#[tokio::test]
async fn huawei_super_level_walks_username_password_bracket_prompt() -> Result<()> {
    let (mut client, mut server) = duplex(1024);
    let policy = AuthPolicy::new(EscalateMethod::SuperLevel, "admin").with_password("hw-pass");

    let shell = async {
        read_until(&mut server, "super level-15\n").await;
        server.write_all(b"Username:").await.unwrap();
        read_until(&mut server, "admin\n").await;
        server.write_all(b"Password:").await.unwrap();
        read_until(&mut server, "hw-pass\n").await;
        server.write_all(b"<HUAWEI>").await.unwrap();
    };

    let (result, ()) = tokio::join!(run_switch_user(&policy, &mut client), shell);
    result?;
    Ok(())
}

#[tokio::test]
async fn failure_output_after_the_password_reports_the_transcript() {
    let (mut client, mut server) = duplex(1024);
    let policy = AuthPolicy::new(EscalateMethod::Su, "alice").with_password("wrong");

    let shell = async {
        read_until(&mut server, "su - alice; exit\n").await;
        server.write_all(b"Password: ").await.unwrap();
        read_until(&mut server, "wrong\n").await;
        server.write_all(b"su: Authentication failure\n").await.unwrap();
        // Hold the stream open so the driver fails on the pattern, not EOF.
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let (result, ()) = tokio::join!(run_switch_user(&policy, &mut client), shell);
    match result.unwrap_err() {
        BrokerError::AuthFailed { transcript } => {
            assert!(transcript.contains("Authentication failure"));
        }
        other => panic!("expected AuthFailed, got {other}"),
    }
}

#[tokio::test]
async fn silence_for_the_whole_budget_is_a_timeout_not_a_success() {
    let (mut client, mut server) = duplex(1024);
    let policy = AuthPolicy::new(EscalateMethod::Su, "alice").with_password("pw");

    let shell = async {
        read_until(&mut server, "su - alice; exit\n").await;
        server.write_all(b"thinking...\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let budget = Duration::from_millis(200);
    let (result, ()) =
        tokio::join!(run_switch_user_with_timeout(&policy, &mut client, budget), shell);
    match result.unwrap_err() {
        BrokerError::EscalateTimeout { transcript } => {
            assert!(transcript.contains("thinking"));
        }
        other => panic!("expected EscalateTimeout, got {other}"),
    }
}

#[tokio::test]
async fn username_is_sent_once_and_never_resent() {
    let (mut client, mut server) = duplex(1024);
    let policy = AuthPolicy::new(EscalateMethod::Su, "alice").with_password("pw");

    let shell = async {
        let mut seen = String::new();
        seen += &read_until(&mut server, "su - alice; exit\n").await;
        server.write_all(b"Username: ").await.unwrap();
        seen += &read_until(&mut server, "alice\n").await;
        // More output that matches nothing; the driver must stay quiet.
        server.write_all(b"checking directory\n").await.unwrap();
        server.write_all(b"still nothing to answer\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        seen
    };

    let budget = Duration::from_millis(200);
    let (result, seen) =
        tokio::join!(run_switch_user_with_timeout(&policy, &mut client, budget), shell);
    assert!(matches!(
        result.unwrap_err(),
        BrokerError::EscalateTimeout { .. }
    ));
    assert_eq!(seen.matches("alice\n").count(), 1);
}
