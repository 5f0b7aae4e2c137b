//! OS account helpers used by first-boot initialization.

use rand::Rng;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::agent::config::PASSWD_WAIT;

/// Characters allowed in generated passwords. Some punctuation is excluded
/// because it confuses `passwd` or downstream shells.
pub(crate) const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!%()*+,-.:;<=>?@[]^_{|}~";

/// Length of rotated passwords
pub(crate) const PASSWORD_LEN: usize = 32;

/// Generate a random string from the password charset.
pub(crate) fn rand_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..PASSWORD_CHARSET.len());
            PASSWORD_CHARSET[idx] as char
        })
        .collect()
}

/// Rotate the password of an OS account via `/usr/bin/passwd`.
///
/// Feeds the new password twice on stdin and waits a bounded time for the
/// helper to finish; a stuck helper is killed and reported as an error so the
/// caller can retry initialization.
pub(crate) async fn change_password(username: &str) -> io::Result<String> {
    let password = rand_string(PASSWORD_LEN);

    let mut child = Command::new("/usr/bin/passwd")
        .arg(username)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(format!("{password}\n{password}\n").as_bytes())
            .await?;
        stdin.shutdown().await?;
    }

    match tokio::time::timeout(PASSWD_WAIT, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(password),
        Ok(Ok(status)) => Err(io::Error::other(format!(
            "passwd exited with status {status}"
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(username, "passwd did not finish in time, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill stuck passwd process");
            }
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "passwd did not finish in time",
            ))
        }
    }
}
