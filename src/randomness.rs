//! Externally supplied challenge randomness.
//!
//! The seed arrives once per protocol run (the result of the verifier's
//! "initiate challenge" call) over a one-shot channel. After that it is
//! advanced locally by +1 for every accepted share, so each round's challenge
//! is derived without going back to the external source.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ProtocolError;
use crate::error_handling::RetryConfig;

/// 256-bit big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChallengeRandomness([u8; 32]);

impl ChallengeRandomness {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 64 {
            return Err(ProtocolError::MalformedRandomness(format!(
                "expected 1..=64 hex digits, got {}",
                digits.len()
            )));
        }
        let padded = format!("{:0>64}", digits);
        let bytes = hex::decode(&padded)
            .map_err(|e| ProtocolError::MalformedRandomness(e.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Advance by one, wrapping at 2^256.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut().rev() {
            let (next, carry) = byte.overflowing_add(1);
            *byte = next;
            if !carry {
                break;
            }
        }
    }

    /// Always 32 bytes, zero-padded on the left, so the challenge buffer
    /// has a fixed width whatever the magnitude of the seed.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ChallengeRandomness {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ChallengeRandomness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeRandomness({})", self.to_hex())
    }
}

pub struct RandomnessSender(oneshot::Sender<ChallengeRandomness>);

pub struct RandomnessReceiver(oneshot::Receiver<ChallengeRandomness>);

pub fn channel() -> (RandomnessSender, RandomnessReceiver) {
    let (tx, rx) = oneshot::channel();
    (RandomnessSender(tx), RandomnessReceiver(rx))
}

impl RandomnessSender {
    pub fn send(self, randomness: ChallengeRandomness) -> Result<(), ProtocolError> {
        self.0
            .send(randomness)
            .map_err(|_| ProtocolError::RandomnessChannelClosed)
    }
}

impl RandomnessReceiver {
    /// Block until the seed arrives or `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> Result<ChallengeRandomness, ProtocolError> {
        match tokio::time::timeout(timeout, self.0).await {
            Ok(Ok(randomness)) => Ok(randomness),
            Ok(Err(_)) => Err(ProtocolError::RandomnessChannelClosed),
            Err(_) => Err(ProtocolError::RandomnessTimeout(timeout.as_millis())),
        }
    }
}

/// Wait for `path` to appear (written by the challenge-initiation script),
/// parse it and hand it over. Reads back off exponentially; gives up after
/// `deadline`.
pub async fn watch_file(
    path: PathBuf,
    sender: RandomnessSender,
    retry: RetryConfig,
    deadline: Duration,
) -> Result<ChallengeRandomness, ProtocolError> {
    let give_up_at = Instant::now() + deadline;
    let mut delay = retry.retry_delay;

    loop {
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.trim().is_empty() => {
                let randomness = ChallengeRandomness::from_hex(&contents)?;
                tracing::info!(path = %path.display(), randomness = %randomness.to_hex(), "challenge randomness received");
                sender.send(randomness)?;
                return Ok(randomness);
            }
            Ok(_) => tracing::debug!(path = %path.display(), "randomness file is empty"),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "randomness not available yet"),
        }

        let now = Instant::now();
        if now >= give_up_at {
            return Err(ProtocolError::RandomnessTimeout(deadline.as_millis()));
        }
        tokio::time::sleep(delay.min(give_up_at - now)).await;
        delay = retry.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_prefixed_hex() {
        let r = ChallengeRandomness::from_hex("0xabc\n").unwrap();
        assert_eq!(&r.as_bytes()[30..], &[0x0a, 0xbc]);
        assert!(r.as_bytes()[..30].iter().all(|b| *b == 0));
        assert!(ChallengeRandomness::from_hex("").is_err());
        assert!(ChallengeRandomness::from_hex(&"1".repeat(65)).is_err());
        assert!("xyz".parse::<ChallengeRandomness>().is_err());
    }

    #[test]
    fn small_seeds_keep_full_width() {
        let below_2_128 = "ff".repeat(15);
        let r = ChallengeRandomness::from_hex(&below_2_128).unwrap();
        assert_eq!(r.as_bytes().len(), 32);
        assert_eq!(r.to_hex(), format!("{}{}", "00".repeat(17), below_2_128));
    }

    #[test]
    fn increment_carries_and_wraps() {
        let mut r = ChallengeRandomness::from_hex("ff").unwrap();
        r.increment();
        assert_eq!(&r.as_bytes()[30..], &[0x01, 0x00]);

        let mut max = ChallengeRandomness::from_bytes([0xff; 32]);
        max.increment();
        assert_eq!(max.as_bytes(), &[0u8; 32]);
    }

    #[tokio::test]
    async fn wait_times_out_without_a_value() {
        let (_tx, rx) = channel();
        let err = rx.wait(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, ProtocolError::RandomnessTimeout(10));
    }

    #[tokio::test]
    async fn wait_reports_dropped_sender() {
        let (tx, rx) = channel();
        drop(tx);
        assert_eq!(
            rx.wait(Duration::from_secs(1)).await.unwrap_err(),
            ProtocolError::RandomnessChannelClosed
        );
    }

    #[tokio::test]
    async fn watch_file_delivers_once_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("randomness.txt");
        let (tx, rx) = channel();
        let retry = RetryConfig {
            max_retries: 0,
            retry_delay: Duration::from_millis(5),
            backoff_multiplier: 1.5,
            max_retry_delay: Duration::from_millis(20),
        };

        let watcher = tokio::spawn(watch_file(path.clone(), tx, retry, Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(15)).await;
        std::fs::write(&path, "c73031daa95c8a4119d200c0796c7958d6ead87cff96d9bdd30c56cfb2314efe").unwrap();

        let got = rx.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            got.to_hex(),
            "c73031daa95c8a4119d200c0796c7958d6ead87cff96d9bdd30c56cfb2314efe"
        );
        assert_eq!(watcher.await.unwrap().unwrap(), got);
    }
}
