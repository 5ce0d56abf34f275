use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const OPUS_BITRATE_KBPS: u32 = 192;

#[derive(Clone, Debug)]
pub struct EncodeTarget {
    pub codec: String,
    pub bitrate_kbps: u32,
    pub container: String,
}

impl Default for EncodeTarget {
    fn default() -> Self {
        Self {
            codec: "libopus".to_string(),
            bitrate_kbps: OPUS_BITRATE_KBPS,
            container: "opus".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum EncodeError {
    Spawn(String),
    Encoder(String),
    Io(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Spawn(err) => write!(f, "failed to start encoder: {}", err),
            EncodeError::Encoder(err) => write!(f, "encoder error: {}", err),
            EncodeError::Io(err) => write!(f, "encoder io error: {}", err),
        }
    }
}

impl std::error::Error for EncodeError {}

pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// A running encode. `chunks` yields encoded bytes until end of stream
/// (channel close after the last chunk) or one terminal error; cancelling
/// the token kills the encoder mid-stream.
pub struct EncodeJob {
    pub chunks: mpsc::Receiver<Result<Bytes, EncodeError>>,
    pub cancel: CancellationToken,
}

/// Encoder port: consumes a readable source stream, produces the encoded
/// byte stream for the requested target. Faked in tests so no subprocess
/// is ever spawned there.
pub trait Encoder: Send + Sync {
    fn start(&self, source: SourceStream, target: &EncodeTarget) -> Result<EncodeJob, EncodeError>;
}

/// Default implementation: an ffmpeg child process fed on stdin, read on
/// stdout.
pub struct FfmpegEncoder {
    pub binary: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn start(&self, source: SourceStream, target: &EncodeTarget) -> Result<EncodeJob, EncodeError> {
        let mut child = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"])
            .args(["-c:a", &target.codec])
            .args(["-b:a", &format!("{}k", target.bitrate_kbps)])
            .args(["-f", &target.container, "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| EncodeError::Spawn(err.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncodeError::Spawn("encoder stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncodeError::Spawn("encoder stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncodeError::Spawn("encoder stderr unavailable".to_string()))?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);

        // Feed the source into the child; closing stdin is the encoder's
        // end-of-input signal.
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut source = source;
            tokio::select! {
                _ = pump_cancel.cancelled() => {}
                result = tokio::io::copy(&mut source, &mut stdin) => {
                    if let Err(err) = result {
                        debug!("Encoder input pump ended: {}", err);
                    }
                }
            }
            let _ = stdin.shutdown().await;
        });

        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return;
                    }
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(EncodeError::Io(err.to_string()))).await;
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            return;
                        }
                    }
                }
            }

            let mut detail = Vec::new();
            let _ = stderr.read_to_end(&mut detail).await;
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let detail = String::from_utf8_lossy(&detail);
                    let _ = tx
                        .send(Err(EncodeError::Encoder(format!(
                            "{}: {}",
                            status,
                            detail.trim()
                        ))))
                        .await;
                }
                Err(err) => {
                    let _ = tx.send(Err(EncodeError::Io(err.to_string()))).await;
                }
            }
        });

        Ok(EncodeJob { chunks: rx, cancel })
    }
}

#[cfg(test)]
mod tests {
    use super::EncodeTarget;

    #[test]
    fn default_target_is_192k_opus() {
        let target = EncodeTarget::default();
        assert_eq!(target.codec, "libopus");
        assert_eq!(target.bitrate_kbps, 192);
        assert_eq!(target.container, "opus");
    }
}
