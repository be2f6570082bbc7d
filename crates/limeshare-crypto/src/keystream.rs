use bytes::Bytes;
use limeshare_types::{chunk_count, chunk_len};
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::debug;

/// WebSocket close code the provider uses after its last frame.
pub const CLOSE_NORMAL: u16 = 1000;

/// What the keystream provider channel delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    Binary(Bytes),
    Closed { code: u16 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeystreamError {
    #[error("keystream provider closed with code {code} after {received} frames")]
    AbnormalClose { code: u16, received: usize },
    #[error("keystream provider channel dropped after {received} frames")]
    ChannelDropped { received: usize },
    #[error("keystream provider finished after {received} of {expected} frames")]
    Truncated { expected: usize, received: usize },
    #[error("keystream has {got} frames, session needs {expected}")]
    Count { expected: usize, got: usize },
    #[error("a {total_size}-byte file cannot be split into {chunk_size}-byte chunks")]
    Layout { total_size: u64, chunk_size: usize },
    #[error("keystream frame {index} is {got} bytes, chunk needs {expected}")]
    FrameSize { index: usize, expected: usize, got: usize },
}

/// One keystream: a frame of random bytes per chunk, in chunk order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Keystream {
    frames: Vec<Bytes>,
}

impl Keystream {
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Key bytes for chunk `index`; empty if the stream has no such frame.
    pub fn frame(&self, index: u32) -> &[u8] {
        self.frames.get(index as usize).map(|f| &f[..]).unwrap_or(&[])
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Checks that every chunk of a `total_size` file is fully covered, so
    /// `combine` never falls back to zero key bytes.
    pub fn validate(&self, total_size: u64, chunk_size: usize) -> Result<(), KeystreamError> {
        let expected = expected_frames(total_size, chunk_size)?;
        if self.frames.len() != expected {
            return Err(KeystreamError::Count {
                expected,
                got: self.frames.len(),
            });
        }
        for (index, frame) in self.frames.iter().enumerate() {
            let need = chunk_len(index as u32, total_size, chunk_size);
            if frame.len() < need {
                return Err(KeystreamError::FrameSize {
                    index,
                    expected: need,
                    got: frame.len(),
                });
            }
        }
        Ok(())
    }
}

fn expected_frames(total_size: u64, chunk_size: usize) -> Result<usize, KeystreamError> {
    chunk_count(total_size, chunk_size)
        .map(|n| n as usize)
        .ok_or(KeystreamError::Layout { total_size, chunk_size })
}

/// Keystream A: one CSPRNG frame per chunk, sized to that chunk.
/// Empty for a layout `chunk_count` rejects.
pub fn generate_local(total_size: u64, chunk_size: usize) -> Keystream {
    let count = chunk_count(total_size, chunk_size).unwrap_or(0);
    let mut rng = rand::rng();
    let frames = (0..count)
        .map(|i| {
            let mut frame = vec![0u8; chunk_len(i, total_size, chunk_size)];
            rng.fill_bytes(&mut frame);
            Bytes::from(frame)
        })
        .collect();
    Keystream { frames }
}

/// Consumes the provider channel until a full keystream for `total_size`
/// bytes has arrived.
///
/// Any close before that point is a failure: a non-normal close code is
/// reported as such, a normal close as truncation. There is no fallback
/// source.
pub async fn collect_keystream(
    mut rx: mpsc::UnboundedReceiver<ProviderFrame>,
    total_size: u64,
    chunk_size: usize,
) -> Result<Keystream, KeystreamError> {
    let expected = expected_frames(total_size, chunk_size)?;
    let mut frames = Vec::with_capacity(expected);

    while frames.len() < expected {
        match rx.recv().await {
            Some(ProviderFrame::Binary(data)) => {
                let index = frames.len();
                let need = chunk_len(index as u32, total_size, chunk_size);
                if data.len() < need {
                    return Err(KeystreamError::FrameSize {
                        index,
                        expected: need,
                        got: data.len(),
                    });
                }
                frames.push(data);
            }
            Some(ProviderFrame::Closed { code }) if code == CLOSE_NORMAL => {
                return Err(KeystreamError::Truncated {
                    expected,
                    received: frames.len(),
                });
            }
            Some(ProviderFrame::Closed { code }) => {
                return Err(KeystreamError::AbnormalClose {
                    code,
                    received: frames.len(),
                });
            }
            None => {
                return Err(KeystreamError::ChannelDropped { received: frames.len() });
            }
        }
    }

    debug!(frames = frames.len(), total_size, "remote keystream complete");
    Ok(Keystream { frames })
}
