/// Limeshare split-key one-time pad.
///
/// Every chunk is combined with two independently sourced keystreams:
/// A is generated locally by the host, B is streamed from a remote
/// provider. `ciphertext = plaintext ^ A ^ B`, so the same `combine`
/// call encrypts and decrypts.
///
/// Routing B over a direct peer link instead of the relay is best-effort
/// hardening: it keeps any single relay observer from seeing both
/// keystreams next to the ciphertext. It is not a cryptographic guarantee;
/// whoever can read both channels can read the file.

pub mod combine;
pub mod content;
pub mod keystream;

pub use combine::{ByteKernel, CombineKernel, SplitKeyCipher, WordKernel};
pub use content::{content_id, session_id_for, SESSION_ID_LEN};
pub use keystream::{collect_keystream, generate_local, Keystream, KeystreamError, ProviderFrame, CLOSE_NORMAL};
