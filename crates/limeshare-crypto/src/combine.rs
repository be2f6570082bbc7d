use std::fmt;
use std::sync::Arc;

/// A strategy for `out[i] = data[i] ^ a[i] ^ b[i]`.
///
/// Key bytes past the end of a key count as zero. Every implementation must
/// produce exactly the bytes `ByteKernel` produces.
pub trait CombineKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// `out.len()` must equal `data.len()`.
    fn combine_into(&self, data: &[u8], a: &[u8], b: &[u8], out: &mut [u8]);
}

/// Reference byte loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteKernel;

impl CombineKernel for ByteKernel {
    fn name(&self) -> &'static str {
        "byte"
    }

    fn combine_into(&self, data: &[u8], a: &[u8], b: &[u8], out: &mut [u8]) {
        byte_range(data, a, b, out, 0);
    }
}

/// Eight bytes per step over the prefix both keys cover, byte loop for the rest.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordKernel;

impl CombineKernel for WordKernel {
    fn name(&self) -> &'static str {
        "word"
    }

    fn combine_into(&self, data: &[u8], a: &[u8], b: &[u8], out: &mut [u8]) {
        let covered = data.len().min(a.len()).min(b.len());
        let words = covered - covered % 8;

        for (((o, d), ka), kb) in out[..words]
            .chunks_exact_mut(8)
            .zip(data[..words].chunks_exact(8))
            .zip(a[..words].chunks_exact(8))
            .zip(b[..words].chunks_exact(8))
        {
            o.copy_from_slice(&(load(d) ^ load(ka) ^ load(kb)).to_ne_bytes());
        }

        byte_range(data, a, b, out, words);
    }
}

#[inline]
fn load(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_ne_bytes(word)
}

#[inline]
fn byte_range(data: &[u8], a: &[u8], b: &[u8], out: &mut [u8], from: usize) {
    for i in from..data.len() {
        out[i] = data[i] ^ a.get(i).copied().unwrap_or(0) ^ b.get(i).copied().unwrap_or(0);
    }
}

/// XOR combiner for the split-key pad. Cheap to clone.
#[derive(Clone)]
pub struct SplitKeyCipher {
    kernel: Arc<dyn CombineKernel>,
}

impl SplitKeyCipher {
    pub fn new(kernel: impl CombineKernel + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
        }
    }

    /// Encrypts plaintext or decrypts ciphertext; the operation is its own inverse.
    pub fn combine(&self, data: &[u8], key_a: &[u8], key_b: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; data.len()];
        self.kernel.combine_into(data, key_a, key_b, &mut out);
        out
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }
}

impl Default for SplitKeyCipher {
    fn default() -> Self {
        Self::new(WordKernel)
    }
}

impl fmt::Debug for SplitKeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitKeyCipher").field("kernel", &self.kernel.name()).finish()
    }
}
