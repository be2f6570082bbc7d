//! Algebraic laws of the split-key pad, checked over arbitrary inputs.

use limeshare_crypto::{generate_local, ByteKernel, SplitKeyCipher, WordKernel};
use proptest::prelude::*;

fn equal_length_triple() -> impl Strategy<Value = (Vec<u8>, Vec<u8>, Vec<u8>)> {
    (0usize..2048).prop_flat_map(|len| {
        (
            prop::collection::vec(any::<u8>(), len),
            prop::collection::vec(any::<u8>(), len),
            prop::collection::vec(any::<u8>(), len),
        )
    })
}

proptest! {
    #[test]
    fn combine_twice_is_identity((data, a, b) in equal_length_triple()) {
        let cipher = SplitKeyCipher::default();
        let once = cipher.combine(&data, &a, &b);
        prop_assert_eq!(cipher.combine(&once, &a, &b), data);
    }

    #[test]
    fn kernels_agree_on_any_lengths(
        data in prop::collection::vec(any::<u8>(), 0..600),
        a in prop::collection::vec(any::<u8>(), 0..600),
        b in prop::collection::vec(any::<u8>(), 0..600),
    ) {
        let fast = SplitKeyCipher::new(WordKernel).combine(&data, &a, &b);
        let slow = SplitKeyCipher::new(ByteKernel).combine(&data, &a, &b);
        prop_assert_eq!(fast.len(), data.len());
        prop_assert_eq!(fast, slow);
    }

    #[test]
    fn key_order_does_not_matter((data, a, b) in equal_length_triple()) {
        let cipher = SplitKeyCipher::default();
        prop_assert_eq!(cipher.combine(&data, &a, &b), cipher.combine(&data, &b, &a));
    }
}

#[test]
fn decrypting_with_one_key_missing_does_not_recover_plaintext() {
    let plaintext: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let a = generate_local(plaintext.len() as u64, plaintext.len());
    let b = generate_local(plaintext.len() as u64, plaintext.len());
    let cipher = SplitKeyCipher::default();

    let ciphertext = cipher.combine(&plaintext, a.frame(0), b.frame(0));
    let half_open = cipher.combine(&ciphertext, a.frame(0), &[]);
    assert_ne!(half_open, plaintext);
    assert_eq!(cipher.combine(&ciphertext, a.frame(0), b.frame(0)), plaintext);
}
