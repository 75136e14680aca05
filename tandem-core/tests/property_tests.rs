// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

use proptest::prelude::*;
use tandem_core::crypto::{EnvelopeEncryptor, KeyEncryptor};
use tandem_core::encoding::{decode_binary, BinaryEncoding};
use tandem_core::engine::{LocalEngine, ProtocolEngine};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn labelled_encoding_decodes_what_was_encoded(bytes in prop::collection::vec(any::<u8>(), 1..256)) {
        for encoding in [BinaryEncoding::Hex, BinaryEncoding::Base64] {
            let text = format!("  {}\n", encoding.encode(&bytes));
            prop_assert_eq!(decode_binary(&text, Some(encoding)).unwrap(), bytes.clone());
        }
    }

    #[test]
    fn hex_text_is_detected_as_hex(bytes in prop::collection::vec(any::<u8>(), 1..128)) {
        let text = hex::encode(&bytes);
        prop_assert_eq!(BinaryEncoding::detect(&text), BinaryEncoding::Hex);
        prop_assert_eq!(decode_binary(&text, None).unwrap(), bytes);
    }

    #[test]
    fn envelope_tokens_are_unique_and_open(
        key in prop::array::uniform32(any::<u8>()),
        share in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let encryptor = EnvelopeEncryptor::new(key);
        let a = encryptor.encrypt_share(&share).unwrap();
        let b = encryptor.encrypt_share(&share).unwrap();
        prop_assert_ne!(&a, &b);
        prop_assert_eq!(&encryptor.decrypt_share(&a).unwrap()[..], &share[..]);
    }

    #[test]
    fn envelope_rejects_foreign_key(
        key in prop::array::uniform32(any::<u8>()),
        other in prop::array::uniform32(any::<u8>()),
        share in prop::collection::vec(any::<u8>(), 1..128)
    ) {
        prop_assume!(key != other);
        let token = EnvelopeEncryptor::new(key).encrypt_share(&share).unwrap();
        prop_assert!(EnvelopeEncryptor::new(other).decrypt_share(&token).is_err());
    }

    #[test]
    fn import_rejects_arbitrary_blobs(blob in prop::collection::vec(any::<u8>(), 0..200)) {
        let ctx = LocalEngine.context();
        prop_assume!(blob.len() != 132);
        prop_assert!(ctx.import_key(&blob).is_err());
    }
}
