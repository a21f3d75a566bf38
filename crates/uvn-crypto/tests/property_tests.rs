use proptest::prelude::*;
use uvn_crypto::{
    EncryptionKeyPair, IdentityKeyPair, PassphraseEnvelope, PresharedKey, SealedEnvelope,
    WgKeyPair,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_wg_private_key_determines_public(_seed in any::<u64>()) {
        let pair = WgKeyPair::generate();
        let restored = WgKeyPair::from_private_base64(&pair.private_key_base64()).unwrap();
        prop_assert_eq!(restored.public_key_base64(), pair.public_key_base64());
    }

    #[test]
    fn prop_psk_base64_round_trip(_seed in any::<u64>()) {
        let psk = PresharedKey::generate();
        let restored = PresharedKey::from_base64(&psk.to_base64()).unwrap();
        prop_assert_eq!(restored, psk);
    }

    #[test]
    fn prop_passphrase_envelope_round_trip(data in prop::collection::vec(any::<u8>(), 0..2048),
                                           pass in "[a-zA-Z0-9!@#]{16,40}") {
        let envelope = PassphraseEnvelope::seal(&data, &pass).unwrap();
        prop_assert_eq!(envelope.open(&pass).unwrap(), data);
    }

    #[test]
    fn prop_passphrase_envelope_rejects_wrong_pass(data in prop::collection::vec(any::<u8>(), 1..256)) {
        let envelope = PassphraseEnvelope::seal(&data, "the right passphrase").unwrap();
        prop_assert!(envelope.open("the wrong passphrase").is_err());
    }

    #[test]
    fn prop_sealed_envelope_round_trip(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let recipient = EncryptionKeyPair::generate();
        let envelope = SealedEnvelope::seal(&data, &recipient.public_base64()).unwrap();
        prop_assert_eq!(envelope.open(&recipient).unwrap(), data);
    }

    #[test]
    fn prop_signatures_bind_data(data in prop::collection::vec(any::<u8>(), 1..1024),
                                 flip in 0usize..1024) {
        let key = IdentityKeyPair::generate();
        let signature = key.sign(&data, "prop");
        prop_assert!(signature.verify(&data).is_ok());

        let mut tampered = data.clone();
        let idx = flip % tampered.len();
        tampered[idx] ^= 0x01;
        prop_assert!(signature.verify(&tampered).is_err());
    }
}
