//! BIP-39 mnemonic backup of wallet master keys.

use bip39::{Language, Mnemonic};
use rand::RngCore;
use tally_core::hd::HdPrivateKey;
use zeroize::{Zeroize, Zeroizing};

use crate::error::WalletError;

/// Generate a fresh English phrase of 12 or 24 words.
pub fn generate(words: usize) -> Result<Zeroizing<String>, WalletError> {
    let len = match words {
        12 => 16,
        24 => 32,
        other => {
            return Err(WalletError::InvalidMnemonic(format!(
                "unsupported word count {other}"
            )));
        }
    };
    let mut entropy = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut entropy[..len]);
    let m = Mnemonic::from_entropy_in(Language::English, &entropy[..len])
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()));
    entropy.zeroize();
    Ok(Zeroizing::new(m?.to_string()))
}

/// Parse a phrase, normalizing whitespace and case.
pub fn parse(phrase: &str) -> Result<Mnemonic, WalletError> {
    let normalized = Zeroizing::new(
        phrase
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    );
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Master key for `phrase` with an optional BIP-39 passphrase.
pub fn master_key(phrase: &str, passphrase: &str) -> Result<HdPrivateKey, WalletError> {
    let m = parse(phrase)?;
    let mut seed = m.to_seed(passphrase);
    let key = HdPrivateKey::from_seed(&seed);
    seed.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_phrase_lengths() {
        assert_eq!(generate(12).unwrap().split_whitespace().count(), 12);
        assert_eq!(generate(24).unwrap().split_whitespace().count(), 24);
        assert!(generate(15).is_err());
    }

    #[test]
    fn parse_normalizes() {
        let phrase = generate(12).unwrap();
        let messy = format!("  {}  ", phrase.to_uppercase().replace(' ', "   "));
        assert_eq!(parse(&messy).unwrap().to_string(), *phrase);
    }

    #[test]
    fn master_key_depends_on_passphrase() {
        let phrase = generate(24).unwrap();
        let a = master_key(&phrase, "").unwrap();
        let b = master_key(&phrase, "").unwrap();
        let c = master_key(&phrase, "extra").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn invalid_word_rejected() {
        let err = master_key("abandon abandon abandon invalidword", "").unwrap_err();
        assert!(err.to_string().contains("invalid mnemonic"), "{err}");
    }
}
