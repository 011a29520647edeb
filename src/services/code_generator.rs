use ring::rand::{SecureRandom, SystemRandom};

/// Length of every gift card code
pub const CODE_LENGTH: usize = 12;

/// Uppercase letters and digits without the look-alikes 0/O and 1/I.
/// 32 symbols, so `byte % 32` maps random bytes onto it without bias.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(thiserror::Error, Debug)]
pub enum CodeGenerationError {
    #[error("Secure random source unavailable")]
    RandomUnavailable,
}

/// Source of candidate bearer codes
pub trait CodeSource: Send + Sync {
    fn generate(&self) -> Result<String, CodeGenerationError>;
}

/// Draws codes from the operating system CSPRNG
#[derive(Clone)]
pub struct SecureCodeGenerator {
    rng: SystemRandom,
}

impl SecureCodeGenerator {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SecureCodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeSource for SecureCodeGenerator {
    fn generate(&self) -> Result<String, CodeGenerationError> {
        let mut bytes = [0u8; CODE_LENGTH];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| CodeGenerationError::RandomUnavailable)?;

        let alphabet_len = CODE_ALPHABET.len();
        Ok(bytes
            .iter()
            .map(|b| CODE_ALPHABET[*b as usize % alphabet_len] as char)
            .collect())
    }
}

/// Checks length and alphabet of a code
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_code_shape() {
        let generator = SecureCodeGenerator::new();

        for _ in 0..200 {
            let code = generator.generate().unwrap();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(is_valid_code(&code), "unexpected code {}", code);
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for c in [b'0', b'O', b'1', b'I'] {
            assert!(!CODE_ALPHABET.contains(&c));
        }
        let unique: HashSet<_> = CODE_ALPHABET.iter().collect();
        assert_eq!(unique.len(), 32);
    }

    #[test]
    fn test_codes_do_not_repeat() {
        let generator = SecureCodeGenerator::new();
        let codes: HashSet<String> = (0..1000).map(|_| generator.generate().unwrap()).collect();

        assert_eq!(codes.len(), 1000);
    }

    #[test]
    fn test_is_valid_code_rejects_bad_input() {
        assert!(is_valid_code("ABCDEFGH2345"));
        assert!(!is_valid_code("ABCDEFGH234"));
        assert!(!is_valid_code("ABCDEFGH23450"));
        assert!(!is_valid_code("abcdefgh2345"));
        assert!(!is_valid_code("ABCDEFGH234O"));
    }
}
