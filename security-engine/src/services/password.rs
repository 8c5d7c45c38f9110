use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString},
    Algorithm, Argon2, Params, Version,
};
use serde::Serialize;
use std::collections::HashSet;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::PasswordPolicyConfig;

/// Passwords rejected regardless of how they score.
const COMMON_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "password123",
    "passw0rd",
    "123456",
    "12345678",
    "123456789",
    "1234567890",
    "qwerty",
    "qwerty123",
    "qwertyuiop",
    "letmein",
    "welcome",
    "welcome1",
    "admin",
    "admin123",
    "administrator",
    "iloveyou",
    "monkey",
    "dragon",
    "football",
    "baseball",
    "sunshine",
    "princess",
    "trustno1",
    "superman",
    "changeme",
    "abc123",
    "111111",
    "000000",
];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "violation")]
pub enum PasswordViolation {
    #[error("must be at least {min} characters")]
    TooShort { min: usize },
    #[error("must be at most {max} characters")]
    TooLong { max: usize },
    #[error("must contain an uppercase letter")]
    MissingUppercase,
    #[error("must contain a lowercase letter")]
    MissingLowercase,
    #[error("must contain a digit")]
    MissingDigit,
    #[error("must contain a special character")]
    MissingSpecial,
    #[error("must not contain the username")]
    ContainsUsername,
    #[error("is too common")]
    CommonPassword,
    #[error("must not repeat a character three or more times in a row")]
    RepeatedCharacters,
    #[error("must not contain three or more sequential characters")]
    SequentialCharacters,
    #[error("was used recently")]
    RecentlyUsed,
}

/// Hashing, verification and strength policy for passwords.
#[derive(Clone)]
pub struct PasswordManager {
    policy: PasswordPolicyConfig,
    common: HashSet<String>,
}

impl PasswordManager {
    pub fn new(policy: PasswordPolicyConfig) -> Self {
        let common = COMMON_PASSWORDS
            .iter()
            .map(|p| p.to_string())
            .chain(policy.common_passwords.iter().map(|p| p.to_lowercase()))
            .collect();

        Self { policy, common }
    }

    pub fn policy(&self) -> &PasswordPolicyConfig {
        &self.policy
    }

    fn hasher(&self) -> Result<Argon2<'static>, anyhow::Error> {
        let params = Params::new(
            self.policy.argon_memory_kib,
            self.policy.argon_iterations,
            self.policy.argon_parallelism,
            Some(self.policy.argon_output_len),
        )
        .map_err(|e| anyhow::anyhow!("Invalid Argon2 parameters: {}", e))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Hash with a fresh salt. The result is a PHC string carrying its own parameters.
    pub fn hash(&self, password: &str) -> Result<String, anyhow::Error> {
        let salt = SaltString::generate(&mut OsRng);

        let hash = self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
            .to_string();

        Ok(hash)
    }

    /// Re-derives with the parameters embedded in `encoded`, so hashes made
    /// under an older policy still verify. Malformed input is a mismatch.
    pub fn verify(&self, password: &str, encoded: &str) -> bool {
        match derive_and_compare(password, encoded) {
            Ok(matched) => matched,
            Err(e) => {
                tracing::debug!(error = %e, "Password hash could not be checked");
                false
            }
        }
    }

    /// True when the password matches any of the given prior hashes.
    pub fn check_history(&self, password: &str, history: &[String]) -> bool {
        history.iter().any(|encoded| self.verify(password, encoded))
    }

    /// Every policy violation, not just the first.
    pub fn validate_strength(
        &self,
        password: &str,
        username: &str,
    ) -> Result<(), Vec<PasswordViolation>> {
        let mut violations = Vec::new();
        let length = password.chars().count();

        if length < self.policy.min_length {
            violations.push(PasswordViolation::TooShort {
                min: self.policy.min_length,
            });
        }
        if length > self.policy.max_length {
            violations.push(PasswordViolation::TooLong {
                max: self.policy.max_length,
            });
        }

        let classes = CharClasses::of(password);
        if self.policy.require_uppercase && !classes.upper {
            violations.push(PasswordViolation::MissingUppercase);
        }
        if self.policy.require_lowercase && !classes.lower {
            violations.push(PasswordViolation::MissingLowercase);
        }
        if self.policy.require_digit && !classes.digit {
            violations.push(PasswordViolation::MissingDigit);
        }
        if self.policy.require_special && !classes.special {
            violations.push(PasswordViolation::MissingSpecial);
        }

        let lowered = password.to_lowercase();
        if !username.is_empty() && lowered.contains(&username.to_lowercase()) {
            violations.push(PasswordViolation::ContainsUsername);
        }
        if self.common.contains(&lowered) {
            violations.push(PasswordViolation::CommonPassword);
        }
        if has_repeated_run(password) {
            violations.push(PasswordViolation::RepeatedCharacters);
        }
        if has_sequential_run(&lowered) {
            violations.push(PasswordViolation::SequentialCharacters);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Strength meter in [0, 100]. Not a policy gate.
    pub fn score(&self, password: &str) -> u8 {
        if password.is_empty() {
            return 0;
        }

        let length = password.chars().count() as i32;
        let classes = CharClasses::of(password);

        // Up to 40 for length, 15 per character class.
        let mut score = (length * 3).min(40) + classes.count() as i32 * 15;

        let lowered = password.to_lowercase();
        if self.common.contains(&lowered) {
            score -= 50;
        }
        if has_repeated_run(password) {
            score -= 15;
        }
        if has_sequential_run(&lowered) {
            score -= 15;
        }
        let distinct = password.chars().collect::<HashSet<_>>().len() as i32;
        if distinct * 2 < length {
            score -= 10;
        }

        score.clamp(0, 100) as u8
    }
}

fn derive_and_compare(password: &str, encoded: &str) -> Result<bool, anyhow::Error> {
    let parsed = PasswordHash::new(encoded).map_err(|e| anyhow::anyhow!("parse: {}", e))?;
    let expected = parsed
        .hash
        .ok_or_else(|| anyhow::anyhow!("hash has no digest"))?;
    let salt = parsed
        .salt
        .ok_or_else(|| anyhow::anyhow!("hash has no salt"))?;

    let algorithm =
        Algorithm::try_from(parsed.algorithm).map_err(|e| anyhow::anyhow!("algorithm: {}", e))?;
    let version = match parsed.version {
        Some(v) => Version::try_from(v).map_err(|e| anyhow::anyhow!("version: {}", e))?,
        None => Version::V0x13,
    };
    let params = Params::try_from(&parsed).map_err(|e| anyhow::anyhow!("params: {}", e))?;

    let mut salt_buf = [0u8; 64];
    let salt_bytes = salt
        .decode_b64(&mut salt_buf)
        .map_err(|e| anyhow::anyhow!("salt: {}", e))?;

    let mut derived = vec![0u8; expected.len()];
    Argon2::new(algorithm, version, params)
        .hash_password_into(password.as_bytes(), salt_bytes, &mut derived)
        .map_err(|e| anyhow::anyhow!("derive: {}", e))?;

    Ok(derived.ct_eq(expected.as_bytes()).into())
}

struct CharClasses {
    upper: bool,
    lower: bool,
    digit: bool,
    special: bool,
}

impl CharClasses {
    fn of(password: &str) -> Self {
        Self {
            upper: password.chars().any(|c| c.is_uppercase()),
            lower: password.chars().any(|c| c.is_lowercase()),
            digit: password.chars().any(|c| c.is_ascii_digit()),
            special: password
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace()),
        }
    }

    fn count(&self) -> u8 {
        [self.upper, self.lower, self.digit, self.special]
            .iter()
            .filter(|present| **present)
            .count() as u8
    }
}

/// Same character three or more times in a row.
fn has_repeated_run(password: &str) -> bool {
    let chars: Vec<char> = password.chars().collect();
    chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

/// Three ascending or descending neighbours such as `abc`, `321`.
fn has_sequential_run(password: &str) -> bool {
    let chars: Vec<char> = password.chars().collect();
    chars.windows(3).any(|w| {
        if !w.iter().all(|c| c.is_ascii_alphanumeric()) {
            return false;
        }
        let (a, b, c) = (w[0] as i32, w[1] as i32, w[2] as i32);
        (b - a == 1 && c - b == 1) || (a - b == 1 && b - c == 1)
    })
}
