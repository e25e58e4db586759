//! Password Service
//!
//! Argon2id hashing (OWASP parameters) with an optional pepper, plus the
//! minimum strength rules applied at registration, reset and change.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params, Version,
};
use zeroize::Zeroizing;

use crate::config::PasswordConfig;
use crate::error::{AuthError, AuthResult};

const COMMON_PASSWORDS: &[&str] = &[
    "password", "123456", "12345678", "qwerty", "abc123", "letmein", "trustno1", "iloveyou",
    "welcome", "admin", "sunshine", "123123", "654321", "password1", "fleetgate",
];

/// Password hashing and verification
#[derive(Clone)]
pub struct PasswordService {
    config: PasswordConfig,
}

impl PasswordService {
    pub fn new(config: PasswordConfig) -> Self {
        Self { config }
    }

    /// Validate strength, then hash with Argon2id
    pub fn hash_password(&self, password: &str) -> AuthResult<String> {
        self.validate_password_strength(password)?;

        let peppered = self.pepper(password);
        let salt = SaltString::generate(&mut OsRng);

        let hash = self
            .argon2()?
            .hash_password(peppered.as_bytes(), &salt)
            .map_err(|_| AuthError::PasswordHashingFailed)?;

        Ok(hash.to_string())
    }

    /// Check a password against a stored PHC string
    ///
    /// `Ok(false)` means the password is wrong; `Err` means the stored hash is unusable.
    pub fn verify_password(&self, password: &str, hash: &str) -> AuthResult<bool> {
        let peppered = self.pepper(password);
        let parsed = PasswordHash::new(hash).map_err(|_| AuthError::PasswordHashingFailed)?;

        // Parameters come from the PHC string itself
        match Argon2::default().verify_password(peppered.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reject a password that breaks any policy rule
    pub fn validate_password_strength(&self, password: &str) -> AuthResult<()> {
        let violations = self.policy_violations(password);
        if violations.is_empty() {
            return Ok(());
        }
        Err(AuthError::WeakPassword(violations.join("; ")))
    }

    /// Every policy rule `password` breaks, in a stable order
    pub fn policy_violations(&self, password: &str) -> Vec<String> {
        let policy = &self.config;
        let length = password.chars().count();
        let contains = |class: fn(&char) -> bool| password.chars().any(|c| class(&c));

        let mut violations = Vec::new();
        if length < policy.min_password_length {
            violations.push(format!("needs at least {} characters", policy.min_password_length));
        }
        if length > policy.max_password_length {
            violations.push(format!("exceeds {} characters", policy.max_password_length));
        }

        let classes: [(bool, fn(&char) -> bool, &str); 3] = [
            (policy.require_uppercase, |c| c.is_uppercase(), "needs an uppercase letter"),
            (policy.require_lowercase, |c| c.is_lowercase(), "needs a lowercase letter"),
            (policy.require_digit, char::is_ascii_digit, "needs a digit"),
        ];
        violations.extend(
            classes
                .iter()
                .filter(|(required, class, _)| *required && !contains(*class))
                .map(|(_, _, rule)| rule.to_string()),
        );

        let folded = password.to_lowercase();
        if let Some(word) = COMMON_PASSWORDS.iter().find(|w| folded.contains(**w)) {
            violations.push(format!("contains the common password \"{word}\""));
        }

        violations
    }

    /// Whether a stored hash was made with other parameters than the current ones
    pub fn needs_rehash(&self, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return true;
        };
        if parsed.algorithm != argon2::ARGON2ID_IDENT {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() != self.config.memory_cost
                    || params.t_cost() != self.config.time_cost
                    || params.p_cost() != self.config.parallelism
            }
            Err(_) => true,
        }
    }

    fn argon2(&self) -> AuthResult<Argon2<'static>> {
        let params = Params::new(
            self.config.memory_cost,
            self.config.time_cost,
            self.config.parallelism,
            None,
        )
        .map_err(|e| AuthError::Config(format!("invalid Argon2 params: {e}")))?;

        Ok(Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params))
    }

    fn pepper(&self, password: &str) -> Zeroizing<String> {
        match self.config.pepper {
            Some(ref pepper) => Zeroizing::new(format!("{password}{pepper}")),
            None => Zeroizing::new(password.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PasswordConfig {
        PasswordConfig {
            // Cheap parameters keep tests fast
            memory_cost: 4096,
            time_cost: 1,
            parallelism: 1,
            min_password_length: 8,
            ..PasswordConfig::default()
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let service = PasswordService::new(test_config());
        let hash = service.hash_password("Dispatch0rRoute9").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(service.verify_password("Dispatch0rRoute9", &hash).unwrap());
        assert!(!service.verify_password("Dispatch0rRoute8", &hash).unwrap());
    }

    #[test]
    fn test_pepper_is_required_to_verify() {
        let mut config = test_config();
        config.pepper = Some("depot-pepper".to_string());
        let peppered = PasswordService::new(config);

        let hash = peppered.hash_password("Dispatch0rRoute9").unwrap();
        assert!(peppered.verify_password("Dispatch0rRoute9", &hash).unwrap());

        let plain = PasswordService::new(test_config());
        assert!(!plain.verify_password("Dispatch0rRoute9", &hash).unwrap());
    }

    #[test]
    fn test_strength_rules() {
        let service = PasswordService::new(test_config());

        assert!(service.validate_password_strength("Forklift42Yard").is_ok());
        assert!(service.validate_password_strength("Short1").is_err());
        assert!(service.validate_password_strength("forklift42yard").is_err());
        assert!(service.validate_password_strength("FORKLIFT42YARD").is_err());
        assert!(service.validate_password_strength("ForkliftYard").is_err());
        assert_eq!(
            service.policy_violations("Fleetgate2024"),
            vec!["contains the common password \"fleetgate\"".to_string()]
        );

        match service.validate_password_strength("short") {
            Err(AuthError::WeakPassword(msg)) => {
                assert_eq!(
                    msg,
                    "needs at least 8 characters; needs an uppercase letter; needs a digit"
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_hash_is_an_error() {
        let service = PasswordService::new(test_config());
        assert!(service.verify_password("Forklift42Yard", "not-a-phc-string").is_err());
    }

    #[test]
    fn test_needs_rehash_on_param_change() {
        let service = PasswordService::new(test_config());
        let hash = service.hash_password("Forklift42Yard").unwrap();
        assert!(!service.needs_rehash(&hash));

        let stronger = PasswordService::new(PasswordConfig {
            time_cost: 3,
            ..test_config()
        });
        assert!(stronger.needs_rehash(&hash));
        assert!(stronger.needs_rehash("garbage"));
    }

    #[test]
    fn test_same_password_different_salts() {
        let service = PasswordService::new(test_config());
        let a = service.hash_password("Forklift42Yard").unwrap();
        let b = service.hash_password("Forklift42Yard").unwrap();
        assert_ne!(a, b);
    }
}
