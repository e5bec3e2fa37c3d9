use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use acquira_core::card::{luhn_valid, CardExpiry, Pan};
use acquira_core::constants::TOKEN_MAX_COLLISION_RETRIES;
use acquira_core::error::GatewayError;
use acquira_core::records::CardTokenRecord;
use acquira_core::types::{now_ts, TokenId};
use acquira_hsm::{HsmKeyService, AES_256_GCM};
use acquira_store::GatewayDb;

/// Key id under which the vault's encryption key lives in the HSM.
const VAULT_KEY_ID: &str = "card-vault";

/// The PAN-to-token vault. One write path, guarded by a token-uniqueness
/// reservation in the store; reads go straight to the token trees.
pub struct TokenVault {
    db: Arc<GatewayDb>,
    hsm: Arc<HsmKeyService>,
}

impl TokenVault {
    /// Ensure the vault key exists and return the vault.
    pub fn new(db: Arc<GatewayDb>, hsm: Arc<HsmKeyService>) -> Result<Self, GatewayError> {
        match hsm.generate_key(VAULT_KEY_ID, AES_256_GCM) {
            Ok(_) | Err(GatewayError::KeyExists(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(Self { db, hsm })
    }

    /// Tokenize a validated card. The CVV is format-checked and discarded —
    /// it is never persisted. A live token for the same PAN is reused.
    pub fn tokenize(
        &self,
        pan: &Pan,
        expiry: CardExpiry,
        cvv: &str,
    ) -> Result<CardTokenRecord, GatewayError> {
        validate_cvv(cvv)?;

        let pan_hash = hash_pan(pan);
        let now = now_ts();

        if let Some(existing) = self.db.find_token_by_hash(&pan_hash)? {
            if existing.active && existing.expires_at > now {
                debug!(token_id = %existing.token_id, "reusing live token");
                return Ok(existing);
            }
        }

        let token = self.reserve_fresh_token(pan)?;

        // pan|MM/YYYY, bound to the token via AAD so a blob cannot be
        // replayed under a different token.
        let plaintext = format!("{}|{:02}/{}", pan.digits(), expiry.month, expiry.year);
        let blob = self.hsm.encrypt(VAULT_KEY_ID, plaintext.as_bytes(), token.as_bytes())?;

        let record = CardTokenRecord {
            token_id: TokenId::generate(),
            token,
            pan_hash,
            encrypted_pan: blob.ciphertext,
            nonce: blob.nonce,
            key_version: blob.key_version,
            brand: pan.brand().as_str().to_string(),
            last_four: pan.last_four(),
            active: true,
            created_at: now,
            expires_at: expiry.expires_at(),
        };
        self.db.put_token(&record)?;
        debug!(token_id = %record.token_id, brand = %record.brand, "tokenized card");
        Ok(record)
    }

    /// True when a live (active, unexpired) token already exists for `pan`.
    pub fn has_live_token(&self, pan: &Pan) -> Result<bool, GatewayError> {
        let now = now_ts();
        Ok(self
            .db
            .find_token_by_hash(&hash_pan(pan))?
            .map(|r| r.active && r.expires_at > now)
            .unwrap_or(false))
    }

    /// Recover the PAN and expiry behind a token. Every rejection is audited.
    pub fn detokenize(&self, token: &str) -> Result<(Pan, CardExpiry), GatewayError> {
        let record = self.lookup_live(token, "detokenize")?;

        let plain = self.hsm.decrypt(
            VAULT_KEY_ID,
            &record.encrypted_pan,
            &record.nonce,
            token.as_bytes(),
            record.key_version,
        )?;
        let text = std::str::from_utf8(&plain)
            .map_err(|_| GatewayError::Internal("corrupt vault plaintext".into()))?;
        let (digits, expiry) = text
            .split_once('|')
            .ok_or_else(|| GatewayError::Internal("corrupt vault plaintext".into()))?;
        let (month, year) = expiry
            .split_once('/')
            .ok_or_else(|| GatewayError::Internal("corrupt vault plaintext".into()))?;
        let month: u8 = month
            .parse()
            .map_err(|_| GatewayError::Internal("corrupt vault plaintext".into()))?;
        let year: u16 = year
            .parse()
            .map_err(|_| GatewayError::Internal("corrupt vault plaintext".into()))?;

        let pan = Pan::parse(digits)?;
        Ok((pan, CardExpiry { month, year }))
    }

    /// True when the token exists, is active and unexpired.
    pub fn validate_token(&self, token: &str) -> bool {
        self.lookup_live(token, "validate").is_ok()
    }

    /// Deactivate a token. Revoking an unknown token is a no-op so saga
    /// compensation can fire unconditionally.
    pub fn revoke_token(&self, token: &str) -> Result<(), GatewayError> {
        if let Some(mut record) = self.db.get_token(token)? {
            record.active = false;
            self.db.put_token(&record)?;
            debug!(token_id = %record.token_id, "token revoked");
        }
        Ok(())
    }

    fn lookup_live(&self, token: &str, op: &str) -> Result<CardTokenRecord, GatewayError> {
        if token.is_empty() || !well_formed(token) {
            warn!(op, "rejected malformed token");
            return Err(GatewayError::MalformedToken);
        }
        let record = match self.db.get_token(token)? {
            Some(r) => r,
            None => {
                warn!(op, "rejected unknown token");
                return Err(GatewayError::TokenNotFound);
            }
        };
        if !record.active {
            warn!(op, token_id = %record.token_id, "rejected revoked token");
            return Err(GatewayError::TokenRevoked);
        }
        if record.expires_at <= now_ts() {
            warn!(op, token_id = %record.token_id, "rejected expired token");
            return Err(GatewayError::TokenExpired);
        }
        Ok(record)
    }

    /// Generate and atomically reserve a fresh format-preserving token:
    /// `'9' + random_digits(len-5) + last_four`. Collisions regenerate, with
    /// a bound that only astronomically unlucky RNG output can hit.
    fn reserve_fresh_token(&self, pan: &Pan) -> Result<String, GatewayError> {
        for _ in 0..TOKEN_MAX_COLLISION_RETRIES {
            let candidate = generate_token_value(pan);
            if self.db.reserve_token(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(GatewayError::TokenSpaceExhausted)
    }
}

fn validate_cvv(cvv: &str) -> Result<(), GatewayError> {
    if !(3..=4).contains(&cvv.len()) || !cvv.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::InvalidCard("cvv must be 3-4 digits".into()));
    }
    Ok(())
}

fn hash_pan(pan: &Pan) -> String {
    hex::encode(Sha256::digest(pan.digits().as_bytes()))
}

fn well_formed(token: &str) -> bool {
    (13..=19).contains(&token.len())
        && token.starts_with('9')
        && token.bytes().all(|b| b.is_ascii_digit())
}

/// Build one candidate token value. Never Luhn-valid: if the candidate
/// happens to pass Luhn, bumping a single middle digit by one is guaranteed
/// to break the checksum.
fn generate_token_value(pan: &Pan) -> String {
    let len = pan.len();
    let mut rng = rand::thread_rng();
    let mut digits: Vec<u8> = Vec::with_capacity(len);
    digits.push(b'9');
    for _ in 0..len - 5 {
        digits.push(b'0' + rng.gen_range(0..10u8));
    }
    digits.extend_from_slice(pan.last_four().as_bytes());

    let mut token = String::from_utf8(digits).expect("ascii digits");
    if luhn_valid(&token) {
        let mut bytes = token.into_bytes();
        let d = bytes[1] - b'0';
        bytes[1] = b'0' + (d + 1) % 10;
        token = String::from_utf8(bytes).expect("ascii digits");
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_NOW: i64 = 1_780_272_000; // 2026-06-01

    fn vault() -> TokenVault {
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let hsm = Arc::new(HsmKeyService::new());
        TokenVault::new(db, hsm).unwrap()
    }

    fn pan() -> Pan {
        Pan::parse("4532015112830366").unwrap()
    }

    fn expiry() -> CardExpiry {
        CardExpiry::parse(12, 2030, TEST_NOW).unwrap()
    }

    #[test]
    fn tokenize_detokenize_round_trip() {
        let v = vault();
        let rec = v.tokenize(&pan(), expiry(), "123").unwrap();
        let (got_pan, got_exp) = v.detokenize(&rec.token).unwrap();
        assert_eq!(got_pan.digits(), pan().digits());
        assert_eq!(got_exp, expiry());
    }

    #[test]
    fn token_format_invariants() {
        let v = vault();
        let p = pan();
        let rec = v.tokenize(&p, expiry(), "123").unwrap();
        assert_eq!(rec.token.len(), p.len());
        assert!(rec.token.starts_with('9'));
        assert!(rec.token.ends_with(&p.last_four()));
        assert!(!luhn_valid(&rec.token), "token must not be Luhn-valid");
        assert_ne!(rec.token, p.digits().to_string());
    }

    #[test]
    fn generated_tokens_never_pass_luhn() {
        let p = pan();
        for _ in 0..500 {
            let t = generate_token_value(&p);
            assert!(!luhn_valid(&t), "{t} passes Luhn");
            assert_eq!(t.len(), p.len());
            assert!(t.starts_with('9'));
        }
    }

    #[test]
    fn same_pan_reuses_live_token() {
        let v = vault();
        let a = v.tokenize(&pan(), expiry(), "123").unwrap();
        let b = v.tokenize(&pan(), expiry(), "123").unwrap();
        assert_eq!(a.token, b.token);
    }

    #[test]
    fn distinct_pans_get_distinct_tokens() {
        let v = vault();
        let pans = ["4532015112830366", "4111111111111111", "5555555555554444", "371449635398431"];
        let mut tokens = std::collections::HashSet::new();
        for digits in pans {
            let p = Pan::parse(digits).unwrap();
            let rec = v.tokenize(&p, expiry(), "123").unwrap();
            assert!(tokens.insert(rec.token), "duplicate token for {digits}");
        }
    }

    #[test]
    fn invalid_tokens_are_typed_rejections() {
        let v = vault();
        assert!(matches!(v.detokenize(""), Err(GatewayError::MalformedToken)));
        assert!(matches!(v.detokenize("12345"), Err(GatewayError::MalformedToken)));
        assert!(matches!(
            v.detokenize("9532015112830366"),
            Err(GatewayError::TokenNotFound)
        ));

        let rec = v.tokenize(&pan(), expiry(), "123").unwrap();
        v.revoke_token(&rec.token).unwrap();
        assert!(matches!(v.detokenize(&rec.token), Err(GatewayError::TokenRevoked)));
        assert!(!v.validate_token(&rec.token));
    }

    #[test]
    fn revoked_token_is_not_reused() {
        let v = vault();
        let a = v.tokenize(&pan(), expiry(), "123").unwrap();
        v.revoke_token(&a.token).unwrap();
        let b = v.tokenize(&pan(), expiry(), "123").unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn cvv_is_format_checked() {
        let v = vault();
        assert!(v.tokenize(&pan(), expiry(), "12").is_err());
        assert!(v.tokenize(&pan(), expiry(), "abcd").is_err());
        assert!(v.tokenize(&pan(), expiry(), "1234").is_ok());
    }
}
