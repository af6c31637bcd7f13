// For reference on JWT specification for APNs: https://developer.apple.com/documentation/usernotifications/setting_up_a_remote_notification_server/establishing_a_token-based_connection_to_apns
// also check out Apple's JSON Web Token Validator tool on their Push Notifications dashboard

use std::fs;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine};
use openssl::{ecdsa::EcdsaSig, hash::MessageDigest, pkey::{PKey, Private}, sign::Signer};
use thiserror::Error;

use crate::config::ApnsSettings;

/// Needs refresh between 20-60 minutes
pub const AUTH_TOKEN_REFRESH_RATE: Duration = Duration::from_secs(60 * 50);

/// ES256 signatures are r and s, each left padded to 32 bytes.
const ES256_COMPONENT_LEN: i32 = 32;

pub struct AuthToken {
    pub token: String,
    jwt_header: String,
    jwt_claims: String,
    jwt_signed: String,
    team_id: String,
    key: PKey<Private>,
    issued_at: Instant,
}

impl AuthToken {
    pub fn new(settings: &ApnsSettings) -> Result<AuthToken, AuthTokenError> {
        let private_key_bytes = fs::read(&settings.auth_key_path).map_err(AuthTokenError::IO)?;
        let key = PKey::private_key_from_pem(&private_key_bytes).map_err(|_| AuthTokenError::BadPrivateKey)?;

        let jwt_header = AuthToken::generate_jwt_header(&settings.key_id);
        let jwt_claims = AuthToken::generate_jwt_claims(&settings.team_id)?;
        let jwt_signed = AuthToken::generate_jwt_signed(&jwt_header, &jwt_claims, &key)?;

        Ok(AuthToken {
            token: AuthToken::get_formatted_token(&jwt_header, &jwt_claims, &jwt_signed),
            jwt_header,
            jwt_claims,
            jwt_signed,
            team_id: settings.team_id.clone(),
            key,
            issued_at: Instant::now(),
        })
    }

    pub fn refresh(&mut self) -> Result<(), AuthTokenError> {
        self.jwt_claims = AuthToken::generate_jwt_claims(&self.team_id)?;
        self.jwt_signed = AuthToken::generate_jwt_signed(&self.jwt_header, &self.jwt_claims, &self.key)?;
        self.token = AuthToken::get_formatted_token(&self.jwt_header, &self.jwt_claims, &self.jwt_signed);
        self.issued_at = Instant::now();
        Ok(())
    }

    pub fn is_stale(&self) -> bool {
        self.issued_at.elapsed() >= AUTH_TOKEN_REFRESH_RATE
    }

    fn get_formatted_token(jwt_header: &str, jwt_claims: &str, jwt_signed: &str) -> String {
        format!("{jwt_header}.{jwt_claims}.{jwt_signed}")
    }

    fn generate_jwt_header(key_id: &str) -> String {
        general_purpose::URL_SAFE_NO_PAD.encode(
            format!("{{ \"alg\": \"ES256\", \"kid\": \"{}\" }}", key_id)
                .as_bytes()
        )
    }

    fn generate_jwt_claims(team_id: &str) -> Result<String, AuthTokenError> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthTokenError::Clock)?
            .as_secs();
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(
            format!("{{ \"iss\": \"{}\", \"iat\": {} }}", team_id, since_epoch)
                .as_bytes()
        ))
    }

    /// Signing using ECDSA
    fn generate_jwt_signed(header: &str, claims: &str, key: &PKey<Private>) -> Result<String, AuthTokenError> {
        let header_claims = format!("{header}.{claims}");

        let mut signer = Signer::new(MessageDigest::sha256(), key).map_err(|_| AuthTokenError::BadSignature)?;
        signer.update(header_claims.as_bytes()).map_err(|_| AuthTokenError::BadSignature)?;
        let der = signer.sign_to_vec().map_err(|_| AuthTokenError::BadSignature)?;

        // openssl hands back DER, JWS wants raw r || s
        let signature = EcdsaSig::from_der(&der).map_err(|_| AuthTokenError::BadSignature)?;
        let mut raw = signature.r().to_vec_padded(ES256_COMPONENT_LEN).map_err(|_| AuthTokenError::BadSignature)?;
        raw.extend(signature.s().to_vec_padded(ES256_COMPONENT_LEN).map_err(|_| AuthTokenError::BadSignature)?);

        Ok(general_purpose::URL_SAFE_NO_PAD.encode(raw))
    }
}

#[derive(Debug, Error)]
pub enum AuthTokenError {
    #[error("failed to read signing key: {0}")]
    IO(std::io::Error),
    #[error("signing key is not a valid PEM private key")]
    BadPrivateKey,
    #[error("could not sign token")]
    BadSignature,
    #[error("system clock is before the unix epoch")]
    Clock,
}
