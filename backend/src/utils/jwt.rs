use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::party::{Party, Role};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // party uuid
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

impl Claims {
    pub fn new(party: Party, expiration_hours: u64) -> Self {
        let now = Utc::now();
        let exp = now + Duration::hours(expiration_hours as i64);

        Self {
            sub: party.uuid().to_string(),
            role: party.role(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    /// The party this token was issued to.
    pub fn party(&self) -> anyhow::Result<Party> {
        let id = Uuid::parse_str(&self.sub)
            .map_err(|e| anyhow::anyhow!("Invalid subject in token: {}", e))?;
        Ok(Party::from_parts(id, self.role))
    }
}

pub fn create_access_token(
    party: Party,
    secret: &str,
    expiration_hours: u64,
) -> anyhow::Result<String> {
    let claims = Claims::new(party, expiration_hours);
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?;

    Ok(token)
}

pub fn verify_access_token(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let validation = Validation::default();
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &validation,
    )?;

    Ok(token_data.claims)
}
