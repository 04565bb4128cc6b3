use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use murmur_db::Database;
use murmur_types::api::{CreateTenantRequest, CreateTenantResponse, Page, TenantSummary};
use murmur_types::models::Tenant;

use crate::error::ApiError;
use crate::{AppState, blocking};

const MAX_CODE_LEN: usize = 32;
const MAX_NAME_LEN: usize = 100;
const SECRET_ATTEMPTS: usize = 5;

pub async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    let code = req.code.trim().to_string();
    validate_tenant(&name, &code)?;

    let tenant = blocking(&state, move |db| {
        if db.tenant_by_code(&code)?.is_some() {
            return Ok(None);
        }
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name,
            code,
            secret_key: unique_secret(db)?,
            is_active: true,
            created_at: Utc::now(),
        };
        db.create_tenant(&tenant)?;
        Ok(Some(tenant))
    })
    .await?
    .ok_or_else(|| ApiError::Conflict("Tenant code already in use".into()))?;

    info!("Created tenant {} ({})", tenant.code, tenant.id);
    Ok((
        StatusCode::CREATED,
        Json(CreateTenantResponse {
            id: tenant.id,
            code: tenant.code,
            secret_key: tenant.secret_key,
        }),
    ))
}

pub async fn list_tenants(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let tenants = blocking(&state, |db| db.list_tenants()).await?;
    let data = tenants
        .into_iter()
        .map(|t| TenantSummary {
            id: t.id,
            name: t.name,
            code: t.code,
            is_active: t.is_active,
            created_at: t.created_at,
        })
        .collect();
    Ok(Json(Page { data, metadata: None }))
}

fn validate_tenant(name: &str, code: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "\"name\" must be between 1 and {} characters",
            MAX_NAME_LEN
        )));
    }
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(ApiError::BadRequest(format!(
            "\"code\" must be between 1 and {} characters",
            MAX_CODE_LEN
        )));
    }
    // The code is embedded in fast-store keys, so ':' is never allowed.
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ApiError::BadRequest(
            "\"code\" may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

/// A random secret, URL-safe so clients can pass it as a query parameter.
fn generate_secret() -> String {
    let mut noise = [0u8; 32];
    rand::rng().fill_bytes(&mut noise);

    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(noise);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn unique_secret(db: &Database) -> anyhow::Result<String> {
    for _ in 0..SECRET_ATTEMPTS {
        let secret = generate_secret();
        if !db.secret_key_exists(&secret)? {
            return Ok(secret);
        }
    }
    anyhow::bail!("could not generate a unique secret key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_codes_are_key_safe() {
        assert!(validate_tenant("Acme", "acme-01_x").is_ok());
        assert!(validate_tenant("Acme", "ac:me").is_err());
        assert!(validate_tenant("Acme", "ac me").is_err());
        assert!(validate_tenant("Acme", "").is_err());
        assert!(validate_tenant("", "acme").is_err());
        assert!(validate_tenant("Acme", &"a".repeat(MAX_CODE_LEN + 1)).is_err());
    }

    #[test]
    fn secrets_are_url_safe_and_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
