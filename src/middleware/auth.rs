//! Admin session middleware.
//!
//! This middleware intercepts every admin request to:
//! 1. Extract the session token from the Authorization header
//! 2. Verify its signature and expiry
//! 3. Inject the session claims into the request
//! 4. Reject anything else with HTTP 401

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{AppState, error::AppError};

/// Admin session middleware function.
///
/// # Flow
///
/// 1. Extract `Authorization: Bearer <token>` header from request
/// 2. Verify the token with the configured `SessionSigner`
/// 3. If valid: insert `AdminClaims` into request extensions, call next handler
/// 4. If not: return 401 Unauthorized error
///
/// Handlers read the claims with `Extension<AdminClaims>`.
pub async fn admin_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let claims = state.sessions.verify(token.trim())?;

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
