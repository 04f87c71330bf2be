use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::{state::AppState, utils::jwt::verify_access_token};

/// Query parameter carrying the token for WebSocket upgrades, where browsers
/// cannot set an Authorization header.
const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Resolves the caller to a [`Party`] and stores it in request extensions.
pub async fn auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .map(str::to_owned)
        .or_else(|| request.uri().query().and_then(token_from_query))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = verify_access_token(&token, &state.config.jwt_secret)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let party = claims.party().map_err(|_| StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(party);
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

fn parse_bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = rest.trim_start();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}

fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == ACCESS_TOKEN_PARAM)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(parse_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer_token("bearer   abc"), Some("abc"));
        assert_eq!(parse_bearer_token("Basic abc"), None);
        assert_eq!(parse_bearer_token("Bearer "), None);
    }

    #[test]
    fn token_read_from_query_string() {
        assert_eq!(
            token_from_query("foo=1&access_token=xyz"),
            Some("xyz".to_string())
        );
        assert_eq!(token_from_query("access_token="), None);
        assert_eq!(token_from_query("other=1"), None);
    }
}
