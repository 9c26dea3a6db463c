//! Client-facing Basic authentication for the local proxy.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use http::header::PROXY_AUTHORIZATION;
use http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Username clients must present. The password is generated per run.
pub const PROXY_USERNAME: &str = "toolgate";

pub(crate) const PROXY_REALM: &str = "toolgate";

/// Fresh random password, safe to embed in a proxy URL.
pub(crate) fn generate_password() -> Result<SecretString> {
    let mut bytes = [0u8; 24];
    getrandom::fill(&mut bytes)
        .map_err(|e| Error::Proxy(format!("failed to generate proxy password: {}", e)))?;
    Ok(SecretString::from(URL_SAFE_NO_PAD.encode(bytes)))
}

/// True when `headers` carry `Proxy-Authorization: Basic` with our username
/// and `password`.
pub(crate) fn is_authorized(headers: &HeaderMap, password: &SecretString) -> bool {
    let Some(value) = headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, encoded)) = value.trim().split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Some(sep) = decoded.iter().position(|b| *b == b':') else {
        return false;
    };
    let (user, pass) = (&decoded[..sep], &decoded[sep + 1..]);

    let user_ok = user.ct_eq(PROXY_USERNAME.as_bytes());
    let pass_ok = pass.ct_eq(password.expose_secret().as_bytes());
    (user_ok & pass_ok).into()
}
