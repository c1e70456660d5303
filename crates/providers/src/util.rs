//! Shared utility functions for provider adapters.

use tm_domain::config::AuthConfig;
use tm_domain::error::{Error, Result};

/// Most bytes of an error response body copied into the error message.
pub(crate) const ERROR_BODY_LIMIT: usize = 16 * 1024;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; a resolver refusal from the
/// hostname guard maps back to [`Error::HostNotAllowed`]; everything else
/// maps to [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::Timeout(e.to_string());
    }
    if let Some(host) = crate::network::blocked_host_in(&e) {
        return Error::HostNotAllowed { host };
    }
    Error::Http(e.to_string())
}

/// Turn a non-2xx response into a provider error carrying the status line
/// and at most [`ERROR_BODY_LIMIT`] bytes of the body.
pub(crate) async fn error_from_response(provider: &str, mut resp: reqwest::Response) -> Error {
    let status = resp.status();
    let mut body: Vec<u8> = Vec::new();
    while body.len() < ERROR_BODY_LIMIT {
        match resp.chunk().await {
            Ok(Some(bytes)) => body.extend_from_slice(&bytes),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(provider, error = %e, "error body read failed");
                break;
            }
        }
    }
    body.truncate(ERROR_BODY_LIMIT);
    Error::Provider {
        provider: provider.to_owned(),
        message: format!(
            "{} {}",
            status.as_u16(),
            String::from_utf8_lossy(&body).trim()
        ),
    }
}

/// Resolve the API key from an [`AuthConfig`].
///
/// Precedence:
/// 1. `key` field (plaintext, logs a warning)
/// 2. `service` + `account` → OS keychain via `keyring`
/// 3. `env` field (reads environment variable)
/// 4. Fallback for keychain mode: env var `{SERVICE}_{ACCOUNT}` uppercased
/// 5. Error
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!(
            "API key loaded from plaintext config field 'key'; \
             prefer 'env' or the keychain instead"
        );
        return Ok(key.clone());
    }

    if let (Some(ref service), Some(ref account)) = (&auth.service, &auth.account) {
        match resolve_from_keychain(service, account) {
            Ok(secret) => return Ok(secret),
            Err(e) => {
                tracing::warn!(
                    service = %service,
                    account = %account,
                    error = %e,
                    "keychain lookup failed, falling through to env"
                );
            }
        }
    }

    if let Some(ref env_var) = auth.env {
        return std::env::var(env_var).map_err(|_| {
            Error::Auth(format!(
                "environment variable '{}' not set or not valid UTF-8",
                env_var
            ))
        });
    }

    if let (Some(ref service), Some(ref account)) = (&auth.service, &auth.account) {
        let fallback_var = keychain_fallback_env_name(service, account);
        if let Ok(val) = std::env::var(&fallback_var) {
            tracing::info!(
                env_var = %fallback_var,
                "API key resolved from keychain headless fallback env var"
            );
            return Ok(val);
        }
    }

    Err(Error::Auth(
        "no API key configured: set 'key', 'env', or keychain \
         'service'+'account' in the service auth section"
            .into(),
    ))
}

/// Try to read a secret from the OS keychain.
pub fn resolve_from_keychain(service: &str, account: &str) -> Result<String> {
    let entry = keyring::Entry::new(service, account)
        .map_err(|e| Error::Auth(format!("keyring entry creation failed: {e}")))?;
    entry
        .get_password()
        .map_err(|e| Error::Auth(format!("keyring get_password failed: {e}")))
}

/// `("threadmind", "openai-key")` → `"THREADMIND_OPENAI_KEY"`.
pub fn keychain_fallback_env_name(service: &str, account: &str) -> String {
    format!(
        "{}_{}",
        service.to_uppercase().replace('-', "_"),
        account.to_uppercase().replace('-', "_"),
    )
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn trim_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_env_name_basic() {
        assert_eq!(
            keychain_fallback_env_name("threadmind", "openai-key"),
            "THREADMIND_OPENAI_KEY"
        );
    }

    #[test]
    fn plaintext_key_wins() {
        let auth = AuthConfig {
            key: Some("plaintext-wins".into()),
            env: Some("TM_TEST_SHOULD_NOT_BE_READ".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "plaintext-wins");
    }

    #[test]
    fn env_var_is_read() {
        let var_name = "TM_TEST_RESOLVE_ENV_KEY_4821";
        std::env::set_var(var_name, "env-secret-value");
        let auth = AuthConfig {
            env: Some(var_name.into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "env-secret-value");
        std::env::remove_var(var_name);
    }

    #[test]
    fn missing_env_var_names_it() {
        let auth = AuthConfig {
            env: Some("TM_TEST_NONEXISTENT_VAR_9313".into()),
            ..Default::default()
        };
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("TM_TEST_NONEXISTENT_VAR_9313"));
    }

    #[test]
    fn nothing_configured() {
        let err = resolve_api_key(&AuthConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no API key configured"));
    }

    #[test]
    fn keychain_headless_fallback() {
        let fallback_var = "THREADMIND_TEST_FALLBACK_PROVIDER";
        std::env::set_var(fallback_var, "fallback-secret");
        let auth = AuthConfig {
            service: Some("threadmind".into()),
            account: Some("test-fallback-provider".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "fallback-secret");
        std::env::remove_var(fallback_var);
    }

    #[test]
    fn base_url_trimmed() {
        assert_eq!(trim_base_url("https://api.openai.com/v1/ "), "https://api.openai.com/v1");
    }
}
