use crate::error::{LifecycleError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use grimoire_home::{resolve_placeholders, EnvFile};
use grimoire_spellbook::AuthConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Supplies request headers for one HTTP/SSE connection attempt.
/// Token-based kinds re-evaluate per attempt so refreshed tokens are
/// picked up; static kinds just clone.
#[async_trait]
pub trait AuthProvider: Send + Sync + std::fmt::Debug {
    async fn headers(&self) -> Result<HeaderMap>;
}

/// External token acquisition (OAuth client-credentials flows and
/// friends). The gateway never implements these; a host embedding the
/// gateway wires one in.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Headers fully known at build time: bearer, basic, and custom headers.
pub struct StaticAuthProvider {
    headers: HeaderMap,
}

impl std::fmt::Debug for StaticAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAuthProvider").finish()
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn headers(&self) -> Result<HeaderMap> {
        Ok(self.headers.clone())
    }
}

struct TokenAuthProvider {
    spell: String,
    source: Arc<dyn TokenSource>,
    base: HeaderMap,
}

impl std::fmt::Debug for TokenAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthProvider")
            .field("spell", &self.spell)
            .finish()
    }
}

#[async_trait]
impl AuthProvider for TokenAuthProvider {
    async fn headers(&self) -> Result<HeaderMap> {
        let token = self.source.access_token().await?;
        let mut headers = self.base.clone();
        headers.insert(
            AUTHORIZATION,
            bearer_value(&self.spell, &token)?,
        );
        Ok(headers)
    }
}

/// Build the provider for a spell's `auth` + `headers` config.
///
/// Placeholders in header values and credentials resolve from the process
/// environment and the shared `.env`; an unresolved reference fails with
/// the variable *name* (the value never existed, so it cannot leak).
pub fn build_auth_provider(
    spell: &str,
    auth: Option<&AuthConfig>,
    headers: &BTreeMap<String, String>,
    env_file: &EnvFile,
    token_source: Option<Arc<dyn TokenSource>>,
) -> Result<Arc<dyn AuthProvider>> {
    let base = build_custom_headers(spell, headers, env_file)?;

    let Some(auth) = auth else {
        return Ok(Arc::new(StaticAuthProvider { headers: base }));
    };

    match auth {
        AuthConfig::Bearer { token } => {
            let token = resolve_secret(spell, "token", token, env_file)?;
            let mut headers = base;
            headers.insert(AUTHORIZATION, bearer_value(spell, &token)?);
            Ok(Arc::new(StaticAuthProvider { headers }))
        }
        AuthConfig::Basic { username, password } => {
            let username = resolve_placeholders(username, env_file)
                .map_err(|err| auth_error(spell, &err))?;
            let password = resolve_secret(spell, "password", password, env_file)?;
            let encoded = BASE64.encode(format!("{username}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|_| {
                LifecycleError::Auth {
                    spell: spell.to_string(),
                    detail: "basic credentials contain non-header bytes".to_string(),
                }
            })?;
            let mut headers = base;
            headers.insert(AUTHORIZATION, value);
            Ok(Arc::new(StaticAuthProvider { headers }))
        }
        AuthConfig::StaticPrivateKeyJwt { assertion, .. } => {
            // The assertion is pre-signed out of band; it rides as a
            // bearer credential.
            let assertion = resolve_secret(spell, "assertion", assertion, env_file)?;
            let mut headers = base;
            headers.insert(AUTHORIZATION, bearer_value(spell, &assertion)?);
            Ok(Arc::new(StaticAuthProvider { headers }))
        }
        AuthConfig::ClientCredentials { .. } | AuthConfig::PrivateKeyJwt { .. } => {
            let Some(source) = token_source else {
                return Err(LifecycleError::Auth {
                    spell: spell.to_string(),
                    detail: format!(
                        "auth kind '{}' needs a token source and none is wired",
                        auth.kind()
                    ),
                });
            };
            Ok(Arc::new(TokenAuthProvider {
                spell: spell.to_string(),
                source,
                base,
            }))
        }
    }
}

fn build_custom_headers(
    spell: &str,
    headers: &BTreeMap<String, String>,
    env_file: &EnvFile,
) -> Result<HeaderMap> {
    let mut out = HeaderMap::new();
    for (key, value) in headers {
        let resolved =
            resolve_placeholders(value, env_file).map_err(|err| auth_error(spell, &err))?;
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| LifecycleError::Auth {
            spell: spell.to_string(),
            detail: format!("invalid header name '{key}'"),
        })?;
        let value = HeaderValue::from_str(&resolved).map_err(|_| LifecycleError::Auth {
            spell: spell.to_string(),
            detail: format!("header '{key}' has a non-header value"),
        })?;
        out.insert(name, value);
    }
    Ok(out)
}

fn resolve_secret(spell: &str, field: &str, raw: &str, env_file: &EnvFile) -> Result<String> {
    resolve_placeholders(raw, env_file).map_err(|err| LifecycleError::Auth {
        spell: spell.to_string(),
        detail: format!("{field}: {err}"),
    })
}

fn bearer_value(spell: &str, token: &str) -> Result<HeaderValue> {
    let mut value =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| LifecycleError::Auth {
            spell: spell.to_string(),
            detail: "bearer token contains non-header bytes".to_string(),
        })?;
    value.set_sensitive(true);
    Ok(value)
}

fn auth_error(spell: &str, err: &grimoire_home::HomeError) -> LifecycleError {
    LifecycleError::Auth {
        spell: spell.to_string(),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grimoire_spellbook::Spell;

    fn env_with(entries: &[(&str, &str)]) -> EnvFile {
        let mut file = EnvFile::default();
        for (k, v) in entries {
            file.set(k, v).expect("set env entry");
        }
        file
    }

    #[tokio::test]
    async fn bearer_header_from_env_file() {
        let env = env_with(&[("STRIPE__BEARER_TOKEN", "super-secret-token-12345")]);
        let auth = AuthConfig::Bearer {
            token: "${STRIPE__BEARER_TOKEN}".to_string(),
        };
        let provider =
            build_auth_provider("stripe", Some(&auth), &BTreeMap::new(), &env, None)
                .expect("build provider");

        let headers = provider.headers().await.expect("headers");
        assert_eq!(
            headers.get(AUTHORIZATION).expect("authorization").to_str().ok(),
            Some("Bearer super-secret-token-12345")
        );
        assert!(headers.get(AUTHORIZATION).expect("authorization").is_sensitive());
    }

    #[tokio::test]
    async fn basic_auth_is_base64_of_user_colon_password() {
        let env = env_with(&[("PM__API_PASSWORD", "pw")]);
        let auth = AuthConfig::Basic {
            username: "admin".to_string(),
            password: "${PM__API_PASSWORD}".to_string(),
        };
        let provider =
            build_auth_provider("project-manager", Some(&auth), &BTreeMap::new(), &env, None)
                .expect("build provider");

        let headers = provider.headers().await.expect("headers");
        let expected = format!("Basic {}", BASE64.encode("admin:pw"));
        assert_eq!(
            headers.get(AUTHORIZATION).expect("authorization").to_str().ok(),
            Some(expected.as_str())
        );
    }

    #[tokio::test]
    async fn custom_headers_resolve_placeholders() {
        let env = env_with(&[("ACME__API_KEY", "k-123")]);
        let mut custom = BTreeMap::new();
        custom.insert("X-Api-Key".to_string(), "${ACME__API_KEY}".to_string());
        custom.insert("X-Client".to_string(), "grimoire".to_string());

        let provider = build_auth_provider("acme", None, &custom, &env, None).expect("build");
        let headers = provider.headers().await.expect("headers");
        assert_eq!(
            headers.get("X-Api-Key").expect("x-api-key").to_str().ok(),
            Some("k-123")
        );
        assert_eq!(
            headers.get("X-Client").expect("x-client").to_str().ok(),
            Some("grimoire")
        );
    }

    #[tokio::test]
    async fn missing_secret_names_the_variable_not_a_value() {
        let auth = AuthConfig::Bearer {
            token: "${ACME__MISSING_TOKEN}".to_string(),
        };
        let err = build_auth_provider("acme", Some(&auth), &BTreeMap::new(), &EnvFile::default(), None)
            .expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("ACME__MISSING_TOKEN"), "got: {msg}");
    }

    #[tokio::test]
    async fn oauth_kinds_need_a_wired_token_source() {
        let auth = AuthConfig::ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: "${ACME__CLIENT_SECRET}".to_string(),
            token_url: "https://auth.example/token".to_string(),
            scope: None,
        };
        let err = build_auth_provider("acme", Some(&auth), &BTreeMap::new(), &EnvFile::default(), None)
            .expect_err("must fail without a source");
        assert!(matches!(err, LifecycleError::Auth { .. }));
        assert!(err.to_string().contains("client_credentials"));
    }

    #[tokio::test]
    async fn token_source_feeds_bearer_header() {
        struct FixedToken;

        #[async_trait]
        impl TokenSource for FixedToken {
            async fn access_token(&self) -> Result<String> {
                Ok("issued-token".to_string())
            }
        }

        let auth = AuthConfig::ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: "${ACME__CLIENT_SECRET}".to_string(),
            token_url: "https://auth.example/token".to_string(),
            scope: None,
        };
        let provider = build_auth_provider(
            "acme",
            Some(&auth),
            &BTreeMap::new(),
            &EnvFile::default(),
            Some(Arc::new(FixedToken)),
        )
        .expect("build");

        let headers = provider.headers().await.expect("headers");
        assert_eq!(
            headers.get(AUTHORIZATION).expect("authorization").to_str().ok(),
            Some("Bearer issued-token")
        );
    }

    // Keep the parse-time placeholder rule and the auth builder honest
    // together: a spell that parses can always have its provider built
    // once the variable exists.
    #[tokio::test]
    async fn parsed_spell_auth_builds_cleanly() {
        let spell = Spell::parse(
            r#"
name: stripe
version: "1"
description: payments
keywords: [payment, invoice, refund]
server:
  transport: http
  url: https://mcp.stripe.example
  auth:
    type: bearer
    token: ${STRIPE__BEARER_TOKEN}
"#,
        )
        .expect("parse");
        let env = env_with(&[("STRIPE__BEARER_TOKEN", "tok")]);
        if let grimoire_spellbook::ServerConfig::Http { auth, headers, .. } = &spell.server {
            build_auth_provider("stripe", auth.as_ref(), headers, &env, None)
                .expect("provider builds");
        } else {
            panic!("expected http server");
        }
    }
}
