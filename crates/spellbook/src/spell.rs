use crate::error::{Result, SpellError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const SPELL_FILE_SUFFIX: &str = ".spell.yaml";
pub const MIN_KEYWORDS: usize = 3;

static SPELL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9][a-z0-9-]*$").expect("spell name regex"));

static SECRET_PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{[A-Z_][A-Z0-9_]*\}$").expect("secret placeholder regex"));

#[must_use]
pub fn is_valid_spell_name(name: &str) -> bool {
    SPELL_NAME_RE.is_match(name)
}

/// File name a spell named `name` conventionally lives in.
#[must_use]
pub fn spell_file_name(name: &str) -> String {
    format!("{name}{SPELL_FILE_SUFFIX}")
}

/// One spell: a named, file-described configuration for one MCP backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spell {
    pub name: String,
    pub version: String,
    pub description: String,
    pub keywords: Vec<String>,
    /// Extra guidance surfaced to the agent on activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steering: Option<String>,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Values may be literals or `${VAR}` references resolved at
        /// spawn time from the process environment and the shared `.env`.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthConfig>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

impl ServerConfig {
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }

    #[must_use]
    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ClientCredentials {
        client_id: String,
        client_secret: String,
        token_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    PrivateKeyJwt {
        client_id: String,
        private_key: String,
        token_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
    },
    StaticPrivateKeyJwt {
        client_id: String,
        assertion: String,
    },
}

impl AuthConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bearer { .. } => "bearer",
            Self::Basic { .. } => "basic",
            Self::ClientCredentials { .. } => "client_credentials",
            Self::PrivateKeyJwt { .. } => "private_key_jwt",
            Self::StaticPrivateKeyJwt { .. } => "static_private_key_jwt",
        }
    }

    /// The fields that must hold `${VAR}` placeholders rather than
    /// literal credentials.
    fn secret_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::Bearer { token } => vec![("token", token.as_str())],
            Self::Basic { password, .. } => vec![("password", password.as_str())],
            Self::ClientCredentials { client_secret, .. } => {
                vec![("client_secret", client_secret.as_str())]
            }
            Self::PrivateKeyJwt { private_key, .. } => {
                vec![("private_key", private_key.as_str())]
            }
            Self::StaticPrivateKeyJwt { assertion, .. } => {
                vec![("assertion", assertion.as_str())]
            }
        }
    }
}

impl Spell {
    /// Parse and validate one spell document.
    pub fn parse(text: &str) -> Result<Self> {
        let spell: Spell = serde_yaml::from_str(text)?;
        spell.validate()?;
        Ok(spell)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_spell_name(&self.name) {
            return Err(SpellError::Invalid(format!(
                "name '{}' must match [a-z0-9][a-z0-9-]*",
                self.name
            )));
        }
        if self.description.trim().is_empty() {
            return Err(SpellError::Invalid(format!(
                "spell '{}' has an empty description",
                self.name
            )));
        }
        let usable_keywords = self
            .keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .count();
        if usable_keywords < MIN_KEYWORDS {
            return Err(SpellError::Invalid(format!(
                "spell '{}' needs at least {MIN_KEYWORDS} keywords, found {usable_keywords}",
                self.name
            )));
        }

        match &self.server {
            ServerConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(SpellError::Invalid(format!(
                        "spell '{}' has an empty stdio command",
                        self.name
                    )));
                }
            }
            ServerConfig::Http { url, auth, .. } | ServerConfig::Sse { url, auth, .. } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(SpellError::Invalid(format!(
                        "spell '{}' has a non-http(s) url",
                        self.name
                    )));
                }
                if let Some(auth) = auth {
                    validate_auth_secrets(&self.name, auth)?;
                }
            }
        }
        Ok(())
    }

    /// The text the resolver indexes for this spell.
    #[must_use]
    pub fn indexed_text(&self) -> String {
        format!(
            "{} {} {}",
            self.name,
            self.keywords.join(" "),
            self.description
        )
    }
}

fn validate_auth_secrets(spell_name: &str, auth: &AuthConfig) -> Result<()> {
    for (field, value) in auth.secret_fields() {
        if !SECRET_PLACEHOLDER_RE.is_match(value) {
            // Reject literals so a credential pasted into YAML is caught
            // before it can reach logs or version control.
            return Err(SpellError::Invalid(format!(
                "spell '{spell_name}' auth field '{field}' must be a ${{VAR}} placeholder"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROJECT_MANAGER: &str = r#"
name: project-manager
version: "1.0.0"
description: Manage projects, tasks and their status
keywords: [create, project, task, status]
server:
  transport: stdio
  command: npx
  args: ["-y", "project-manager-mcp"]
  env:
    API_PASSWORD: ${PROJECT_MANAGER__API_PASSWORD}
"#;

    #[test]
    fn parses_stdio_spell() {
        let spell = Spell::parse(PROJECT_MANAGER).expect("parse");
        assert_eq!(spell.name, "project-manager");
        assert_eq!(spell.keywords.len(), 4);
        match &spell.server {
            ServerConfig::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &["-y", "project-manager-mcp"]);
                assert_eq!(
                    env.get("API_PASSWORD").map(String::as_str),
                    Some("${PROJECT_MANAGER__API_PASSWORD}")
                );
            }
            other => panic!("expected stdio server, got {other:?}"),
        }
    }

    #[test]
    fn parses_http_spell_with_bearer_auth() {
        let spell = Spell::parse(
            r#"
name: stripe
version: "0.3.0"
description: Payments, invoices and customers via Stripe
keywords: [payment, invoice, customer, refund]
server:
  transport: http
  url: https://mcp.stripe.example/v1
  auth:
    type: bearer
    token: ${STRIPE__BEARER_TOKEN}
  headers:
    X-Client: grimoire
"#,
        )
        .expect("parse");
        match &spell.server {
            ServerConfig::Http { url, auth, headers } => {
                assert_eq!(url, "https://mcp.stripe.example/v1");
                assert_eq!(
                    auth,
                    &Some(AuthConfig::Bearer {
                        token: "${STRIPE__BEARER_TOKEN}".to_string()
                    })
                );
                assert_eq!(headers.get("X-Client").map(String::as_str), Some("grimoire"));
            }
            other => panic!("expected http server, got {other:?}"),
        }
    }

    #[test]
    fn sse_requires_absolute_http_url() {
        let err = Spell::parse(
            r#"
name: feed
version: "0.1.0"
description: Streaming feed backend
keywords: [stream, feed, events]
server:
  transport: sse
  url: ws://example.com/stream
"#,
        )
        .expect_err("ws url must be rejected");
        assert!(err.to_string().contains("non-http"));
    }

    #[test]
    fn rejects_invalid_names() {
        for bad in ["Bad-Name", "-leading-dash", "has_underscore", "has space", ""] {
            let doc = format!(
                "name: \"{bad}\"\nversion: \"1\"\ndescription: d\nkeywords: [a, b, c]\nserver:\n  transport: stdio\n  command: cmd\n"
            );
            assert!(
                Spell::parse(&doc).is_err(),
                "name '{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn rejects_too_few_keywords() {
        let err = Spell::parse(
            r#"
name: sparse
version: "1"
description: too few keywords
keywords: [one, two]
server:
  transport: stdio
  command: cmd
"#,
        )
        .expect_err("two keywords must fail");
        assert!(err.to_string().contains("at least 3 keywords"));
    }

    #[test]
    fn rejects_literal_credentials() {
        let err = Spell::parse(
            r#"
name: leaky
version: "1"
description: literal secret in yaml
keywords: [a, b, c]
server:
  transport: http
  url: https://example.com
  auth:
    type: bearer
    token: super-secret-token-12345
"#,
        )
        .expect_err("literal token must fail");
        let msg = err.to_string();
        assert!(msg.contains("placeholder"), "got: {msg}");
        assert!(
            !msg.contains("super-secret-token-12345"),
            "error must not echo the credential"
        );
    }

    #[test]
    fn rejects_unknown_transport() {
        let err = Spell::parse(
            r#"
name: odd
version: "1"
description: unknown transport tag
keywords: [a, b, c]
server:
  transport: websocket
  url: https://example.com
"#,
        )
        .expect_err("unknown transport must fail");
        assert!(matches!(err, SpellError::Yaml(_)));
    }

    #[test]
    fn indexed_text_concatenates_name_keywords_description() {
        let spell = Spell::parse(PROJECT_MANAGER).expect("parse");
        assert_eq!(
            spell.indexed_text(),
            "project-manager create project task status Manage projects, tasks and their status"
        );
    }

    #[test]
    fn file_name_convention() {
        assert_eq!(
            spell_file_name("project-manager"),
            "project-manager.spell.yaml"
        );
    }

    #[test]
    fn spell_name_validation() {
        assert!(is_valid_spell_name("project-manager"));
        assert!(is_valid_spell_name("cap-js"));
        assert!(is_valid_spell_name("a"));
        assert!(is_valid_spell_name("0ok"));
        assert!(!is_valid_spell_name("../evil"));
        assert!(!is_valid_spell_name("a b"));
        assert!(!is_valid_spell_name("name;rm"));
        assert!(!is_valid_spell_name(""));
    }
}
