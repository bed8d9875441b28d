//! Wire shapes for the two meta-tools.
//!
//! Every `resolve_intent` response draws from one fixed key set
//! (`status`, `query`, `message`, `availableSpells`, `spell`, `tools`,
//! `matches`), with unused keys absent rather than null, so the agent
//! can parse all four tiers the same way.

use grimoire_resolver::SpellMatch;
use serde::{Deserialize, Serialize};

pub const RESOLVE_INTENT_TOOL: &str = "resolve_intent";
pub const ACTIVATE_SPELL_TOOL: &str = "activate_spell";

/// Cap on `availableSpells` in not-found responses.
pub const MAX_AVAILABLE_SPELLS: usize = 10;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ResolveIntentRequest {
    /// Natural-language description of what you want to do.
    #[schemars(description = "What you want to accomplish, in plain words")]
    pub query: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ActivateSpellRequest {
    /// Exact spell name, as returned by resolve_intent.
    #[schemars(description = "Spell name to activate")]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveIntentResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "availableSpells", skip_serializing_if = "Option::is_none")]
    pub available_spells: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spell: Option<MatchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<MatchSummary>>,
}

impl ResolveIntentResponse {
    fn base(status: &'static str, query: Option<String>) -> Self {
        Self {
            status,
            query,
            message: None,
            available_spells: None,
            spell: None,
            tools: None,
            matches: None,
        }
    }

    pub fn activated(query: String, spell: MatchSummary, tools: Vec<String>) -> Self {
        Self {
            spell: Some(spell),
            tools: Some(tools),
            ..Self::base("activated", Some(query))
        }
    }

    pub fn multiple_matches(query: String, matches: Vec<MatchSummary>) -> Self {
        Self {
            message: Some(
                "several spells match; call activate_spell with one of them".to_string(),
            ),
            matches: Some(matches),
            ..Self::base("multiple_matches", Some(query))
        }
    }

    pub fn weak_matches(query: String, matches: Vec<MatchSummary>) -> Self {
        Self {
            message: Some(
                "only weak matches; consider rephrasing or activate_spell directly".to_string(),
            ),
            matches: Some(matches),
            ..Self::base("weak_matches", Some(query))
        }
    }

    pub fn not_found(
        query: Option<String>,
        message: impl Into<String>,
        available_spells: Vec<String>,
    ) -> Self {
        Self {
            message: Some(message.into()),
            available_spells: Some(available_spells),
            ..Self::base("not_found", query)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MatchSummary {
    pub name: String,
    pub confidence: f32,
    #[serde(rename = "matchType")]
    pub match_type: &'static str,
    pub description: String,
    pub keywords: Vec<String>,
}

impl From<SpellMatch> for MatchSummary {
    fn from(m: SpellMatch) -> Self {
        Self {
            name: m.name,
            confidence: round2(m.confidence),
            match_type: m.match_type.as_str(),
            description: m.description,
            keywords: m.keywords,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivateSpellResponse {
    pub spell: ActivatedSpell,
    pub tools: Vec<ToolSummary>,
}

#[derive(Debug, Serialize)]
pub struct ActivatedSpell {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steering: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const UNIFORM_KEYS: &[&str] = &[
        "status",
        "query",
        "message",
        "availableSpells",
        "spell",
        "tools",
        "matches",
    ];

    fn keys_of(response: &ResolveIntentResponse) -> BTreeSet<String> {
        let value = serde_json::to_value(response).expect("serialize");
        value
            .as_object()
            .expect("object")
            .keys()
            .cloned()
            .collect()
    }

    #[test]
    fn every_tier_stays_inside_the_uniform_key_set() {
        let summary = MatchSummary {
            name: "project-manager".to_string(),
            confidence: 0.91,
            match_type: "both",
            description: "Manage projects".to_string(),
            keywords: vec!["create".to_string()],
        };
        let responses = [
            ResolveIntentResponse::activated(
                "q".to_string(),
                summary,
                vec!["create_project".to_string()],
            ),
            ResolveIntentResponse::multiple_matches("q".to_string(), vec![]),
            ResolveIntentResponse::weak_matches("q".to_string(), vec![]),
            ResolveIntentResponse::not_found(None, "query is empty", vec![]),
        ];
        for response in &responses {
            for key in keys_of(response) {
                assert!(
                    UNIFORM_KEYS.contains(&key.as_str()),
                    "unexpected key '{key}' in {response:?}"
                );
            }
        }
    }

    #[test]
    fn unused_keys_are_absent_not_null() {
        let response = ResolveIntentResponse::not_found(
            Some("xyzzy".to_string()),
            "no spell matched",
            vec!["project-manager".to_string()],
        );
        let value = serde_json::to_value(&response).expect("serialize");
        let object = value.as_object().expect("object");
        assert!(!object.contains_key("spell"));
        assert!(!object.contains_key("tools"));
        assert!(!object.contains_key("matches"));
        assert!(!object.values().any(serde_json::Value::is_null));
    }

    #[test]
    fn confidence_is_rounded_for_display() {
        let m = SpellMatch {
            name: "x".to_string(),
            confidence: 0.87654,
            match_type: grimoire_resolver::MatchType::Both,
            description: String::new(),
            keywords: vec![],
        };
        let summary = MatchSummary::from(m);
        assert!((summary.confidence - 0.88).abs() < 1e-6);
    }
}
