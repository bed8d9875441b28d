use serde::Serialize;
use std::collections::HashSet;

/// Blend weights for the combined score.
pub const KEYWORD_WEIGHT: f32 = 0.4;
pub const VECTOR_WEIGHT: f32 = 0.6;

/// Decision-tier thresholds on the combined score.
pub const ACTIVATE_THRESHOLD: f32 = 0.85;
pub const MULTIPLE_THRESHOLD: f32 = 0.65;
pub const WEAK_THRESHOLD: f32 = 0.40;

/// Best and runner-up closer than this never auto-activate.
pub const TIE_GAP: f32 = 0.05;

/// Longer queries are scored on their leading tokens only.
pub const MAX_QUERY_TOKENS: usize = 4096;

pub const MAX_ALTERNATIVES: usize = 5;
pub const MAX_MATCH_KEYWORDS: usize = 5;

/// A channel below this contributed nothing worth reporting.
const CONTRIBUTION_FLOOR: f32 = 0.1;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "for", "in", "into", "is", "it", "my", "of", "on", "or", "the", "to", "with",
];

/// Which scoring channel put a spell on the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Keyword,
    Vector,
    Both,
}

impl MatchType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Vector => "vector",
            Self::Both => "both",
        }
    }
}

/// Lowercase and split on every non-alphanumeric boundary.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Query-side tokens: stopwords dropped, order-preserving dedup, capped at
/// [`MAX_QUERY_TOKENS`].
#[must_use]
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .take(MAX_QUERY_TOKENS)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Token-overlap score in [0,1]: matched tokens over the smaller of the
/// two sets, so a query fully covered by the keywords (or vice versa)
/// scores 1.0.
#[must_use]
pub fn keyword_score(query_tokens: &[String], spell_tokens: &HashSet<String>) -> f32 {
    if query_tokens.is_empty() || spell_tokens.is_empty() {
        return 0.0;
    }
    let matched = query_tokens
        .iter()
        .filter(|t| spell_tokens.contains(*t))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let denom = query_tokens.len().min(spell_tokens.len()) as f32;
    matched as f32 / denom
}

/// Cosine similarity clamped to [0,1]; dimension mismatches score 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Weighted blend; with no vector available (degraded query) the keyword
/// score stands alone so the tier thresholds keep their meaning.
#[must_use]
pub fn combined_score(keyword: f32, vector: Option<f32>) -> f32 {
    match vector {
        Some(vector) => KEYWORD_WEIGHT * keyword + VECTOR_WEIGHT * vector,
        None => keyword,
    }
}

#[must_use]
pub fn classify_match(keyword: f32, vector: Option<f32>) -> MatchType {
    let keyword_hit = keyword >= CONTRIBUTION_FLOOR;
    let vector_hit = vector.unwrap_or(0.0) >= CONTRIBUTION_FLOOR;
    match (keyword_hit, vector_hit) {
        (true, true) => MatchType::Both,
        (false, true) => MatchType::Vector,
        _ => MatchType::Keyword,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(tokens: &[&str]) -> HashSet<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Create-Project_and ADD,task!"),
            vec!["create", "project", "and", "add", "task"]
        );
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[test]
    fn query_tokens_drop_stopwords_and_dupes() {
        assert_eq!(
            query_tokens("create a project and add a task to the project"),
            vec!["create", "project", "add", "task"]
        );
    }

    #[test]
    fn keyword_score_full_coverage_is_one() {
        let spell = set(&["create", "project", "task", "status", "manager"]);
        let query: Vec<String> = query_tokens("create project task");
        assert_eq!(keyword_score(&query, &spell), 1.0);
    }

    #[test]
    fn keyword_score_partial_overlap() {
        let spell = set(&["create", "project", "task", "status"]);
        let query = query_tokens("create project and add task");
        // matched: create, project, task of {create, project, add, task}
        assert_eq!(keyword_score(&query, &spell), 0.75);
    }

    #[test]
    fn keyword_score_disjoint_is_zero() {
        let spell = set(&["payment", "invoice", "refund"]);
        let query = query_tokens("xyzzy qux plugh");
        assert_eq!(keyword_score(&query, &spell), 0.0);
    }

    #[test]
    fn cosine_clamps_negatives_to_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn combined_uses_blend_when_vector_present() {
        let got = combined_score(0.5, Some(1.0));
        assert!((got - (0.4 * 0.5 + 0.6)).abs() < 1e-6);
    }

    #[test]
    fn combined_is_keyword_only_when_degraded() {
        assert_eq!(combined_score(0.75, None), 0.75);
    }

    #[test]
    fn match_classification() {
        assert_eq!(classify_match(0.8, Some(0.7)), MatchType::Both);
        assert_eq!(classify_match(0.0, Some(0.7)), MatchType::Vector);
        assert_eq!(classify_match(0.8, Some(0.01)), MatchType::Keyword);
        assert_eq!(classify_match(0.8, None), MatchType::Keyword);
        assert_eq!(classify_match(0.0, None), MatchType::Keyword);
    }
}
