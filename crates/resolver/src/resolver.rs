use crate::embedder::EmbeddingService;
use crate::score::{
    classify_match, combined_score, cosine_similarity, keyword_score, query_tokens, tokenize,
    MatchType, ACTIVATE_THRESHOLD, MAX_ALTERNATIVES, MAX_MATCH_KEYWORDS, MULTIPLE_THRESHOLD,
    TIE_GAP, WEAK_THRESHOLD,
};
use async_trait::async_trait;
use grimoire_embedding_store::EmbeddingStore;
use grimoire_spellbook::{Spell, SpellDiscovery, SpellEvent};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One scored candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct SpellMatch {
    pub name: String,
    pub confidence: f32,
    pub match_type: MatchType,
    pub description: String,
    pub keywords: Vec<String>,
}

/// What the gateway should do with a query.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Confident single winner; the gateway spawns it.
    Activated { spell: SpellMatch },
    /// Plausible candidates, none confident enough to auto-activate.
    MultipleMatches { matches: Vec<SpellMatch> },
    /// Something matched, but weakly.
    WeakMatches { matches: Vec<SpellMatch> },
    NotFound { message: String },
}

/// Seam between the gateway and the scoring machinery; tests substitute it.
#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Resolution;

    /// Make sure every discovered spell has a cached embedding.
    async fn index_spells(&self);
}

pub struct HybridResolver {
    discovery: SpellDiscovery,
    store: EmbeddingStore,
    embedder: Arc<dyn EmbeddingService>,
}

impl HybridResolver {
    /// Build the resolver and subscribe it to discovery changes so edits
    /// to spell files re-index without a restart.
    pub fn new(
        discovery: SpellDiscovery,
        store: EmbeddingStore,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Arc<Self> {
        let resolver = Arc::new(Self {
            discovery,
            store,
            embedder,
        });
        resolver.spawn_reindex_listener();
        resolver
    }

    fn spawn_reindex_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.discovery.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SpellEvent::Added(_) | SpellEvent::Modified(_)) => {
                        let Some(resolver) = weak.upgrade() else { break };
                        resolver.index_spells().await;
                    }
                    Ok(SpellEvent::Removed(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("re-index listener lagged by {skipped} event(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Cached embedding for a spell, computing and storing it on miss.
    /// `None` means the embedding service failed; the caller degrades.
    async fn spell_vector(&self, spell: &Spell) -> Option<Vec<f32>> {
        let text = spell.indexed_text();
        let hash = text_hash(&text);
        if let Some(vector) = self.store.get_embedding(&hash) {
            return Some(vector);
        }
        match self.embedder.embed(&text).await {
            Ok(vector) => {
                self.store.set_embedding(hash, vector.clone());
                Some(vector)
            }
            Err(err) => {
                log::warn!("embedding failed for spell '{}': {err}", spell.name);
                None
            }
        }
    }

    async fn score_all(&self, query: &str) -> Vec<SpellMatch> {
        let q_tokens = query_tokens(query);

        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                log::warn!("query embedding failed, degrading to keyword-only: {err}");
                None
            }
        };

        let mut scored = Vec::new();
        for (_, spell) in self.discovery.snapshot() {
            let spell_tokens: HashSet<String> = spell
                .keywords
                .iter()
                .flat_map(|k| tokenize(k))
                .chain(tokenize(&spell.name))
                .collect();
            let kw = keyword_score(&q_tokens, &spell_tokens);

            let vec_score = match &query_vector {
                Some(qv) => self
                    .spell_vector(&spell)
                    .await
                    .map(|sv| cosine_similarity(qv, &sv)),
                None => None,
            };

            let mut keywords = spell.keywords.clone();
            keywords.truncate(MAX_MATCH_KEYWORDS);
            scored.push((
                vec_score.unwrap_or(0.0),
                SpellMatch {
                    name: spell.name.clone(),
                    confidence: combined_score(kw, vec_score),
                    match_type: classify_match(kw, vec_score),
                    description: spell.description.clone(),
                    keywords,
                },
            ));
        }

        scored.sort_by(|(vec_a, a), (vec_b, b)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| vec_b.partial_cmp(vec_a).unwrap_or(Ordering::Equal))
                .then_with(|| a.name.cmp(&b.name))
        });
        scored.into_iter().map(|(_, m)| m).collect()
    }
}

#[async_trait]
impl IntentResolver for HybridResolver {
    async fn resolve(&self, query: &str) -> Resolution {
        let query = query.trim();
        if query.is_empty() {
            return Resolution::NotFound {
                message: "query is empty".to_string(),
            };
        }
        if self.discovery.is_empty() {
            return Resolution::NotFound {
                message: "no spells available".to_string(),
            };
        }

        let mut matches = self.score_all(query).await;
        let Some(best) = matches.first() else {
            return Resolution::NotFound {
                message: format!("no spell matched '{query}'"),
            };
        };
        let top1 = best.confidence;
        let gap = matches
            .get(1)
            .map_or(f32::INFINITY, |second| top1 - second.confidence);

        if top1 < WEAK_THRESHOLD {
            return Resolution::NotFound {
                message: format!("no spell matched '{query}'"),
            };
        }
        if top1 >= ACTIVATE_THRESHOLD && gap >= TIE_GAP {
            return Resolution::Activated {
                spell: matches.swap_remove(0),
            };
        }
        matches.truncate(MAX_ALTERNATIVES);
        if top1 >= MULTIPLE_THRESHOLD || gap < TIE_GAP {
            Resolution::MultipleMatches { matches }
        } else {
            Resolution::WeakMatches { matches }
        }
    }

    async fn index_spells(&self) {
        for (_, spell) in self.discovery.snapshot() {
            let _ = self.spell_vector(&spell).await;
        }
    }
}

/// Stable digest keying the embedding cache.
#[must_use]
pub(crate) fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
