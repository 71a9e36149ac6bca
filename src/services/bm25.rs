//! In-process BM25 lexical ranking (§4.D step 6).
//!
//! Operates purely over the candidate set already loaded by the
//! retriever — no SQL full-text index involved, so the retriever stays
//! within the three capabilities named in §9 (`EngramStore`,
//! `VectorIndex`, `EnvironmentProbe`).

use std::collections::HashMap;

use crate::models::EngramId;

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// Lower-cases and splits on ASCII word boundaries, per §4.D step 6.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Ranks `documents` (id, searchable text) against `query`, returning the
/// top `top_k` `(id, bm25_score)` pairs in descending score order. Terms
/// absent from every document contribute nothing; an empty corpus or
/// query yields an empty result.
#[must_use]
pub fn rank(documents: &[(EngramId, String)], query: &str, top_k: usize) -> Vec<(EngramId, f32)> {
    let query_terms = tokenize(query);
    if documents.is_empty() || query_terms.is_empty() {
        return Vec::new();
    }

    let tokenized: Vec<(EngramId, Vec<String>)> =
        documents.iter().map(|(id, text)| (*id, tokenize(text))).collect();

    let n = tokenized.len();
    #[allow(clippy::cast_precision_loss)]
    let avgdl = tokenized.iter().map(|(_, toks)| toks.len()).sum::<usize>() as f32 / n as f32;

    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for (_, toks) in &tokenized {
        let mut seen = std::collections::HashSet::new();
        for term in toks {
            if seen.insert(term.as_str()) {
                *doc_freq.entry(term.as_str()).or_insert(0) += 1;
            }
        }
    }

    let idf = |term: &str| -> f32 {
        let n_t = doc_freq.get(term).copied().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let n = n as f32;
        #[allow(clippy::cast_precision_loss)]
        let n_t = n_t as f32;
        ((n - n_t + 0.5) / (n_t + 0.5) + 1.0).ln()
    };

    let mut scored: Vec<(EngramId, f32)> = tokenized
        .iter()
        .map(|(id, toks)| {
            #[allow(clippy::cast_precision_loss)]
            let doc_len = toks.len() as f32;
            let mut term_freq: HashMap<&str, usize> = HashMap::new();
            for t in toks {
                *term_freq.entry(t.as_str()).or_insert(0) += 1;
            }

            let score = query_terms
                .iter()
                .map(|qt| {
                    let Some(&f) = term_freq.get(qt.as_str()) else { return 0.0 };
                    #[allow(clippy::cast_precision_loss)]
                    let f = f as f32;
                    let numerator = f * (K1 + 1.0);
                    let denominator = f + K1 * (1.0 - B + B * doc_len / avgdl);
                    idf(qt) * (numerator / denominator)
                })
                .sum::<f32>();

            (*id, score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: i64, text: &str) -> (EngramId, String) {
        (EngramId::new(id), text.to_string())
    }

    #[test]
    fn exact_term_match_outranks_unrelated_document() {
        let docs = vec![
            doc(1, "use rebase instead of merge for feature branches"),
            doc(2, "prefer tabs over spaces in this codebase"),
        ];
        let results = rank(&docs, "rebase merge", 10);
        assert_eq!(results[0].0, EngramId::new(1));
    }

    #[test]
    fn empty_query_yields_no_results() {
        let docs = vec![doc(1, "some text")];
        assert!(rank(&docs, "", 10).is_empty());
    }

    #[test]
    fn empty_corpus_yields_no_results() {
        assert!(rank(&[], "query", 10).is_empty());
    }

    #[test]
    fn respects_top_k_truncation() {
        let docs: Vec<_> = (0..20).map(|i| doc(i, "rust programming language lesson")).collect();
        let results = rank(&docs, "rust lesson", 5);
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn terms_absent_from_corpus_contribute_nothing() {
        let docs = vec![doc(1, "rust ownership model")];
        let results = rank(&docs, "javascript", 10);
        assert!(results.is_empty());
    }
}
