//! BM25 inverted index over an ordered corpus.
//!
//! The index is read-only once built and is rebuilt wholesale when the
//! corpus changes. Scoring is deterministic: query terms are summed in
//! first-occurrence order and ties are broken by insertion order.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use showrunner_shared::{CorpusDocument, Result, RetrievalHit, ShowrunnerError};

use crate::tokenizer::{tokenize, unique_terms};

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Document-length normalization strength (0 = none, 1 = full).
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// A posting: document position and term frequency.
#[derive(Debug, Clone, Copy)]
struct Posting {
    doc: usize,
    tf: u32,
}

/// Term -> postings map over a fixed ordered sequence of documents.
#[derive(Debug)]
pub struct IndexedCorpus {
    documents: Vec<CorpusDocument>,
    positions: HashMap<String, usize>,
    postings: HashMap<String, Vec<Posting>>,
    doc_lengths: Vec<usize>,
    avg_doc_len: f64,
    params: Bm25Params,
    version: String,
}

impl IndexedCorpus {
    /// Build an index. Fails on an empty corpus or duplicate document ids.
    #[instrument(skip_all, fields(documents = documents.len()))]
    pub fn build(documents: Vec<CorpusDocument>, params: Bm25Params) -> Result<Self> {
        if documents.is_empty() {
            return Err(ShowrunnerError::index_build("corpus is empty"));
        }

        let mut positions = HashMap::with_capacity(documents.len());
        for (i, doc) in documents.iter().enumerate() {
            if positions.insert(doc.id.clone(), i).is_some() {
                return Err(ShowrunnerError::index_build(format!(
                    "duplicate document id '{}'",
                    doc.id
                )));
            }
        }

        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();
        let mut doc_lengths = Vec::with_capacity(documents.len());

        for (i, doc) in documents.iter().enumerate() {
            // Titles are indexed alongside the body.
            let terms = tokenize(&format!("{}\n{}", doc.title, doc.text));
            doc_lengths.push(terms.len());

            let mut counts: HashMap<String, u32> = HashMap::new();
            for term in terms {
                *counts.entry(term).or_default() += 1;
            }
            for (term, tf) in counts {
                postings.entry(term).or_default().push(Posting { doc: i, tf });
            }
        }

        let total_len: usize = doc_lengths.iter().sum();
        let avg_doc_len = total_len as f64 / documents.len() as f64;
        let version = corpus_version(&documents);

        info!(
            documents = documents.len(),
            terms = postings.len(),
            avg_doc_len,
            version = %&version[..16],
            "corpus indexed"
        );

        Ok(Self {
            documents,
            positions,
            postings,
            doc_lengths,
            avg_doc_len,
            params,
            version,
        })
    }

    /// Rank every document against `query` and return the best `top_k`.
    ///
    /// Always returns `min(top_k, len)` hits; documents sharing no term with
    /// the query score zero and fall back to insertion order.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        if top_k == 0 {
            return Err(ShowrunnerError::validation("top_k must be at least 1"));
        }

        let n = self.documents.len() as f64;
        let Bm25Params { k1, b } = self.params;
        let mut scores = vec![0.0_f64; self.documents.len()];

        for term in unique_terms(query) {
            let Some(list) = self.postings.get(&term) else {
                continue;
            };
            let df = list.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();

            for posting in list {
                let tf = f64::from(posting.tf);
                let len_ratio = if self.avg_doc_len > 0.0 {
                    self.doc_lengths[posting.doc] as f64 / self.avg_doc_len
                } else {
                    1.0
                };
                let norm = k1 * (1.0 - b + b * len_ratio);
                scores[posting.doc] += idf * (tf * (k1 + 1.0)) / (tf + norm);
            }
        }

        let mut ranked: Vec<usize> = (0..self.documents.len()).collect();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        ranked.truncate(top_k);

        debug!(query, top_k, hits = ranked.len(), "search complete");

        Ok(ranked
            .into_iter()
            .map(|i| RetrievalHit {
                document_id: self.documents[i].id.clone(),
                score: scores[i],
            })
            .collect())
    }

    /// Look up a document by id.
    pub fn document(&self, id: &str) -> Option<&CorpusDocument> {
        self.positions.get(id).map(|&i| &self.documents[i])
    }

    pub fn documents(&self) -> &[CorpusDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Content hash of the ordered corpus; changes whenever any document does.
    pub fn version(&self) -> &str {
        &self.version
    }
}

fn corpus_version(documents: &[CorpusDocument]) -> String {
    let mut hasher = Sha256::new();
    for doc in documents {
        for field in [&doc.id, &doc.title, &doc.locator, &doc.text] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
    }
    format!("{:x}", hasher.finalize())
}
