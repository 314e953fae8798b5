//! Embedding topic model: spherical k-means with an outlier cutoff.
//!
//! Fitting clusters unit-length document embeddings, dissolves clusters that
//! end up too small and keeps the surviving centroids. Inference assigns a
//! document to its nearest centroid only when the cosine similarity clears
//! `min_similarity`; anything else is an outlier with an all-zero membership
//! vector. The fitted model is plain data and serializes to JSON.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ai_client::truncate_to_char_boundary;
use taxon_common::vector::{centroid, dot, normalized};
use taxon_common::{Document, OUTLIER_TOPIC};

use crate::keywords::{class_keywords, TOP_KEYWORDS};

const REPRESENTATIVE_DOCS: usize = 3;
const REPRESENTATIVE_DOC_BYTES: usize = 600;
/// Sharpens the membership softmax over cosine similarities.
const SOFTMAX_TEMPERATURE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub cluster_count: usize,
    pub min_cluster_size: usize,
    pub min_similarity: f64,
    pub max_iterations: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            cluster_count: 40,
            min_cluster_size: 10,
            min_similarity: 0.35,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCluster {
    pub id: i32,
    pub centroid: Vec<f32>,
    /// Members at fit time.
    pub size: usize,
    pub representation: Vec<String>,
    pub representative_docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicModel {
    pub settings: ModelSettings,
    /// Ordered by size, largest first; `topics[i].id == i`.
    pub topics: Vec<TopicCluster>,
}

/// One document's place in a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    /// Topic id, or [`OUTLIER_TOPIC`].
    pub topic: i32,
    /// Per-topic probability, aligned with `TopicModel::topics`.
    pub probabilities: Vec<f64>,
}

impl Membership {
    fn outlier(topics: usize) -> Self {
        Self {
            topic: OUTLIER_TOPIC,
            probabilities: vec![0.0; topics],
        }
    }

    pub fn is_outlier(&self) -> bool {
        self.topic == OUTLIER_TOPIC
    }

    /// Probability of the assigned topic; 0 for outliers.
    pub fn confidence(&self) -> f64 {
        if self.is_outlier() {
            0.0
        } else {
            self.probabilities.iter().copied().fold(0.0, f64::max)
        }
    }
}

impl TopicModel {
    pub fn topic(&self, id: i32) -> Option<&TopicCluster> {
        usize::try_from(id).ok().and_then(|i| self.topics.get(i))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Fit over `documents` and return the model plus one membership per
    /// document, aligned with the input.
    pub fn fit(documents: &[&Document], settings: ModelSettings) -> (Self, Vec<Membership>) {
        let indexed: Vec<(usize, Vec<f32>)> = documents
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.embedding.as_deref().map(|e| (i, normalized(e))))
            .collect();

        let k = settings.cluster_count.min(indexed.len());
        let vectors: Vec<&[f32]> = indexed.iter().map(|(_, v)| v.as_slice()).collect();
        let centroids = spherical_kmeans(&vectors, k, settings.max_iterations);

        let mut model = Self {
            settings,
            topics: Vec::new(),
        };
        if centroids.is_empty() {
            return (model, vec![Membership::outlier(0); documents.len()]);
        }

        // Count raw members, dissolve small clusters, order by size.
        let mut sizes = vec![0usize; centroids.len()];
        for v in &vectors {
            sizes[nearest(v, &centroids).0] += 1;
        }
        let mut surviving: Vec<usize> = (0..centroids.len())
            .filter(|&c| sizes[c] >= settings.min_cluster_size.max(1))
            .collect();
        surviving.sort_by(|a, b| sizes[*b].cmp(&sizes[*a]).then(a.cmp(b)));
        debug!(
            clusters = centroids.len(),
            surviving = surviving.len(),
            "Dissolved undersized clusters"
        );

        model.topics = surviving
            .iter()
            .enumerate()
            .map(|(id, &c)| TopicCluster {
                id: id as i32,
                centroid: centroids[c].clone(),
                size: 0,
                representation: Vec::new(),
                representative_docs: Vec::new(),
            })
            .collect();

        let mut memberships = model.infer(documents);

        // A surviving centroid can still end up empty once the similarity
        // cutoff applies; drop those and re-assign.
        let mut occupied = vec![false; model.topics.len()];
        for m in memberships.iter().filter(|m| !m.is_outlier()) {
            occupied[m.topic as usize] = true;
        }
        if occupied.iter().any(|o| !o) {
            let kept: Vec<TopicCluster> = model
                .topics
                .drain(..)
                .zip(occupied)
                .filter_map(|(t, o)| o.then_some(t))
                .collect();
            model.topics = kept
                .into_iter()
                .enumerate()
                .map(|(id, t)| TopicCluster { id: id as i32, ..t })
                .collect();
            memberships = model.infer(documents);
        }

        model.describe(documents, &memberships);
        info!(
            documents = documents.len(),
            topics = model.topics.len(),
            outliers = memberships.iter().filter(|m| m.is_outlier()).count(),
            "Topic model fitted"
        );
        (model, memberships)
    }

    /// Assign documents to the fitted topics without changing the model.
    pub fn infer(&self, documents: &[&Document]) -> Vec<Membership> {
        let centroids: Vec<&[f32]> = self.topics.iter().map(|t| t.centroid.as_slice()).collect();
        documents
            .iter()
            .map(|d| match d.embedding.as_deref() {
                Some(e) if !centroids.is_empty() => self.membership(&normalized(e), &centroids),
                _ => Membership::outlier(self.topics.len()),
            })
            .collect()
    }

    fn membership(&self, unit: &[f32], centroids: &[&[f32]]) -> Membership {
        let sims: Vec<f64> = centroids
            .iter()
            .map(|c| if c.len() == unit.len() { dot(unit, c) } else { f64::NEG_INFINITY })
            .collect();

        let qualifying: Vec<usize> = (0..sims.len())
            .filter(|&i| sims[i] >= self.settings.min_similarity)
            .collect();
        if qualifying.is_empty() {
            return Membership::outlier(sims.len());
        }

        let best = qualifying
            .iter()
            .copied()
            .max_by(|a, b| sims[*a].total_cmp(&sims[*b]).then(b.cmp(a)))
            .unwrap_or(qualifying[0]);
        let peak = sims[best];
        let mut probabilities = vec![0.0; sims.len()];
        let mut total = 0.0;
        for &i in &qualifying {
            let w = ((sims[i] - peak) / SOFTMAX_TEMPERATURE).exp();
            probabilities[i] = w;
            total += w;
        }
        for p in &mut probabilities {
            *p /= total;
        }

        // Probabilities summing to zero mean "no topic", whatever was nearest.
        let topic = if probabilities.iter().sum::<f64>() > 0.0 {
            best as i32
        } else {
            OUTLIER_TOPIC
        };
        Membership {
            topic,
            probabilities,
        }
    }

    /// Fill in size, keywords and representative documents from members.
    fn describe(&mut self, documents: &[&Document], memberships: &[Membership]) {
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); self.topics.len()];
        for (i, m) in memberships.iter().enumerate() {
            if !m.is_outlier() {
                members[m.topic as usize].push(i);
            }
        }

        let texts: Vec<Vec<&str>> = members
            .iter()
            .map(|idx| idx.iter().map(|&i| documents[i].text.as_str()).collect())
            .collect();
        let keywords = class_keywords(&texts, TOP_KEYWORDS);

        for ((topic, idx), representation) in self.topics.iter_mut().zip(&members).zip(keywords) {
            topic.size = idx.len();
            topic.representation = representation;

            let mut by_closeness: Vec<(usize, f64)> = idx
                .iter()
                .map(|&i| (i, memberships[i].probabilities[topic.id as usize]))
                .collect();
            by_closeness.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            topic.representative_docs = by_closeness
                .into_iter()
                .take(REPRESENTATIVE_DOCS)
                .map(|(i, _)| {
                    truncate_to_char_boundary(documents[i].text.trim(), REPRESENTATIVE_DOC_BYTES)
                        .to_string()
                })
                .collect();
        }
    }
}

/// Index and similarity of the closest centroid; earliest index wins ties.
fn nearest(v: &[f32], centroids: &[Vec<f32>]) -> (usize, f64) {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let s = dot(v, c);
        if s > best.1 {
            best = (i, s);
        }
    }
    best
}

/// Farthest-point seeding followed by Lloyd iterations on the unit sphere.
fn spherical_kmeans(vectors: &[&[f32]], k: usize, max_iterations: usize) -> Vec<Vec<f32>> {
    if k == 0 || vectors.is_empty() {
        return Vec::new();
    }

    let mut centroids: Vec<Vec<f32>> = vec![vectors[0].to_vec()];
    let mut closest: Vec<f64> = vectors.iter().map(|v| dot(v, vectors[0])).collect();
    while centroids.len() < k {
        let (next, sim) = closest
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .unwrap_or((0, 1.0));
        // Every remaining point coincides with a centroid.
        if sim >= 1.0 - 1e-9 {
            break;
        }
        let seed = vectors[next].to_vec();
        for (c, v) in closest.iter_mut().zip(vectors) {
            *c = c.max(dot(v, &seed));
        }
        centroids.push(seed);
    }

    let mut assignment: Vec<usize> = vec![usize::MAX; vectors.len()];
    for iteration in 0..max_iterations.max(1) {
        let mut changed = false;
        for (a, v) in assignment.iter_mut().zip(vectors) {
            let (c, _) = nearest(v, &centroids);
            if *a != c {
                *a = c;
                changed = true;
            }
        }
        if !changed {
            debug!(iteration, "k-means converged");
            break;
        }
        for (c, slot) in centroids.iter_mut().enumerate() {
            let members = vectors
                .iter()
                .zip(&assignment)
                .filter(|(_, a)| **a == c)
                .map(|(v, _)| *v);
            if let Some(mean) = centroid(members) {
                *slot = mean;
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_common::testing::doc;

    fn blob(prefix: &str, count: usize, axis: usize, text: &str) -> Vec<Document> {
        (0..count)
            .map(|i| {
                let mut e = vec![0.02 * (i % 3) as f32; 3];
                e[axis] = 1.0;
                doc(&format!("https://x/{prefix}{i}"), text, e, "Report")
            })
            .collect()
    }

    fn settings(cluster_count: usize, min_cluster_size: usize) -> ModelSettings {
        ModelSettings {
            cluster_count,
            min_cluster_size,
            min_similarity: 0.5,
            max_iterations: 50,
        }
    }

    #[test]
    fn separates_blobs_ordered_by_size() {
        let mut docs = blob("fish", 6, 0, "fish stock quota");
        docs.extend(blob("ship", 4, 1, "ship vessel port"));
        let refs: Vec<&Document> = docs.iter().collect();

        let (model, memberships) = TopicModel::fit(&refs, settings(2, 2));

        assert_eq!(model.topics.len(), 2);
        assert_eq!(model.topics[0].size, 6);
        assert_eq!(model.topics[1].size, 4);
        assert!(memberships[..6].iter().all(|m| m.topic == 0));
        assert!(memberships[6..].iter().all(|m| m.topic == 1));
        assert_eq!(model.topics[0].representation, vec!["fish", "quota", "stock"]);
        assert_eq!(model.topics[0].representative_docs.len(), 3);
    }

    #[test]
    fn small_clusters_dissolve_into_outliers() {
        let mut docs = blob("fish", 6, 0, "fish stock");
        docs.extend(blob("lone", 1, 2, "lonely"));
        let refs: Vec<&Document> = docs.iter().collect();

        let (model, memberships) = TopicModel::fit(&refs, settings(2, 3));

        assert_eq!(model.topics.len(), 1);
        let last = memberships.last().unwrap();
        assert!(last.is_outlier());
        assert_eq!(last.probabilities.iter().sum::<f64>(), 0.0);
        assert_eq!(last.confidence(), 0.0);
    }

    #[test]
    fn probabilities_sum_to_one_for_members() {
        let docs = blob("fish", 5, 0, "fish");
        let refs: Vec<&Document> = docs.iter().collect();
        let (_, memberships) = TopicModel::fit(&refs, settings(1, 1));
        for m in memberships {
            assert!((m.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            assert!(m.confidence() > 0.0 && m.confidence() <= 1.0);
        }
    }

    #[test]
    fn infer_matches_fit_and_handles_missing_embeddings() {
        let mut docs = blob("fish", 6, 0, "fish stock quota");
        docs.extend(blob("ship", 4, 1, "ship vessel port"));
        let refs: Vec<&Document> = docs.iter().collect();
        let (model, fitted) = TopicModel::fit(&refs, settings(2, 2));

        let inferred = model.infer(&refs);
        assert_eq!(
            fitted.iter().map(|m| m.topic).collect::<Vec<_>>(),
            inferred.iter().map(|m| m.topic).collect::<Vec<_>>()
        );

        let bare = Document::new("https://x/bare", "no vector", None, "Report");
        assert!(model.infer(&[&bare])[0].is_outlier());
    }

    #[test]
    fn empty_input_yields_empty_model() {
        let (model, memberships) = TopicModel::fit(&[], ModelSettings::default());
        assert!(model.is_empty());
        assert!(memberships.is_empty());
    }

    #[test]
    fn round_trips_through_json() {
        let docs = blob("fish", 4, 0, "fish stock");
        let refs: Vec<&Document> = docs.iter().collect();
        let (model, _) = TopicModel::fit(&refs, settings(1, 1));
        let json = serde_json::to_string(&model).unwrap();
        let restored: TopicModel = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, model);
    }
}
