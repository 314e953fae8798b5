//! Map run-local cluster ids back onto persisted topic names.
//!
//! Matching is exact equality of the ordered keyword signature. A cluster
//! whose keywords drift by a single term will not resolve.

use std::collections::HashMap;

use tracing::warn;

use taxon_common::{keyword_signature, DerivedTopic, MISCELLANEOUS};

use crate::model::TopicCluster;

pub struct IdentityResolver {
    by_signature: HashMap<String, String>,
}

impl IdentityResolver {
    pub fn new(persisted: &[DerivedTopic]) -> Self {
        let mut by_signature = HashMap::new();
        for topic in persisted {
            if topic.topic_name == MISCELLANEOUS {
                continue;
            }
            let signature = topic.signature();
            if let Some(existing) = by_signature.get(&signature) {
                warn!(
                    %signature,
                    kept = %existing,
                    ignored = %topic.topic_name,
                    "Two persisted topics share a signature"
                );
                continue;
            }
            by_signature.insert(signature, topic.topic_name.clone());
        }
        Self { by_signature }
    }

    pub fn len(&self) -> usize {
        self.by_signature.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_signature.is_empty()
    }

    pub fn resolve(&self, cluster: &TopicCluster) -> Option<&str> {
        self.by_signature
            .get(&keyword_signature(&cluster.representation))
            .map(String::as_str)
    }

    /// Resolution for every cluster, keyed by cluster id.
    pub fn resolve_all<'a>(
        &'a self,
        clusters: &[TopicCluster],
    ) -> HashMap<i32, Option<&'a str>> {
        clusters.iter().map(|c| (c.id, self.resolve(c))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(name: &str, keywords: &[&str]) -> DerivedTopic {
        DerivedTopic {
            topic_name: name.into(),
            representation: keywords.iter().map(|k| k.to_string()).collect(),
            representative_docs: vec![],
        }
    }

    fn cluster(id: i32, keywords: &[&str]) -> TopicCluster {
        TopicCluster {
            id,
            centroid: vec![1.0],
            size: 1,
            representation: keywords.iter().map(|k| k.to_string()).collect(),
            representative_docs: vec![],
        }
    }

    #[test]
    fn identical_signature_resolves_to_persisted_name() {
        let resolver = IdentityResolver::new(&[persisted("Fish stocks", &["stock", "quota", "fish"])]);
        assert_eq!(
            resolver.resolve(&cluster(7, &["stock", "quota", "fish"])),
            Some("Fish stocks")
        );
    }

    #[test]
    fn reordered_or_drifted_keywords_do_not_resolve() {
        let resolver = IdentityResolver::new(&[persisted("Fish stocks", &["stock", "quota", "fish"])]);
        assert_eq!(resolver.resolve(&cluster(0, &["fish", "quota", "stock"])), None);
        assert_eq!(resolver.resolve(&cluster(0, &["stock", "quota", "fishing"])), None);
    }

    #[test]
    fn first_persisted_topic_wins_on_duplicate_signature() {
        let resolver = IdentityResolver::new(&[
            persisted("A", &["x", "y"]),
            persisted("B", &["x", "y"]),
            persisted(MISCELLANEOUS, &["z"]),
        ]);
        assert_eq!(resolver.len(), 1);
        let resolved = resolver.resolve_all(&[cluster(0, &["x", "y"]), cluster(1, &["z"])]);
        assert_eq!(resolved[&0], Some("A"));
        assert_eq!(resolved[&1], None);
    }
}
