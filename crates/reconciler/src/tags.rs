//! Topic tag catalog of managed-cloud providers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Free-form tags attached to topics, per cluster.
#[async_trait]
pub trait TagCatalog: Send + Sync {
    /// Tags of every tagged topic of `cluster`.
    async fn list_topic_tags(&self, cluster: &str) -> Result<BTreeMap<String, BTreeSet<String>>>;

    async fn add_topic_tags(&self, cluster: &str, topic: &str, tags: &[String]) -> Result<()>;

    async fn remove_topic_tag(&self, cluster: &str, topic: &str, tag: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagChange {
    Added { topic: String, tags: Vec<String> },
    Removed { topic: String, tag: String },
}

/// In-memory [`TagCatalog`] with a change journal.
#[derive(Clone, Default)]
pub struct InMemoryTagCatalog {
    tags: Arc<Mutex<BTreeMap<(String, String), BTreeSet<String>>>>,
    journal: Arc<Mutex<Vec<TagChange>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryTagCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tag(&self, cluster: &str, topic: &str, tag: &str) {
        self.tags
            .lock()
            .await
            .entry((cluster.to_string(), topic.to_string()))
            .or_default()
            .insert(tag.to_string());
    }

    pub async fn tags_of(&self, cluster: &str, topic: &str) -> BTreeSet<String> {
        self.tags
            .lock()
            .await
            .get(&(cluster.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn journal(&self) -> Vec<TagChange> {
        self.journal.lock().await.clone()
    }

    /// Make every call fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::tag_catalog("catalog unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TagCatalog for InMemoryTagCatalog {
    async fn list_topic_tags(&self, cluster: &str) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.check()?;
        Ok(self
            .tags
            .lock()
            .await
            .iter()
            .filter(|((c, _), tags)| c == cluster && !tags.is_empty())
            .map(|((_, topic), tags)| (topic.clone(), tags.clone()))
            .collect())
    }

    async fn add_topic_tags(&self, cluster: &str, topic: &str, tags: &[String]) -> Result<()> {
        self.check()?;
        self.tags
            .lock()
            .await
            .entry((cluster.to_string(), topic.to_string()))
            .or_default()
            .extend(tags.iter().cloned());
        self.journal.lock().await.push(TagChange::Added {
            topic: topic.to_string(),
            tags: tags.to_vec(),
        });
        Ok(())
    }

    async fn remove_topic_tag(&self, cluster: &str, topic: &str, tag: &str) -> Result<()> {
        self.check()?;
        if let Some(tags) = self
            .tags
            .lock()
            .await
            .get_mut(&(cluster.to_string(), topic.to_string()))
        {
            tags.remove(tag);
        }
        self.journal.lock().await.push(TagChange::Removed {
            topic: topic.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tags_are_scoped_by_cluster() -> Result<()> {
        let catalog = InMemoryTagCatalog::new();
        catalog.tag("a", "orders", "PII").await;
        catalog.tag("b", "orders", "GDPR").await;

        let tags = catalog.list_topic_tags("a").await?;
        assert_eq!(tags.len(), 1);
        assert!(tags.get("orders").is_some_and(|t| t.contains("PII")));
        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_catalog_fails() {
        let catalog = InMemoryTagCatalog::new();
        catalog.set_unavailable(true);
        assert!(matches!(
            catalog.list_topic_tags("a").await,
            Err(Error::TagCatalog { .. })
        ));
    }
}
