//! On-demand consumer group offset resets.
//!
//! Nothing here is reconciled; a reset is requested for one group, computed
//! against the live partition bounds and, unless it is a dry run, committed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::broker::{ConsumerGroupState, KafkaAdmin, OffsetSpec, TopicPartition};
use crate::error::{Error, Result};
use crate::executor::bounded;

/// Which partitions of the group a reset applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSelector {
    /// Every partition the group has committed offsets for.
    All,
    /// Every partition of one topic.
    Topic(String),
    Partition(TopicPartition),
}

impl FromStr for TopicSelector {
    type Err = Error;

    /// Parses `*`, `topic` or `topic:partition`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::All);
        }
        match s.rsplit_once(':') {
            Some((topic, partition)) if !topic.is_empty() => {
                let partition = partition.parse::<i32>().map_err(|_| {
                    Error::invalid_offset_reset(format!("invalid partition in '{s}'"))
                })?;
                Ok(Self::Partition(TopicPartition::new(topic, partition)))
            }
            Some(_) => Err(Error::invalid_offset_reset(format!("missing topic in '{s}'"))),
            None if s.is_empty() => Err(Error::invalid_offset_reset("empty topic selector")),
            None => Ok(Self::Topic(s.to_string())),
        }
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Topic(topic) => f.write_str(topic),
            Self::Partition(tp) => write!(f, "{}:{}", tp.topic, tp.partition),
        }
    }
}

/// How new offsets are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMethod {
    ToEarliest,
    ToLatest,
    /// First offset written at or after the instant.
    ToDatetime(DateTime<Utc>),
    /// First offset written at or after `now - duration`.
    ByDuration(Duration),
    /// Move the committed offset by `n`.
    ShiftBy(i64),
    ToOffset(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub group: String,
    pub selector: TopicSelector,
    pub method: ResetMethod,
    /// Compute the new offsets without committing them.
    pub dry_run: bool,
}

/// Offset resets against one managed cluster.
pub struct ConsumerGroupService {
    cluster: String,
    admin: Arc<dyn KafkaAdmin>,
    timeout: Duration,
}

impl ConsumerGroupService {
    pub fn new(cluster: impl Into<String>, admin: Arc<dyn KafkaAdmin>, timeout: Duration) -> Self {
        Self {
            cluster: cluster.into(),
            admin,
            timeout,
        }
    }

    /// Compute and, unless `dry_run`, commit new offsets for the group.
    ///
    /// Offsets are clamped into each partition's `[earliest, latest]`. Groups
    /// with live members are refused.
    pub async fn reset_offsets(&self, request: &ResetRequest) -> Result<BTreeMap<TopicPartition, i64>> {
        let group = &request.group;
        let state = bounded(
            "describe_consumer_group_state",
            self.timeout,
            self.admin.describe_consumer_group_state(group),
        )
        .await?;
        if !matches!(state, ConsumerGroupState::Empty | ConsumerGroupState::Dead) {
            return Err(Error::GroupActive {
                group: group.clone(),
                state: state.to_string(),
            });
        }

        let committed = bounded(
            "list_consumer_group_offsets",
            self.timeout,
            self.admin.list_consumer_group_offsets(group),
        )
        .await?;
        let partitions = self.select(&request.selector, &committed).await?;
        if partitions.is_empty() {
            return Err(Error::invalid_offset_reset(format!(
                "selector '{}' matches no partition of group '{group}'",
                request.selector
            )));
        }

        let earliest = self.offsets(&partitions, OffsetSpec::Earliest).await?;
        let latest = self.offsets(&partitions, OffsetSpec::Latest).await?;
        let targets = match request.method {
            ResetMethod::ToEarliest => earliest.clone(),
            ResetMethod::ToLatest => latest.clone(),
            ResetMethod::ToDatetime(at) => {
                self.offsets(&partitions, OffsetSpec::Timestamp(at.timestamp_millis()))
                    .await?
            }
            ResetMethod::ByDuration(ago) => {
                let ago = chrono::Duration::from_std(ago)
                    .map_err(|e| Error::invalid_offset_reset(format!("duration out of range: {e}")))?;
                let at = Utc::now().checked_sub_signed(ago).ok_or_else(|| {
                    Error::invalid_offset_reset(format!("no instant {ago} before now"))
                })?;
                self.offsets(&partitions, OffsetSpec::Timestamp(at.timestamp_millis()))
                    .await?
            }
            ResetMethod::ShiftBy(n) => partitions
                .iter()
                .map(|tp| {
                    let current = committed.get(tp).or_else(|| earliest.get(tp)).copied().unwrap_or(0);
                    (tp.clone(), current.saturating_add(n))
                })
                .collect(),
            ResetMethod::ToOffset(n) => partitions.iter().map(|tp| (tp.clone(), n)).collect(),
        };

        let offsets: BTreeMap<TopicPartition, i64> = targets
            .into_iter()
            .map(|(tp, offset)| {
                let low = earliest.get(&tp).copied().unwrap_or(0);
                let high = latest.get(&tp).copied().unwrap_or(low).max(low);
                (tp, offset.clamp(low, high))
            })
            .collect();

        if request.dry_run {
            info!(cluster = %self.cluster, group = %group, partitions = offsets.len(), "Offset reset computed (dry run)");
            return Ok(offsets);
        }

        bounded(
            "alter_consumer_group_offsets",
            self.timeout,
            self.admin.alter_consumer_group_offsets(group, &offsets),
        )
        .await?;
        info!(
            cluster = %self.cluster,
            group = %group,
            selector = %request.selector,
            method = ?request.method,
            partitions = offsets.len(),
            "Consumer group offsets reset"
        );
        Ok(offsets)
    }

    async fn select(
        &self,
        selector: &TopicSelector,
        committed: &BTreeMap<TopicPartition, i64>,
    ) -> Result<Vec<TopicPartition>> {
        match selector {
            TopicSelector::All => Ok(committed.keys().cloned().collect()),
            TopicSelector::Partition(tp) => Ok(vec![tp.clone()]),
            TopicSelector::Topic(topic) => {
                let names = [topic.clone()];
                let described = bounded(
                    "describe_topics",
                    self.timeout,
                    self.admin.describe_topics(&names),
                )
                .await?;
                Ok(described
                    .iter()
                    .flat_map(|t| (0..t.partitions).map(|p| TopicPartition::new(&t.name, p)))
                    .collect())
            }
        }
    }

    async fn offsets(
        &self,
        partitions: &[TopicPartition],
        spec: OffsetSpec,
    ) -> Result<BTreeMap<TopicPartition, i64>> {
        bounded(
            "list_offsets",
            self.timeout,
            self.admin.list_offsets(partitions, spec),
        )
        .await
    }
}
