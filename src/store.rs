//! Read/write contract of the mark store. The engine itself never touches it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::averages::AverageTree;
use crate::config::WeightConfig;
use crate::models::{Mark, StudentMarks};

/// Result of filing a mark: the mark it replaced and the rebuilt tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FiledMark {
    pub replaced: Option<Mark>,
    pub averages: AverageTree,
}

#[async_trait]
pub trait MarkStore: Send + Sync {
    async fn get_marks(&self, student_id: Uuid) -> anyhow::Result<Vec<Mark>>;

    async fn get_all_students(&self) -> anyhow::Result<Vec<StudentMarks>>;

    async fn save_averages(&self, student_id: Uuid, tree: &AverageTree) -> anyhow::Result<()>;

    async fn save_promotion_averages(
        &self,
        tree: &AverageTree,
        next_update: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Inserts the mark, replacing any mark with the same id, and saves the
    /// tree rebuilt from the new mark list. Either both writes land or neither does.
    async fn file_mark(
        &self,
        student_id: Uuid,
        mark: &Mark,
        config: &WeightConfig,
    ) -> anyhow::Result<FiledMark>;

    /// Name of a published mark, if the id is published.
    async fn published_mark(&self, mark_id: &str) -> anyhow::Result<Option<String>>;

    /// Pulls the mark from every student and unpublishes it. Returns the
    /// number of students that had filed it.
    async fn remove_mark_everywhere(&self, mark_id: &str) -> anyhow::Result<u64>;
}
