//! SQLite-backed [`InteractionStore`].
//!
//! The relational implementation of the storage boundary. Schema columns are
//! exactly the [`Interaction`] and [`TemplateIntelligence`] fields, plus a
//! `question_norm` column so case-insensitive lookups can use an index.
//!
//! rusqlite is synchronous, so every statement runs on the blocking pool via
//! [`tokio::task::spawn_blocking`] while holding the single connection lock.
//! Async worker threads never wait on SQLite I/O.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use super::{
    normalize_question, AnswerQuery, FeedbackKind, Interaction, InteractionStore, SourceTier,
    StoreError, TemplateIntelligence,
};
use crate::classify::Category;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS interactions (
    id              TEXT PRIMARY KEY,
    template_id     TEXT NOT NULL,
    question        TEXT NOT NULL,
    question_norm   TEXT NOT NULL,
    answer          TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    source_tier     TEXT NOT NULL,
    category        TEXT NOT NULL,
    learning_score  INTEGER NOT NULL DEFAULT 0,
    user_feedback   TEXT
);

CREATE INDEX IF NOT EXISTS idx_interactions_lookup
    ON interactions(template_id, question_norm, created_at);
CREATE INDEX IF NOT EXISTS idx_interactions_created_at
    ON interactions(created_at);

CREATE TABLE IF NOT EXISTS template_intelligence (
    template_id       TEXT PRIMARY KEY,
    common_questions  TEXT NOT NULL,
    success_rate      REAL NOT NULL,
    last_updated      INTEGER NOT NULL
);
"#;

const SELECT_COLUMNS: &str = "id, template_id, question, answer, user_id, created_at, \
     source_tier, category, learning_score, user_feedback";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

/// Raw column values before label parsing.
struct RawRow {
    id: String,
    template_id: String,
    question: String,
    answer: String,
    user_id: String,
    created_at: i64,
    source_tier: String,
    category: String,
    learning_score: i64,
    user_feedback: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            template_id: row.get(1)?,
            question: row.get(2)?,
            answer: row.get(3)?,
            user_id: row.get(4)?,
            created_at: row.get(5)?,
            source_tier: row.get(6)?,
            category: row.get(7)?,
            learning_score: row.get(8)?,
            user_feedback: row.get(9)?,
        })
    }

    fn into_interaction(self) -> Result<Interaction, StoreError> {
        let source_tier = SourceTier::from_label(&self.source_tier).ok_or_else(|| {
            StoreError::Serialization(format!("unknown source tier '{}'", self.source_tier))
        })?;
        let category = Category::from_label(&self.category).ok_or_else(|| {
            StoreError::Serialization(format!("unknown category '{}'", self.category))
        })?;
        let user_feedback = match self.user_feedback.as_deref() {
            None => None,
            Some(label) => Some(FeedbackKind::from_label(label).ok_or_else(|| {
                StoreError::Serialization(format!("unknown feedback '{label}'"))
            })?),
        };
        Ok(Interaction {
            id: self.id,
            template_id: self.template_id,
            question: self.question,
            answer: self.answer,
            user_id: self.user_id,
            created_at: u64::try_from(self.created_at).unwrap_or(0),
            source_tier,
            category,
            learning_score: self.learning_score,
            user_feedback,
        })
    }
}

fn to_sql_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// SQLite store. One connection guarded by a mutex.
pub struct SqliteInteractionStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteInteractionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteInteractionStore").finish_non_exhaustive()
    }
}

impl SqliteInteractionStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Sqlite`] if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Private in-memory database, for tests and ephemeral runs.
    ///
    /// # Errors
    ///
    /// [`StoreError::Sqlite`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// [`StoreError::Sqlite`] if the schema cannot be created.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&conn.lock()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }

    fn query_interactions(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Interaction>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRow::into_interaction).collect()
    }

    fn read_intelligence(
        conn: &Connection,
        template_id: &str,
    ) -> Result<Option<TemplateIntelligence>, StoreError> {
        let row = conn
            .query_row(
                "SELECT common_questions, success_rate, last_updated
                 FROM template_intelligence WHERE template_id = ?1",
                params![template_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(questions, success_rate, last_updated)| {
            let common_questions: Vec<String> = serde_json::from_str(&questions)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(TemplateIntelligence {
                template_id: template_id.to_string(),
                common_questions,
                success_rate,
                last_updated: u64::try_from(last_updated).unwrap_or(0),
            })
        })
        .transpose()
    }

    fn write_intelligence(
        conn: &Connection,
        intel: &TemplateIntelligence,
    ) -> Result<(), StoreError> {
        let questions = serde_json::to_string(&intel.common_questions)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO template_intelligence (template_id, common_questions, success_rate, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(template_id) DO UPDATE SET
                common_questions = excluded.common_questions,
                success_rate = excluded.success_rate,
                last_updated = excluded.last_updated",
            params![
                intel.template_id,
                questions,
                intel.success_rate,
                to_sql_secs(intel.last_updated)
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl InteractionStore for SqliteInteractionStore {
    async fn insert(&self, interaction: Interaction) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO interactions (id, template_id, question, question_norm, answer,
                    user_id, created_at, source_tier, category, learning_score, user_feedback)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    interaction.id,
                    interaction.template_id,
                    interaction.question,
                    normalize_question(&interaction.question),
                    interaction.answer,
                    interaction.user_id,
                    to_sql_secs(interaction.created_at),
                    interaction.source_tier.as_str(),
                    interaction.category.as_str(),
                    interaction.learning_score,
                    interaction.user_feedback.map(|f| f.as_str()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Interaction>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SELECT_COLUMNS} FROM interactions WHERE id = ?1");
            let raw = conn
                .query_row(&sql, params![id], RawRow::from_row)
                .optional()?;
            raw.map(RawRow::into_interaction).transpose()
        })
        .await
    }

    async fn find_answers(&self, query: &AnswerQuery) -> Result<Vec<Interaction>, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM interactions
                 WHERE template_id = ?1 AND question_norm = ?2 AND created_at >= ?3"
            );
            let since = to_sql_secs(query.since_secs);
            let rows = Self::query_interactions(
                conn,
                &sql,
                &[&query.template_id, &query.normalized_question, &since],
            )?;
            Ok(rows
                .into_iter()
                .filter(|r| query.tiers.contains(&r.source_tier))
                .collect())
        })
        .await
    }

    async fn apply_feedback(
        &self,
        id: &str,
        feedback: FeedbackKind,
        score_delta: i64,
    ) -> Result<Interaction, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE interactions
                 SET user_feedback = ?1, learning_score = learning_score + ?2
                 WHERE id = ?3",
                params![feedback.as_str(), score_delta, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            let sql = format!("SELECT {SELECT_COLUMNS} FROM interactions WHERE id = ?1");
            conn.query_row(&sql, params![id], RawRow::from_row)?
                .into_interaction()
        })
        .await
    }

    async fn recent_for_template(
        &self,
        template_id: &str,
        since_secs: u64,
    ) -> Result<Vec<Interaction>, StoreError> {
        let template_id = template_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM interactions
                 WHERE template_id = ?1 AND created_at >= ?2
                 ORDER BY created_at ASC"
            );
            let since = to_sql_secs(since_secs);
            Self::query_interactions(conn, &sql, &[&template_id, &since])
        })
        .await
    }

    async fn active_templates(&self, since_secs: u64) -> Result<Vec<String>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT template_id FROM interactions
                 WHERE created_at >= ?1 ORDER BY template_id ASC",
            )?;
            let ids = stmt
                .query_map(params![to_sql_secs(since_secs)], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn prune_before(&self, cutoff_secs: u64) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM interactions WHERE created_at < ?1",
                params![to_sql_secs(cutoff_secs)],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn merge_intelligence(
        &self,
        template_id: &str,
        questions: &[String],
        success_rate: f64,
        now: u64,
    ) -> Result<TemplateIntelligence, StoreError> {
        let template_id = template_id.to_string();
        let questions = questions.to_vec();
        self.with_conn(move |conn| {
            let mut intel = Self::read_intelligence(conn, &template_id)?
                .unwrap_or_else(|| TemplateIntelligence::empty(&template_id, now));
            intel.absorb_questions(questions.iter().map(String::as_str));
            intel.success_rate = success_rate.clamp(0.0, 100.0);
            intel.last_updated = now;
            Self::write_intelligence(conn, &intel)?;
            Ok(intel)
        })
        .await
    }

    async fn intelligence(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateIntelligence>, StoreError> {
        let template_id = template_id.to_string();
        self.with_conn(move |conn| Self::read_intelligence(conn, &template_id))
            .await
    }

    async fn reset_intelligence(&self, template_id: &str) -> Result<(), StoreError> {
        let template_id = template_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE template_intelligence SET common_questions = '[]' WHERE template_id = ?1",
                params![template_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteInteractionStore {
        SqliteInteractionStore::open_in_memory().expect("in-memory sqlite")
    }

    fn record(question: &str, tier: SourceTier, at: u64) -> Interaction {
        Interaction::new("T1", "u1", question, "answer", tier, Category::Credentials, at)
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let store = store();
        let rec = record("How?", SourceTier::External, 100);
        store.insert(rec.clone()).await.expect("insert");
        assert_eq!(store.get(&rec.id).await.expect("get"), Some(rec));
    }

    #[tokio::test]
    async fn test_find_answers_case_insensitive_and_tier_filtered() {
        let store = store();
        store
            .insert(record("How do I test?", SourceTier::External, 100))
            .await
            .expect("insert");
        store
            .insert(record("HOW DO I TEST?", SourceTier::Fallback, 100))
            .await
            .expect("insert");
        let query = AnswerQuery {
            normalized_question: "how do i test?".into(),
            template_id: "T1".into(),
            since_secs: 0,
            tiers: vec![SourceTier::External, SourceTier::Learned],
        };
        let found = store.find_answers(&query).await.expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_tier, SourceTier::External);
    }

    #[tokio::test]
    async fn test_apply_feedback_and_prune() {
        let store = store();
        let rec = record("Q", SourceTier::External, 10);
        store.insert(rec.clone()).await.expect("insert");
        let updated = store
            .apply_feedback(&rec.id, FeedbackKind::Helpful, 2)
            .await
            .expect("feedback");
        assert_eq!(updated.learning_score, 2);
        assert_eq!(updated.user_feedback, Some(FeedbackKind::Helpful));

        assert!(matches!(
            store.apply_feedback("missing", FeedbackKind::Helpful, 2).await,
            Err(StoreError::NotFound(_))
        ));

        assert_eq!(store.prune_before(11).await.expect("prune"), 1);
        assert_eq!(store.get(&rec.id).await.expect("get"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_leave_async_workers_free() {
        let store = Arc::new(store());
        let writers: Vec<_> = (0..32u64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert(record(&format!("Q{i}"), SourceTier::External, 100 + i))
                        .await
                })
            })
            .collect();

        // A timer on the async runtime keeps firing while the writes are in flight.
        let ticker = tokio::spawn(async {
            for _ in 0..5 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        });
        tokio::time::timeout(std::time::Duration::from_secs(5), ticker)
            .await
            .expect("runtime stayed responsive")
            .expect("ticker");

        for writer in writers {
            writer.await.expect("join").expect("insert");
        }
        let recent = store.recent_for_template("T1", 0).await.expect("recent");
        assert_eq!(recent.len(), 32);
        assert!(recent.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_intelligence_merge_and_reset() {
        let store = store();
        store
            .merge_intelligence("T1", &["Q1".into()], 90.0, 5)
            .await
            .expect("merge");
        let intel = store
            .merge_intelligence("T1", &["q1".into(), "Q2".into()], 70.0, 6)
            .await
            .expect("merge");
        assert_eq!(intel.common_questions, vec!["Q1", "Q2"]);
        assert_eq!(intel.success_rate, 70.0);

        store.reset_intelligence("T1").await.expect("reset");
        let intel = store.intelligence("T1").await.expect("read").expect("row");
        assert!(intel.common_questions.is_empty());
    }
}
