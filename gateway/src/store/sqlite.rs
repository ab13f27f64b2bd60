use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{ConversationStore, StoreError};
use crate::models::{Conversation, ConversationSummary, Exchange};

/// SQLite-backed conversation store.
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
}

impl SqliteConversationStore {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(db_error)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(db_error)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS exchanges (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                query TEXT NOT NULL,
                answer TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )",
            [],
        )
        .map_err(db_error)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(owner)",
            [],
        )
        .map_err(db_error)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_exchanges_conversation ON exchanges(conversation_id)",
            [],
        )
        .map_err(db_error)?;

        tracing::info!("Conversation store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::DatabaseError(e.to_string()))
    }
}

impl ConversationStore for SqliteConversationStore {
    fn create_conversation(&self, owner: &str) -> Result<String, StoreError> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO conversations (id, owner, created_at) VALUES (?1, ?2, ?3)",
            params![id, owner, Utc::now().to_rfc3339()],
        )
        .map_err(db_error)?;

        tracing::debug!(chat_id = %id, owner, "Created conversation");
        Ok(id)
    }

    fn append_exchange(&self, id: &str, query: &str, answer: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        if !exists {
            return Err(StoreError::NotFound(id.to_string()));
        }

        conn.execute(
            "INSERT INTO exchanges (conversation_id, query, answer, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, query, answer, Utc::now().to_rfc3339()],
        )
        .map_err(db_error)?;

        Ok(())
    }

    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock()?;

        let header: Option<(String, String)> = conn
            .query_row(
                "SELECT owner, created_at FROM conversations WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_error)?;

        let Some((owner, created_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT query, answer, created_at FROM exchanges
                 WHERE conversation_id = ?1 ORDER BY seq ASC",
            )
            .map_err(db_error)?;

        let exchanges = stmt
            .query_map(params![id], |row| {
                Ok(Exchange {
                    query: row.get(0)?,
                    answer: row.get(1)?,
                    created_at: parse_timestamp(&row.get::<_, String>(2)?),
                })
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;

        Ok(Some(Conversation {
            id: id.to_string(),
            owner,
            created_at: parse_timestamp(&created_at),
            exchanges,
        }))
    }

    fn list_conversations(&self, owner: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.created_at, COUNT(e.seq)
                 FROM conversations c
                 LEFT JOIN exchanges e ON e.conversation_id = c.id
                 WHERE c.owner = ?1
                 GROUP BY c.id
                 ORDER BY c.created_at DESC, c.rowid DESC",
            )
            .map_err(db_error)?;

        let summaries = stmt
            .query_map(params![owner], |row| {
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    created_at: parse_timestamp(&row.get::<_, String>(1)?),
                    exchange_count: row.get::<_, i64>(2)? as usize,
                })
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;

        Ok(summaries)
    }

    fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_error)?;

        tx.execute("DELETE FROM exchanges WHERE conversation_id = ?1", params![id])
            .map_err(db_error)?;
        let removed = tx
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(db_error)?;
        tx.commit().map_err(db_error)?;

        if removed > 0 {
            tracing::debug!(chat_id = %id, "Deleted conversation");
        }
        Ok(removed > 0)
    }
}

fn db_error(e: rusqlite::Error) -> StoreError {
    StoreError::DatabaseError(e.to_string())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> SqliteConversationStore {
        SqliteConversationStore::new(":memory:").unwrap()
    }

    #[test]
    fn test_create_and_append() {
        let store = memory_store();
        let id = store.create_conversation("alice").unwrap();

        store.append_exchange(&id, "hi", "hello there").unwrap();
        store.append_exchange(&id, "and?", "that's it").unwrap();

        let conversation = store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conversation.owner, "alice");
        let pairs: Vec<(&str, &str)> = conversation
            .exchanges
            .iter()
            .map(|e| (e.query.as_str(), e.answer.as_str()))
            .collect();
        assert_eq!(pairs, vec![("hi", "hello there"), ("and?", "that's it")]);
    }

    #[test]
    fn test_append_to_unknown_conversation_fails() {
        let store = memory_store();
        let err = store.append_exchange("nope", "q", "a").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_get_unknown_conversation_is_none() {
        assert!(memory_store().get_conversation("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_is_scoped_to_owner() {
        let store = memory_store();
        let a1 = store.create_conversation("alice").unwrap();
        let a2 = store.create_conversation("alice").unwrap();
        store.create_conversation("bob").unwrap();
        store.append_exchange(&a1, "q", "a").unwrap();

        let listed = store.list_conversations("alice").unwrap();
        assert_eq!(listed.len(), 2);
        let ids: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
        assert!(ids.contains(&a1.as_str()));
        assert!(ids.contains(&a2.as_str()));

        let first = listed.iter().find(|c| c.id == a1).unwrap();
        assert_eq!(first.exchange_count, 1);
        assert!(store.list_conversations("carol").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_conversation_and_exchanges() {
        let store = memory_store();
        let id = store.create_conversation("alice").unwrap();
        let kept = store.create_conversation("alice").unwrap();
        store.append_exchange(&id, "q", "a").unwrap();

        assert!(store.delete_conversation(&id).unwrap());
        assert!(store.get_conversation(&id).unwrap().is_none());
        assert!(matches!(
            store.append_exchange(&id, "q", "a"),
            Err(StoreError::NotFound(_))
        ));

        let listed = store.list_conversations("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, kept);

        assert!(!store.delete_conversation(&id).unwrap());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("nested/chats.db").display());

        let id = {
            let store = SqliteConversationStore::new(&url).unwrap();
            let id = store.create_conversation("alice").unwrap();
            store.append_exchange(&id, "q", "a").unwrap();
            id
        };

        let reopened = SqliteConversationStore::new(&url).unwrap();
        let conversation = reopened.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conversation.exchanges.len(), 1);
    }
}
