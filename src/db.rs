use crate::constants::DB_PRAGMAS;
use crate::types::{
    MessageId, Result, Role, Session, SessionId, StoredMessage, StudyError, User, UserId,
};
use sqlx::sqlite::{SqliteConnection, SqliteExecutor, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(StudyError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(StudyError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(StudyError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(StudyError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// --- USERS ---

pub async fn find_user(pool: &DbPool, user_id: &UserId) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, email, created_at FROM users WHERE id = ?")
        .bind(&user_id.0)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(Some(User {
            id: UserId(r.try_get("id")?),
            email: r.try_get("email")?,
            created_at: r.try_get("created_at")?,
        })),
        None => Ok(None),
    }
}

/// Records a user the gateway has authenticated. Existing rows are left untouched.
pub async fn upsert_user(pool: &DbPool, user_id: &UserId, email: Option<&str>) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO users (id, email, created_at) VALUES (?, ?, ?)")
        .bind(&user_id.0)
        .bind(email)
        .bind(now_millis())
        .execute(pool)
        .await?;
    Ok(())
}

/// --- SESSIONS ---

fn row_to_session(r: &SqliteRow) -> Result<Session> {
    let user_id: Option<String> = r.try_get("user_id")?;
    Ok(Session {
        id: SessionId(r.try_get("id")?),
        user_id: user_id.map(UserId),
        topic: r.try_get("topic")?,
        created_at: r.try_get("created_at")?,
    })
}

pub async fn get_session(pool: &DbPool, session_id: &SessionId) -> Result<Option<Session>> {
    let row = sqlx::query("SELECT id, user_id, topic, created_at FROM sessions WHERE id = ?")
        .bind(&session_id.0)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_session).transpose()
}

/// Returns the session, creating it for `user_id` on the first interaction.
pub async fn ensure_session(
    pool: &DbPool,
    session_id: &SessionId,
    user_id: &UserId,
) -> Result<Session> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO sessions (id, user_id, topic, created_at) VALUES (?, ?, '', ?)",
    )
    .bind(&session_id.0)
    .bind(&user_id.0)
    .bind(now_millis())
    .execute(pool)
    .await?;

    if inserted.rows_affected() > 0 {
        tracing::info!("Created session {} for user {}", session_id.short(), user_id);
    }

    let session = match get_session(pool, session_id).await? {
        Some(s) => s,
        None => {
            return Err(StudyError::internal(format!(
                "Session {} vanished after insert",
                session_id
            ))
            .into())
        }
    };

    match &session.user_id {
        Some(owner) if owner == user_id => Ok(session),
        _ => Err(StudyError::Forbidden(format!(
            "Session {} belongs to another user",
            session_id.short()
        ))
        .into()),
    }
}

/// The session's topic, or `None` while it is still unassigned.
pub async fn session_topic(pool: &DbPool, session_id: &SessionId) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT topic FROM sessions WHERE id = ?")
        .bind(&session_id.0)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(t,)| t).filter(|t| !t.trim().is_empty()))
}

/// Assigns the topic only while it is empty. Returns whether this call set it.
pub async fn set_topic_if_empty<'e, E>(executor: E, session_id: &SessionId, topic: &str) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE sessions SET topic = ? WHERE id = ? AND topic = ''")
        .bind(topic)
        .bind(&session_id.0)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// --- MESSAGES ---

const MESSAGE_COLUMNS: &str = "id, session_id, user_id, role, content, created_at";

fn row_to_message(r: &SqliteRow) -> Result<StoredMessage> {
    let role: String = r.try_get("role")?;
    let role = match Role::parse(&role) {
        Some(role) => role,
        None => return Err(StudyError::internal(format!("Unknown stored role: {}", role)).into()),
    };
    let user_id: Option<String> = r.try_get("user_id")?;
    Ok(StoredMessage {
        id: MessageId(r.try_get("id")?),
        session_id: SessionId(r.try_get("session_id")?),
        user_id: user_id.map(UserId),
        role,
        content: r.try_get("content")?,
        created_at: r.try_get("created_at")?,
    })
}

/// Whole transcript in display order.
pub async fn list_messages(pool: &DbPool, session_id: &SessionId) -> Result<Vec<StoredMessage>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE session_id = ? ORDER BY created_at ASC, rowid ASC",
        MESSAGE_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(&session_id.0).fetch_all(pool).await?;
    rows.iter().map(row_to_message).collect()
}

/// The last `limit` messages of a session, oldest first.
pub async fn recent_messages(
    pool: &DbPool,
    session_id: &SessionId,
    limit: usize,
) -> Result<Vec<StoredMessage>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        MESSAGE_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(&session_id.0)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    let mut messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>>>()?;
    messages.reverse();
    Ok(messages)
}

pub async fn get_message<'e, E>(executor: E, message_id: &MessageId) -> Result<Option<StoredMessage>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(&message_id.0)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_message).transpose()
}

pub async fn insert_message<'e, E>(executor: E, message: &StoredMessage) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO messages (id, session_id, user_id, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id.0)
    .bind(&message.session_id.0)
    .bind(message.user_id.as_ref().map(|u| u.0.as_str()))
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Rewrites a message in place. Returns whether a row in `session_id` matched.
pub async fn update_message_content<'e, E>(
    executor: E,
    session_id: &SessionId,
    message_id: &MessageId,
    content: &str,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE messages SET content = ? WHERE id = ? AND session_id = ?")
        .bind(content)
        .bind(&message_id.0)
        .bind(&session_id.0)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Deletes the message directly after `user_message` when it is an assistant reply.
/// Returns the removed message so its slot in the ordering can be reused.
pub async fn delete_following_assistant(
    conn: &mut SqliteConnection,
    user_message: &StoredMessage,
) -> Result<Option<StoredMessage>> {
    let sql = format!(
        "SELECT {} FROM messages
         WHERE session_id = ?
           AND (created_at > ? OR (created_at = ? AND rowid > (SELECT rowid FROM messages WHERE id = ?)))
         ORDER BY created_at ASC, rowid ASC
         LIMIT 1",
        MESSAGE_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(&user_message.session_id.0)
        .bind(user_message.created_at)
        .bind(user_message.created_at)
        .bind(&user_message.id.0)
        .fetch_optional(&mut *conn)
        .await?;

    let next = match row.as_ref().map(row_to_message).transpose()? {
        Some(m) if m.role == Role::Assistant => m,
        _ => return Ok(None),
    };

    sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(&next.id.0)
        .execute(&mut *conn)
        .await?;
    tracing::debug!("Removed assistant reply {} after edited message {}", next.id, user_message.id);
    Ok(Some(next))
}
