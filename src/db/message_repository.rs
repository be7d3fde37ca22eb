use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Message, MessageRole, MessageState, TokenUsage};

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stored messages of a conversation in sequence order.
    pub async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            "SELECT seq, role, name, content, state, error, response_time_ms,
                    input_tokens, output_tokens, created_at
             FROM messages
             WHERE conversation_id = $1 AND NOT deleted
             ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for conversation {conversation_id}: {e}");
            AppError::db_query(
                format!("Failed to fetch messages for conversation {conversation_id}"),
                e,
            )
        })?;

        rows.iter().map(message_from_row).collect()
    }

    /// Inserts the message under its conversation, inheriting the conversation's
    /// `deleted` flag so late writes never resurface a deleted conversation.
    pub async fn save(&self, conversation_id: &str, message: &Message) -> Result<(), AppError> {
        let error = match &message.state {
            MessageState::Failed { reason } => Some(reason.as_str()),
            _ => None,
        };
        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, seq, role, name, content, state, error,
                                   response_time_ms, input_tokens, output_tokens, created_at, deleted)
             SELECT c.id, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, c.deleted
             FROM conversations c
             WHERE c.id = $1",
        )
        .bind(conversation_id)
        .bind(to_column(message.seq))
        .bind(message.role.as_str())
        .bind(&message.name)
        .bind(&message.content)
        .bind(message.state.as_str())
        .bind(error)
        .bind(message.response_time_ms.map(to_column))
        .bind(message.usage.map(|u| to_column(u.input_tokens)))
        .bind(message.usage.map(|u| to_column(u.output_tokens)))
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save message {conversation_id}/{}: {e}", message.seq);
            AppError::db_query("Failed to save message", e)
        })?;
        if result.rows_affected() == 0 {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        Ok(())
    }

    pub async fn soft_delete_by_conversation_id(&self, conversation_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE messages SET deleted = TRUE WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete messages of conversation {conversation_id}: {e}");
                AppError::db_query("Failed to delete messages", e)
            })?;
        Ok(())
    }
}

fn message_from_row(row: &PgRow) -> Result<Message, AppError> {
    let role: String = row.try_get("role").map_err(|e| AppError::db_query("Failed to read role", e))?;
    let role = MessageRole::try_from(role).map_err(AppError::Unexpected)?;
    let state: String = row.try_get("state").map_err(|e| AppError::db_query("Failed to read state", e))?;
    let error: Option<String> =
        row.try_get("error").map_err(|e| AppError::db_query("Failed to read error", e))?;
    let state = MessageState::from_columns(&state, error).map_err(AppError::Unexpected)?;

    let seq: i64 = row.try_get("seq").map_err(|e| AppError::db_query("Failed to read seq", e))?;
    let response_time_ms: Option<i64> = row
        .try_get("response_time_ms")
        .map_err(|e| AppError::db_query("Failed to read response_time_ms", e))?;
    let input_tokens: Option<i64> = row
        .try_get("input_tokens")
        .map_err(|e| AppError::db_query("Failed to read input_tokens", e))?;
    let output_tokens: Option<i64> = row
        .try_get("output_tokens")
        .map_err(|e| AppError::db_query("Failed to read output_tokens", e))?;

    Ok(Message {
        seq: from_column(seq)?,
        role,
        name: row.try_get("name").map_err(|e| AppError::db_query("Failed to read name", e))?,
        content: row.try_get("content").map_err(|e| AppError::db_query("Failed to read content", e))?,
        state,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
        response_time_ms: response_time_ms.map(from_column).transpose()?,
        usage: match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(TokenUsage {
                input_tokens: from_column(input)?,
                output_tokens: from_column(output)?,
            }),
            _ => None,
        },
    })
}

fn to_column(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_column(value: i64) -> Result<u64, AppError> {
    u64::try_from(value).map_err(|_| AppError::Unexpected(format!("Negative value {value} in messages table")))
}
