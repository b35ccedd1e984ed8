// 对话工作台：按用户保存会话与消息，支持消息改写截断与标题生成。
use crate::auth::Principal;
use crate::services::audit::{now_ts, AuditContext, AuditLogger};
use crate::services::chat::{ChatService, HistoryMessage};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::run_storage;
use crate::storage::{ChatMessageRecord, ChatSessionRecord, StorageBackend};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const TITLE_SOURCE_MESSAGES: i64 = 4;
const ALLOWED_ROLES: [&str; 3] = ["user", "assistant", "system"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionCreate {
    #[serde(default)]
    pub title: Option<String>,
}

/// 新增或改写消息的请求体。
#[derive(Debug, Clone, Deserialize)]
pub struct MessageInput {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub struct PlaygroundService {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<AuditLogger>,
    chat: Arc<ChatService>,
}

impl PlaygroundService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        audit: Arc<AuditLogger>,
        chat: Arc<ChatService>,
    ) -> Self {
        Self {
            storage,
            audit,
            chat,
        }
    }

    pub async fn list_sessions(&self, user_id: &str) -> ServiceResult<Vec<ChatSessionRecord>> {
        let user_id = user_id.to_string();
        let rows =
            run_storage(&self.storage, move |storage| storage.list_chat_sessions(&user_id)).await?;
        Ok(rows)
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        input: SessionCreate,
    ) -> ServiceResult<ChatSessionRecord> {
        let now = now_ts();
        let record = ChatSessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: input
                .title
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            created_at: now,
            updated_at: now,
        };
        let stored = record.clone();
        run_storage(&self.storage, move |storage| storage.insert_chat_session(&stored)).await?;
        Ok(record)
    }

    pub async fn list_messages(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> ServiceResult<Vec<ChatMessageRecord>> {
        let session = self.owned_session(user_id, session_id).await?;
        let rows = run_storage(&self.storage, move |storage| {
            storage.list_chat_messages(&session.id, None)
        })
        .await?;
        Ok(rows)
    }

    pub async fn add_message(
        &self,
        user_id: &str,
        session_id: &str,
        input: MessageInput,
    ) -> ServiceResult<ChatMessageRecord> {
        let session = self.owned_session(user_id, session_id).await?;
        let message = build_message(&session, user_id, input)?;
        let stored = message.clone();
        run_storage(&self.storage, move |storage| storage.insert_chat_message(&stored)).await?;
        Ok(message)
    }

    /// 改写一条消息：删除它及之后的全部消息，再写入新内容。
    pub async fn edit_message(
        &self,
        user_id: &str,
        session_id: &str,
        message_id: &str,
        input: MessageInput,
    ) -> ServiceResult<ChatMessageRecord> {
        let session = self.owned_session(user_id, session_id).await?;
        let message = build_message(&session, user_id, input)?;
        let stored = message.clone();
        let anchor = message_id.trim().to_string();
        let replaced = run_storage(&self.storage, move |storage| {
            storage.replace_chat_messages_from(&anchor, &stored)
        })
        .await?;
        if !replaced {
            return Err(ServiceError::not_found("Message not found"));
        }
        Ok(message)
    }

    /// 取会话前几条消息生成标题并保存。
    pub async fn update_title(
        &self,
        user_id: &str,
        principal: &Principal,
        session_id: &str,
    ) -> ServiceResult<String> {
        let mut session = self.owned_session(user_id, session_id).await?;
        let target = session.id.clone();
        let messages = run_storage(&self.storage, move |storage| {
            storage.list_chat_messages(&target, Some(TITLE_SOURCE_MESSAGES))
        })
        .await?;
        if messages.is_empty() {
            return Err(ServiceError::invalid_request("No messages found in session"));
        }
        let conversation = messages
            .iter()
            .map(|message| HistoryMessage::new(&message.role, message.content.clone()))
            .collect::<Vec<_>>();
        let title = self.chat.generate_title(principal, &conversation).await;
        session.title = Some(title.clone());
        let stored = session.clone();
        run_storage(&self.storage, move |storage| storage.update_chat_session(&stored)).await?;
        Ok(title)
    }

    pub async fn delete_session(
        &self,
        user_id: &str,
        session_id: &str,
        context: &AuditContext,
    ) -> ServiceResult<i64> {
        let session = self.owned_session(user_id, session_id).await?;
        let target = session.id.clone();
        let removed =
            run_storage(&self.storage, move |storage| storage.delete_chat_session(&target)).await?;
        info!("删除对话会话: id={}, messages={removed}", session.id);
        self.audit
            .record(
                context,
                "delete_chat_session",
                "chat_session",
                Some(&session.id),
                json!({ "message": format!("Deleted chat session with {removed} messages") }),
            )
            .await;
        Ok(removed)
    }

    /// 会话不存在或不属于该用户时一律按未找到处理。
    async fn owned_session(&self, user_id: &str, session_id: &str) -> ServiceResult<ChatSessionRecord> {
        let user_id = user_id.to_string();
        let session_id = session_id.to_string();
        run_storage(&self.storage, move |storage| {
            storage.get_chat_session(&session_id, &user_id)
        })
        .await?
        .ok_or_else(|| ServiceError::not_found("Chat session not found"))
    }
}

fn build_message(
    session: &ChatSessionRecord,
    user_id: &str,
    input: MessageInput,
) -> ServiceResult<ChatMessageRecord> {
    let role = input.role.trim().to_lowercase();
    if !ALLOWED_ROLES.contains(&role.as_str()) {
        return Err(ServiceError::invalid_request(format!(
            "Unsupported message role: {}",
            input.role
        )));
    }
    Ok(ChatMessageRecord {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        // 只有用户消息记录发送人。
        user_id: (role == "user").then(|| user_id.to_string()),
        role,
        content: input.content,
        metadata: input.metadata.unwrap_or_else(|| json!({})),
        created_at: now_ts(),
    })
}
