//! Open questions raised by the model during enrichment

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenQuestion {
    pub id: Uuid,
    pub project_id: Uuid,
    pub text: String,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait QuestionSink: Send + Sync {
    async fn submit(&self, project_id: Uuid, conversation_id: Option<&str>, questions: &[String]);
}

/// Per-project in-memory question list
#[derive(Default)]
pub struct QuestionQueue {
    questions: RwLock<HashMap<Uuid, Vec<OpenQuestion>>>,
}

impl QuestionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self, project_id: Uuid) -> Vec<OpenQuestion> {
        self.questions
            .read()
            .await
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuestionSink for QuestionQueue {
    async fn submit(&self, project_id: Uuid, conversation_id: Option<&str>, questions: &[String]) {
        let now = Utc::now();
        let mut all = self.questions.write().await;
        let list = all.entry(project_id).or_default();
        for text in questions.iter().map(|q| q.trim()).filter(|q| !q.is_empty()) {
            if list.iter().any(|q| q.text == text) {
                continue;
            }
            list.push(OpenQuestion {
                id: Uuid::new_v4(),
                project_id,
                text: text.to_string(),
                conversation_id: conversation_id.map(str::to_string),
                created_at: now,
            });
        }
    }
}
