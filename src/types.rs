use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity resolved from the session cookie, passed explicitly into every
/// handler that needs it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalProfile {
    pub id: String,
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub dob: String,
    pub gender: String,
    pub height: Option<i32>,
    pub weight: Option<i32>,
    pub medical_history: Vec<String>,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub created_at: String,
}

/// Validated onboarding submission, ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMedicalProfile {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: String,
    pub gender: String,
    pub height: Option<i32>,
    pub weight: Option<i32>,
    pub medical_history: Vec<String>,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub medical_context_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Chat list row with its denormalized latest-message preview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    pub medical_context_id: Option<String>,
    pub last_message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<Value>,
    pub created_at: String,
}

/// Entry for the medical-context dropdown on the new-chat form.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalContextOption {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
}

/// Raw onboarding form values. List fields arrive as JSON-serialized text
/// produced by the form's client-side chip inputs.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingForm {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub dob: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub medical_history: String,
    #[serde(default)]
    pub allergies: String,
    #[serde(default)]
    pub medications: String,
}

/// Form for `POST /chats`, which multiplexes the list page's two actions
/// through an `action` discriminator.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListActionForm {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub medical_context_id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatForm {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub medical_context_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageForm {
    #[serde(default)]
    pub content: String,
}

/// Body forwarded to the agent collaborator's `/chat` endpoint.
#[derive(Debug, Serialize)]
pub struct AgentChatRequest {
    pub chat_id: String,
    pub sender_id: String,
    pub message: String,
    pub user_message_id: String,
}
