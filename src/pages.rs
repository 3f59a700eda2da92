use axum::response::Html;
use minijinja::{context, Environment};

use crate::error::AppError;
use crate::types::{
    Chat, ChatMessage, ChatSummary, CurrentUser, MedicalContextOption, MedicalProfile,
};

const LANDING_TEMPLATE: &str = include_str!("pages/landing.html");
const LOGIN_TEMPLATE: &str = include_str!("pages/login.html");
const REGISTER_TEMPLATE: &str = include_str!("pages/register.html");
const ONBOARDING_TEMPLATE: &str = include_str!("pages/onboarding.html");
const HOME_TEMPLATE: &str = include_str!("pages/home.html");
const CHATS_TEMPLATE: &str = include_str!("pages/chats.html");
const NEW_CHAT_TEMPLATE: &str = include_str!("pages/chat_new.html");
const CHAT_TEMPLATE: &str = include_str!("pages/chat.html");

fn render_page(
    name: &'static str,
    source: &'static str,
    ctx: minijinja::Value,
) -> Result<Html<String>, AppError> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .map_err(|err| render_error(name, err))?;
    let template = env
        .get_template(name)
        .map_err(|err| render_error(name, err))?;
    let body = template.render(ctx).map_err(|err| render_error(name, err))?;
    Ok(Html(body))
}

fn render_error(name: &str, err: minijinja::Error) -> AppError {
    AppError::Internal {
        message: format!("Failed to render {name}"),
        details: err.to_string(),
    }
}

pub fn landing_page() -> Result<Html<String>, AppError> {
    render_page("landing.html", LANDING_TEMPLATE, context! {})
}

pub fn login_page() -> Result<Html<String>, AppError> {
    render_page("login.html", LOGIN_TEMPLATE, context! {})
}

pub fn register_page() -> Result<Html<String>, AppError> {
    render_page("register.html", REGISTER_TEMPLATE, context! {})
}

pub fn onboarding_page(user: &CurrentUser) -> Result<Html<String>, AppError> {
    render_page(
        "onboarding.html",
        ONBOARDING_TEMPLATE,
        context! { user => user },
    )
}

pub fn home_page(user: &CurrentUser, profile: &MedicalProfile) -> Result<Html<String>, AppError> {
    render_page(
        "home.html",
        HOME_TEMPLATE,
        context! { user => user, profile => profile },
    )
}

pub fn chats_page(user: &CurrentUser, chats: &[ChatSummary]) -> Result<Html<String>, AppError> {
    render_page(
        "chats.html",
        CHATS_TEMPLATE,
        context! { user => user, chats => chats },
    )
}

pub fn new_chat_page(
    user: &CurrentUser,
    contexts: &[MedicalContextOption],
) -> Result<Html<String>, AppError> {
    render_page(
        "chat_new.html",
        NEW_CHAT_TEMPLATE,
        context! { user => user, contexts => contexts },
    )
}

pub fn chat_page(
    user: &CurrentUser,
    chat: &Chat,
    messages: &[ChatMessage],
    medical_context: Option<&MedicalProfile>,
) -> Result<Html<String>, AppError> {
    render_page(
        "chat.html",
        CHAT_TEMPLATE,
        context! {
            user => user,
            chat => chat,
            messages => messages,
            medical_context => medical_context,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> CurrentUser {
        CurrentUser {
            id: "user-1".into(),
            email: "ada@example.com".into(),
            full_name: "Ada Lovelace".into(),
        }
    }

    fn sample_profile() -> MedicalProfile {
        MedicalProfile {
            id: "profile-1".into(),
            user_id: "user-1".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            full_name: "Ada Lovelace".into(),
            dob: "1990-12-10".into(),
            gender: "female".into(),
            height: Some(170),
            weight: None,
            medical_history: vec!["asthma".into()],
            allergies: vec!["penicillin".into()],
            medications: vec![],
            created_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn public_pages_render() {
        assert!(landing_page().unwrap().0.contains("CareChat"));
        assert!(login_page().unwrap().0.contains("form"));
        assert!(register_page().unwrap().0.contains("confirmPassword"));
    }

    #[test]
    fn home_page_shows_profile() {
        let body = home_page(&sample_user(), &sample_profile()).unwrap().0;
        assert!(body.contains("Ada Lovelace"));
        assert!(body.contains("penicillin"));
    }

    #[test]
    fn chats_page_lists_previews() {
        let chats = vec![ChatSummary {
            id: "chat-1".into(),
            title: "Headache questions".into(),
            updated_at: "2026-01-02T00:00:00+00:00".into(),
            medical_context_id: None,
            last_message: "How long have you had it?".into(),
        }];
        let body = chats_page(&sample_user(), &chats).unwrap().0;
        assert!(body.contains("Headache questions"));
        assert!(body.contains("How long have you had it?"));
    }

    #[test]
    fn chats_page_renders_empty_list() {
        let body = chats_page(&sample_user(), &[]).unwrap().0;
        assert!(body.contains("No conversations yet"));
    }

    #[test]
    fn chat_page_escapes_message_content() {
        let chat = Chat {
            id: "chat-1".into(),
            user_id: "user-1".into(),
            title: "General".into(),
            medical_context_id: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
            updated_at: "2026-01-01T00:00:00+00:00".into(),
        };
        let messages = vec![ChatMessage {
            id: "msg-1".into(),
            chat_id: "chat-1".into(),
            sender_id: "user-1".into(),
            content: "<script>alert(1)</script>".into(),
            responses: None,
            created_at: "2026-01-01T00:00:01+00:00".into(),
        }];
        let body = chat_page(&sample_user(), &chat, &messages, None).unwrap().0;
        assert!(!body.contains("<script>alert(1)</script>"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[test]
    fn chat_page_shows_medical_context() {
        let chat = Chat {
            id: "chat-1".into(),
            user_id: "user-1".into(),
            title: "General".into(),
            medical_context_id: Some("profile-1".into()),
            created_at: "2026-01-01T00:00:00+00:00".into(),
            updated_at: "2026-01-01T00:00:00+00:00".into(),
        };
        let profile = sample_profile();
        let body = chat_page(&sample_user(), &chat, &[], Some(&profile))
            .unwrap()
            .0;
        assert!(body.contains("Medical context"));
        assert!(body.contains("asthma"));
    }

    #[test]
    fn new_chat_page_lists_contexts() {
        let contexts = vec![MedicalContextOption {
            id: "profile-1".into(),
            title: "Ada Lovelace".into(),
        }];
        let body = new_chat_page(&sample_user(), &contexts).unwrap().0;
        assert!(body.contains("Ada Lovelace"));
        assert!(body.contains("medicalContextId"));
    }
}
