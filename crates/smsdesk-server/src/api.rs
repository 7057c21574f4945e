//! REST handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use smsdesk::protocol::{
    Contact, ContactResponse, ContactsResponse, CreateContactRequest, Direction, Event,
    HealthResponse, MAX_BODY_CHARS, MeResponse, MessageResponse, MessagesResponse, PhoneNumber,
    PhoneNumbersResponse, SendRequest, SuccessResponse, UpdateContactRequest, User, is_e164,
};
use smsdesk_store::NewMessage;
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::ApiFailure;
use crate::realtime::activity_scopes;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiFailure>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsQuery {
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    phone_number: Option<String>,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let healthy = match state.store.call(|s| s.ping()).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("health check failed: {e}");
            false
        }
    };
    Json(HealthResponse {
        healthy,
        transport: state.fanout.transport().kind().to_string(),
    })
}

/// GET /me
pub async fn me(AuthUser(user): AuthUser) -> ApiResult<MeResponse> {
    Ok(Json(MeResponse { user }))
}

/// GET /assigned-phone-number
pub async fn phone_numbers(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<PhoneNumbersResponse> {
    let phone_numbers = state
        .store
        .call(move |s| s.phone_numbers_for(&user))
        .await?;
    Ok(Json(PhoneNumbersResponse { phone_numbers }))
}

/// GET /contacts?phoneNumberId=
pub async fn contacts(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<ContactsQuery>,
) -> ApiResult<ContactsResponse> {
    let phone = accessible_phone(&state, &user, &query.phone_number_id).await?;
    let contacts = state.store.call(move |s| s.contacts(&phone.id)).await?;
    Ok(Json(ContactsResponse { contacts }))
}

/// GET /conversation/{contact_id}?phoneNumber=
pub async fn conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(contact_id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<MessagesResponse> {
    let (contact, _) = accessible_contact(&state, &user, &contact_id).await?;
    if let Some(number) = query.phone_number
        && number != contact.phone_number
    {
        return Err(ApiFailure::NotFound(format!(
            "contact {contact_id} has no conversation with {number}"
        )));
    }
    let messages = state
        .store
        .call(move |s| s.conversation(&contact.id))
        .await?;
    Ok(Json(MessagesResponse { messages }))
}

/// POST /send
pub async fn send(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<SendRequest>,
) -> ApiResult<MessageResponse> {
    if req.body.trim().is_empty() {
        return Err(ApiFailure::Invalid("message body is empty".into()));
    }
    if req.body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiFailure::Invalid(format!(
            "message body exceeds {MAX_BODY_CHARS} characters"
        )));
    }
    if !is_e164(&req.to) {
        return Err(ApiFailure::Invalid(format!("{} is not an E.164 number", req.to)));
    }
    let phone = accessible_phone(&state, &user, &req.phone_number_id).await?;
    if !phone.active {
        return Err(ApiFailure::Invalid(format!(
            "{} is not active",
            phone.phone_number
        )));
    }

    let sid = state
        .carrier
        .send(&phone.phone_number, &req.to, &req.body)
        .await?;

    let new = NewMessage {
        phone_number_id: phone.id.clone(),
        counterpart: req.to,
        body: req.body,
        direction: Direction::Outbound,
        sid: Some(sid),
    };
    let recorded = state.store.call(move |s| s.record_message(new)).await?;
    tracing::info!(
        user = %user.id,
        phone = %phone.phone_number,
        to = %recorded.message.to,
        "message sent"
    );

    let scopes = activity_scopes(&phone);
    state.fanout.publish(
        &scopes,
        &Event::NewMessage {
            message: recorded.message.clone(),
        },
    );
    state.fanout.publish(
        &scopes,
        &Event::ContactUpdated {
            contact: recorded.contact,
        },
    );
    Ok(Json(MessageResponse {
        message: recorded.message,
    }))
}

/// POST /mark-read/{contact_id}
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(contact_id): Path<String>,
) -> ApiResult<SuccessResponse> {
    let (_, phone) = accessible_contact(&state, &user, &contact_id).await?;
    let contact = state.store.call(move |s| s.mark_read(&contact_id)).await?;
    publish_contact(&state, &phone, contact);
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /contacts
pub async fn create_contact(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateContactRequest>,
) -> ApiResult<ContactResponse> {
    let phone = accessible_phone(&state, &user, &req.phone_number_id).await?;
    let phone_id = phone.id.clone();
    let contact = state
        .store
        .call(move |s| s.create_contact(&phone_id, &req.phone_number, req.name.as_deref()))
        .await?;
    tracing::info!(phone = %phone.phone_number, contact = %contact.phone_number, "contact created");
    publish_contact(&state, &phone, contact.clone());
    Ok(Json(ContactResponse { contact }))
}

/// PATCH /contacts/{id}
pub async fn update_contact(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(contact_id): Path<String>,
    Json(patch): Json<UpdateContactRequest>,
) -> ApiResult<ContactResponse> {
    let (_, phone) = accessible_contact(&state, &user, &contact_id).await?;
    let contact = state
        .store
        .call(move |s| s.update_contact(&contact_id, &patch))
        .await?;
    publish_contact(&state, &phone, contact.clone());
    Ok(Json(ContactResponse { contact }))
}

/// DELETE /contacts/{id}
pub async fn delete_contact(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(contact_id): Path<String>,
) -> ApiResult<SuccessResponse> {
    let (_, phone) = accessible_contact(&state, &user, &contact_id).await?;
    let removed = state
        .store
        .call(move |s| s.delete_contact(&contact_id))
        .await?;
    tracing::info!(phone = %phone.phone_number, contact = %removed.phone_number, "contact deleted");
    publish_contact(&state, &phone, removed);
    Ok(Json(SuccessResponse { success: true }))
}

// ---------------------------------------------------------------------------
// Access helpers
// ---------------------------------------------------------------------------

async fn accessible_phone(
    state: &AppState,
    user: &User,
    phone_number_id: &str,
) -> Result<PhoneNumber, ApiFailure> {
    let id = phone_number_id.to_string();
    let phone = state.store.call(move |s| s.phone_number(&id)).await?;
    if !phone.accessible_by(user) {
        return Err(ApiFailure::Forbidden(format!(
            "no access to phone number {phone_number_id}"
        )));
    }
    Ok(phone)
}

async fn accessible_contact(
    state: &AppState,
    user: &User,
    contact_id: &str,
) -> Result<(Contact, PhoneNumber), ApiFailure> {
    let id = contact_id.to_string();
    let contact = state.store.call(move |s| s.contact(&id)).await?;
    let phone = accessible_phone(state, user, &contact.phone_number_id).await?;
    Ok((contact, phone))
}

fn publish_contact(state: &AppState, phone: &PhoneNumber, contact: Contact) {
    state
        .fanout
        .publish(&activity_scopes(phone), &Event::ContactUpdated { contact });
}
