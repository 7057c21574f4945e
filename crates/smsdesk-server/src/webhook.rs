//! Carrier webhook for inbound SMS.

use axum::Form;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use serde::Deserialize;
use smsdesk::protocol::{Contact, Direction, Event, Message};
use smsdesk_store::NewMessage;
use std::sync::Arc;

use crate::error::ApiFailure;
use crate::realtime::{Fanout, inbound_scopes};
use crate::state::{AppState, Store};

const EMPTY_TWIML: &str = "<Response></Response>";

/// Form fields posted by the carrier.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundSms {
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default)]
    pub body: String,
    pub message_sid: Option<String>,
}

#[derive(Debug)]
pub enum InboundOutcome {
    Recorded { message: Message, contact: Contact },
    /// The carrier redelivered a message that is already stored.
    Duplicate { message: Message },
}

/// Persists inbound SMS and fans the change out.
#[derive(Clone)]
pub struct InboundProcessor {
    store: Store,
    fanout: Fanout,
}

impl InboundProcessor {
    pub fn new(store: Store, fanout: Fanout) -> Self {
        Self { store, fanout }
    }

    pub async fn process(&self, sms: InboundSms) -> Result<InboundOutcome, ApiFailure> {
        let from = required(sms.from, "From")?;
        let to = required(sms.to, "To")?;
        let sid = required(sms.message_sid, "MessageSid")?;

        let lookup = to.clone();
        let phone = self
            .store
            .call(move |s| s.phone_number_by_e164(&lookup))
            .await?
            .ok_or_else(|| ApiFailure::NotFound(format!("no phone number {to}")))?;

        let new = NewMessage {
            phone_number_id: phone.id.clone(),
            counterpart: from,
            body: sms.body,
            direction: Direction::Inbound,
            sid: Some(sid),
        };
        let recorded = self.store.call(move |s| s.record_message(new)).await?;
        if recorded.duplicate {
            tracing::info!(sid = ?recorded.message.sid, phone = %phone.phone_number, "duplicate delivery acknowledged");
            return Ok(InboundOutcome::Duplicate {
                message: recorded.message,
            });
        }

        tracing::info!(
            phone = %phone.phone_number,
            from = %recorded.message.from,
            unread = recorded.contact.unread_count,
            "inbound message recorded"
        );
        let scopes = inbound_scopes(&phone);
        self.fanout.publish(
            &scopes,
            &Event::NewMessage {
                message: recorded.message.clone(),
            },
        );
        self.fanout.publish(
            &scopes,
            &Event::ContactUpdated {
                contact: recorded.contact.clone(),
            },
        );
        Ok(InboundOutcome::Recorded {
            message: recorded.message,
            contact: recorded.contact,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiFailure> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiFailure::Invalid(format!("missing {field}")))
}

/// POST /webhook/sms
pub async fn inbound_sms(
    State(state): State<Arc<AppState>>,
    Form(sms): Form<InboundSms>,
) -> Result<impl IntoResponse, ApiFailure> {
    state.inbound.process(sms).await?;
    Ok(([(CONTENT_TYPE, "text/xml")], EMPTY_TWIML))
}
