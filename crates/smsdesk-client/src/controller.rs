//! Per-session conversation controller.
//!
//! One task owns all client state. User commands, real-time signals, poll
//! ticks and fetch completions are multiplexed in [`Controller::run`]; fetches
//! run as spawned tasks that report back over an internal channel, so nothing
//! is shared between tasks. Each completion carries enough context (phone id,
//! selection token) to be discarded when the view has moved on.

use smsdesk::protocol::{
    Contact, CreateContactRequest, MAX_BODY_CHARS, Message, PhoneNumber, Scope, SendRequest,
    UpdateContactRequest, User, is_e164,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::api::ConversationApi;
use crate::error::{ErrorKind, UserError};
use crate::merge::{ReadHolds, merge_contacts};
use crate::overlay::PendingOverlay;
use crate::realtime::{Interest, RealtimeSignal};
use crate::resync::{Finished, Resource, ResyncGate, Trigger};
use crate::state_dir;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    /// Mark-read attempts per selection before the read hold is dropped.
    pub mark_read_max_attempts: u32,
    /// Where the last active phone number is remembered. `None` disables it.
    pub state_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            mark_read_max_attempts: 3,
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
    /// Identity or phone numbers could not be loaded. `Initialize` retries.
    Failed(UserError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    NoSelection,
    LoadingMessages,
    MessagesLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeStatus {
    Offline,
    Live,
    /// Reconnects exhausted; polling only.
    Degraded,
}

/// Snapshot of everything a front end renders.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub phase: Phase,
    pub user: Option<User>,
    pub phone_numbers: Vec<PhoneNumber>,
    pub active_phone: Option<PhoneNumber>,
    pub contacts: Vec<Contact>,
    pub selected: Option<String>,
    pub pane: Pane,
    /// Confirmed history of the selected contact followed by pending sends.
    pub messages: Vec<Message>,
    pub draft: String,
    pub realtime: RealtimeStatus,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            user: None,
            phone_numbers: Vec::new(),
            active_phone: None,
            contacts: Vec::new(),
            selected: None,
            pane: Pane::NoSelection,
            messages: Vec::new(),
            draft: String::new(),
            realtime: RealtimeStatus::Offline,
        }
    }
}

impl ViewState {
    pub fn contact(&self, contact_id: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == contact_id)
    }

    pub fn selected_contact(&self) -> Option<&Contact> {
        self.selected.as_deref().and_then(|id| self.contact(id))
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    /// (Re)load identity, numbers and contacts. An explicit phone id wins over
    /// the remembered one.
    Initialize { phone_number_id: Option<String> },
    SelectContact(String),
    ClearSelection,
    SwitchPhone(String),
    SetDraft(String),
    Send(String),
    CreateContact {
        phone_number: String,
        name: Option<String>,
    },
    UpdateContact {
        contact_id: String,
        patch: UpdateContactRequest,
    },
    DeleteContact(String),
    Refresh,
}

/// Things worth telling the user about, separate from the view snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Ready { phone_number: PhoneNumber },
    NewUnread { contact: Contact, added: u32 },
    Sent { message: Message },
    ContactSaved { contact: Contact },
    ContactDeleted { contact_id: String },
    Realtime(RealtimeStatus),
    Error(UserError),
}

enum Completion {
    Contacts {
        phone_number_id: String,
        ticket: u64,
        generation: u64,
        result: Result<Vec<Contact>, UserError>,
    },
    Conversation {
        contact_id: String,
        token: u64,
        ticket: u64,
        result: Result<Vec<Message>, UserError>,
    },
    Sent {
        temp_id: String,
        result: Result<Message, UserError>,
    },
    MarkRead {
        contact_id: String,
        attempt: u32,
        result: Result<(), UserError>,
    },
    ContactSaved(Result<Contact, UserError>),
    ContactDeleted {
        contact_id: String,
        result: Result<(), UserError>,
    },
}

pub struct Controller<A: ConversationApi> {
    api: A,
    config: ControllerConfig,
    view: ViewState,
    view_tx: watch::Sender<ViewState>,
    interests_tx: watch::Sender<Vec<Interest>>,
    notices: mpsc::UnboundedSender<Notice>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    /// Spawned tasks whose completion has not been handled yet.
    outstanding: usize,
    holds: ReadHolds,
    overlay: PendingOverlay,
    gate: ResyncGate,
    confirmed: Vec<Message>,
    selection_token: u64,
    /// Failed mark-reads waiting for the next poll tick, by attempts made.
    mark_read_retries: HashMap<String, u32>,
    /// Set once the active number's contacts loaded; unread notices start after.
    contacts_loaded: bool,
}

impl<A: ConversationApi> Controller<A> {
    pub fn new(api: A, config: ControllerConfig, notices: mpsc::UnboundedSender<Notice>) -> Self {
        let (view_tx, _) = watch::channel(ViewState::default());
        let (interests_tx, _) = watch::channel(Vec::new());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            api,
            config,
            view: ViewState::default(),
            view_tx,
            interests_tx,
            notices,
            completions_tx,
            completions_rx,
            outstanding: 0,
            holds: ReadHolds::new(),
            overlay: PendingOverlay::new(),
            gate: ResyncGate::new(),
            confirmed: Vec::new(),
            selection_token: 0,
            mark_read_retries: HashMap::new(),
            contacts_loaded: false,
        }
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn watch_view(&self) -> watch::Receiver<ViewState> {
        self.view_tx.subscribe()
    }

    /// Scopes the real-time subscriber should follow. Changes on phone switch.
    pub fn watch_interests(&self) -> watch::Receiver<Vec<Interest>> {
        self.interests_tx.subscribe()
    }

    /// Main loop. Returns when the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<RealtimeSignal>,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        poll.tick().await;
        let mut signals_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    self.handle_command(cmd).await;
                }
                Some(done) = self.completions_rx.recv() => {
                    self.handle_completion(done);
                }
                signal = signals.recv(), if signals_open => {
                    match signal {
                        Some(signal) => self.handle_signal(signal),
                        None => signals_open = false,
                    }
                }
                _ = poll.tick() => {
                    self.poll_tick();
                }
            }
        }
        tracing::debug!("controller stopped");
    }

    /// Handle completions until no spawned work is left.
    pub async fn drain(&mut self) {
        while self.outstanding > 0 {
            let Some(done) = self.completions_rx.recv().await else {
                break;
            };
            self.handle_completion(done);
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Initialize { phone_number_id } => self.initialize(phone_number_id).await,
            Command::SelectContact(contact_id) => self.select_contact(&contact_id),
            Command::ClearSelection => {
                self.clear_selection();
                self.publish();
            }
            Command::SwitchPhone(phone_number_id) => self.switch_phone(&phone_number_id),
            Command::SetDraft(text) => {
                self.view.draft = text;
                self.publish();
            }
            Command::Send(text) => self.send(text),
            Command::CreateContact { phone_number, name } => self.create_contact(phone_number, name),
            Command::UpdateContact { contact_id, patch } => self.update_contact(contact_id, patch),
            Command::DeleteContact(contact_id) => self.delete_contact(contact_id),
            Command::Refresh => {
                self.request_contacts(Trigger::Hint);
                self.request_conversation(Trigger::Hint);
            }
        }
    }

    pub async fn initialize(&mut self, requested: Option<String>) {
        self.view.phase = Phase::Loading;
        self.publish();

        let user = match self.api.me().await {
            Ok(user) => user,
            Err(e) => return self.fail_init(e.into()),
        };
        let numbers = match self.api.phone_numbers().await {
            Ok(numbers) => numbers,
            Err(e) => return self.fail_init(e.into()),
        };
        if numbers.is_empty() {
            return self.fail_init(UserError::new(
                ErrorKind::Unauthorized,
                "no phone number is assigned to this account",
            ));
        }

        let remembered = self.config.state_dir.as_deref().and_then(state_dir::load_last_phone);
        let active = pick_phone(&numbers, requested.as_deref(), remembered.as_deref()).clone();
        tracing::info!(user = %user.id, phone = %active.phone_number, numbers = numbers.len(), "session initialized");

        self.view.user = Some(user);
        self.view.phone_numbers = numbers;
        self.activate_phone(active.clone());

        // the first contact load happens inline so Ready means contacts are shown
        let resource = Resource::Contacts(active.id.clone());
        self.gate.forget(&resource);
        let generation = self.holds.begin_fetch();
        let result = self.api.contacts(&active.id).await.map_err(UserError::from);
        self.apply_contacts(&active.id, generation, result);
        if matches!(self.view.phase, Phase::Failed(_)) {
            return;
        }

        self.view.phase = Phase::Ready;
        self.publish();
        self.notify(Notice::Ready {
            phone_number: active,
        });
    }

    fn fail_init(&mut self, err: UserError) {
        tracing::error!("initialization failed: {err}");
        self.view.phase = Phase::Failed(err.clone());
        self.publish();
        self.notify(Notice::Error(err));
    }

    /// The session or the number assignment was revoked while running. Stop
    /// polling and listening until `Initialize` is issued again.
    fn lose_access(&mut self, err: UserError) {
        if matches!(self.view.phase, Phase::Failed(_)) {
            return;
        }
        tracing::warn!("access lost, session stopped: {err}");
        self.interests_tx.send_replace(Vec::new());
        self.view.phase = Phase::Failed(err.clone());
        self.publish();
        self.notify(Notice::Error(err));
    }

    fn activate_phone(&mut self, phone: PhoneNumber) {
        if let Some(previous) = &self.view.active_phone {
            self.gate.forget(&Resource::Contacts(previous.id.clone()));
        }
        self.clear_selection();
        self.view.contacts.clear();
        self.contacts_loaded = false;

        if let Some(dir) = &self.config.state_dir
            && let Err(e) = state_dir::save_last_phone(dir, &phone.id)
        {
            tracing::warn!("could not remember active phone number: {e:#}");
        }
        if let Some(user) = &self.view.user {
            let mut scopes = user.personal_scopes();
            scopes.push(Scope::Phone(phone.phone_number.clone()));
            self.interests_tx
                .send_replace(scopes.into_iter().map(Interest::all).collect());
        }
        self.view.active_phone = Some(phone);
    }

    fn switch_phone(&mut self, phone_number_id: &str) {
        if self.view.phase != Phase::Ready {
            return self.notify(Notice::Error(UserError::validation("session is not ready")));
        }
        if self.active_phone_id() == Some(phone_number_id) {
            return;
        }
        let Some(phone) = self
            .view
            .phone_numbers
            .iter()
            .find(|p| p.id == phone_number_id)
            .cloned()
        else {
            return self.notify(Notice::Error(UserError::new(
                ErrorKind::NotFound,
                format!("phone number {phone_number_id} is not available"),
            )));
        };
        tracing::info!(phone = %phone.phone_number, "switching phone number");
        self.activate_phone(phone);
        self.request_contacts(Trigger::Hint);
        self.publish();
    }

    fn select_contact(&mut self, contact_id: &str) {
        let Some(contact) = self.view.contact(contact_id).cloned() else {
            return self.notify(Notice::Error(UserError::new(
                ErrorKind::NotFound,
                format!("unknown contact {contact_id}"),
            )));
        };
        self.clear_selection();
        self.selection_token += 1;
        self.view.selected = Some(contact.id.clone());
        self.view.pane = Pane::LoadingMessages;
        self.request_conversation(Trigger::Hint);

        // the local count may lag an inbound message, so mark read regardless
        if contact.unread_count > 0 {
            if let Some(local) = self.view.contacts.iter_mut().find(|c| c.id == contact.id) {
                local.unread_count = 0;
            }
            self.holds.place(&contact.id);
        }
        self.mark_read_retries.remove(&contact.id);
        self.spawn_mark_read(contact.id.clone(), 1);
        self.refresh_messages();
        self.publish();
    }

    fn clear_selection(&mut self) {
        if let Some(previous) = self.view.selected.take() {
            self.gate.forget(&Resource::Conversation(previous));
        }
        self.selection_token += 1;
        self.confirmed.clear();
        self.view.pane = Pane::NoSelection;
        self.refresh_messages();
    }

    fn send(&mut self, text: String) {
        let (phone, contact) = match self.validate_send(&text) {
            Ok(resolved) => resolved,
            Err(err) => return self.notify(Notice::Error(err)),
        };
        let temp_id = self.overlay.insert(
            &phone.id,
            &phone.phone_number,
            &contact.phone_number,
            &contact.id,
            &text,
        );
        self.view.draft.clear();
        self.refresh_messages();
        self.publish();

        let req = SendRequest {
            to: contact.phone_number,
            body: text.trim().to_string(),
            phone_number_id: phone.id,
        };
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.send(&req).await.map_err(UserError::from);
            Completion::Sent { temp_id, result }
        });
    }

    fn validate_send(&self, text: &str) -> Result<(PhoneNumber, Contact), UserError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(UserError::validation("message is empty"));
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(UserError::validation(format!(
                "message is longer than {MAX_BODY_CHARS} characters"
            )));
        }
        let phone = self
            .view
            .active_phone
            .clone()
            .ok_or_else(|| UserError::validation("no phone number selected"))?;
        let contact = self
            .view
            .selected_contact()
            .cloned()
            .ok_or_else(|| UserError::validation("no conversation selected"))?;
        Ok((phone, contact))
    }

    fn create_contact(&mut self, phone_number: String, name: Option<String>) {
        let Some(phone_number_id) = self.active_phone_id().map(str::to_string) else {
            return self.notify(Notice::Error(UserError::validation("no phone number selected")));
        };
        let phone_number = phone_number.trim().to_string();
        if !is_e164(&phone_number) {
            return self.notify(Notice::Error(UserError::validation(format!(
                "{phone_number} is not an E.164 number"
            ))));
        }
        let req = CreateContactRequest {
            name: name.filter(|n| !n.trim().is_empty()),
            phone_number,
            phone_number_id,
        };
        let api = self.api.clone();
        self.spawn(async move {
            Completion::ContactSaved(api.create_contact(&req).await.map_err(UserError::from))
        });
    }

    fn update_contact(&mut self, contact_id: String, patch: UpdateContactRequest) {
        if patch.is_empty() {
            return self.notify(Notice::Error(UserError::validation("nothing to update")));
        }
        let api = self.api.clone();
        self.spawn(async move {
            Completion::ContactSaved(
                api.update_contact(&contact_id, &patch)
                    .await
                    .map_err(UserError::from),
            )
        });
    }

    fn delete_contact(&mut self, contact_id: String) {
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.delete_contact(&contact_id).await.map_err(UserError::from);
            Completion::ContactDeleted { contact_id, result }
        });
    }

    pub fn handle_signal(&mut self, signal: RealtimeSignal) {
        match signal {
            RealtimeSignal::Connected => self.set_realtime(RealtimeStatus::Live),
            RealtimeSignal::Reconnected => {
                self.set_realtime(RealtimeStatus::Live);
                self.request_contacts(Trigger::Hint);
                self.request_conversation(Trigger::Hint);
            }
            RealtimeSignal::Degraded => {
                tracing::warn!("real-time degraded, relying on polling");
                self.set_realtime(RealtimeStatus::Degraded);
            }
            RealtimeSignal::Event(event) => {
                if self.active_phone_id() != Some(event.event.phone_number_id()) {
                    tracing::trace!(serial = event.serial, "event for another number");
                    return;
                }
                tracing::debug!(serial = event.serial, name = %event.event.name(), "real-time hint");
                self.request_contacts(Trigger::Hint);
                if let smsdesk::protocol::Event::NewMessage { message } = &event.event
                    && self
                        .view
                        .selected_contact()
                        .is_some_and(|c| c.phone_number == message.counterpart())
                {
                    self.request_conversation(Trigger::Hint);
                }
            }
        }
    }

    fn set_realtime(&mut self, status: RealtimeStatus) {
        if self.view.realtime == status {
            return;
        }
        self.view.realtime = status;
        self.publish();
        self.notify(Notice::Realtime(status));
    }

    pub fn poll_tick(&mut self) {
        if self.view.phase != Phase::Ready {
            return;
        }
        self.request_contacts(Trigger::Poll);
        self.request_conversation(Trigger::Poll);
        for (contact_id, attempts) in std::mem::take(&mut self.mark_read_retries) {
            self.spawn_mark_read(contact_id, attempts + 1);
        }
    }

    fn request_contacts(&mut self, trigger: Trigger) {
        if self.view.phase != Phase::Ready {
            return;
        }
        let Some(phone_number_id) = self.active_phone_id().map(str::to_string) else {
            return;
        };
        if let Some(ticket) = self
            .gate
            .request(&Resource::Contacts(phone_number_id.clone()), trigger)
        {
            self.spawn_contacts(phone_number_id, ticket);
        }
    }

    fn spawn_contacts(&mut self, phone_number_id: String, ticket: u64) {
        let generation = self.holds.begin_fetch();
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.contacts(&phone_number_id).await.map_err(UserError::from);
            Completion::Contacts {
                phone_number_id,
                ticket,
                generation,
                result,
            }
        });
    }

    fn request_conversation(&mut self, trigger: Trigger) {
        if self.view.phase != Phase::Ready {
            return;
        }
        let Some(contact_id) = self.view.selected.clone() else {
            return;
        };
        if let Some(ticket) = self
            .gate
            .request(&Resource::Conversation(contact_id.clone()), trigger)
        {
            self.spawn_conversation(contact_id, ticket);
        }
    }

    fn spawn_conversation(&mut self, contact_id: String, ticket: u64) {
        let token = self.selection_token;
        let number = self.view.contact(&contact_id).map(|c| c.phone_number.clone());
        let api = self.api.clone();
        self.spawn(async move {
            let result = api
                .conversation(&contact_id, number.as_deref())
                .await
                .map_err(UserError::from);
            Completion::Conversation {
                contact_id,
                token,
                ticket,
                result,
            }
        });
    }

    fn spawn_mark_read(&mut self, contact_id: String, attempt: u32) {
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.mark_read(&contact_id).await.map_err(UserError::from);
            Completion::MarkRead {
                contact_id,
                attempt,
                result,
            }
        });
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.outstanding += 1;
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match done {
            Completion::Contacts {
                phone_number_id,
                ticket,
                generation,
                result,
            } => {
                if self.active_phone_id() != Some(phone_number_id.as_str()) {
                    tracing::debug!(phone = %phone_number_id, "dropping contacts for inactive number");
                    return;
                }
                match self.gate.finish(&Resource::Contacts(phone_number_id.clone()), ticket) {
                    Finished::Stale => {
                        tracing::debug!(phone = %phone_number_id, ticket, "dropping superseded contacts");
                        return;
                    }
                    Finished::Done => {}
                    Finished::FollowUp(next) => self.spawn_contacts(phone_number_id.clone(), next),
                }
                self.apply_contacts(&phone_number_id, generation, result);
            }
            Completion::Conversation {
                contact_id,
                token,
                ticket,
                result,
            } => {
                if token != self.selection_token
                    || self.view.selected.as_deref() != Some(contact_id.as_str())
                {
                    tracing::debug!(contact = %contact_id, "dropping stale conversation");
                    return;
                }
                match self.gate.finish(&Resource::Conversation(contact_id.clone()), ticket) {
                    Finished::Stale => return,
                    Finished::Done => {}
                    Finished::FollowUp(next) => self.spawn_conversation(contact_id.clone(), next),
                }
                match result {
                    Ok(messages) => {
                        self.confirmed = messages;
                        self.view.pane = Pane::MessagesLoaded;
                        self.refresh_messages();
                    }
                    Err(e) if e.kind == ErrorKind::Unauthorized => self.lose_access(e),
                    Err(e) => tracing::warn!(contact = %contact_id, "conversation fetch failed: {e}"),
                }
            }
            Completion::Sent { temp_id, result } => {
                let Some(pending) = self.overlay.remove(&temp_id) else {
                    return;
                };
                match result {
                    Ok(message) => {
                        tracing::debug!(message = %message.id, "send confirmed");
                        if self.view.selected.as_deref() == Some(pending.contact_id.as_str())
                            && !self.confirmed.iter().any(|m| m.id == message.id)
                        {
                            self.confirmed.push(message.clone());
                        }
                        self.notify(Notice::Sent { message });
                        self.request_conversation(Trigger::Hint);
                        self.request_contacts(Trigger::Hint);
                    }
                    Err(err) => {
                        tracing::warn!("send failed: {err}");
                        if self.view.draft.is_empty() {
                            self.view.draft = pending.input;
                        }
                        self.notify(Notice::Error(err));
                    }
                }
                self.refresh_messages();
            }
            Completion::MarkRead {
                contact_id,
                attempt,
                result,
            } => match result {
                Ok(()) => self.holds.acknowledge(&contact_id),
                Err(e) if attempt < self.config.mark_read_max_attempts => {
                    tracing::warn!(contact = %contact_id, attempt, "mark-read failed, will retry: {e}");
                    self.mark_read_retries.insert(contact_id, attempt);
                }
                Err(e) => {
                    tracing::warn!(contact = %contact_id, attempt, "mark-read failed, giving up: {e}");
                    self.holds.release(&contact_id);
                }
            },
            Completion::ContactSaved(result) => match result {
                Ok(contact) => {
                    if let Some(local) = self.view.contacts.iter_mut().find(|c| c.id == contact.id) {
                        *local = Contact {
                            unread_count: local.unread_count,
                            ..contact.clone()
                        };
                    }
                    self.notify(Notice::ContactSaved { contact });
                    self.request_contacts(Trigger::Hint);
                }
                Err(err) => self.notify(Notice::Error(err)),
            },
            Completion::ContactDeleted { contact_id, result } => match result {
                Ok(()) => {
                    if self.view.selected.as_deref() == Some(contact_id.as_str()) {
                        self.clear_selection();
                    }
                    self.view.contacts.retain(|c| c.id != contact_id);
                    self.holds.release(&contact_id);
                    self.mark_read_retries.remove(&contact_id);
                    self.notify(Notice::ContactDeleted { contact_id });
                    self.request_contacts(Trigger::Hint);
                }
                Err(err) => self.notify(Notice::Error(err)),
            },
        }
        self.publish();
    }

    fn apply_contacts(
        &mut self,
        phone_number_id: &str,
        generation: u64,
        result: Result<Vec<Contact>, UserError>,
    ) {
        let fresh = match result {
            Ok(fresh) => fresh,
            Err(e) if e.kind == ErrorKind::Unauthorized => return self.lose_access(e),
            Err(e) => {
                tracing::warn!(phone = %phone_number_id, "contacts fetch failed: {e}");
                return;
            }
        };
        let outcome = merge_contacts(&self.view.contacts, fresh, &mut self.holds, generation);
        self.view.contacts = outcome.contacts;

        if self.contacts_loaded {
            for increase in outcome.increases {
                if self.view.selected.as_deref() == Some(increase.contact.id.as_str()) {
                    continue;
                }
                self.notify(Notice::NewUnread {
                    contact: increase.contact,
                    added: increase.added,
                });
            }
        }
        self.contacts_loaded = true;

        if let Some(selected) = self.view.selected.clone()
            && self.view.contact(&selected).is_none()
        {
            tracing::info!(contact = %selected, "selected contact disappeared");
            self.clear_selection();
        }
    }

    fn refresh_messages(&mut self) {
        let mut messages = self.confirmed.clone();
        if let Some(selected) = &self.view.selected {
            messages.extend(self.overlay.messages_for(selected).cloned());
        }
        self.view.messages = messages;
    }

    fn active_phone_id(&self) -> Option<&str> {
        self.view.active_phone.as_ref().map(|p| p.id.as_str())
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view.clone());
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

/// Requested id, else the remembered one, else the first number.
fn pick_phone<'a>(
    numbers: &'a [PhoneNumber],
    requested: Option<&str>,
    remembered: Option<&str>,
) -> &'a PhoneNumber {
    if let Some(id) = requested {
        if let Some(found) = numbers.iter().find(|p| p.id == id) {
            return found;
        }
        tracing::warn!(phone = %id, "requested phone number is not accessible");
    }
    remembered
        .and_then(|id| numbers.iter().find(|p| p.id == id))
        .unwrap_or(&numbers[0])
}
