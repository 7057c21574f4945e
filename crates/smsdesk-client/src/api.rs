use smsdesk::client::{ApiClient, ApiError};
use smsdesk::protocol::{
    Contact, CreateContactRequest, Message, PhoneNumber, SendRequest, UpdateContactRequest, User,
};
use std::future::Future;

/// The REST calls the controller depends on. Implemented by [`ApiClient`];
/// tests substitute an in-memory fake.
pub trait ConversationApi: Clone + Send + Sync + 'static {
    fn me(&self) -> impl Future<Output = Result<User, ApiError>> + Send;

    fn phone_numbers(&self) -> impl Future<Output = Result<Vec<PhoneNumber>, ApiError>> + Send;

    fn contacts(
        &self,
        phone_number_id: &str,
    ) -> impl Future<Output = Result<Vec<Contact>, ApiError>> + Send;

    fn conversation(
        &self,
        contact_id: &str,
        phone_number: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    fn send(&self, req: &SendRequest) -> impl Future<Output = Result<Message, ApiError>> + Send;

    fn mark_read(&self, contact_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn create_contact(
        &self,
        req: &CreateContactRequest,
    ) -> impl Future<Output = Result<Contact, ApiError>> + Send;

    fn update_contact(
        &self,
        contact_id: &str,
        patch: &UpdateContactRequest,
    ) -> impl Future<Output = Result<Contact, ApiError>> + Send;

    fn delete_contact(&self, contact_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl ConversationApi for ApiClient {
    fn me(&self) -> impl Future<Output = Result<User, ApiError>> + Send {
        ApiClient::me(self)
    }

    fn phone_numbers(&self) -> impl Future<Output = Result<Vec<PhoneNumber>, ApiError>> + Send {
        ApiClient::phone_numbers(self)
    }

    fn contacts(
        &self,
        phone_number_id: &str,
    ) -> impl Future<Output = Result<Vec<Contact>, ApiError>> + Send {
        ApiClient::contacts(self, phone_number_id)
    }

    fn conversation(
        &self,
        contact_id: &str,
        phone_number: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send {
        ApiClient::conversation(self, contact_id, phone_number)
    }

    fn send(&self, req: &SendRequest) -> impl Future<Output = Result<Message, ApiError>> + Send {
        ApiClient::send(self, req)
    }

    fn mark_read(&self, contact_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send {
        ApiClient::mark_read(self, contact_id)
    }

    fn create_contact(
        &self,
        req: &CreateContactRequest,
    ) -> impl Future<Output = Result<Contact, ApiError>> + Send {
        ApiClient::create_contact(self, req)
    }

    fn update_contact(
        &self,
        contact_id: &str,
        patch: &UpdateContactRequest,
    ) -> impl Future<Output = Result<Contact, ApiError>> + Send {
        ApiClient::update_contact(self, contact_id, patch)
    }

    fn delete_contact(&self, contact_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send {
        ApiClient::delete_contact(self, contact_id)
    }
}
