use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

pub const HEADER_AUTH_TOKEN: &str = "x-auth-token";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_CLIENT_FLAG: &str = "x-client-flag";

/// Request id reported by nodes used outside of any request (unit tests, scripts).
pub const NO_REQUEST_ID: &str = "<no-request-id>";

pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Per-request identity plus a shared attachment store.
///
/// Built once by the dispatcher and shared by `Arc` with every node of the
/// request's object graph, so an attachment stored by one interceptor is
/// visible to the next one and to the handler.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    user_token: String,
    client_ip: String,
    client_flag: String,
    attachments: DashMap<String, Attachment>,
}

impl RequestContext {
    /// An empty `request_id` is replaced by a freshly generated UUID.
    pub fn new(
        request_id: impl Into<String>,
        user_token: impl Into<String>,
        client_ip: impl Into<String>,
        client_flag: impl Into<String>,
    ) -> Self {
        let mut request_id = request_id.into();
        if request_id.is_empty() {
            request_id = uuid::Uuid::new_v4().to_string();
        }
        Self {
            request_id,
            user_token: user_token.into(),
            client_ip: client_ip.into(),
            client_flag: client_flag.into(),
            attachments: DashMap::new(),
        }
    }

    /// Context handed to nodes that were built outside of a request.
    pub fn detached() -> Self {
        Self::new(NO_REQUEST_ID, "", "", "")
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_token(&self) -> &str {
        &self.user_token
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn client_flag(&self) -> &str {
        &self.client_flag
    }

    pub fn set_attachment<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attachments.insert(key.into(), Arc::new(value));
    }

    pub fn attachment(&self, key: &str) -> Option<Attachment> {
        self.attachments.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Typed lookup; `None` when the key is absent or holds another type.
    pub fn attachment_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.attachment(key)?.downcast::<T>().ok()
    }

    pub fn remove_attachment(&self, key: &str) -> Option<Attachment> {
        self.attachments.remove(key).map(|(_, value)| value)
    }
}
