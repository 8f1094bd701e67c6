use std::sync::{Mutex, PoisonError};

use crate::channel::Origin;
use crate::channel::wire::ResponseEnvelope;
use crate::error::{ResponseCode, WireError};

type Responder = Box<dyn FnOnce(ResponseEnvelope) -> bool + Send>;

/// One inbound request awaiting its single response.
///
/// The first `resolve`/`reject` posts the response and returns `true`.
/// Every later call returns `false` without posting anything. Dropping an
/// uncompleted context rejects it with "request dropped".
pub struct ConnectionContext {
    id: String,
    origin: Origin,
    method: String,
    responder: Mutex<Option<Responder>>,
}

impl ConnectionContext {
    /// `respond` delivers the envelope and reports whether it was posted.
    pub fn new(
        id: impl Into<String>,
        origin: Origin,
        method: impl Into<String>,
        respond: impl FnOnce(ResponseEnvelope) -> bool + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            origin,
            method: method.into(),
            responder: Mutex::new(Some(Box::new(respond))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Origin the request actually arrived from.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_completed(&self) -> bool {
        self.responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn resolve(&self, result: serde_json::Value) -> bool {
        self.complete(ResponseEnvelope::success(self.id.clone(), result))
    }

    pub fn reject(&self, error: WireError) -> bool {
        self.complete(ResponseEnvelope::failure(self.id.clone(), error))
    }

    fn complete(&self, envelope: ResponseEnvelope) -> bool {
        let responder = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match responder {
            Some(respond) => respond(envelope),
            None => {
                tracing::debug!(id = %self.id, method = %self.method, "Ignoring repeated completion");
                false
            }
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        let responder = self
            .responder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(respond) = responder {
            tracing::warn!(id = %self.id, method = %self.method, "Request dropped without a response");
            respond(ResponseEnvelope::failure(
                self.id.clone(),
                WireError::new(ResponseCode::Error, "request dropped"),
            ));
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("method", &self.method)
            .field("completed", &self.is_completed())
            .finish()
    }
}
