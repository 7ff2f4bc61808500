use crate::api::Error;
use crate::transport::{Exchange, Message, Outcome, Transport};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Responder settles the response to one command request.
///
/// Every settling method consumes the responder, so a handler can respond at
/// most once. When the caller did not ask for a response the settlement is
/// recorded but nothing is published.
pub struct Responder {
    transport: Arc<dyn Transport>,
    logger: slog::Logger,
    // None when the caller did not ask for a response.
    reply_to: Option<String>,
    correlation_id: String,
    namespace: String,
    command: String,
    trace_id: Option<String>,
    app_id: Option<String>,
    closed: Arc<AtomicBool>,
    faults: mpsc::UnboundedSender<Error>,
}

impl Responder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        logger: slog::Logger,
        reply_to: Option<String>,
        correlation_id: String,
        namespace: String,
        command: String,
        trace_id: Option<String>,
        app_id: Option<String>,
        closed: Arc<AtomicBool>,
        faults: mpsc::UnboundedSender<Error>,
    ) -> Responder {
        Responder {
            transport,
            logger,
            reply_to,
            correlation_id,
            namespace,
            command,
            trace_id,
            app_id,
            closed,
            faults,
        }
    }

    /// True if the caller is waiting for a response.
    pub fn is_required(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Sends a successful response with the given payload.
    pub async fn done(self, payload: Bytes) {
        self.send(Outcome::Success, payload).await;
    }

    /// Sends an application-defined failure. The same failure is returned,
    /// so a handler can end with `return response.fail(...).await` shapes
    /// that also log or propagate it.
    pub async fn fail(self, failure_type: &str, message: &str, payload: Bytes) -> Error {
        let failure = Error::failure(failure_type, message, payload.clone());

        self.send(
            Outcome::Failure {
                failure_type: failure_type.to_string(),
                message: message.to_string(),
            },
            payload,
        )
        .await;

        failure
    }

    /// Reports a server-side error. The message is opaque to the caller.
    pub async fn error(self, message: &str) {
        self.send(
            Outcome::Error {
                message: message.to_string(),
            },
            Bytes::new(),
        )
        .await;
    }

    /// Closes the response without a payload.
    pub async fn close(self) {
        self.send(Outcome::Success, Bytes::new()).await;
    }

    async fn send(self, outcome: Outcome, payload: Bytes) {
        self.closed.store(true, Ordering::Release);

        let reply_to = match &self.reply_to {
            Some(reply_to) => reply_to.clone(),
            None => return,
        };

        let message = Message {
            id: self.correlation_id.clone(),
            kind: self.command.clone(),
            namespace: Some(self.namespace.clone()),
            trace_id: self.trace_id.clone(),
            app_id: self.app_id.clone(),
            outcome: Some(outcome),
            payload,
            ..Message::default()
        };

        if let Err(err) = self.transport.publish(Exchange::Response, &reply_to, message).await {
            slog::error!(
                self.logger,
                "failed to publish response for {}: {}",
                self.correlation_id,
                err
            );
            let _ = self.faults.send(Error::Transport(err));
        }
    }
}
