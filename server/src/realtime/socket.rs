use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{event_payload, ClientId, Hub};
use crate::{
    error::OrchestratorError,
    orchestrator::Orchestrator,
    types::{
        EventEnvelopeIn, JoinConversationData, MarkAsReadData, Principal, SendToConversationData,
    },
};

/// Runs one authenticated socket until the client goes away.
pub async fn handle_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    orchestrator: Arc<Orchestrator>,
    principal: Principal,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = match hub.connect(principal.user_id, tx) {
        Ok(client_id) => client_id,
        Err(err) => {
            info!(user_id = principal.user_id, error = %err, "socket rejected");
            reject(socket, &err.to_string()).await;
            return;
        }
    };
    debug!(client_id, user_id = principal.user_id, "socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let session = SocketSession {
        hub: hub.clone(),
        orchestrator,
        client_id,
        principal,
    };
    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        session.handle_text(&text).await;
    }

    hub.disconnect(client_id);
    send_task.abort();
    debug!(client_id, user_id = principal.user_id, "socket disconnected");
}

async fn reject(mut socket: WebSocket, reason: &str) {
    if let Some(payload) = event_payload("error", json!({ "message": reason })) {
        let _ = socket.send(Message::Text(payload.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// The per-socket event handlers, separate from the transport.
pub struct SocketSession {
    hub: Arc<Hub>,
    orchestrator: Arc<Orchestrator>,
    client_id: ClientId,
    principal: Principal,
}

impl SocketSession {
    pub fn new(
        hub: Arc<Hub>,
        orchestrator: Arc<Orchestrator>,
        client_id: ClientId,
        principal: Principal,
    ) -> Self {
        Self {
            hub,
            orchestrator,
            client_id,
            principal,
        }
    }

    pub async fn handle_text(&self, text: &str) {
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(text) else {
            debug!(client_id = self.client_id, "ignoring malformed frame");
            return;
        };

        let result = match envelope.event.as_str() {
            "joinConversation" => match parse::<JoinConversationData>(envelope.data) {
                Ok(data) => self.join_conversation(data).await,
                Err(err) => Err(err),
            },
            "sendMessageToConversation" => match parse::<SendToConversationData>(envelope.data) {
                Ok(data) => self.send_message(data).await,
                Err(err) => Err(err),
            },
            "markAsRead" => match parse::<MarkAsReadData>(envelope.data) {
                Ok(data) => self.mark_as_read(data).await,
                Err(err) => Err(err),
            },
            _ => Ok(()),
        };

        if let Err(err) = result {
            debug!(
                client_id = self.client_id,
                event = %envelope.event,
                error = %err,
                "socket event failed"
            );
            self.hub.emit_to_client(
                self.client_id,
                "error",
                json!({ "event": envelope.event, "message": err.to_string() }),
            );
        }
    }

    fn check_user(&self, user_id: Option<i64>) -> Result<(), OrchestratorError> {
        match user_id {
            Some(user_id) if user_id != self.principal.user_id => Err(OrchestratorError::Invalid(
                "userId does not match the authenticated user".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn join_conversation(&self, data: JoinConversationData) -> Result<(), OrchestratorError> {
        self.check_user(data.user_id)?;
        let conversation = self
            .orchestrator
            .conversation_for(self.principal, data.conversation_id)
            .await?;
        self.orchestrator
            .members()
            .require_member(conversation.id, self.principal.participant())
            .await?;
        self.hub
            .join_room(self.client_id, conversation.id)
            .map_err(|err| OrchestratorError::Invalid(err.to_string()))
    }

    async fn send_message(&self, data: SendToConversationData) -> Result<(), OrchestratorError> {
        self.check_user(data.user_id)?;
        self.orchestrator
            .handle_outbound(self.principal, data.into())
            .await?;
        Ok(())
    }

    async fn mark_as_read(&self, data: MarkAsReadData) -> Result<(), OrchestratorError> {
        self.check_user(data.user_id)?;
        let conversation = self
            .orchestrator
            .conversation_for(self.principal, data.conversation_id)
            .await?;
        self.orchestrator
            .members()
            .mark_read(
                conversation.id,
                self.principal.participant(),
                Some(self.hub.socket_ref(self.client_id)),
            )
            .await?;
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, OrchestratorError> {
    serde_json::from_value(data).map_err(|err| OrchestratorError::Invalid(format!("invalid event data: {err}")))
}
