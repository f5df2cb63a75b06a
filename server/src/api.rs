//! HTTP handlers: platform webhooks, agent replies, the conversation API,
//! queue administration and health.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    app::AppState,
    auth::{bearer_token, principal_from_headers},
    channels::InboundEvent,
    error::{ApiError, AuthError, QueueError},
    queue::sync::DEFAULT_JOB_TYPE,
    realtime::socket::handle_socket,
    types::{
        AddMembersBody, BotToggleBody, Conversation, MessagesQuery, Participant, Platform,
        Principal, SendMessageBody, SyncRequestBody,
    },
};

type ApiResult<T> = Result<T, ApiError>;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<Principal> {
    Ok(principal_from_headers(state.auth.as_ref(), headers).await?)
}

fn webhook_platform(state: &AppState, raw: &str) -> ApiResult<Platform> {
    raw.parse::<Platform>()
        .ok()
        .filter(|platform| state.config.platform_enabled(*platform))
        .ok_or_else(|| ApiError::NotFound(format!("no webhook for '{raw}'")))
}

fn received(queued: usize) -> Response {
    (StatusCode::OK, Json(json!({ "ok": true, "queued": queued }))).into_response()
}

/// Normalizes and enqueues. Anything wrong with the delivery itself is
/// logged and still answered with 200, so platforms do not redeliver it. Only
/// a queue outage returns an error.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let platform = webhook_platform(&state, &platform)?;
    let adapter = state
        .orchestrator
        .adapters()
        .get(platform)
        .map_err(|err| ApiError::NotFound(err.to_string()))?;

    if let Err(err) = adapter.verify_webhook(&headers, &body) {
        warn!(%platform, error = %err, "dropping webhook");
        return Ok(received(0));
    }
    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%platform, error = %err, "dropping webhook with invalid json");
            return Ok(received(0));
        }
    };
    let events = match adapter.parse_webhook(&payload) {
        Ok(events) => events,
        Err(err) => {
            warn!(%platform, error = %err, "dropping unparseable webhook");
            return Ok(received(0));
        }
    };

    let topic = platform.inbound_topic();
    let mut queued = 0;
    for event in events {
        if let Err(err) = event.validate() {
            warn!(%platform, error = %err, "dropping invalid webhook event");
            continue;
        }
        let shop_id = event_shop(&state, &event).await;
        let payload = serde_json::to_value(&event).map_err(QueueError::from)?;
        let item_id = state.queue.enqueue(&topic, shop_id, payload).await.map_err(|err| {
            warn!(%platform, error = %err, "webhook enqueue failed");
            ApiError::Unavailable("event queue unavailable".to_string())
        })?;
        debug!(%platform, item_id, external_id = %event.external_message_id, "webhook event queued");
        queued += 1;
    }
    Ok(received(queued))
}

/// Shop owning the channel an event arrived on. A store error leaves the item
/// unscoped instead of refusing the delivery.
async fn event_shop(state: &AppState, event: &InboundEvent) -> Option<i64> {
    match state
        .store
        .channel_by_app(event.platform, &event.channel_app_id)
        .await
    {
        Ok(channel) => channel.map(|channel| channel.shop_id),
        Err(err) => {
            warn!(platform = %event.platform, error = %err, "channel lookup failed, queueing unscoped");
            None
        }
    }
}

/// Subscription handshake on `GET` of the webhook URL.
pub async fn verify_webhook_subscription(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let platform = webhook_platform(&state, &platform)?;
    let adapter = state
        .orchestrator
        .adapters()
        .get(platform)
        .map_err(|err| ApiError::NotFound(err.to_string()))?;
    match adapter.verify_subscription(&params) {
        Some(challenge) => Ok((StatusCode::OK, challenge).into_response()),
        None => Err(ApiError::Forbidden(
            "invalid webhook verification token".to_string(),
        )),
    }
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Response> {
    let principal = authenticate(&state, &headers).await?;
    let sent = state
        .orchestrator
        .handle_outbound(principal, body.into())
        .await?;
    Ok((StatusCode::CREATED, Json(sent)).into_response())
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversations = state
        .store
        .conversations_for(principal.shop_id, principal.participant(), MAX_PAGE)
        .await?;
    Ok(Json(json!({ "conversations": conversations })))
}

/// The conversation, provided `principal` is one of its active members.
async fn member_conversation(
    state: &AppState,
    principal: Principal,
    conversation_id: i64,
) -> ApiResult<Conversation> {
    let conversation = state
        .orchestrator
        .conversation_for(principal, conversation_id)
        .await?;
    state
        .orchestrator
        .members()
        .require_member(conversation.id, principal.participant())
        .await?;
    Ok(conversation)
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = member_conversation(&state, principal, conversation_id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let messages = state
        .store
        .list_messages(conversation.id, query.before, limit)
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = member_conversation(&state, principal, conversation_id).await?;
    let members = state
        .orchestrator
        .members()
        .active_members(conversation.id)
        .await?;
    Ok(Json(json!({ "members": members })))
}

pub async fn add_members(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<AddMembersBody>,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = member_conversation(&state, principal, conversation_id).await?;
    let participants = body
        .user_ids
        .iter()
        .copied()
        .map(Participant::User)
        .chain(body.customer_ids.iter().copied().map(Participant::Customer))
        .collect::<Vec<_>>();
    if participants.is_empty() {
        return Err(ApiError::BadRequest(
            "userIds or customerIds is required".to_string(),
        ));
    }
    let members = state
        .orchestrator
        .members()
        .add_participants(&conversation, &participants)
        .await?
        .into_iter()
        .map(|member| member.value)
        .collect::<Vec<_>>();
    Ok(Json(json!({ "members": members })))
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, member_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = member_conversation(&state, principal, conversation_id).await?;
    let members = state.orchestrator.members();
    let participant = members
        .active_members(conversation.id)
        .await?
        .into_iter()
        .find(|member| member.id == member_id)
        .map(|member| member.participant)
        .ok_or_else(|| ApiError::NotFound(format!("member {member_id} not found")))?;
    let removed = members
        .remove_participant(conversation.id, participant)
        .await?;
    Ok(Json(json!({ "member": removed })))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = state
        .orchestrator
        .conversation_for(principal, conversation_id)
        .await?;
    let receipt = state
        .orchestrator
        .members()
        .mark_read(conversation.id, principal.participant(), None)
        .await?;
    Ok(Json(json!(receipt)))
}

pub async fn toggle_bot(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<BotToggleBody>,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = state
        .orchestrator
        .set_bot(principal, conversation_id, body.enabled)
        .await?;
    Ok(Json(json!({ "conversation": conversation })))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub topic: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let items = state
        .queue
        .dead_letters(principal.shop_id, query.topic.as_deref(), limit)
        .await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn requeue_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let item = state
        .queue
        .requeue(item_id, principal.shop_id)
        .await
        .map_err(|err| match err {
            QueueError::NotFound(id) => ApiError::NotFound(format!("no dead letter {id}")),
            other => ApiError::Queue(other),
        })?;
    tracing::info!(item_id, topic = %item.topic, user_id = principal.user_id, "dead letter requeued");
    Ok(Json(json!({ "item": item })))
}

pub async fn start_sync(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<SyncRequestBody>>,
) -> ApiResult<Response> {
    let principal = authenticate(&state, &headers).await?;
    let channel = state
        .store
        .channel_by_id(channel_id)
        .await?
        .filter(|channel| channel.shop_id == principal.shop_id)
        .ok_or_else(|| ApiError::NotFound(format!("channel {channel_id} not found")))?;
    let job_type = body
        .and_then(|Json(body)| body.job_type)
        .map(|job_type| job_type.trim().to_ascii_lowercase())
        .filter(|job_type| !job_type.is_empty())
        .unwrap_or_else(|| DEFAULT_JOB_TYPE.to_string());
    let job = state.jobs.create_job(channel.id, &job_type).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))).into_response())
}

pub async fn get_sync_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = authenticate(&state, &headers).await?;
    let job = state
        .jobs
        .job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("sync job {job_id} not found")))?;
    let visible = state
        .store
        .channel_by_id(job.channel_id)
        .await?
        .is_some_and(|channel| channel.shop_id == principal.shop_id);
    if !visible {
        return Err(ApiError::NotFound(format!("sync job {job_id} not found")));
    }
    Ok(Json(json!({ "job": job })))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "health: store unreachable");
            false
        }
    };
    let queues = match state.queue.depth().await {
        Ok(depth) => json!(depth),
        Err(err) => {
            warn!(error = %err, "health: queue depth unavailable");
            Value::Null
        }
    };
    let (channels_ok, missing_credentials) = match state.store.list_channels().await {
        Ok(channels) => (
            true,
            channels
                .into_iter()
                .filter(|channel| channel.active && !channel.has_credentials())
                .map(|channel| json!({ "id": channel.id, "platform": channel.platform }))
                .collect::<Vec<_>>(),
        ),
        Err(err) => {
            warn!(error = %err, "health: channel listing failed");
            (false, Vec::new())
        }
    };
    let store_ok = store_ok && channels_ok;
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ok": store_ok,
            "store": store_ok,
            "queues": queues,
            "channelsMissingCredentials": missing_credentials,
            "now": chrono::Utc::now(),
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// `/ws?token=` or a bearer header. The token is checked before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = query
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or(AuthError::MissingToken)?;
    let principal = state.auth.verify(&token).await?;
    let hub = state.hub.clone();
    let orchestrator = state.orchestrator.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, orchestrator, principal)))
}
