use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use murmur_db::{ConversationQuery, MessageQuery};
use murmur_gateway::buffer::buffer_key;
use murmur_types::api::{ConversationItemsRequest, ConversationSummary, Page, PageMetadata};
use murmur_types::models::{Message, Tenant, User};

use crate::error::ApiError;
use crate::{AppState, blocking};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 5;

/// `POST /{tenant_code}/conversation/items`: the caller's conversations, or
/// the messages of one conversation when `cid` is given.
pub async fn items(
    State(state): State<AppState>,
    Path(tenant_code): Path<String>,
    Json(req): Json<ConversationItemsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let page = req.page.unwrap_or(DEFAULT_PAGE);
    let limit = req.limit.unwrap_or(DEFAULT_LIMIT);
    if page < 1 {
        return Err(ApiError::BadRequest("\"page\" must be greater than or equal to 1".into()));
    }
    if limit < 1 {
        return Err(ApiError::BadRequest("\"limit\" must be greater than or equal to 1".into()));
    }
    if req.uid < 1 {
        return Err(ApiError::BadRequest("\"uid\" must be greater than or equal to 1".into()));
    }

    let (tenant, user) = authorize(&state, tenant_code, &req).await?;
    let window = Window { page, limit };

    let body = match req.cid {
        Some(cid) => serde_json::to_value(messages_page(&state, &tenant, &user, cid, &req, window).await?),
        None => serde_json::to_value(conversations_page(&state, &tenant, &user, &req, window).await?),
    }
    .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(Json::<Value>(body))
}

#[derive(Debug, Clone, Copy)]
struct Window {
    page: u32,
    limit: u32,
}

impl Window {
    fn skip(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }

    /// Metadata for `total` records, or the out-of-range error. Scrollable
    /// clients get no metadata at all.
    fn metadata(&self, total: u64, scrollable: bool) -> Result<Option<PageMetadata>, ApiError> {
        let meta = PageMetadata::new(total, self.page, self.limit);
        if meta.total_pages > 0 && u64::from(self.page) > meta.total_pages {
            return Err(ApiError::BadRequest(format!(
                "\"page\" number exceeds total pages ({})",
                meta.total_pages
            )));
        }
        Ok((!scrollable).then_some(meta))
    }
}

/// Tenant by code and secret, then a user that already exists. Unlike the
/// socket handshake, listing never creates users.
async fn authorize(
    state: &AppState,
    tenant_code: String,
    req: &ConversationItemsRequest,
) -> Result<(Tenant, User), ApiError> {
    if req.sid.is_empty() {
        return Err(ApiError::Unauthorized("Missing \"sid\"".into()));
    }
    let sid = req.sid.clone();
    let uid = req.uid;

    let found = blocking(state, move |db| {
        let Some(tenant) = db.tenant_by_credentials(&tenant_code, &sid)? else {
            return Ok(None);
        };
        let user = db.find_user(tenant.id, uid)?;
        Ok(Some((tenant, user)))
    })
    .await?;

    match found {
        None => Err(ApiError::Unauthorized("Invalid tenant credentials".into())),
        Some((_, None)) => Err(ApiError::Unauthorized("Invalid \"uid\"".into())),
        Some((tenant, Some(user))) => Ok((tenant, user)),
    }
}

async fn conversations_page(
    state: &AppState,
    tenant: &Tenant,
    user: &User,
    req: &ConversationItemsRequest,
    window: Window,
) -> Result<Page<ConversationSummary>, ApiError> {
    let query = ConversationQuery {
        tenant_id: tenant.id,
        external_id: user.external_id,
        unread_only: req.unread_only.unwrap_or(false),
        skip: window.skip(),
        limit: u64::from(window.limit),
    };
    let scrollable = req.scrollable.unwrap_or(false);

    let (mut data, total) = blocking(state, move |db| {
        let data = db.list_conversations(&query)?;
        let total = if scrollable { 0 } else { db.count_conversations(&query)? };
        Ok((data, total))
    })
    .await?;

    let presence = &state.gateway.presence;
    for user in data.iter_mut().flat_map(|c| c.participant_users.iter_mut()) {
        user.is_online = presence
            .is_online(&tenant.code, user.external_id, user.last_seen)
            .await?;
    }

    let metadata = window.metadata(total, scrollable)?;
    Ok(Page { data, metadata })
}

/// Messages of one conversation, newest first. Messages still waiting in the
/// buffer are newer than anything stored, so they lead the listing.
async fn messages_page(
    state: &AppState,
    tenant: &Tenant,
    user: &User,
    conversation_id: Uuid,
    req: &ConversationItemsRequest,
    window: Window,
) -> Result<Page<Message>, ApiError> {
    let gateway = &state.gateway;
    gateway
        .conversations
        .participants_for(tenant, conversation_id, user.external_id)
        .await?;

    let mut query = MessageQuery {
        tenant_id: tenant.id,
        conversation_id,
        search: req.search.clone().filter(|s| !s.trim().is_empty()),
        before: req.before_date,
        after: req.after_date,
        skip: window.skip(),
        limit: u64::from(window.limit),
    };

    let pending = gateway.buffer.pending(&buffer_key(&tenant.code, conversation_id)).await?;
    let buffered: Vec<Message> = pending
        .into_iter()
        .rev()
        .filter(|m| matches_query(m, &query))
        .collect();

    // Split the page between buffered and stored messages.
    let buffered_count = buffered.len() as u64;
    let skip = query.skip;
    let from_buffer: Vec<Message> = buffered
        .into_iter()
        .skip(skip.min(buffered_count) as usize)
        .take(window.limit as usize)
        .collect();
    query.skip = skip.saturating_sub(buffered_count);
    query.limit = u64::from(window.limit) - from_buffer.len() as u64;

    let scrollable = req.scrollable.unwrap_or(false);
    let (stored, stored_total) = blocking(state, move |db| {
        let stored = if query.limit > 0 { db.list_messages(&query)? } else { Vec::new() };
        let total = if scrollable { 0 } else { db.count_messages(&query)? };
        Ok((stored, total))
    })
    .await?;

    // A flush can land between reading the buffer and querying the store.
    let mut data = from_buffer;
    for message in stored {
        if !data.iter().any(|m| m.id == message.id) {
            data.push(message);
        }
    }
    debug!(
        "Listed {} messages of {} for {} ({} buffered)",
        data.len(),
        conversation_id,
        user.external_id,
        buffered_count
    );

    let metadata = window.metadata(stored_total + buffered_count, scrollable)?;
    Ok(Page { data, metadata })
}

fn matches_query(message: &Message, query: &MessageQuery) -> bool {
    if message.deleted_at.is_some() {
        return false;
    }
    if query.before.is_some_and(|before| message.created_at >= before) {
        return false;
    }
    if query.after.is_some_and(|after| message.created_at <= after) {
        return false;
    }
    match &query.search {
        Some(search) => {
            let needle = search.to_lowercase();
            message
                .content
                .as_deref()
                .is_some_and(|c| c.to_lowercase().contains(&needle))
                || message.sender_name.to_lowercase().contains(&needle)
        }
        None => true,
    }
}
