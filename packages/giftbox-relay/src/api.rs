//! REST API handlers.
//!
//! Every JSON endpoint answers with an [`ApiResponse`] envelope. Endpoints
//! under `/api` other than register, login and wish pages need an
//! `Authorization: Bearer <token>` header carrying a token from `/api/login`.
//!
//! - `POST /api/register`, `/api/login`, `/api/logout` - Accounts and sessions
//! - `/api/friends/...`                              - Friend requests
//! - `/api/messages/...`, `/api/rooms/...`           - Send and read history
//! - `/api/media/:kind`                              - Upload and list media
//! - `PUT  /api/media/video/:id/poster`              - Set a video's poster
//! - `GET  /media/:owner/:filename`                  - Serve a media file
//! - `/api/wish/...`                                 - Wish pages

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use giftbox_core::{
    Credentials, Error, Identity, MediaKind, MediaReference, Message, MessageBody, Relationship,
    RoomName, Target,
};
use serde::{Deserialize, Serialize};

use crate::state::RelayState;

// ── Response Types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        status,
        Json(ApiResponse {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }),
    )
}

type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

/// A core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            Error::InvalidIdentity(_) | Error::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Error::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Error::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::StorageFailure(_) | Error::DeliveryFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::SerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "Request failed");
        }
        (
            status,
            Json(ApiResponse::<()> {
                ok: false,
                data: None,
                error: Some(self.0.to_string()),
                code: Some(self.0.code()),
            }),
        )
            .into_response()
    }
}

// ── Authentication ───────────────────────────────────────────────────────────

/// The identity behind the request's bearer token.
pub struct AuthIdentity {
    pub identity: Identity,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<RelayState> for AuthIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RelayState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError(Error::AuthenticationFailed))?;

        let identity = state
            .resolve_session(token)
            .ok_or(ApiError(Error::AuthenticationFailed))?;

        Ok(Self {
            identity,
            token: token.to_string(),
        })
    }
}

// ── Accounts ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionResponse {
    pub identity: Identity,
    pub token: String,
    pub expires_in: i64,
}

/// POST /api/register
pub async fn register(
    State(state): State<RelayState>,
    Json(credentials): Json<Credentials>,
) -> ApiResult<Identity> {
    let identity = state.core.directory.register(&credentials)?;
    tracing::info!(identity = %identity, "Account registered");
    Ok(ok(StatusCode::CREATED, identity))
}

/// POST /api/login
pub async fn login(
    State(state): State<RelayState>,
    Json(credentials): Json<Credentials>,
) -> ApiResult<SessionResponse> {
    let identity = state.core.directory.authenticate(&credentials)?;
    let token = state.create_session(&identity);
    Ok(ok(
        StatusCode::OK,
        SessionResponse {
            identity,
            token,
            expires_in: state.config.session_ttl_secs,
        },
    ))
}

/// POST /api/logout
pub async fn logout(State(state): State<RelayState>, auth: AuthIdentity) -> ApiResult<bool> {
    Ok(ok(StatusCode::OK, state.revoke_session(&auth.token)))
}

// ── Friends ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FriendRequestBody {
    pub to: String,
}

#[derive(Deserialize)]
pub struct RespondBody {
    pub accept: bool,
}

/// GET /api/friends
pub async fn list_friends(
    State(state): State<RelayState>,
    auth: AuthIdentity,
) -> ApiResult<Vec<Identity>> {
    let friends = state.core.relationships.list_friends(&auth.identity)?;
    Ok(ok(StatusCode::OK, friends.into_iter().collect()))
}

/// GET /api/friends/pending
///
/// Identities with an unanswered request to the caller, oldest first.
pub async fn list_pending(
    State(state): State<RelayState>,
    auth: AuthIdentity,
) -> ApiResult<Vec<Identity>> {
    let requesters = state
        .core
        .relationships
        .list_pending(&auth.identity)
        .requesters()?;
    Ok(ok(StatusCode::OK, requesters))
}

/// GET /api/friends/outgoing
pub async fn list_outgoing(
    State(state): State<RelayState>,
    auth: AuthIdentity,
) -> ApiResult<Vec<Relationship>> {
    let outgoing = state.core.relationships.list_outgoing(&auth.identity)?;
    Ok(ok(StatusCode::OK, outgoing))
}

/// POST /api/friends/requests
pub async fn request_friend(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Json(body): Json<FriendRequestBody>,
) -> ApiResult<Relationship> {
    let to = Identity::parse(&body.to)?;
    let relationship = state.request_friend(&auth.identity, &to)?;
    Ok(ok(StatusCode::CREATED, relationship))
}

/// POST /api/friends/requests/:from/respond
pub async fn respond_friend(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Path(from): Path<String>,
    Json(body): Json<RespondBody>,
) -> ApiResult<Relationship> {
    let from = Identity::parse(&from)?;
    let relationship = state.respond_friend(&auth.identity, &from, body.accept)?;
    Ok(ok(StatusCode::OK, relationship))
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SendBody {
    pub target: Target,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachment: Option<String>,
}

#[derive(Serialize)]
pub struct SentResponse {
    pub id: String,
}

/// POST /api/messages
pub async fn send_message(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Json(body): Json<SendBody>,
) -> ApiResult<SentResponse> {
    let id = state
        .send_message(
            &auth.identity,
            body.target,
            MessageBody {
                text: body.text,
                attachment: body.attachment,
            },
        )
        .await?;
    Ok(ok(
        StatusCode::CREATED,
        SentResponse {
            id: id.as_str().to_string(),
        },
    ))
}

/// GET /api/messages/:peer
pub async fn peer_history(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Path(peer): Path<String>,
) -> ApiResult<Vec<Message>> {
    let peer = Identity::parse(&peer)?;
    let messages = state.core.channel.history(&auth.identity, &peer)?;
    Ok(ok(StatusCode::OK, messages))
}

/// GET /api/rooms/:room/messages
pub async fn room_history(
    State(state): State<RelayState>,
    _auth: AuthIdentity,
    Path(room): Path<String>,
) -> ApiResult<Vec<Message>> {
    let room = RoomName::parse(&room)?;
    let messages = state.core.channel.room_history(&room)?;
    Ok(ok(StatusCode::OK, messages))
}

// ── Media ────────────────────────────────────────────────────────────────────

fn parse_kind(kind: &str) -> Result<MediaKind, ApiError> {
    MediaKind::parse(kind)
        .ok_or_else(|| ApiError(Error::InvalidOperation(format!("unknown media kind '{}'", kind))))
}

/// POST /api/media/:kind
///
/// Multipart form fields:
/// - `file`: The binary data, with its content type
/// - `caption`: Optional short caption
pub async fn upload_media(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Path(kind): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<MediaReference> {
    let kind = parse_kind(&kind)?;
    let mut file_data: Option<Vec<u8>> = None;
    let mut content_type = String::from("application/octet-stream");
    let mut caption: Option<String> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                if let Some(ct) = field.content_type() {
                    content_type = ct.to_string();
                }
                match field.bytes().await {
                    Ok(bytes) => file_data = Some(bytes.to_vec()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read upload file bytes");
                        return Err(ApiError(Error::InvalidOperation(
                            "Failed to read file data".into(),
                        )));
                    }
                }
            }
            "caption" => {
                if let Ok(text) = field.text().await {
                    caption = Some(text);
                }
            }
            _ => {}
        }
    }

    let data = file_data
        .ok_or_else(|| ApiError(Error::InvalidOperation("No file data provided".into())))?;

    let media = state.core.media.clone();
    let owner = auth.identity.clone();
    let reference = tokio::task::spawn_blocking(move || {
        media.store(&owner, kind, &content_type, &data, caption)
    })
    .await
    .map_err(|e| Error::StorageFailure(format!("upload task failed: {}", e)))??;

    Ok(ok(StatusCode::CREATED, reference))
}

/// GET /api/media/:kind
pub async fn list_media(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Path(kind): Path<String>,
) -> ApiResult<Vec<MediaReference>> {
    let kind = parse_kind(&kind)?;
    let media = state.core.media.list(&auth.identity, kind)?;
    Ok(ok(StatusCode::OK, media))
}

#[derive(Deserialize)]
pub struct PosterBody {
    /// Photo id; `null` clears the poster
    pub poster: Option<String>,
}

/// PUT /api/media/video/:id/poster
pub async fn set_poster(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Path((kind, id)): Path<(String, String)>,
    Json(body): Json<PosterBody>,
) -> ApiResult<MediaReference> {
    if parse_kind(&kind)? != MediaKind::Video {
        return Err(ApiError(Error::InvalidOperation("only videos have posters".into())));
    }
    let video = state
        .core
        .media
        .set_poster(&auth.identity, &id, body.poster.as_deref())?;
    Ok(ok(StatusCode::OK, video))
}

/// GET /media/:owner/:filename
///
/// Serve a stored file with its content type. No auth required; wish pages
/// link here directly and filenames are content hashes.
pub async fn serve_media(
    State(state): State<RelayState>,
    Path((owner, filename)): Path<(String, String)>,
) -> Response {
    let owner = match Identity::parse(&owner) {
        Ok(owner) => owner,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    match state.core.media.read(&owner, &filename) {
        Ok((data, content_type)) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                content_type
                    .parse()
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            // Content-hash filenames never change
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000, immutable"),
            );

            (StatusCode::OK, headers, Body::from(data)).into_response()
        }
        Err(Error::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

// ── Wish Pages ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct WishBody {
    pub note: String,
}

/// GET /api/wish/:owner
pub async fn wish_page(
    State(state): State<RelayState>,
    Path(owner): Path<String>,
) -> ApiResult<giftbox_core::WishPage> {
    let owner = Identity::parse(&owner)?;
    let page = state.core.wishes.page(&owner)?;
    Ok(ok(StatusCode::OK, page))
}

/// PUT /api/wish
pub async fn set_wish(
    State(state): State<RelayState>,
    auth: AuthIdentity,
    Json(body): Json<WishBody>,
) -> ApiResult<giftbox_core::wish::WishNote> {
    let note = state.core.wishes.set_note(&auth.identity, &body.note)?;
    Ok(ok(StatusCode::OK, note))
}
