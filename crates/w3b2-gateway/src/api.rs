use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use w3b2_engine::{Bridge, BridgeStats, CardInfo, ChannelConnector, SessionInfo, SyncStatus};
use w3b2_shared::protocol::Instruction;
use w3b2_shared::types::{CommandId, CorrelationId, Pubkey, SessionId};
use w3b2_store::{
    AdminProfile, CardScope, DispatchKey, DispatchRecord, FundingRequest, UserProfile,
};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::wire::*;
use crate::ws;

type ApiResult<T> = Result<Json<T>, GatewayError>;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub connector: ChannelConnector,
    pub config: Arc<GatewayConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(sync_status))
        .route("/stats", get(bridge_stats))
        .route("/admins", get(list_admins))
        .route("/admins/register", post(register_admin))
        .route("/admins/:admin", get(get_admin))
        .route("/admins/:admin/users", get(list_users))
        .route("/admins/:admin/funding", get(list_funding))
        .route("/users/register", post(register_user))
        .route("/users/:user/:admin", get(get_user))
        .route("/funding", post(request_funding))
        .route("/funding/:request", get(get_funding))
        .route("/funding/:request/approve", post(approve_funding))
        .route("/funding/:request/reject", post(reject_funding))
        .route("/dispatch", post(dispatch))
        .route(
            "/dispatch/:user/:admin/:command_id/:correlation",
            get(get_dispatch),
        )
        .route(
            "/dispatch/:user/:admin/:command_id/:correlation/cancel",
            post(cancel_dispatch),
        )
        .route("/sessions", post(open_session))
        .route("/sessions/:id", get(get_session).delete(close_session))
        .route("/sessions/:id/encrypt", post(encrypt))
        .route("/sessions/:id/decrypt", post(decrypt))
        .route("/instructions", post(submit_instruction))
        .route("/connector/events", post(push_events))
        .route("/connector/outbox", get(drain_outbox))
        .route("/admin/resync", post(admin_resync))
        .route("/cards", get(list_cards).post(create_card))
        .route(
            "/cards/:holder/:service",
            get(get_card).patch(update_card).delete(delete_card),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn sync_status(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.bridge.status())
}

async fn bridge_stats(State(state): State<AppState>) -> ApiResult<BridgeStats> {
    Ok(Json(state.bridge.stats().await?))
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

async fn list_admins(State(state): State<AppState>) -> ApiResult<Vec<AdminProfile>> {
    Ok(Json(state.bridge.mirror().list_admins()?))
}

async fn get_admin(
    State(state): State<AppState>,
    Path(admin): Path<Pubkey>,
) -> ApiResult<AdminProfile> {
    Ok(Json(state.bridge.mirror().get_admin(&admin)?))
}

async fn list_users(
    State(state): State<AppState>,
    Path(admin): Path<Pubkey>,
) -> ApiResult<Vec<UserProfile>> {
    state.bridge.mirror().get_admin(&admin)?;
    Ok(Json(state.bridge.mirror().list_users(&admin)?))
}

async fn get_user(
    State(state): State<AppState>,
    Path((user, admin)): Path<(Pubkey, Pubkey)>,
) -> ApiResult<UserProfile> {
    Ok(Json(state.bridge.mirror().get_user(&user, &admin)?))
}

async fn register_admin(
    State(state): State<AppState>,
    Json(req): Json<RegisterAdminRequest>,
) -> ApiResult<SubmittedResponse> {
    submit(
        &state,
        Instruction::AdminRegister {
            authority: req.authority,
            communication_pubkey: req.communication_pubkey,
        },
    )
    .await
}

async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterUserRequest>,
) -> ApiResult<SubmittedResponse> {
    submit(
        &state,
        Instruction::UserCreate {
            authority: req.authority,
            target_admin: req.target_admin,
            communication_pubkey: req.communication_pubkey,
        },
    )
    .await
}

// ---------------------------------------------------------------------------
// Funding
// ---------------------------------------------------------------------------

async fn request_funding(
    State(state): State<AppState>,
    Json(req): Json<FundingRequestBody>,
) -> ApiResult<SubmittedResponse> {
    submit(
        &state,
        Instruction::RequestFunding {
            requester: req.requester,
            target_admin: req.target_admin,
            amount: req.amount,
        },
    )
    .await
}

async fn get_funding(
    State(state): State<AppState>,
    Path(request): Path<Pubkey>,
) -> ApiResult<FundingRequest> {
    Ok(Json(state.bridge.mirror().get_funding(&request)?))
}

async fn list_funding(
    State(state): State<AppState>,
    Path(admin): Path<Pubkey>,
    Query(query): Query<FundingQuery>,
) -> ApiResult<Vec<FundingRequest>> {
    let mirror = state.bridge.mirror();
    mirror.get_admin(&admin)?;
    Ok(Json(mirror.list_funding(&admin, query.status)?))
}

async fn approve_funding(
    State(state): State<AppState>,
    Path(request): Path<Pubkey>,
) -> ApiResult<SubmittedResponse> {
    resolve_funding(&state, request, true).await
}

async fn reject_funding(
    State(state): State<AppState>,
    Path(request): Path<Pubkey>,
) -> ApiResult<SubmittedResponse> {
    resolve_funding(&state, request, false).await
}

async fn resolve_funding(
    state: &AppState,
    request: Pubkey,
    approve: bool,
) -> ApiResult<SubmittedResponse> {
    let submission_id = state
        .bridge
        .router()
        .resolve_funding(&request, approve)
        .await?;
    info!(request = %request.short(), approve, "funding resolution submitted");
    Ok(Json(SubmittedResponse {
        submission_id,
        instruction: "resolve_funding".to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

type DispatchPath = (Pubkey, Pubkey, CommandId, CorrelationId);

fn dispatch_key((user, admin, command_id, correlation_id): DispatchPath) -> DispatchKey {
    DispatchKey {
        user,
        admin,
        command_id,
        correlation_id,
    }
}

async fn dispatch(
    State(state): State<AppState>,
    Json(body): Json<DispatchBody>,
) -> ApiResult<DispatchRecord> {
    Ok(Json(state.bridge.router().dispatch(body.into()).await?))
}

async fn get_dispatch(
    State(state): State<AppState>,
    Path(path): Path<DispatchPath>,
) -> ApiResult<DispatchRecord> {
    Ok(Json(state.bridge.router().get_dispatch(&dispatch_key(path))?))
}

async fn cancel_dispatch(
    State(state): State<AppState>,
    Path(path): Path<DispatchPath>,
) -> ApiResult<DispatchRecord> {
    Ok(Json(state.bridge.router().cancel(&dispatch_key(path))?))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

async fn open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<SessionOfferView> {
    let offer = state.bridge.sessions().open(&req.user, &req.admin).await?;
    Ok(Json(offer.into()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult<SessionInfo> {
    Ok(Json(state.bridge.sessions().get(&id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    state.bridge.sessions().close(&id).await?;
    Ok(Json(serde_json::json!({ "closed": true })))
}

async fn encrypt(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<DataBody>,
) -> ApiResult<DataBody> {
    let data = state.bridge.sessions().encrypt(&id, &body.data).await?;
    Ok(Json(DataBody { data }))
}

async fn decrypt(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<DataBody>,
) -> ApiResult<DataBody> {
    let data = state.bridge.sessions().decrypt(&id, &body.data).await?;
    Ok(Json(DataBody { data }))
}

// ---------------------------------------------------------------------------
// Instructions and connector
// ---------------------------------------------------------------------------

async fn submit_instruction(
    State(state): State<AppState>,
    Json(instruction): Json<Instruction>,
) -> ApiResult<SubmittedResponse> {
    if matches!(instruction, Instruction::DispatchCommand { .. }) {
        return Err(GatewayError::BadRequest(
            "command dispatches go through POST /dispatch".into(),
        ));
    }
    submit(&state, instruction).await
}

async fn submit(state: &AppState, instruction: Instruction) -> ApiResult<SubmittedResponse> {
    let name = instruction.name();
    let submission_id = state.bridge.router().submit_instruction(instruction).await?;
    Ok(Json(SubmittedResponse {
        submission_id,
        instruction: name.to_string(),
    }))
}

/// Webhook for an external indexer: raw records, in log order.
async fn push_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<RawEventBody>>,
) -> Json<AcceptedResponse> {
    let accepted = events.len();
    for event in events {
        state.connector.push_event(event.into());
    }
    tracing::debug!(accepted, "raw events pushed");
    Json(AcceptedResponse { accepted })
}

async fn drain_outbox(State(state): State<AppState>) -> Json<Vec<OutboxEntry>> {
    let entries = state
        .connector
        .drain_outbox()
        .into_iter()
        .map(|(id, submission)| OutboxEntry::new(id, submission))
        .collect();
    Json(entries)
}

// ---------------------------------------------------------------------------
// Operator endpoints (require ADMIN_TOKEN)
// ---------------------------------------------------------------------------

fn verify_admin_token(headers: &HeaderMap, config: &GatewayConfig) -> Result<(), GatewayError> {
    let Some(ref expected) = config.admin_token else {
        return Err(GatewayError::Forbidden(
            "Operator API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(GatewayError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_resync(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<SyncStatus> {
    verify_admin_token(&headers, &state.config)?;
    state.bridge.resync()?;
    info!("re-sync from genesis requested by operator");
    Ok(Json(state.bridge.status()))
}

// ---------------------------------------------------------------------------
// ChainCards (require ADMIN_TOKEN)
// ---------------------------------------------------------------------------

async fn list_cards(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<CardsQuery>,
) -> ApiResult<Vec<CardInfo>> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.bridge.keystore().list(query.holder.as_ref())?))
}

async fn create_card(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateCardRequest>,
) -> ApiResult<CardInfo> {
    verify_admin_token(&headers, &state.config)?;
    let scope = CardScope {
        holder: req.holder,
        service: req.service,
    };
    Ok(Json(state.bridge.keystore().create(scope, req.metadata)?))
}

async fn get_card(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((holder, service)): Path<(Pubkey, Pubkey)>,
) -> ApiResult<CardInfo> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.bridge.keystore().get(&CardScope { holder, service })?))
}

async fn update_card(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((holder, service)): Path<(Pubkey, Pubkey)>,
    Json(patch): Json<MetadataPatch>,
) -> ApiResult<CardInfo> {
    verify_admin_token(&headers, &state.config)?;
    let scope = CardScope { holder, service };
    Ok(Json(state.bridge.keystore().update_metadata(&scope, patch.into())?))
}

async fn delete_card(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((holder, service)): Path<(Pubkey, Pubkey)>,
) -> ApiResult<serde_json::Value> {
    verify_admin_token(&headers, &state.config)?;
    state.bridge.keystore().delete(&CardScope { holder, service })?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use w3b2_engine::{EngineConfig, MasterKey};
    use w3b2_shared::events::*;
    use w3b2_store::Database;

    use super::*;

    const ADMIN: Pubkey = Pubkey([0xad; 32]);
    const USER: Pubkey = Pubkey([0x05; 32]);

    fn state(admin_token: Option<&str>) -> AppState {
        let connector = ChannelConnector::new();
        let bridge = Bridge::new(
            Database::open_in_memory().unwrap(),
            Arc::new(connector.clone()),
            MasterKey::ephemeral(),
            EngineConfig::default(),
        )
        .unwrap();
        let config = GatewayConfig {
            admin_token: admin_token.map(str::to_string),
            ..GatewayConfig::default()
        };
        AppState {
            bridge,
            connector,
            config: Arc::new(config),
        }
    }

    /// Start the bridge and wait until the seeded admin and user are mirrored.
    async fn seeded(deposit: u64) -> AppState {
        let state = state(None);
        let events = [
            BridgeEvent::AdminProfileRegistered(AdminProfileRegistered {
                authority: ADMIN,
                communication_pubkey: Pubkey([9; 32]),
                ts: 1,
            }),
            BridgeEvent::AdminPricesUpdated(AdminPricesUpdated {
                authority: ADMIN,
                new_prices: vec![(5, 300_000)],
                ts: 2,
            }),
            BridgeEvent::UserProfileCreated(UserProfileCreated {
                authority: USER,
                target_admin: ADMIN,
                communication_pubkey: Pubkey([8; 32]),
                ts: 3,
            }),
            BridgeEvent::UserFundsDeposited(UserFundsDeposited {
                authority: USER,
                target_admin: ADMIN,
                amount: deposit,
                new_deposit_balance: deposit,
                ts: 4,
            }),
        ];
        for event in &events {
            state.connector.emit(event).unwrap();
        }
        state.bridge.start().unwrap();
        for _ in 0..500 {
            if state.bridge.mirror().checkpoint().unwrap().seq >= 4 {
                return state;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("mirror never caught up");
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&state(None), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_admin_is_404() {
        let uri = format!("/admins/{}", ADMIN.to_hex());
        let (status, body) = call(&state(None), get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_such_profile");
    }

    #[tokio::test]
    async fn test_malformed_key_is_rejected() {
        let (status, _) = call(&state(None), get("/admins/zz")).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_profiles_are_served_from_mirror() {
        let state = seeded(1_000).await;
        let uri = format!("/users/{}/{}", USER.to_hex(), ADMIN.to_hex());
        let (status, body) = call(&state, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deposit"], 1_000);

        let (status, body) = call(&state, get("/admins")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_deposit_is_402() {
        let state = seeded(1_000).await;
        let body = json!({
            "direction": "user_to_admin",
            "user": USER.to_hex(),
            "admin": ADMIN.to_hex(),
            "command_id": 5,
            "correlation_id": "order-1",
            "payload": "aGVsbG8=",
        });
        let (status, body) = call(&state, post("/dispatch", body)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["kind"], "insufficient_deposit");
        assert_eq!(state.connector.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_session_roundtrip_over_http() {
        let state = seeded(1).await;
        let body = json!({ "user": USER.to_hex(), "admin": ADMIN.to_hex() });
        let (status, offer) = call(&state, post("/sessions", body)).await;
        assert_eq!(status, StatusCode::OK);
        let id = offer["session_id"].as_str().unwrap().to_string();

        let (status, sealed) = call(
            &state,
            post(&format!("/sessions/{id}/encrypt"), json!({ "data": "aGVsbG8=" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, opened) = call(
            &state,
            post(&format!("/sessions/{id}/decrypt"), json!({ "data": sealed["data"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["data"], "aGVsbG8=");

        let close = Request::delete(format!("/sessions/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, close).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &state,
            post(&format!("/sessions/{id}/encrypt"), json!({ "data": "aGVsbG8=" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_such_session");
    }

    #[tokio::test]
    async fn test_register_goes_to_outbox() {
        let state = state(None);
        let body = json!({
            "authority": ADMIN.to_hex(),
            "communication_pubkey": Pubkey([9; 32]).to_hex(),
        });
        let (status, body) = call(&state, post("/admins/register", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instruction"], "admin_register");

        let (status, outbox) = call(&state, get("/connector/outbox")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outbox[0]["name"], "admin_register");
        assert_eq!(state.connector.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_instruction_is_refused() {
        let body = json!({
            "DispatchCommand": {
                "sender": USER.to_hex(),
                "recipient": ADMIN.to_hex(),
                "command_id": 5,
                "max_price": 1,
                "correlation_id": "x",
                "payload": [],
            }
        });
        let (status, _) = call(&state(None), post("/instructions", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connector_webhook_buffers_events() {
        let state = state(None);
        let body = json!([{
            "position": { "slot": 2, "seq": 1, "signature": "sig-1" },
            "tag": "SomethingNew",
            "data": "",
        }]);
        let (status, body) = call(&state, post("/connector/events", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 1);
        assert_eq!(state.connector.event_count(), 1);
    }

    #[tokio::test]
    async fn test_resync_requires_token() {
        let disabled = state(None);
        let (status, _) = call(&disabled, post("/admin/resync", json!({}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let state = state(Some("s3cret"));
        let wrong = Request::post("/admin/resync")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let right = Request::post("/admin/resync")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, right).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checkpoint"]["seq"], 0);
    }

    fn with_token(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request
            .header("authorization", "Bearer s3cret")
            .header("content-type", "application/json")
    }

    #[tokio::test]
    async fn test_submission_signed_by_listed_card() {
        let state = state(Some("s3cret"));
        let body = json!({
            "authority": ADMIN.to_hex(),
            "communication_pubkey": Pubkey([9; 32]).to_hex(),
        });
        call(&state, post("/admins/register", body)).await;

        let (status, _) = call(&state, get("/cards")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let list = with_token(Request::get(format!("/cards?holder={}", ADMIN.to_hex())))
            .body(Body::empty())
            .unwrap();
        let (status, cards) = call(&state, list).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cards.as_array().unwrap().len(), 1);
        assert_eq!(cards[0]["service"], ADMIN.to_hex());
        assert!(cards[0].get("sealed_secret").is_none());

        let (_, outbox) = call(&state, get("/connector/outbox")).await;
        assert_eq!(outbox[0]["signer"], cards[0]["card_pubkey"]);
    }

    #[tokio::test]
    async fn test_card_metadata_lifecycle() {
        let state = state(Some("s3cret"));
        let path = format!("/cards/{}/{}", USER.to_hex(), ADMIN.to_hex());

        let create = with_token(Request::post("/cards"))
            .body(Body::from(
                json!({
                    "holder": USER.to_hex(),
                    "service": ADMIN.to_hex(),
                    "metadata": { "label": "phone" },
                })
                .to_string(),
            ))
            .unwrap();
        let (status, card) = call(&state, create).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(card["metadata"]["label"], "phone");

        let patch = with_token(Request::patch(&path))
            .body(Body::from(
                json!({ "set": { "key": "os", "value": "linux" } }).to_string(),
            ))
            .unwrap();
        let (status, card) = call(&state, patch).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(card["metadata"], json!({ "label": "phone", "os": "linux" }));

        let delete = with_token(Request::delete(&path)).body(Body::empty()).unwrap();
        let (status, _) = call(&state, delete).await;
        assert_eq!(status, StatusCode::OK);

        let fetch = with_token(Request::get(&path)).body(Body::empty()).unwrap();
        let (status, body) = call(&state, fetch).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }
}
