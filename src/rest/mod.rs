//! REST surface visible to the core — spec §6: only the write paths that
//! flow through `UpdateCoordinator`. Aggregate/diagram CRUD, listing, and
//! real OAuth/JWT issuance and validation live outside the core (§1
//! Non-goals); `build_router` still has to attach the `Subject` a bearer
//! token resolves to before a handler runs, so it installs that middleware
//! itself rather than assuming some other host does it.
//!
//! Grounded in this codebase's `rest::build_router`: an axum `Router` with
//! `.with_state(ctx)`, handlers returning `Result<Json<Value>, (StatusCode,
//! Json<Value>)>` so error bodies stay uniform with success bodies.

use axum::{
    body::Body,
    extract::{Extension, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::put,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::authz::AggregateLookup;
use crate::connection::SubjectAuthenticator;
use crate::domain::{CellsOp, DiagramId, PatchOp, Subject};
use crate::errors::CoreError;
use crate::registry::CoreUpdateCoordinator;
use crate::storage::DiagramStore;

/// The pieces of `AppContext` this router needs: a coordinator handle plus
/// the same `SubjectAuthenticator` the WS handshake uses, so this router can
/// install its own bearer→Subject middleware instead of assuming a host does
/// it (spec §1 Non-goals only excludes OAuth/JWT issuance/validation — the
/// core still has to attach whatever already-validated subject the bearer
/// carries before a handler sees the request).
pub struct RestState<S> {
    pub coordinator: Arc<CoreUpdateCoordinator<S>>,
    pub authenticator: Arc<dyn SubjectAuthenticator>,
}

pub fn build_router<S>(state: Arc<RestState<S>>) -> Router
where
    S: DiagramStore + AggregateLookup + 'static,
{
    Router::new()
        .route(
            "/threat_models/:aggregate_id/diagrams/:diagram_id",
            put(put_diagram::<S>).patch(patch_diagram::<S>),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_subject::<S>))
        .with_state(state)
}

/// Extracts `Authorization: Bearer <token>`, authenticates it through the
/// same `SubjectAuthenticator` the WS handshake uses, and inserts the
/// resulting `Subject` into the request extensions for `Extension<Subject>`
/// to pick up downstream. Mirrors `ConnectionHandler`'s handshake bearer
/// flow (`connection::mod`), just over a header instead of a query param.
async fn require_subject<S>(
    State(state): State<Arc<RestState<S>>>,
    mut req: Request<Body>,
    next: Next,
) -> Response
where
    S: DiagramStore + AggregateLookup + 'static,
{
    let bearer = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let subject = match bearer {
        Some(token) => state.authenticator.authenticate(&token).await,
        None => None,
    };

    match subject {
        Some(subject) => {
            req.extensions_mut().insert(subject);
            next.run(req).await
        }
        None => error_response(&CoreError::Unauthenticated).into_response(),
    }
}

#[derive(Deserialize)]
pub struct PutDiagramRequest {
    pub cells: Vec<crate::domain::Cell>,
    /// Spec §6: "`update_vector` MUST be omitted or rejected with 400."
    #[serde(default)]
    pub update_vector: Option<u64>,
}

#[derive(Deserialize)]
pub struct PatchDiagramRequest {
    pub delta: Vec<PatchOp>,
}

async fn put_diagram<S>(
    State(state): State<Arc<RestState<S>>>,
    Extension(subject): Extension<Subject>,
    Path((_aggregate_id, diagram_id)): Path<(String, String)>,
    Json(body): Json<PutDiagramRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)>
where
    S: DiagramStore + AggregateLookup + 'static,
{
    if body.update_vector.is_some() {
        return Err(error_response(&CoreError::InvalidPatch(
            "update_vector must be omitted on PUT".into(),
        )));
    }
    let diagram_id = parse_diagram_id(&diagram_id)?;
    let op = CellsOp::Replace { cells: body.cells };
    apply_and_respond(&state, diagram_id, &subject, op, None).await
}

async fn patch_diagram<S>(
    State(state): State<Arc<RestState<S>>>,
    Extension(subject): Extension<Subject>,
    Path((_aggregate_id, diagram_id)): Path<(String, String)>,
    Json(body): Json<PatchDiagramRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)>
where
    S: DiagramStore + AggregateLookup + 'static,
{
    let diagram_id = parse_diagram_id(&diagram_id)?;
    let op = CellsOp::Patch { delta: body.delta };
    apply_and_respond(&state, diagram_id, &subject, op, None).await
}

async fn apply_and_respond<S>(
    state: &RestState<S>,
    diagram_id: DiagramId,
    subject: &Subject,
    op: CellsOp,
    client_known_version: Option<u64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)>
where
    S: DiagramStore + AggregateLookup + 'static,
{
    match state
        .coordinator
        .apply(diagram_id, subject, op, client_known_version)
        .await
    {
        Ok(commit) => Ok(Json(json!({
            "update_vector": commit.new_version,
            "modified_at": commit.modified_at.to_rfc3339(),
        }))),
        Err(e) => Err(error_response(&e)),
    }
}

fn parse_diagram_id(raw: &str) -> Result<DiagramId, (StatusCode, Json<Value>)> {
    DiagramId::parse(raw).map_err(|_| error_response(&CoreError::NotFound))
}

fn error_response(err: &CoreError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "code": err.http_code(),
        "message": err.to_string(),
    });
    if let CoreError::Stale(current) = err {
        body["current_version"] = json!(current);
    }
    (status, Json(body))
}
