//! HTTP/2 endpoint surface mapped onto the assignment engine.
//!
//! Paths follow the `ietf-mnat` RESTCONF layout rooted at `/mnat-ds`. List
//! items are addressed with `watcher=<id>` path segments, which we receive
//! as one opaque segment and split ourselves.

use crate::assignments::{Assignments, Monitor};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mnat_model::{Sg, wire};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Instant;

/// Refresh period handed to new watchers.
pub const REFRESH_PERIOD_SECS: u64 = 20;

pub type Engine = Arc<Mutex<Assignments<StdRng>>>;

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route(
            "/mnat-ds/operations/ietf-mnat:get-new-watcher-id",
            post(get_new_watcher_id),
        )
        .route(
            "/mnat-ds/operations/ietf-mnat:refresh-watcher-id",
            post(refresh_watcher_id),
        )
        .route(
            "/mnat-ds/data/ietf-mnat:assigned-channels",
            get(assigned_channels),
        )
        .route(
            "/mnat-ds/data/ietf-mnat:assigned-channels/{watcher}",
            get(assigned_channels_for),
        )
        .route(
            "/mnat-ds/data/ietf-mnat:egress-global-joined",
            post(egress_joined).put(egress_joined),
        )
        .route(
            "/mnat-ds/data/ietf-mnat:egress-global-joined/{watcher}",
            post(egress_joined_for).put(egress_joined_for),
        )
        .route(
            "/mnat-ds/data/ietf-mnat:ingress-watching",
            post(ingress_watching).put(ingress_watching),
        )
        .route(
            "/mnat-ds/data/ietf-mnat:ingress-watching/{watcher}",
            post(ingress_watching_for).put(ingress_watching_for),
        )
        .with_state(engine)
}

/// Splits a `watcher=<id>` path segment.
fn watcher_key(segment: &str) -> Result<&str, Response> {
    segment.strip_prefix("watcher=").ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("expected `watcher=<id>`, got `{segment}`"),
        )
            .into_response()
    })
}

fn unknown_watcher(watcher_id: &str) -> Response {
    let errors = serde_json::json!({
        "ietf-restconf:errors": {
            "error": [{
                "error-type": "application",
                "error-tag": "unknown-element",
                "error-app-tag": "unknown-watcher-id",
                "error-message": format!("No such watcher id \"{watcher_id}\""),
            }]
        }
    });

    (StatusCode::NOT_FOUND, Json(errors)).into_response()
}

async fn get_new_watcher_id(State(engine): State<Engine>) -> Response {
    let mut engine = engine.lock();

    match engine.new_watcher_id(Instant::now()) {
        Ok(watcher_id) => Json(wire::WatcherIdReply {
            watcher_id,
            refresh_period: REFRESH_PERIOD_SECS,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn refresh_watcher_id(
    State(engine): State<Engine>,
    Json(request): Json<wire::RefreshRequest>,
) -> Response {
    let watcher_id = request.input.watcher_id;
    let now = Instant::now();

    let mut engine = engine.lock();
    engine.check_timeouts(now);

    match engine.refresh(&watcher_id, now) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => unknown_watcher(&watcher_id),
    }
}

async fn assigned_channels(State(engine): State<Engine>) -> Response {
    let mut engine = engine.lock();
    engine.check_timeouts(Instant::now());

    Json(wire::AssignedChannels {
        watcher: engine.view_all(),
    })
    .into_response()
}

async fn assigned_channels_for(
    State(engine): State<Engine>,
    Path(segment): Path<String>,
) -> Response {
    let watcher_id = match watcher_key(&segment) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut engine = engine.lock();
    engine.check_timeouts(Instant::now());

    match engine.view_for(watcher_id) {
        Ok(view) => Json(wire::AssignedChannels {
            watcher: vec![view],
        })
        .into_response(),
        Err(_) => unknown_watcher(watcher_id),
    }
}

async fn egress_joined(
    State(engine): State<Engine>,
    Json(publish): Json<wire::JoinedPublish>,
) -> Response {
    let watcher_id = publish.watcher.id.clone();

    apply_joined(&engine, &watcher_id, publish)
}

async fn egress_joined_for(
    State(engine): State<Engine>,
    Path(segment): Path<String>,
    Json(publish): Json<wire::JoinedPublish>,
) -> Response {
    let watcher_id = match watcher_key(&segment) {
        Ok(id) => id.to_owned(),
        Err(response) => return response,
    };

    if publish.watcher.id != watcher_id {
        tracing::warn!(
            path_id = %watcher_id,
            body_id = %publish.watcher.id,
            "Body watcher id differs from path, using the path id"
        );
    }

    apply_joined(&engine, &watcher_id, publish)
}

fn apply_joined(engine: &Engine, watcher_id: &str, publish: wire::JoinedPublish) -> Response {
    let mut sgs = Vec::new();
    for entry in &publish.watcher.joined_sg {
        match Sg::new(entry.source, entry.group) {
            Ok(sg) => sgs.push(sg),
            Err(e) => {
                tracing::warn!(id = %entry.id, "Skipping invalid joined-sg entry: {e}");
            }
        }
    }

    engine
        .lock()
        .set_subscribed_sgs(watcher_id, sgs, Instant::now());

    StatusCode::NO_CONTENT.into_response()
}

async fn ingress_watching(
    State(engine): State<Engine>,
    Json(publish): Json<wire::MonitorPublish>,
) -> Response {
    let watcher_id = publish.watcher.id.clone();

    apply_monitors(&engine, &watcher_id, publish)
}

async fn ingress_watching_for(
    State(engine): State<Engine>,
    Path(segment): Path<String>,
    Json(publish): Json<wire::MonitorPublish>,
) -> Response {
    let watcher_id = match watcher_key(&segment) {
        Ok(id) => id.to_owned(),
        Err(response) => return response,
    };

    apply_monitors(&engine, &watcher_id, publish)
}

fn apply_monitors(engine: &Engine, watcher_id: &str, publish: wire::MonitorPublish) -> Response {
    let mut monitors = Vec::new();
    for entry in &publish.watcher.monitor {
        let Some(prefix) = &entry.global_source_prefix else {
            tracing::debug!(id = %entry.id, "Ignoring monitor without a known kind");
            continue;
        };

        match prefix.parse() {
            Ok(prefix) => monitors.push((entry.id.clone(), Monitor::SourcePrefix { prefix })),
            Err(e) => {
                tracing::warn!(id = %entry.id, %prefix, "Skipping monitor with invalid prefix: {e}");
            }
        }
    }

    engine
        .lock()
        .set_monitors(watcher_id, monitors, Instant::now());

    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{LocalPool, PoolRange, SourceRange};
    use axum::body::Body;
    use http_body_util::BodyExt as _;
    use rand::SeedableRng as _;
    use tower::util::ServiceExt as _;

    fn test_router() -> Router {
        let pool = LocalPool::new(vec![PoolRange::new(
            "239.1.1.0/30".parse().unwrap(),
            SourceRange::Net("10.9.1.2/32".parse().unwrap()),
            &[],
        )]);
        let engine = Arc::new(Mutex::new(Assignments::new(
            pool,
            StdRng::seed_from_u64(1),
        )));

        router(engine)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/yang-data+json")
            .body(match &body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, json)
    }

    async fn new_watcher(router: &Router) -> String {
        let (status, body) = send(
            router,
            "POST",
            "/mnat-ds/operations/ietf-mnat:get-new-watcher-id",
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refresh-period"], 20);

        body["watcher-id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn egress_flow_publishes_and_polls_assignments() {
        let router = test_router();
        let id = new_watcher(&router).await;

        let publish = serde_json::json!({
            "ietf-mnat:watcher": {
                "id": id,
                "joined-sg": [
                    {"id": "0", "source": "10.1.1.1", "group": "232.1.1.1"},
                    {"id": "1", "source": "10.1.1.1", "group": "232.1.1.2"}
                ]
            }
        });
        let (status, _) = send(
            &router,
            "PUT",
            &format!("/mnat-ds/data/ietf-mnat:egress-global-joined/watcher={id}"),
            Some(publish),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &router,
            "GET",
            &format!("/mnat-ds/data/ietf-mnat:assigned-channels/watcher={id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mapped = &body["ietf-mnat:watcher"][0]["mapped-sg"];
        assert_eq!(mapped.as_array().unwrap().len(), 2);
        assert_eq!(mapped[0]["state"], "assigned-local-multicast");
        assert_eq!(mapped[0]["local-mapping"]["source"], "10.9.1.2");
    }

    #[tokio::test]
    async fn refresh_known_and_unknown_watchers() {
        let router = test_router();
        let id = new_watcher(&router).await;

        let (status, _) = send(
            &router,
            "POST",
            "/mnat-ds/operations/ietf-mnat:refresh-watcher-id",
            Some(serde_json::json!({"ietf-mnat:input": {"ietf-mnat:watcher-id": id}})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &router,
            "POST",
            "/mnat-ds/operations/ietf-mnat:refresh-watcher-id",
            Some(serde_json::json!({"ietf-mnat:input": {"ietf-mnat:watcher-id": "NOPE"}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body["ietf-restconf:errors"]["error"][0]["error-app-tag"],
            "unknown-watcher-id"
        );
    }

    #[tokio::test]
    async fn polling_an_unknown_watcher_is_a_404() {
        let router = test_router();

        let (status, _) = send(
            &router,
            "GET",
            "/mnat-ds/data/ietf-mnat:assigned-channels/watcher=NOPE",
            None,
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_watcher_key_is_a_400() {
        let router = test_router();

        let (status, _) = send(
            &router,
            "GET",
            "/mnat-ds/data/ietf-mnat:assigned-channels/bogus",
            None,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingress_monitors_see_egress_subscriptions() {
        let router = test_router();
        let egress_id = new_watcher(&router).await;
        let ingress_id = new_watcher(&router).await;

        let publish = serde_json::json!({
            "ietf-mnat:watcher": {
                "id": egress_id,
                "joined-sg": [{"id": "0", "source": "10.1.1.1", "group": "232.1.1.1"}]
            }
        });
        send(
            &router,
            "POST",
            "/mnat-ds/data/ietf-mnat:egress-global-joined",
            Some(publish),
        )
        .await;

        let monitors = serde_json::json!({
            "ietf-mnat:watcher": {
                "id": ingress_id,
                "monitor": [
                    {"id": "0", "global-source-prefix": "0.0.0.0/0"},
                    {"id": "1", "global-source-prefix": "::/0"}
                ]
            }
        });
        let (status, _) = send(
            &router,
            "POST",
            "/mnat-ds/data/ietf-mnat:ingress-watching",
            Some(monitors),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &router,
            "GET",
            &format!("/mnat-ds/data/ietf-mnat:assigned-channels/watcher={ingress_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mapped = &body["ietf-mnat:watcher"][0]["mapped-sg"];
        assert_eq!(mapped.as_array().unwrap().len(), 1);
        assert_eq!(mapped[0]["global-subscription"]["group"], "232.1.1.1");
    }
}
