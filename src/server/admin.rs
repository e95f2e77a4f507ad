use super::{full_body, BoxBody, GatewayState};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde_json::json;

enum AdminReply {
    Json(StatusCode, serde_json::Value),
    Prometheus(String),
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let is_post = req.method() == Method::POST;

    let reply = match (is_post, path.as_str()) {
        (false, "/health" | "/healthz") => AdminReply::Json(StatusCode::OK, json!({"status": "ok"})),

        (false, "/ready" | "/readyz") => AdminReply::Json(
            StatusCode::OK,
            json!({
                "status": "ready",
                "adapters": state.adapters.len(),
                "paywall_rules": state.paywall.load().len(),
                "browser_engine": state.browser.is_some(),
                "proxy_pool": state.proxy_pool.len(),
            }),
        ),

        (false, "/metrics") => AdminReply::Prometheus(state.metrics.render()),

        (false, "/stats") => {
            let snapshot = state.stats.snapshot(state.gate.queued());
            AdminReply::Json(
                StatusCode::OK,
                serde_json::to_value(&snapshot).unwrap_or_default(),
            )
        }

        // Atomic rule-table replacement; the old map serves readers until
        // the swap commits.
        (true, "/paywall-rules") => {
            let body = req.into_body().collect().await?.to_bytes();
            match state.replace_paywall_rules(&String::from_utf8_lossy(&body)) {
                Ok(count) => {
                    AdminReply::Json(StatusCode::OK, json!({"ok": true, "rules": count}))
                }
                Err(e) => AdminReply::Json(
                    StatusCode::BAD_REQUEST,
                    json!({"error": e.to_string(), "kind": e.kind()}),
                ),
            }
        }

        _ => AdminReply::Json(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    };

    let response = match reply {
        AdminReply::Json(status, value) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(value.to_string())),
        AdminReply::Prometheus(text) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(text)),
    };
    Ok(response.expect("static response construction"))
}
