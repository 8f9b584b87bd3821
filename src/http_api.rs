//! HTTP surface: WebSocket upgrade, health, room admin and Prometheus
//! exposition, all served by one warp router.

use std::convert::Infallible;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::id_types::RoomId;
use crate::orchestrator::Sfu;
use crate::ws::{self, WsQuery};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    name: String,
    max_peers: Option<usize>,
}

fn with_sfu(sfu: Arc<Sfu>) -> impl Filter<Extract = (Arc<Sfu>,), Error = Infallible> + Clone {
    warp::any().map(move || sfu.clone())
}

pub fn routes(sfu: Arc<Sfu>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_read_limit = sfu.config.ws_read_limit;
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<WsQuery>())
        .and(with_sfu(sfu.clone()))
        .map(move |upgrade: warp::ws::Ws, query: WsQuery, sfu: Arc<Sfu>| {
            upgrade
                .max_message_size(ws_read_limit)
                .on_upgrade(move |socket| ws::client_connected(sfu, socket, query))
        });

    let health = warp::path("health")
        .and(warp::get())
        .and(with_sfu(sfu.clone()))
        .and_then(health_handler);

    let rooms_list = warp::path!("api" / "rooms")
        .and(warp::get())
        .and(with_sfu(sfu.clone()))
        .and_then(rooms_list_handler);

    let rooms_create = warp::path!("api" / "rooms")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_sfu(sfu.clone()))
        .and_then(rooms_create_handler);

    let room_get = warp::path!("api" / "rooms" / String)
        .and(warp::get())
        .and(with_sfu(sfu.clone()))
        .and_then(room_get_handler);

    let room_delete = warp::path!("api" / "rooms" / String)
        .and(warp::delete())
        .and(with_sfu(sfu.clone()))
        .and_then(room_delete_handler);

    let metrics = warp::path("metrics").and(warp::get()).map(|| {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = vec![];
        let metric_families = prometheus::gather();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            buffer.clear();
        }
        String::from_utf8(buffer).unwrap_or_default()
    });

    let cors = if sfu.config.allowed_origins.is_empty() {
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
            .allow_headers(vec!["content-type"])
    } else {
        let origins: Vec<&str> = sfu
            .config
            .allowed_origins
            .iter()
            .map(String::as_str)
            .collect();
        warp::cors()
            .allow_origins(origins)
            .allow_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
            .allow_headers(vec!["content-type"])
    };

    ws_route
        .or(health)
        .or(rooms_list)
        .or(rooms_create)
        .or(room_get)
        .or(room_delete)
        .or(metrics)
        .with(cors)
}

async fn health_handler(sfu: Arc<Sfu>) -> Result<impl Reply, Infallible> {
    let store_up = sfu.store_healthy().await;
    let degraded = sfu.store_configured && !store_up;
    let body = json!({
        "status": if degraded { "degraded" } else { "ok" },
        "timestamp": Utc::now().to_rfc3339(),
        "instanceId": sfu.instance_id,
        "redis": if !sfu.store_configured {
            "disabled"
        } else if store_up {
            "up"
        } else {
            "down"
        },
        "rooms": sfu.rooms.len(),
        "peers": sfu.total_peer_count().await,
    });
    Ok(warp::reply::json(&body))
}

async fn rooms_list_handler(sfu: Arc<Sfu>) -> Result<impl Reply, Infallible> {
    let stats = sfu.room_stats_list().await;
    Ok(warp::reply::json(&stats))
}

async fn rooms_create_handler(
    req: CreateRoomRequest,
    sfu: Arc<Sfu>,
) -> Result<impl Reply, Infallible> {
    match sfu.create_room(&req.name, req.max_peers).await {
        Ok(stats) => Ok(warp::reply::with_status(
            warp::reply::json(&stats),
            StatusCode::CREATED,
        )),
        Err(err) => Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": err.to_string()})),
            StatusCode::from_u16(err.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        )),
    }
}

async fn room_get_handler(id: String, sfu: Arc<Sfu>) -> Result<impl Reply, Infallible> {
    match sfu.rooms.get(&RoomId::from(id.as_str())) {
        Some(room) => Ok(warp::reply::with_status(
            warp::reply::json(&room.stats().await),
            StatusCode::OK,
        )),
        None => Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": "room not found"})),
            StatusCode::NOT_FOUND,
        )),
    }
}

async fn room_delete_handler(id: String, sfu: Arc<Sfu>) -> Result<impl Reply, Infallible> {
    if sfu.close_room(&RoomId::from(id.as_str())).await {
        Ok(warp::reply::with_status(
            warp::reply::json(&json!({"closed": id})),
            StatusCode::OK,
        ))
    } else {
        Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": "room not found"})),
            StatusCode::NOT_FOUND,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;

    fn test_sfu() -> Arc<Sfu> {
        Sfu::new(
            Arc::new(Config::default()),
            Arc::new(MemoryStore::new()),
            false,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint_shape() {
        let routes = routes(test_sfu());
        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["redis"], "disabled");
        assert_eq!(body["rooms"], 0);
        assert!(body["instanceId"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_room_crud_over_http() {
        let routes = routes(test_sfu());

        let created = warp::test::request()
            .method("POST")
            .path("/api/rooms")
            .json(&serde_json::json!({"name": "standup", "maxPeers": 4}))
            .reply(&routes)
            .await;
        assert_eq!(created.status(), 201);

        let listed = warp::test::request().path("/api/rooms").reply(&routes).await;
        let rooms: serde_json::Value = serde_json::from_slice(listed.body()).unwrap();
        assert_eq!(rooms.as_array().unwrap().len(), 1);

        let fetched = warp::test::request()
            .path("/api/rooms/standup")
            .reply(&routes)
            .await;
        assert_eq!(fetched.status(), 200);

        let deleted = warp::test::request()
            .method("DELETE")
            .path("/api/rooms/standup")
            .reply(&routes)
            .await;
        assert_eq!(deleted.status(), 200);

        let missing = warp::test::request()
            .path("/api/rooms/standup")
            .reply(&routes)
            .await;
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_create_room_validates_name() {
        let routes = routes(test_sfu());
        let response = warp::test::request()
            .method("POST")
            .path("/api/rooms")
            .json(&serde_json::json!({"name": "bad name!"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        crate::metrics::register_metrics();
        let routes = routes(test_sfu());
        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), 200);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("sfu_active_rooms_total"));
        assert!(body.contains("sfu_connections_total"));
    }

    #[tokio::test]
    async fn test_ws_endpoint_upgrades() {
        let routes = routes(test_sfu());
        let client = warp::test::ws()
            .path("/ws?userId=u1&name=Alice")
            .handshake(routes)
            .await;
        assert!(client.is_ok());
    }
}
