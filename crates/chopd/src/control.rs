//! The `/_chopin` control namespace.
//!
//! These endpoints are served by the proxy itself: never queued, never
//! forwarded, and exempt from identity injection. The router is mounted
//! into the data plane for any path under `/_chopin`; unmatched paths fall
//! through to axum's 404.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;

use crate::identity::{self, Address, DEV_ADDRESS_COOKIE};
use crate::store::Store;
use crate::token;

/// Size cap for a single report-context body.
pub const REPORT_CONTEXT_BYTE_LIMIT: usize = 1024 * 1024;

#[derive(Clone)]
pub struct App {
	store: Arc<Store>,
}

impl App {
	pub fn new(store: Arc<Store>) -> Self {
		Self { store }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/_chopin/login", get(login))
			.route("/_chopin/logout", get(logout))
			.route("/_chopin/me", get(me))
			.route("/_chopin/status", get(status))
			.route("/_chopin/logs", get(logs))
			.route("/_chopin/report-context", post(report_context))
			.layer(DefaultBodyLimit::max(REPORT_CONTEXT_BYTE_LIMIT))
			.with_state(self.clone())
	}
}

async fn login(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
	let address = params
		.get("as")
		.and_then(|requested| Address::parse(requested).ok())
		.unwrap_or_else(Address::random);
	let token = token::mint(address.as_str());
	// Deliberately not HTTP-only: browser code reads the development address.
	let cookie = format!("{DEV_ADDRESS_COOKIE}={address}; Path=/; SameSite=Strict");
	(
		[(header::SET_COOKIE, cookie)],
		Json(json!({"success": true, "address": address, "token": token})),
	)
}

async fn logout() -> impl IntoResponse {
	let cookie = format!("{DEV_ADDRESS_COOKIE}=; Path=/; SameSite=Strict; Max-Age=0");
	(
		StatusCode::FOUND,
		[
			(header::SET_COOKIE, cookie),
			(header::LOCATION, "/".to_string()),
		],
	)
}

async fn me(headers: HeaderMap) -> Json<serde_json::Value> {
	Json(json!({"address": identity::resolve(&headers)}))
}

async fn status() -> Json<serde_json::Value> {
	Json(json!({"status": "ok"}))
}

async fn logs(State(app): State<App>) -> impl IntoResponse {
	Json(app.store.snapshot())
}

async fn report_context(
	State(app): State<App>,
	Query(params): Query<HashMap<String, String>>,
	body: Bytes,
) -> Response {
	let Some(request_id) = params.get("requestId") else {
		return (
			StatusCode::BAD_REQUEST,
			Json(json!({"error": "requestId query parameter is required"})),
		)
			.into_response();
	};
	match app.store.append_context(request_id, body) {
		Ok(()) => Json(json!({"success": true})).into_response(),
		Err(_) => (
			StatusCode::NOT_FOUND,
			Json(json!({"error": "unknown requestId"})),
		)
			.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use axum::body::Body;
	use http::Request;
	use tower::ServiceExt;

	use super::*;
	use crate::store::LogEntry;

	fn test_app() -> (App, Arc<Store>) {
		let store = Arc::new(Store::default());
		(App::new(store.clone()), store)
	}

	async fn body_json(response: Response) -> serde_json::Value {
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn login_sets_cookie_and_returns_token() {
		let (app, _) = test_app();
		let addr = "0x1111111111111111111111111111111111111111";
		let response = app
			.router()
			.oneshot(
				Request::get(format!("/_chopin/login?as={addr}"))
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let cookie = response
			.headers()
			.get(header::SET_COOKIE)
			.unwrap()
			.to_str()
			.unwrap()
			.to_string();
		assert!(cookie.starts_with(&format!("dev-address={addr}")));
		assert!(cookie.contains("SameSite=Strict"));

		let body = body_json(response).await;
		assert_eq!(body["success"], true);
		assert_eq!(body["address"], addr);
		assert_eq!(token::decode_subject(body["token"].as_str().unwrap()).unwrap(), addr);
	}

	#[tokio::test]
	async fn login_generates_address_when_requested_one_is_invalid() {
		let (app, _) = test_app();
		let response = app
			.router()
			.oneshot(
				Request::get("/_chopin/login?as=not-an-address")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		let body = body_json(response).await;
		assert!(Address::parse(body["address"].as_str().unwrap()).is_ok());
	}

	#[tokio::test]
	async fn logout_clears_cookie_and_redirects() {
		let (app, _) = test_app();
		let response = app
			.router()
			.oneshot(Request::get("/_chopin/logout").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::FOUND);
		assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");
		let cookie = response
			.headers()
			.get(header::SET_COOKIE)
			.unwrap()
			.to_str()
			.unwrap();
		assert!(cookie.contains("Max-Age=0"));
	}

	#[tokio::test]
	async fn me_reports_null_without_identity() {
		let (app, _) = test_app();
		let response = app
			.router()
			.oneshot(Request::get("/_chopin/me").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(body_json(response).await["address"], serde_json::Value::Null);
	}

	#[tokio::test]
	async fn report_context_requires_request_id() {
		let (app, _) = test_app();
		let response = app
			.router()
			.oneshot(
				Request::post("/_chopin/report-context")
					.body(Body::from("ctx"))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn report_context_unknown_id_is_404() {
		let (app, _) = test_app();
		let response = app
			.router()
			.oneshot(
				Request::post("/_chopin/report-context?requestId=missing")
					.body(Body::from("ctx"))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn report_context_appends_raw_bytes() {
		let (app, store) = test_app();
		store.begin_request(LogEntry::new(
			"r1".to_string(),
			&http::Method::POST,
			"/slow".to_string(),
			&http::HeaderMap::new(),
			&Bytes::new(),
		));
		let response = app
			.router()
			.oneshot(
				Request::post("/_chopin/report-context?requestId=r1")
					.header(header::CONTENT_TYPE, "text/plain")
					.body(Body::from("Hello from forced raw text context."))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(body_json(response).await["success"], true);
		assert_eq!(
			store.snapshot()[0].contexts,
			vec!["Hello from forced raw text context."]
		);
	}

	#[tokio::test]
	async fn oversized_context_body_is_rejected() {
		let (app, store) = test_app();
		store.begin_request(LogEntry::new(
			"r1".to_string(),
			&http::Method::POST,
			"/slow".to_string(),
			&http::HeaderMap::new(),
			&Bytes::new(),
		));
		let response = app
			.router()
			.oneshot(
				Request::post("/_chopin/report-context?requestId=r1")
					.body(Body::from(vec![0u8; REPORT_CONTEXT_BYTE_LIMIT + 1]))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
		assert!(store.snapshot()[0].contexts.is_empty());
	}
}
