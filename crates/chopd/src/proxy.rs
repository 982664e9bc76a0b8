//! The data plane: one pipeline per connection, serving the control
//! namespace, the serialized mutating path, and transparent pass-through
//! (including WebSocket upgrades) over a single listener.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpStream;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::control;
use crate::http::{Body, Response, is_upgrade, strip_hop_by_hop, upgrade_type, x_headers};
use crate::identity;
use crate::queue::{RequestQueue, SlotGuard};
use crate::store::{LogEntry, RecordedResponse, Store, fresh_request_id, snapshot_headers};
use ::http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use ::http::uri::PathAndQuery;
use ::http::{HeaderValue, Method, StatusCode, Uri};

/// Size cap for a buffered mutating request body.
pub const QUEUED_BODY_BYTE_LIMIT: usize = 2 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("request body exceeds the queued-request limit")]
	RequestBodyTooLarge,
	#[error("failed to read request body: {0}")]
	RequestBodyRead(Box<dyn std::error::Error + Send + Sync>),
	#[error("upstream call failed: {0}")]
	Upstream(#[from] hyper_util::client::legacy::Error),
	#[error("upstream connect failed: {0}")]
	UpstreamConnect(std::io::Error),
	#[error("upstream protocol error: {0}")]
	UpstreamHttp(#[from] hyper::Error),
	#[error("request is not a protocol upgrade")]
	NotAnUpgrade,
	#[error("invalid forwarded request: {0}")]
	BadForward(#[from] ::http::Error),
	#[error("handler fault")]
	HandlerFault,
}

impl ProxyError {
	pub fn as_response(&self) -> Response {
		match self {
			ProxyError::RequestBodyTooLarge => {
				plain_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
			},
			ProxyError::RequestBodyRead(_) => {
				plain_response(StatusCode::BAD_REQUEST, "failed to read request body")
			},
			ProxyError::Upstream(_) | ProxyError::UpstreamConnect(_) | ProxyError::UpstreamHttp(_) => {
				bad_gateway(&self.to_string())
			},
			ProxyError::NotAnUpgrade | ProxyError::BadForward(_) | ProxyError::HandlerFault => {
				plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal proxy error")
			},
		}
	}
}

fn plain_response(status: StatusCode, message: &str) -> Response {
	::http::Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "text/plain")
		.body(Body::from(message.to_string()))
		.expect("static response builds")
}

fn bad_gateway(details: &str) -> Response {
	let body = serde_json::json!({"error": "Bad Gateway", "details": details});
	::http::Response::builder()
		.status(StatusCode::BAD_GATEWAY)
		.header(CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response builds")
}

pin_project_lite::pin_project! {
	/// Response body wrapper that keeps the queue slot held until the body
	/// has been fully written to (or abandoned by) the client.
	struct GuardedBody {
		#[pin]
		inner: Body,
		_slot: SlotGuard,
	}
}

impl ::http_body::Body for GuardedBody {
	type Data = Bytes;
	type Error = axum::Error;

	fn poll_frame(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Result<::http_body::Frame<Bytes>, Self::Error>>> {
		self.project().inner.poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> ::http_body::SizeHint {
		self.inner.size_hint()
	}
}

fn hold_slot_until_sent(response: Response, slot: SlotGuard) -> Response {
	response.map(|inner| Body::new(GuardedBody { inner, _slot: slot }))
}

#[derive(Clone)]
pub struct Pipeline {
	control: axum::Router,
	client: Client<HttpConnector, Body>,
	store: Arc<Store>,
	queue: Arc<RequestQueue>,
	proxy_port: u16,
	target_port: u16,
}

impl Pipeline {
	pub fn new(
		store: Arc<Store>,
		queue: Arc<RequestQueue>,
		proxy_port: u16,
		target_port: u16,
	) -> Self {
		let control = control::App::new(store.clone()).router();
		let client = Client::builder(TokioExecutor::new())
			.timer(TokioTimer::new())
			.build_http();
		Pipeline {
			control,
			client,
			store,
			queue,
			proxy_port,
			target_port,
		}
	}

	/// Serve one accepted client connection until it closes.
	pub async fn serve_connection(
		&self,
		stream: TcpStream,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
		let pipeline = self.clone();
		let service = hyper::service::service_fn(move |req| {
			let pipeline = pipeline.clone();
			async move { Ok::<_, Infallible>(pipeline.handle(req).await) }
		});
		auto::Builder::new(TokioExecutor::new())
			.serve_connection_with_upgrades(TokioIo::new(stream), service)
			.await
	}

	async fn handle(&self, mut req: ::http::Request<Incoming>) -> Response {
		let path = req.uri().path();
		if path == "/_chopin" || path.starts_with("/_chopin/") {
			match self.control.clone().oneshot(req.map(Body::new)).await {
				Ok(response) => response,
				Err(infallible) => match infallible {},
			}
		} else {
			identity::inject(req.headers_mut());
			if is_mutating(req.method()) && !is_upgrade(req.headers()) {
				self.handle_serialized(req).await
			} else {
				self.forward(req).await.unwrap_or_else(|err| {
					warn!("pass-through failed: {err}");
					err.as_response()
				})
			}
		}
	}

	/// Take the slot, run the queued handler, and tie the slot's release to
	/// the delivery of whatever response comes out, error or not.
	///
	/// The handler runs in its own task and owns the slot while it does: a
	/// client that disconnects mid-flight abandons the response, but the
	/// exchange still completes at the target, still lands in the log, and
	/// only then does the slot move on.
	async fn handle_serialized(&self, req: ::http::Request<Incoming>) -> Response {
		let slot = self.queue.admit().await;
		let pipeline = self.clone();
		let task = tokio::spawn(async move {
			let result = pipeline.handle_queued(req).await;
			(result, slot)
		});
		match task.await {
			Ok((Ok(response), slot)) => hold_slot_until_sent(response, slot),
			Ok((Err(err), slot)) => {
				warn!("queued request failed: {err}");
				hold_slot_until_sent(err.as_response(), slot)
			},
			// A panicking handler drops the slot during unwind; the queue
			// keeps moving and this client gets a 500.
			Err(join_error) => {
				warn!("queued handler panicked: {join_error}");
				ProxyError::HandlerFault.as_response()
			},
		}
	}

	async fn handle_queued(
		&self,
		req: ::http::Request<Incoming>,
	) -> Result<Response, ProxyError> {
		let (parts, body) = req.into_parts();
		let body = match Limited::new(body, QUEUED_BODY_BYTE_LIMIT).collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(err) if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
				return Err(ProxyError::RequestBodyTooLarge);
			},
			Err(err) => return Err(ProxyError::RequestBodyRead(err)),
		};

		let request_id = fresh_request_id();
		let url = parts
			.uri
			.path_and_query()
			.map(|pq| pq.to_string())
			.unwrap_or_else(|| parts.uri.path().to_string());
		self.store.begin_request(LogEntry::new(
			request_id.clone(),
			&parts.method,
			url,
			&parts.headers,
			&body,
		));
		debug!(request_id = %request_id, method = %parts.method, "dispatching queued request");

		// The callback must be reachable from the target: address it the way
		// the client addressed us, falling back to our own port.
		let callback_host = parts
			.headers
			.get(HOST)
			.and_then(|value| value.to_str().ok())
			.map(str::to_string)
			.unwrap_or_else(|| format!("localhost:{}", self.proxy_port));
		let callback_url =
			format!("http://{callback_host}/_chopin/report-context?requestId={request_id}");

		let mut forwarded = ::http::Request::builder()
			.method(parts.method.clone())
			.uri(self.target_uri(&parts.uri)?)
			.body(Body::from(body))?;
		*forwarded.headers_mut() = parts.headers.clone();
		strip_hop_by_hop(forwarded.headers_mut());
		forwarded.headers_mut().insert(
			x_headers::X_CALLBACK_URL,
			HeaderValue::from_str(&callback_url).map_err(::http::Error::from)?,
		);

		let upstream_response = match self.client.request(forwarded).await {
			Ok(response) => response,
			Err(err) => {
				self.store.record_error(&request_id, err.to_string());
				return Err(ProxyError::Upstream(err));
			},
		};

		let (mut response_parts, response_body) = upstream_response.into_parts();
		let response_bytes = match response_body.collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(err) => {
				self.store.record_error(&request_id, err.to_string());
				return Err(ProxyError::UpstreamHttp(err));
			},
		};
		self.store.record_response(
			&request_id,
			RecordedResponse {
				status: response_parts.status.as_u16(),
				status_text: response_parts
					.status
					.canonical_reason()
					.unwrap_or("")
					.to_string(),
				headers: snapshot_headers(&response_parts.headers),
				body: String::from_utf8_lossy(&response_bytes).into_owned(),
			},
		);
		strip_hop_by_hop(&mut response_parts.headers);
		Ok(::http::Response::from_parts(
			response_parts,
			Body::from(response_bytes),
		))
	}

	/// Transparent relay for non-mutating methods, plus the upgrade path.
	async fn forward(&self, req: ::http::Request<Incoming>) -> Result<Response, ProxyError> {
		if is_upgrade(req.headers()) {
			return self.forward_upgrade(req).await;
		}
		let (parts, body) = req.into_parts();
		let mut forwarded = ::http::Request::builder()
			.method(parts.method.clone())
			.uri(self.target_uri(&parts.uri)?)
			.body(Body::new(body))?;
		*forwarded.headers_mut() = parts.headers;
		strip_hop_by_hop(forwarded.headers_mut());

		let response = self.client.request(forwarded).await?;
		let (mut response_parts, response_body) = response.into_parts();
		strip_hop_by_hop(&mut response_parts.headers);
		Ok(::http::Response::from_parts(
			response_parts,
			Body::new(response_body),
		))
	}

	/// Proxy a protocol upgrade: handshake against the target on a dedicated
	/// connection, then splice the two upgraded streams together without
	/// buffering frames.
	async fn forward_upgrade(
		&self,
		mut req: ::http::Request<Incoming>,
	) -> Result<Response, ProxyError> {
		let requested_protocol = upgrade_type(req.headers()).ok_or(ProxyError::NotAnUpgrade)?;
		let downstream = req
			.extensions_mut()
			.remove::<OnUpgrade>()
			.ok_or(ProxyError::NotAnUpgrade)?;
		let (parts, _body) = req.into_parts();

		let path_and_query = parts
			.uri
			.path_and_query()
			.cloned()
			.unwrap_or_else(|| PathAndQuery::from_static("/"));
		let authority = format!("127.0.0.1:{}", self.target_port);
		let mut forwarded = ::http::Request::builder()
			.method(parts.method.clone())
			.uri(path_and_query)
			.body(Empty::<Bytes>::new())?;
		*forwarded.headers_mut() = parts.headers.clone();
		strip_hop_by_hop(forwarded.headers_mut());
		forwarded.headers_mut().insert(
			HOST,
			HeaderValue::from_str(&authority).map_err(::http::Error::from)?,
		);
		forwarded
			.headers_mut()
			.insert(CONNECTION, HeaderValue::from_static("upgrade"));
		forwarded.headers_mut().insert(UPGRADE, requested_protocol);

		let stream = TcpStream::connect(&authority)
			.await
			.map_err(ProxyError::UpstreamConnect)?;
		let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
		tokio::spawn(async move {
			if let Err(err) = conn.with_upgrades().await {
				debug!("upgrade connection ended: {err}");
			}
		});

		let mut response = sender.send_request(forwarded).await?;
		if response.status() != StatusCode::SWITCHING_PROTOCOLS {
			// Target declined the upgrade; relay its answer untouched.
			return Ok(response.map(Body::new));
		}
		let upstream = response
			.extensions_mut()
			.remove::<OnUpgrade>()
			.ok_or(ProxyError::NotAnUpgrade)?;
		tokio::spawn(async move {
			match tokio::try_join!(downstream, upstream) {
				Ok((downstream, upstream)) => {
					let mut downstream = TokioIo::new(downstream);
					let mut upstream = TokioIo::new(upstream);
					if let Err(err) =
						tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await
					{
						debug!("upgraded relay closed: {err}");
					}
				},
				Err(err) => warn!("protocol upgrade failed: {err}"),
			}
		});
		Ok(response.map(|_| Body::empty()))
	}

	fn target_uri(&self, uri: &Uri) -> Result<Uri, ::http::Error> {
		let path_and_query = uri
			.path_and_query()
			.cloned()
			.unwrap_or_else(|| PathAndQuery::from_static("/"));
		Uri::builder()
			.scheme("http")
			.authority(format!("127.0.0.1:{}", self.target_port).as_str())
			.path_and_query(path_and_query)
			.build()
	}
}

pub fn is_mutating(method: &Method) -> bool {
	matches!(
		*method,
		Method::POST | Method::PUT | Method::PATCH | Method::DELETE
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mutating_method_set_is_exact() {
		assert!(is_mutating(&Method::POST));
		assert!(is_mutating(&Method::PUT));
		assert!(is_mutating(&Method::PATCH));
		assert!(is_mutating(&Method::DELETE));
		assert!(!is_mutating(&Method::GET));
		assert!(!is_mutating(&Method::HEAD));
		assert!(!is_mutating(&Method::OPTIONS));
	}

	#[test]
	fn bad_gateway_body_names_the_failure() {
		let response = bad_gateway("connection refused");
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
	}

	#[test]
	fn target_uri_preserves_path_and_query() {
		let pipeline = Pipeline::new(
			Arc::new(Store::default()),
			Arc::new(RequestQueue::new()),
			4000,
			3000,
		);
		let uri: Uri = "/slow?x=1".parse().unwrap();
		let target = pipeline.target_uri(&uri).unwrap();
		assert_eq!(target.to_string(), "http://127.0.0.1:3000/slow?x=1");
	}
}
