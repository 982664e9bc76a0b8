//! Shared HTTP types and header plumbing for both proxy legs.

use ::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use ::http::{HeaderMap, HeaderName, HeaderValue};
use headers::HeaderMapExt;

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub mod x_headers {
	use http::HeaderName;

	pub const X_ADDRESS: HeaderName = HeaderName::from_static("x-address");
	pub const X_CALLBACK_URL: HeaderName = HeaderName::from_static("x-callback-url");
}

/// Headers that must not cross the proxy in either direction. `host` and
/// `content-length` are re-derived for the outbound leg by the HTTP stack.
const HOP_BY_HOP: [HeaderName; 4] = [HOST, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(name);
	}
}

/// The `Upgrade` token of a request that asks for a protocol switch, if the
/// `Connection` header nominates one.
pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	let connection = headers.typed_get::<headers::Connection>()?;
	if connection.contains(UPGRADE) {
		headers.get(UPGRADE).cloned()
	} else {
		None
	}
}

pub fn is_upgrade(headers: &HeaderMap) -> bool {
	upgrade_type(headers).is_some()
}
