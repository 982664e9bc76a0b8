//! Development identity: the `dev-address` cookie, bearer-token fallback,
//! and the `x-address` header injected on forwarded requests.

use std::fmt;

use headers::HeaderMapExt;
use headers::authorization::Bearer;
use http::HeaderMap;
use serde::Serialize;

use crate::http::x_headers::X_ADDRESS;
use crate::token;

pub const DEV_ADDRESS_COOKIE: &str = "dev-address";

/// A 20-byte account identifier, `0x` followed by 40 lower-hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Address(String);

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("not a 0x-prefixed 40-digit lower-hex address")]
pub struct InvalidAddress;

impl Address {
	pub fn parse(s: &str) -> Result<Address, InvalidAddress> {
		let hex_part = s.strip_prefix("0x").ok_or(InvalidAddress)?;
		if hex_part.len() != 40 {
			return Err(InvalidAddress);
		}
		if !hex_part
			.bytes()
			.all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
		{
			return Err(InvalidAddress);
		}
		Ok(Address(s.to_string()))
	}

	pub fn random() -> Address {
		let raw: [u8; 20] = rand::random();
		Address(format!("0x{}", hex::encode(raw)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Resolve the development identity for a request.
///
/// The cookie always wins; a bearer token is only consulted when the cookie
/// is absent. Token decode failures are silent: the request simply proceeds
/// anonymous.
pub fn resolve(headers: &HeaderMap) -> Option<String> {
	if let Some(cookie) = headers.typed_get::<headers::Cookie>()
		&& let Some(value) = cookie.get(DEV_ADDRESS_COOKIE)
	{
		return Some(value.to_string());
	}
	let bearer = headers.typed_get::<headers::Authorization<Bearer>>()?;
	token::decode_subject(bearer.token()).ok()
}

/// Make the proxy the sole source of truth for `x-address`: whatever the
/// client sent is dropped, and the header is only present when an identity
/// actually resolved.
pub fn inject(headers: &mut HeaderMap) {
	let resolved = resolve(headers);
	headers.remove(X_ADDRESS);
	if let Some(address) = resolved
		&& let Ok(value) = address.parse()
	{
		headers.insert(X_ADDRESS, value);
	}
}
