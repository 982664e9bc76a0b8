//! Unsigned development tokens.
//!
//! The identity vector is a three-segment `header.payload.signature` token
//! with `alg: "none"` and an empty signature. That is exactly the shape real
//! JWT libraries refuse to produce, so the segments are built and parsed
//! directly. Anything signed (or claiming to be) is rejected: this must
//! never be mistaken for real authentication.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenError {
	#[error("the token is not in header.payload.signature form")]
	Malformed,
	#[error("the token algorithm is not \"none\"")]
	SignedAlgorithm,
	#[error("the token carries a signature")]
	UnexpectedSignature,
	#[error("the token payload has no `sub` claim")]
	MissingSubject,
}

#[derive(Serialize, Deserialize)]
struct Header {
	alg: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	typ: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Claims {
	sub: String,
}

/// Mint an unsigned token whose `sub` claim is the given address.
pub fn mint(subject: &str) -> String {
	let header = Header {
		alg: "none".to_string(),
		typ: Some("JWT".to_string()),
	};
	let claims = Claims {
		sub: subject.to_string(),
	};
	// Serializing two flat structs of strings cannot fail.
	let header = serde_json::to_vec(&header).expect("token header serializes");
	let claims = serde_json::to_vec(&claims).expect("token claims serialize");
	format!(
		"{}.{}.",
		URL_SAFE_NO_PAD.encode(header),
		URL_SAFE_NO_PAD.encode(claims)
	)
}

/// Decode the `sub` claim of an unsigned token.
pub fn decode_subject(token: &str) -> Result<String, TokenError> {
	let mut segments = token.split('.');
	let (header, payload, signature) = match (
		segments.next(),
		segments.next(),
		segments.next(),
		segments.next(),
	) {
		(Some(h), Some(p), Some(s), None) => (h, p, s),
		_ => return Err(TokenError::Malformed),
	};
	if !signature.is_empty() {
		return Err(TokenError::UnexpectedSignature);
	}
	let header: Header = decode_segment(header)?;
	if header.alg != "none" {
		return Err(TokenError::SignedAlgorithm);
	}
	let claims: Claims = decode_segment(payload).map_err(|_| TokenError::MissingSubject)?;
	Ok(claims.sub)
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, TokenError> {
	let raw = URL_SAFE_NO_PAD
		.decode(segment)
		.map_err(|_| TokenError::Malformed)?;
	serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)
}
