//! Process-lived recording state: the append-only request log and the
//! per-request context sequences reported by the target.
//!
//! The two collections sit behind separate locks so `/logs` readers never
//! contend with the serialization queue, and context appends never contend
//! with log writes.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http::HeaderMap;
use serde::Serialize;

/// Generate a fresh request identifier: 128 random bits, lower-hex.
pub fn fresh_request_id() -> String {
	format!("{:032x}", rand::random::<u128>())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
	pub request_id: String,
	pub method: String,
	pub url: String,
	pub headers: BTreeMap<String, String>,
	pub body: String,
	pub timestamp: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response: Option<RecordedResponse>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedResponse {
	pub status: u16,
	pub status_text: String,
	pub headers: BTreeMap<String, String>,
	pub body: String,
}

/// A log entry joined with its context sequence, as served by `/logs`.
#[derive(Debug, Serialize)]
pub struct LogEntryWithContexts {
	#[serde(flatten)]
	pub entry: LogEntry,
	pub contexts: Vec<String>,
}

impl LogEntry {
	pub fn new(
		request_id: String,
		method: &http::Method,
		url: String,
		headers: &HeaderMap,
		body: &Bytes,
	) -> Self {
		LogEntry {
			request_id,
			method: method.to_string(),
			url,
			headers: snapshot_headers(headers),
			body: String::from_utf8_lossy(body).into_owned(),
			timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
			response: None,
			response_error: None,
		}
	}
}

pub fn snapshot_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
	let mut map: BTreeMap<String, String> = BTreeMap::new();
	for (name, value) in headers {
		let value = String::from_utf8_lossy(value.as_bytes());
		match map.entry(name.as_str().to_string()) {
			Entry::Occupied(mut existing) => {
				let joined = existing.get_mut();
				joined.push_str(", ");
				joined.push_str(&value);
			},
			Entry::Vacant(slot) => {
				slot.insert(value.into_owned());
			},
		}
	}
	map
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("unknown request id")]
pub struct UnknownRequestId;

#[derive(Default)]
pub struct Store {
	log: RwLock<Vec<LogEntry>>,
	contexts: RwLock<HashMap<String, Vec<Bytes>>>,
}

impl Store {
	/// Record a newly admitted request: its (empty) context sequence and its
	/// log entry come into existence together, under the same id.
	pub fn begin_request(&self, entry: LogEntry) {
		self
			.contexts
			.write()
			.expect("contexts lock")
			.insert(entry.request_id.clone(), Vec::new());
		self.log.write().expect("log lock").push(entry);
	}

	/// Append one opaque context body to a request's sequence. Sequences are
	/// never destroyed, so reports that arrive after the originating request
	/// has completed are still accepted.
	pub fn append_context(&self, request_id: &str, body: Bytes) -> Result<(), UnknownRequestId> {
		let mut contexts = self.contexts.write().expect("contexts lock");
		let sequence = contexts.get_mut(request_id).ok_or(UnknownRequestId)?;
		sequence.push(body);
		Ok(())
	}

	pub fn record_response(&self, request_id: &str, response: RecordedResponse) {
		self.with_entry(request_id, |entry| entry.response = Some(response));
	}

	pub fn record_error(&self, request_id: &str, error: String) {
		self.with_entry(request_id, |entry| entry.response_error = Some(error));
	}

	fn with_entry(&self, request_id: &str, f: impl FnOnce(&mut LogEntry)) {
		let mut log = self.log.write().expect("log lock");
		// The entry being completed is almost always the most recent one.
		if let Some(entry) = log
			.iter_mut()
			.rev()
			.find(|entry| entry.request_id == request_id)
		{
			f(entry);
		}
	}

	/// A consistent snapshot of the log with each entry's contexts joined in,
	/// in append order.
	pub fn snapshot(&self) -> Vec<LogEntryWithContexts> {
		let log = self.log.read().expect("log lock");
		let contexts = self.contexts.read().expect("contexts lock");
		log
			.iter()
			.map(|entry| LogEntryWithContexts {
				entry: entry.clone(),
				contexts: contexts
					.get(&entry.request_id)
					.map(|seq| {
						seq
							.iter()
							.map(|b| String::from_utf8_lossy(b).into_owned())
							.collect()
					})
					.unwrap_or_default(),
			})
			.collect()
	}

}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(id: &str) -> LogEntry {
		LogEntry::new(
			id.to_string(),
			&http::Method::POST,
			"/slow".to_string(),
			&HeaderMap::new(),
			&Bytes::from_static(b"{}"),
		)
	}

	#[test]
	fn request_ids_are_distinct_hex() {
		let a = fresh_request_id();
		let b = fresh_request_id();
		assert_eq!(a.len(), 32);
		assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
		assert_ne!(a, b);
	}

	#[test]
	fn contexts_preserve_append_order() {
		let store = Store::default();
		store.begin_request(entry("r1"));
		for body in ["context #1", "context #2", "context #3"] {
			store.append_context("r1", Bytes::from(body)).unwrap();
		}
		let snapshot = store.snapshot();
		assert_eq!(snapshot.len(), 1);
		assert_eq!(
			snapshot[0].contexts,
			vec!["context #1", "context #2", "context #3"]
		);
	}

	#[test]
	fn unknown_request_id_is_rejected() {
		let store = Store::default();
		assert_eq!(
			store.append_context("nope", Bytes::new()),
			Err(UnknownRequestId)
		);
	}

	#[test]
	fn late_context_reports_are_accepted() {
		let store = Store::default();
		store.begin_request(entry("r1"));
		store.record_response(
			"r1",
			RecordedResponse {
				status: 201,
				status_text: "Created".to_string(),
				headers: BTreeMap::new(),
				body: String::new(),
			},
		);
		// The originating request is long done; the sequence still lives.
		store.append_context("r1", Bytes::from("late")).unwrap();
		assert_eq!(store.snapshot()[0].contexts, vec!["late"]);
	}

	#[test]
	fn log_keeps_admission_order() {
		let store = Store::default();
		store.begin_request(entry("r1"));
		store.begin_request(entry("r2"));
		store.record_error("r1", "connection refused".to_string());
		let snapshot = store.snapshot();
		assert_eq!(snapshot[0].entry.request_id, "r1");
		assert_eq!(
			snapshot[0].entry.response_error.as_deref(),
			Some("connection refused")
		);
		assert_eq!(snapshot[1].entry.request_id, "r2");
		assert!(snapshot[1].entry.response_error.is_none());
	}

	#[test]
	fn header_snapshot_joins_repeated_names() {
		let mut headers = HeaderMap::new();
		headers.append("accept", "text/html".parse().unwrap());
		headers.append("accept", "application/json".parse().unwrap());
		let map = snapshot_headers(&headers);
		assert_eq!(map["accept"], "text/html, application/json");
	}
}
