//! Configuration: `chopin.config.json` plus positional CLI port overrides.
//!
//! Precedence is CLI > file > defaults. Validation failures here are fatal
//! before the listener ever binds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "chopin.config.json";
pub const DEFAULT_PROXY_PORT: u16 = 4000;
pub const DEFAULT_TARGET_PORT: u16 = 3000;

/// The validated runtime configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// Shell command that starts the target application, when the proxy is
	/// responsible for spawning it.
	pub command: Option<String>,
	pub proxy_port: u16,
	pub target_port: u16,
	pub env: HashMap<String, String>,
	pub version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
	command: Option<String>,
	proxy_port: Option<u16>,
	target_port: Option<u16>,
	env: Option<HashMap<String, String>>,
	version: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PortOverrides {
	pub proxy_port: Option<u16>,
	pub target_port: Option<u16>,
}

pub fn load(path: Option<&Path>, overrides: PortOverrides) -> anyhow::Result<Config> {
	let (path, explicit) = match path {
		Some(path) => (path.to_path_buf(), true),
		None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
	};
	let raw = if path.exists() {
		let contents = std::fs::read_to_string(&path)
			.with_context(|| format!("reading {}", path.display()))?;
		serde_json::from_str::<RawConfig>(&contents)
			.with_context(|| format!("invalid config {}", path.display()))?
	} else if explicit {
		bail!("config file {} not found", path.display());
	} else {
		RawConfig::default()
	};

	let proxy_port = overrides
		.proxy_port
		.or(raw.proxy_port)
		.unwrap_or(DEFAULT_PROXY_PORT);
	let target_port = overrides
		.target_port
		.or(raw.target_port)
		.unwrap_or(DEFAULT_TARGET_PORT);
	validate_port(proxy_port, "proxyPort")?;
	validate_port(target_port, "targetPort")?;
	if let Some(version) = &raw.version {
		validate_version(version)?;
	}

	Ok(Config {
		command: raw.command,
		proxy_port,
		target_port,
		env: raw.env.unwrap_or_default(),
		version: raw.version,
	})
}

fn validate_port(port: u16, field: &str) -> anyhow::Result<()> {
	if port == 0 {
		bail!("{field} must be between 1 and 65535");
	}
	Ok(())
}

fn validate_version(version: &str) -> anyhow::Result<()> {
	let numeric_triple = {
		let mut segments = version.split('.');
		let all_numeric = segments
			.by_ref()
			.take(3)
			.all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
		all_numeric && segments.next().is_none() && version.split('.').count() == 3
	};
	if !numeric_triple {
		bail!("version `{version}` is not a MAJOR.MINOR.PATCH semver string");
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_config(contents: &str) -> tempfile::TempDir {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), contents).unwrap();
		dir
	}

	#[test]
	fn explicit_missing_file_fails() {
		let err = load(
			Some(Path::new("/nonexistent/nope.json")),
			PortOverrides::default(),
		)
		.unwrap_err();
		assert!(err.to_string().contains("not found"));
	}

	#[test]
	fn empty_config_uses_defaults() {
		let dir = write_config("{}");
		let config = load(
			Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
			PortOverrides::default(),
		)
		.unwrap();
		assert_eq!(config.proxy_port, DEFAULT_PROXY_PORT);
		assert_eq!(config.target_port, DEFAULT_TARGET_PORT);
		assert!(config.command.is_none());
		assert!(config.env.is_empty());
	}

	#[test]
	fn file_values_are_read() {
		let dir = write_config(
			r#"{
				"command": "npm run dev",
				"proxyPort": 4100,
				"targetPort": 3100,
				"env": {"NODE_ENV": "development"},
				"version": "1.0.0"
			}"#,
		);
		let config = load(
			Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
			PortOverrides::default(),
		)
		.unwrap();
		assert_eq!(config.command.as_deref(), Some("npm run dev"));
		assert_eq!(config.proxy_port, 4100);
		assert_eq!(config.target_port, 3100);
		assert_eq!(config.env["NODE_ENV"], "development");
	}

	#[test]
	fn cli_ports_override_the_file() {
		let dir = write_config(r#"{"proxyPort": 4100, "targetPort": 3100}"#);
		let config = load(
			Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
			PortOverrides {
				proxy_port: Some(5000),
				target_port: None,
			},
		)
		.unwrap();
		assert_eq!(config.proxy_port, 5000);
		assert_eq!(config.target_port, 3100);
	}

	#[test]
	fn zero_ports_are_rejected() {
		let dir = write_config(r#"{"proxyPort": 0}"#);
		let err = load(
			Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
			PortOverrides::default(),
		)
		.unwrap_err();
		assert!(err.to_string().contains("proxyPort"));
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let dir = write_config(r#"{"proxyPortt": 4000}"#);
		assert!(
			load(
				Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
				PortOverrides::default()
			)
			.is_err()
		);
	}

	#[test]
	fn version_must_be_semver() {
		let dir = write_config(r#"{"version": "not-semver"}"#);
		assert!(
			load(
				Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
				PortOverrides::default()
			)
			.is_err()
		);

		let dir = write_config(r#"{"version": "2.10.3"}"#);
		assert!(
			load(
				Some(&dir.path().join(DEFAULT_CONFIG_FILE)),
				PortOverrides::default()
			)
			.is_ok()
		);
	}
}
