use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chopd::{app, config};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chopd", version, about = "Deterministic local-development reverse proxy")]
struct Args {
	/// Path to the configuration file
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,

	/// `init`, or positional [proxyPort] [targetPort] overrides
	#[arg(value_name = "args")]
	rest: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	chopd_core::telemetry::setup_logging();
	let args = Args::parse();

	// A leading non-numeric token is a subcommand, not a port.
	if let Some(first) = args.rest.first()
		&& !first.bytes().all(|b| b.is_ascii_digit())
	{
		return match first.as_str() {
			"init" => init(args.config.as_deref()),
			other => bail!("unknown subcommand `{other}`"),
		};
	}

	let overrides = parse_port_overrides(&args.rest)?;
	let config = config::load(args.config.as_deref(), overrides)?;
	let bound = app::run(Arc::new(config)).await?;
	bound.wait_termination().await
}

fn parse_port_overrides(rest: &[String]) -> anyhow::Result<config::PortOverrides> {
	if rest.len() > 2 {
		bail!("expected at most [proxyPort] [targetPort]");
	}
	let parse_port = |raw: &String, which: &str| {
		raw
			.parse::<u16>()
			.ok()
			.filter(|port| *port != 0)
			.with_context(|| format!("invalid {which} `{raw}`"))
	};
	Ok(config::PortOverrides {
		proxy_port: rest
			.first()
			.map(|raw| parse_port(raw, "proxy port"))
			.transpose()?,
		target_port: rest
			.get(1)
			.map(|raw| parse_port(raw, "target port"))
			.transpose()?,
	})
}

fn init(path: Option<&Path>) -> anyhow::Result<()> {
	let path = path.unwrap_or(Path::new(config::DEFAULT_CONFIG_FILE));
	if path.exists() {
		bail!("{} already exists, not overwriting", path.display());
	}
	std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)
		.with_context(|| format!("writing {}", path.display()))?;
	println!("created {}", path.display());
	Ok(())
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"{
  "command": "npm run dev",
  "proxyPort": 4000,
  "targetPort": 3000,
  "env": {},
  "version": "1.0.0"
}
"#;
