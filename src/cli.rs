use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::server;
use crate::store::{
    AuthConfig, NewServer, RemoteConfig, ServerUpdate, StdioConfig, Store, TransportConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "gatehouse",
    version,
    about = "MCP gateway: many upstream MCP servers behind one endpoint"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the gateway daemon.
    Serve(ServeArgs),
    /// Register an upstream server in the store.
    Add(AddArgs),
    /// List configured upstream servers.
    List(DataDirArgs),
    /// Remove a server (and its OAuth state) by name or id.
    Remove(SelectorArgs),
    /// Mark a server enabled.
    Enable(SelectorArgs),
    /// Mark a server disabled.
    Disable(SelectorArgs),
    #[command(name = "__fixture_server", hide = true)]
    FixtureServer,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,
    /// Listen port.
    #[arg(long, env = "PORT", default_value_t = 8787)]
    pub port: u16,
    /// Externally-reachable base URL used for OAuth redirect URLs.
    #[arg(long, env = "GATEWAY_BASE_URL")]
    pub base_url: Option<String>,
    /// Directory holding the persistent store.
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DataDirArgs {
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SelectorArgs {
    /// Server name or id.
    server: String,
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Unique human name; its normalized form becomes the tool prefix.
    name: String,
    /// Stdio command to spawn (mutually exclusive with --url).
    #[arg(long, conflicts_with = "url")]
    command: Option<String>,
    /// Arguments for the stdio command (repeatable).
    #[arg(long = "arg")]
    args: Vec<String>,
    /// Extra environment for the stdio command, as KEY=VALUE (repeatable).
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,
    /// Working directory for the stdio command; `~` expands at spawn time.
    #[arg(long)]
    cwd: Option<String>,
    /// Remote server URL (http/https).
    #[arg(long)]
    url: Option<String>,
    /// Remote transport: streamable-http (default) or sse.
    #[arg(long, default_value = "streamable-http")]
    transport: String,
    /// Static header for remote servers, as NAME=VALUE (repeatable).
    #[arg(long = "header", value_parser = parse_key_value)]
    headers: Vec<(String, String)>,
    /// Bearer token auth for remote servers.
    #[arg(long, conflicts_with_all = ["api_key", "oauth"])]
    bearer: Option<String>,
    /// API-key auth for remote servers.
    #[arg(long, conflicts_with = "oauth")]
    api_key: Option<String>,
    /// Header name for --api-key (default X-API-Key).
    #[arg(long, requires = "api_key")]
    api_key_header: Option<String>,
    /// Use OAuth 2.0 + PKCE for this remote server.
    #[arg(long)]
    oauth: bool,
    /// Pre-registered OAuth client id (skips dynamic client registration).
    #[arg(long, requires = "oauth")]
    oauth_client_id: Option<String>,
    /// OAuth scopes to request (repeatable).
    #[arg(long = "scope", requires = "oauth")]
    scopes: Vec<String>,
    /// Register the server disabled.
    #[arg(long, default_value_t = false)]
    disabled: bool,
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => server::serve(args).await,
        Commands::Add(args) => add_server(args).await,
        Commands::List(args) => {
            let store = open_store(args.data_dir)?;
            let servers = store.list_servers();
            if servers.is_empty() {
                println!("no servers configured");
                return Ok(());
            }
            for server in servers {
                let target = match server.transport.stdio() {
                    Some(stdio) => stdio.command.clone(),
                    None => server
                        .transport
                        .remote()
                        .map(|remote| remote.url.clone())
                        .unwrap_or_default(),
                };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    server.id,
                    server.name,
                    server.transport.kind().as_str(),
                    if server.enabled { "enabled" } else { "disabled" },
                    target
                );
            }
            Ok(())
        }
        Commands::Remove(args) => {
            let store = open_store(args.data_dir)?;
            let id = resolve_server(&store, &args.server)?;
            store.remove_server(&id)?;
            store.close().await?;
            println!("server removed");
            Ok(())
        }
        Commands::Enable(args) => set_enabled(args, true).await,
        Commands::Disable(args) => set_enabled(args, false).await,
        Commands::FixtureServer => crate::fixture::run().await,
    }
}

async fn add_server(args: AddArgs) -> Result<()> {
    let transport = match (&args.command, &args.url) {
        (Some(command), None) => TransportConfig::Stdio(StdioConfig {
            command: command.clone(),
            args: args.args.clone(),
            env: args.env.iter().cloned().collect(),
            cwd: args.cwd.clone(),
        }),
        (None, Some(url)) => {
            let auth = build_auth(&args)?;
            let remote = RemoteConfig {
                url: url.clone(),
                headers: args.headers.iter().cloned().collect(),
                auth,
                oauth: None,
            };
            match args.transport.trim().to_ascii_lowercase().as_str() {
                "streamable-http" | "http" => TransportConfig::StreamableHttp(remote),
                "sse" => TransportConfig::Sse(remote),
                other => bail!("invalid transport '{other}', expected streamable-http|sse"),
            }
        }
        (Some(_), Some(_)) => bail!("--command and --url are mutually exclusive"),
        (None, None) => bail!("one of --command or --url is required"),
    };

    let store = open_store(args.data_dir)?;
    let added = store.add_server(NewServer {
        name: args.name,
        enabled: !args.disabled,
        transport,
    })?;
    store.close().await?;
    println!("server '{}' added with id {}", added.name, added.id);
    Ok(())
}

async fn set_enabled(args: SelectorArgs, enabled: bool) -> Result<()> {
    let store = open_store(args.data_dir)?;
    let id = resolve_server(&store, &args.server)?;
    store.update_server(
        &id,
        ServerUpdate {
            enabled: Some(enabled),
            ..Default::default()
        },
    )?;
    store.close().await?;
    println!(
        "server {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn build_auth(args: &AddArgs) -> Result<AuthConfig> {
    if args.oauth {
        return Ok(AuthConfig::Oauth {
            client_id: args.oauth_client_id.clone(),
            client_secret: None,
            scopes: args.scopes.clone(),
        });
    }
    if let Some(token) = &args.bearer {
        return Ok(AuthConfig::Bearer {
            token: token.clone(),
        });
    }
    if let Some(key) = &args.api_key {
        return Ok(AuthConfig::ApiKey {
            key: key.clone(),
            header_name: args.api_key_header.clone(),
            header_value_prefix: None,
        });
    }
    Ok(AuthConfig::None)
}

fn open_store(data_dir: Option<PathBuf>) -> Result<Store> {
    let dir = server::resolve_data_dir(data_dir)?;
    Store::open(&dir).with_context(|| {
        format!(
            "failed to open store in {} (is a gatehouse daemon running? use its REST API instead)",
            dir.display()
        )
    })
}

fn resolve_server(store: &Store, selector: &str) -> Result<String> {
    if let Some(config) = store.get_server(selector) {
        return Ok(config.id);
    }
    if let Some(config) = store.get_server_by_name(selector) {
        return Ok(config.id);
    }
    bail!("no server matches '{selector}'")
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("'{raw}' is not in KEY=VALUE form"))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_serve_defaults() {
        let cli = Cli::parse_from(["gatehouse", "serve"]);
        let debug = format!("{cli:?}");
        assert!(debug.contains("host: 127.0.0.1"));
        assert!(debug.contains("port: 8787"));
    }

    #[test]
    fn parses_stdio_add() {
        let cli = Cli::parse_from([
            "gatehouse",
            "add",
            "fs",
            "--command",
            "mcp-server-filesystem",
            "--arg",
            "--root",
            "--arg",
            "/tmp",
            "--env",
            "LOG_LEVEL=debug",
        ]);
        let debug = format!("{cli:?}");
        assert!(debug.contains("mcp-server-filesystem"));
        assert!(debug.contains("LOG_LEVEL"));
    }

    #[test]
    fn parses_remote_add_with_oauth() {
        let cli = Cli::parse_from([
            "gatehouse",
            "add",
            "example",
            "--url",
            "https://mcp.example/v1",
            "--oauth",
            "--scope",
            "read",
            "--scope",
            "write",
        ]);
        let debug = format!("{cli:?}");
        assert!(debug.contains("oauth: true"));
        assert!(debug.contains("\"read\""));
    }

    #[test]
    fn rejects_command_and_url_together() {
        let parsed = Cli::try_parse_from([
            "gatehouse",
            "add",
            "bad",
            "--command",
            "foo",
            "--url",
            "https://example.com",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn rejects_bearer_with_oauth() {
        let parsed = Cli::try_parse_from([
            "gatehouse",
            "add",
            "bad",
            "--url",
            "https://example.com",
            "--bearer",
            "abc",
            "--oauth",
        ]);
        assert!(parsed.is_err());
    }
}
