//! Fleet identity CLI: the `fleetbot` command.
//!
//! Bootstraps a host identity against the control plane, keeps it announced
//! and rotated, and inspects what is stored on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use fleet_identity::config::UserCertsSettings;
use fleet_identity::crypto::pin;
use fleet_identity::{
    Agent, AgentConfig, CredentialIssuer, DestinationSpec, HttpTransport, Identity, IdentityStore,
    JoinToken, Passphrase, Role,
};

const TOKEN_ENV: &str = "FLEET_JOIN_TOKEN";
const PASSPHRASE_ENV: &str = "FLEET_IDENTITY_PASSPHRASE";

// ── Duration parsing ──────────────────────────────────────────────────────────

/// Parse a duration string like "4h", "30m", "1h30m", or plain seconds.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if let Ok(n) = s.parse::<u64>() {
        if n == 0 {
            bail!("duration must be > 0");
        }
        return Ok(Duration::from_secs(n));
    }

    let mut total: u64 = 0;
    let mut current = String::new();

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else {
            let val: u64 = current
                .parse()
                .map_err(|_| anyhow!("invalid duration: {s}"))?;
            current.clear();
            let unit = match ch {
                'd' => 86_400,
                'h' => 3_600,
                'm' => 60,
                's' => 1,
                _ => bail!("unknown duration unit '{ch}' in '{s}'"),
            };
            total = val
                .checked_mul(unit)
                .and_then(|secs| total.checked_add(secs))
                .ok_or_else(|| anyhow!("duration '{s}' is too large"))?;
        }
    }

    if !current.is_empty() {
        bail!("duration '{s}' is missing a unit (d/h/m/s)");
    }
    if total == 0 {
        bail!("duration must be > 0");
    }
    Ok(Duration::from_secs(total))
}

// ── CLI structure ─────────────────────────────────────────────────────────────

/// fleetbot: join a host to the fleet and keep its identity alive.
#[derive(Parser, Debug)]
#[command(
    name = "fleetbot",
    about = "Fleet agent identity bootstrap",
    version,
    long_about = "fleetbot: fleet agent identity bootstrap\n\nRegister with a join token, persist the issued identity, heartbeat\nto the control plane and rotate certificates before they expire."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every command that talks to the control plane.
#[derive(Args, Debug)]
struct AgentArgs {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Auth server address (host:port); may be repeated
    #[arg(long = "auth-server")]
    auth_servers: Vec<String>,

    /// Join token (falls back to $FLEET_JOIN_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Where the identity is kept: dir:<path> or memory
    #[arg(long)]
    destination: Option<String>,

    /// Node name announced to the control plane
    #[arg(long = "node-name")]
    node_name: Option<String>,

    /// Role requested at registration: node or bot
    #[arg(long)]
    role: Option<String>,

    /// Expected cluster CA pin (sha256:<hex>); may be repeated
    #[arg(long = "ca-pin")]
    ca_pins: Vec<String>,

    /// Extra DNS name for the TLS certificate; may be repeated
    #[arg(long = "dns-name")]
    dns_names: Vec<String>,

    /// Extra SSH principal; may be repeated
    #[arg(long = "additional-principal")]
    additional_principals: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap, then heartbeat and rotate until interrupted
    Start {
        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Print the identity stored at a destination
    Show {
        /// Destination to read: dir:<path>
        #[arg(long)]
        destination: String,
    },

    /// Compute the pin of a CA certificate file
    Pin {
        /// PEM CA certificate
        #[arg(long = "ca-cert")]
        ca_cert: PathBuf,
    },

    /// Bootstrap, then rotate certificates once
    Rotate {
        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Bootstrap, then request delegated user certificates
    UserCerts {
        #[command(flatten)]
        agent: AgentArgs,

        /// Principal the certificates are issued for
        #[arg(long)]
        principal: String,

        /// Requested lifetime (e.g. "4h", "30m", or seconds)
        #[arg(long, default_value = "1h")]
        ttl: String,

        /// authorized_keys line of the principal's key; a fresh key pair is
        /// generated and exported when omitted
        #[arg(long = "public-key")]
        public_key: Option<PathBuf>,
    },
}

// ── Main entry point ──────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Commands::Start { agent } => cmd_start(&agent).await,
        Commands::Show { destination } => cmd_show(&destination),
        Commands::Pin { ca_cert } => cmd_pin(&ca_cert),
        Commands::Rotate { agent } => cmd_rotate(&agent).await,
        Commands::UserCerts {
            agent,
            principal,
            ttl,
            public_key,
        } => cmd_user_certs(&agent, principal, &ttl, public_key.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

fn passphrase_from_env() -> Option<Passphrase> {
    std::env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Passphrase::new)
}

fn build_config(args: &AgentArgs) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => {
            let destination = args
                .destination
                .as_deref()
                .ok_or_else(|| anyhow!("--destination is required without --config"))?;
            let name = args
                .node_name
                .clone()
                .ok_or_else(|| anyhow!("--node-name is required without --config"))?;
            AgentConfig::new(Vec::new(), DestinationSpec::parse(destination)?, name)
        }
    };

    if !args.auth_servers.is_empty() {
        config.auth_servers = args.auth_servers.clone();
    }
    if let Some(destination) = &args.destination {
        config.destination = DestinationSpec::parse(destination)?;
    }
    if let Some(name) = &args.node_name {
        config.node_name = name.clone();
    }
    if let Some(role) = &args.role {
        config.role = role.parse::<Role>()?;
    }
    config.ca_pins.extend(args.ca_pins.iter().cloned());
    config.dns_names.extend(args.dns_names.iter().cloned());
    config
        .additional_principals
        .extend(args.additional_principals.iter().cloned());

    let token = args
        .token
        .clone()
        .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()));
    if let Some(token) = token {
        config.token = Some(JoinToken::new(token));
    }
    if let Some(passphrase) = passphrase_from_env() {
        config.passphrase = Some(passphrase);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn bootstrap(args: &AgentArgs) -> Result<Agent> {
    let config = build_config(args)?;
    if let Some(token) = &config.token {
        log::debug!("join token {}", token.redacted());
    }
    let agent = Agent::bootstrap(config, Arc::new(HttpTransport::new()))
        .await
        .context("bootstrap failed")?;
    log::info!("running as {}", agent.identity().id);
    Ok(agent)
}

// ── Command implementations ───────────────────────────────────────────────────

/// `fleetbot start`
async fn cmd_start(args: &AgentArgs) -> Result<()> {
    let agent = bootstrap(args).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("interrupt received, shutting down");
                on_signal.cancel();
            }
            Err(e) => log::warn!("cannot listen for interrupts: {e}"),
        }
    });

    agent.run(cancel).await.context("agent stopped with an error")
}

/// `fleetbot show --destination dir:<path>`
fn cmd_show(destination: &str) -> Result<()> {
    let spec = DestinationSpec::parse(destination)?;
    if !matches!(spec, DestinationSpec::Directory(_)) {
        bail!("show needs a dir: destination, got {spec}");
    }

    let store = spec.open(passphrase_from_env());
    let identity = store
        .load()
        .with_context(|| format!("failed to read {}", store.describe()))?
        .ok_or_else(|| anyhow!("no identity stored at {}", store.describe()))?;

    print_identity(&identity)
}

fn print_identity(identity: &Identity) -> Result<()> {
    let cert = identity
        .tls_cert_info()
        .context("stored TLS certificate is unreadable")?;

    println!("Identity: {}", identity.id.node_name);
    println!("  Role:       {}", identity.id.role);
    println!("  Host UUID:  {}", identity.id.host_uuid);
    if let Some(cluster) = identity.cluster_name() {
        println!("  Cluster:    {cluster}");
    }
    println!("  SSH key:    {}", identity.ssh_public_key());
    println!("  Subject:    {}", cert.subject);
    println!(
        "  Valid:      {} .. {}",
        cert.not_before.format("%Y-%m-%d %H:%M:%S UTC"),
        cert.not_after.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Issued at:  {}",
        identity.issued_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    for ca in &identity.certs.tls_ca_certs {
        match pin::ca_pin(ca) {
            Ok(p) => println!("  CA pin:     {p}"),
            Err(e) => println!("  CA pin:     unreadable ({e})"),
        }
    }

    match identity.validate() {
        Ok(()) => println!("  Status:     valid"),
        Err(e) => println!("  Status:     INVALID ({e})"),
    }
    Ok(())
}

/// `fleetbot pin <ca.pem>`
fn cmd_pin(path: &Path) -> Result<()> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = pin::ca_pin(&pem)
        .with_context(|| format!("{} is not a certificate", path.display()))?;
    println!("{value}");
    Ok(())
}

/// `fleetbot rotate`
async fn cmd_rotate(args: &AgentArgs) -> Result<()> {
    let agent = bootstrap(args).await?;
    let before = agent.identity();
    let session = agent.rotate_now().await.context("rotation failed")?;

    println!("Rotated: {}", session.identity.id);
    println!("  Previous key: {}", before.ssh_public_key());
    println!("  New key:      {}", session.identity.ssh_public_key());
    Ok(())
}

/// `fleetbot user-certs --principal NAME [--ttl 1h] [--public-key FILE]`
async fn cmd_user_certs(
    args: &AgentArgs,
    principal: String,
    ttl: &str,
    public_key: Option<&Path>,
) -> Result<()> {
    let ttl = parse_duration(ttl)?;
    let mut config = build_config(args)?;

    let bundle = match public_key {
        Some(path) => {
            let line = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let agent = Agent::bootstrap(config, Arc::new(HttpTransport::new()))
                .await
                .context("bootstrap failed")?;
            CredentialIssuer::new(agent.config().request_timeout)
                .issue_for_session(agent.session(), &principal, line.trim(), ttl)
                .await
                .context("user certificate request failed")?
        }
        None => {
            config.user_certs = Some(UserCertsSettings { principal, ttl });
            let agent = Agent::bootstrap(config, Arc::new(HttpTransport::new()))
                .await
                .context("bootstrap failed")?;
            let (_keys, bundle) = agent
                .issue_configured_user_certs()
                .await
                .context("user certificate request failed")?
                .ok_or_else(|| anyhow!("no user certificates configured"))?;
            bundle
        }
    };

    println!("Principal: {}", bundle.principal);
    println!(
        "  Expires:  {}",
        bundle.expires.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  SSH cert: {}", bundle.ssh_cert);
    Ok(())
}
