// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! The `reach` command line.
//!
//! Exit codes: `0` success, `1` operational failure, `2` invariant
//! violation (verification failed, integrity mismatch). Every command
//! accepts `--json` for machine-readable output.

mod commands;

use clap::{Parser, Subcommand};
use reach_config::Config;
use reach_core::ReachError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reach", version, about = "Deterministic execution runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (overrides REACH_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate, hash, or register a pack.
    Pack {
        #[command(subcommand)]
        action: PackAction,
    },

    /// List registered packs.
    Packs,

    /// Execute a registered pack.
    Run {
        /// Pack name to execute.
        #[arg(long)]
        pack: String,

        /// Owning tenant.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Environment label recorded on the run.
        #[arg(long, default_value = "local")]
        environment: String,
    },

    /// Inspect runs.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Build, verify, or replay capsules.
    Capsule {
        #[command(subcommand)]
        action: CapsuleAction,
    },

    /// Submit and inspect queue jobs.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Node identity, pairing, and peer trust.
    Mesh {
        #[command(subcommand)]
        action: MeshAction,
    },

    /// Issue a signed delegation envelope to a trusted peer.
    Delegate {
        /// Peer node id; must be trusted.
        #[arg(long)]
        peer: String,

        /// Pack name to delegate.
        #[arg(long)]
        pack: String,

        /// Inputs as inline JSON.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Verify a returned execution proof.
    VerifyProof {
        /// Path to the proof JSON file.
        proof: PathBuf,
    },

    /// Evaluate or fingerprint governance policies.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Sign a completed run's fingerprint.
    Sign {
        /// The run to sign.
        run_id: uuid::Uuid,
    },

    /// Exercise the deterministic core against its golden vectors.
    SelfTest,
}

#[derive(Subcommand, Debug)]
enum PackAction {
    /// Validate a pack source without registering it.
    Validate {
        /// Directory, archive, or git URL.
        source: String,
    },
    /// Print a pack source's canonical content hash.
    Hash {
        /// Directory, archive, or git URL.
        source: String,
    },
    /// Validate and register a pack, pinning it in the lockfile.
    Add {
        /// Directory, archive, or git URL.
        source: String,

        /// Replace an existing lockfile pin.
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RunsAction {
    /// List runs for a tenant.
    List {
        /// Tenant to list.
        #[arg(long, default_value = "default")]
        tenant: String,
    },
    /// Show one run.
    Show {
        /// The run id.
        run_id: uuid::Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum CapsuleAction {
    /// Build a capsule from a completed run and write it to the data dir.
    Build {
        /// The run to archive.
        run_id: uuid::Uuid,
    },
    /// Verify a capsule file against its own contents.
    Verify {
        /// Path to the capsule file.
        path: PathBuf,
    },
    /// Replay a capsule and compare fingerprints.
    Replay {
        /// Path to the capsule file.
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Enqueue a job.
    Enqueue {
        /// Pack name the job executes.
        #[arg(long)]
        pack: String,

        /// Owning tenant.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Optional session grouping.
        #[arg(long)]
        session: Option<String>,

        /// Priority; lower leases first.
        #[arg(long, default_value_t = 10)]
        priority: i64,

        /// Idempotency key; defaults to a fresh uuid.
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Retry budget.
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
    },
    /// Show queue counts by status.
    Stats,
}

#[derive(Subcommand, Debug)]
enum MeshAction {
    /// Generate (or show) this node's identity.
    Init,
    /// List known peers.
    Peers,
    /// Publish a pairing payload, or import one from a file.
    Pair {
        /// Import a pairing payload JSON file instead of publishing.
        #[arg(long)]
        import: Option<PathBuf>,
    },
    /// Confirm a provisional peer as trusted.
    Trust {
        /// The peer to confirm.
        node_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    /// Evaluate run facts against a policy.
    Eval {
        /// Path to the policy JSON file.
        #[arg(long)]
        policy: PathBuf,

        /// Path to the run-facts JSON file.
        #[arg(long)]
        facts: PathBuf,
    },
    /// Print a policy's canonical fingerprint.
    Fingerprint {
        /// Path to the policy JSON file.
        #[arg(long)]
        policy: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => exit_with(&err, cli.json),
    };

    match dispatch(&cli, &config).await {
        Ok(output) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
            } else {
                print_human(&output);
            }
        }
        Err(err) => exit_with(&err, cli.json),
    }
}

fn load_config(cli: &Cli) -> Result<Config, ReachError> {
    let config = match &cli.data_dir {
        Some(dir) => Config::load_with_data_dir(dir),
        None => Config::load(),
    };
    config.map_err(|e| {
        ReachError::new(reach_core::ErrorKind::ValidationFailure, e.to_string())
    })
}

async fn dispatch(cli: &Cli, config: &Config) -> Result<serde_json::Value, ReachError> {
    match &cli.command {
        Commands::Pack { action } => match action {
            PackAction::Validate { source } => commands::pack_validate(config, source),
            PackAction::Hash { source } => commands::pack_hash(config, source),
            PackAction::Add { source, replace } => commands::pack_add(config, source, *replace),
        },
        Commands::Packs => commands::packs_list(config),
        Commands::Run {
            pack,
            tenant,
            environment,
        } => commands::run_pack(config, pack, tenant, environment).await,
        Commands::Runs { action } => match action {
            RunsAction::List { tenant } => commands::runs_list(config, tenant),
            RunsAction::Show { run_id } => commands::runs_show(config, *run_id),
        },
        Commands::Capsule { action } => match action {
            CapsuleAction::Build { run_id } => commands::capsule_build(config, *run_id),
            CapsuleAction::Verify { path } => commands::capsule_verify(path),
            CapsuleAction::Replay { path } => commands::capsule_replay(path),
        },
        Commands::Queue { action } => match action {
            QueueAction::Enqueue {
                pack,
                tenant,
                session,
                priority,
                idempotency_key,
                max_attempts,
            } => commands::queue_enqueue(
                config,
                pack,
                tenant,
                session.as_deref(),
                *priority,
                idempotency_key.as_deref(),
                *max_attempts,
            ),
            QueueAction::Stats => commands::queue_stats(config),
        },
        Commands::Mesh { action } => match action {
            MeshAction::Init => commands::mesh_init(config),
            MeshAction::Peers => commands::mesh_peers(config),
            MeshAction::Pair { import } => commands::mesh_pair(config, import.as_deref()),
            MeshAction::Trust { node_id } => commands::mesh_trust(config, node_id),
        },
        Commands::Delegate { peer, pack, input } => {
            commands::delegate(config, peer, pack, input)
        }
        Commands::VerifyProof { proof } => commands::verify_proof(config, proof),
        Commands::Policy { action } => match action {
            PolicyAction::Eval { policy, facts } => commands::policy_eval(policy, facts),
            PolicyAction::Fingerprint { policy } => commands::policy_fingerprint(policy),
        },
        Commands::Sign { run_id } => commands::sign_run(config, *run_id),
        Commands::SelfTest => commands::self_test(config).await,
    }
}

fn print_human(output: &serde_json::Value) {
    match output {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                match value {
                    serde_json::Value::String(s) => println!("{key}: {s}"),
                    other => println!("{key}: {other}"),
                }
            }
        }
        other => println!("{other}"),
    }
}

fn exit_with(err: &ReachError, json: bool) -> ! {
    if json {
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&err.to_wire()).unwrap_or_default()
        );
    } else {
        eprintln!("error: {err}");
        eprintln!("correlation id: {}", err.correlation_id);
    }
    std::process::exit(err.kind.exit_code());
}
