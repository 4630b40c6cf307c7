use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::Mutex;
use uuid::Uuid;

use spark_debug_submitter::{
    logging, ArtifactRef, BatchId, BatchService, DebugError, HttpClient, HttpSettings, LivyClient,
    PipelineSettings, RemoteDebugJobController, RetryPolicy, SessionRegistry,
    SubmissionParameter, YarnClient,
};

/// Number of livy log lines printed when a debug pipeline fails
const FAILURE_LOG_LINES: u64 = 50;

/// Submit spark batches through Livy with a remote debugger attached to the
/// driver.
///
/// The driver JVM listens on an ephemeral port, the `debug` command follows
/// the batch to its YARN attempt and reads the port from the driver log.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// the livy server url
    #[arg(long, env = "LIVY_URL")]
    livy_url: String,

    /// the user for basic authentication against livy and yarn
    #[arg(long, env = "LIVY_USERNAME")]
    username: Option<String>,

    /// the password for basic authentication against livy and yarn
    #[arg(long, env = "LIVY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// timeout of every single http request, in seconds
    #[arg(long, default_value_t = 30)]
    http_timeout_secs: u64,

    /// log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a batch with the debug agent enabled and print the driver's debug endpoint
    Debug(DebugArgs),
    /// Show the state of a batch
    Status {
        #[arg(long)]
        batch_id: BatchId,
    },
    /// Kill a batch
    Kill {
        #[arg(long)]
        batch_id: BatchId,
    },
    /// Print the livy log of a batch
    Log {
        #[arg(long)]
        batch_id: BatchId,
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long, default_value_t = 100)]
        size: u64,
    },
}

#[derive(clap::Args, Debug)]
struct DebugArgs {
    /// the yarn resource manager url
    #[arg(long, env = "YARN_URL")]
    yarn_url: String,

    /// a json job file holding the whole submission parameter
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    job: Option<PathBuf>,

    /// the entry point file (jar or script) as seen by the cluster
    #[arg(long)]
    file: Option<String>,

    /// the main class of a jar application
    #[arg(long)]
    class_name: Option<String>,

    /// the cluster the batch targets
    #[arg(long, default_value_t = String::from(""))]
    cluster_name: String,

    /// the local artifact the entry point file was uploaded from
    #[arg(long)]
    artifact: Option<String>,

    /// jars put on the driver and executor classpaths
    #[arg(long)]
    jars: Vec<String>,

    /// files shipped to the working directory of each executor
    #[arg(long)]
    files: Vec<String>,

    /// the arguments of the program
    #[arg(long, allow_hyphen_values = true)]
    args: Vec<String>,

    /// spark configuration entries, as key=value
    #[arg(long)]
    conf: Vec<String>,

    /// how often the batch status is polled for an application id
    #[arg(long, default_value_t = 3)]
    app_id_retries: u32,

    /// seconds between two application id polls
    #[arg(long, default_value_t = 10)]
    app_id_delay_secs: u64,

    /// how often yarn is asked for an application attempt
    #[arg(long, default_value_t = 10)]
    attempt_retries: u32,

    /// how often the driver log is searched for the debug port
    #[arg(long, default_value_t = 20)]
    endpoint_retries: u32,

    /// seconds between two attempt or driver log polls
    #[arg(long, default_value_t = 3)]
    stage_delay_secs: u64,
}

impl DebugArgs {
    fn submission_parameter(&self) -> Result<SubmissionParameter> {
        if let Some(path) = &self.job {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read job file {}", path.display()))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("failed to parse job file {}", path.display()));
        }

        let file = self
            .file
            .clone()
            .ok_or_else(|| anyhow!("either --job or --file is required"))?;
        let mut builder = SubmissionParameter::builder()
            .cluster_name(self.cluster_name.clone())
            .file(file)
            .jars(self.jars.clone())
            .files(self.files.clone())
            .args(self.args.clone());
        if let Some(class_name) = &self.class_name {
            builder = builder.class_name(class_name.clone());
        }
        if let Some(artifact) = &self.artifact {
            builder = builder.artifact(ArtifactRef::LocalPath(artifact.clone()));
        }
        for entry in &self.conf {
            let Some((key, value)) = entry.split_once('=') else {
                bail!("spark configuration `{}` is not key=value", entry);
            };
            builder = builder.conf(key.trim(), value.trim());
        }
        Ok(builder.build())
    }

    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            app_id_retry: RetryPolicy::from_secs(self.app_id_delay_secs, self.app_id_retries),
            attempt_retry: RetryPolicy::from_secs(self.stage_delay_secs, self.attempt_retries),
            endpoint_retry: RetryPolicy::from_secs(self.stage_delay_secs, self.endpoint_retries),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(if args.verbose { "debug" } else { "info" })?;

    let http = HttpClient::new(HttpSettings {
        timeout: Duration::from_secs(args.http_timeout_secs),
        username: args.username.clone(),
        password: args.password.clone(),
        ..Default::default()
    })
    .context("failed to build the http client")?;
    let livy = LivyClient::new(http.clone(), args.livy_url.clone());

    match args.command {
        Command::Debug(debug) => run_debug(http, livy, debug).await,
        Command::Status { batch_id } => {
            let status = livy.get_status(batch_id).await?;
            println!("batch {}: {}", status.id, status.state);
            if let Some(app_id) = status.application_id() {
                println!("application: {}", app_id);
            }
            for (key, value) in &status.app_info {
                if let Some(value) = value {
                    println!("{}: {}", key, value);
                }
            }
            Ok(())
        }
        Command::Kill { batch_id } => {
            livy.kill(batch_id).await?;
            println!("batch {} killed", batch_id);
            Ok(())
        }
        Command::Log {
            batch_id,
            from,
            size,
        } => {
            let log = livy.get_log(batch_id, from, size).await?;
            for line in log.log {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

async fn run_debug(http: HttpClient, livy: LivyClient, debug: DebugArgs) -> Result<()> {
    let base = debug.submission_parameter()?;
    let yarn = YarnClient::new(http.clone(), debug.yarn_url.clone());
    let controller = Arc::new(RemoteDebugJobController::new(
        Arc::new(livy.clone()),
        Arc::new(yarn),
        Arc::new(http),
        debug.pipeline_settings(),
    ));

    let registry = Arc::new(Mutex::new(SessionRegistry::new()));
    let session = registry.lock().await.insert(controller.clone());

    let mut states = controller.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            eprintln!("[{}] {}", session, state);
            if state.is_terminal() {
                break;
            }
        }
    });

    let start_time = Instant::now();
    let handle = controller.spawn(base);
    let result = tokio::select! {
        result = handle => result.context("the debug pipeline panicked")?,
        _ = signal::ctrl_c() => {
            eprintln!("received ctrl-c, killing debug sessions");
            let kills = registry.lock().await.kill_all().await;
            return Err(interrupted(&kills));
        }
    };
    registry.lock().await.remove(&session);

    match result {
        Ok(endpoint) => {
            let elapsed = Instant::now() - start_time;
            eprintln!("driver is listening, resolved in {} ms", elapsed.as_millis());
            if let Some(batch_id) = controller.batch_id().await {
                eprintln!("batch id: {}", batch_id);
            }
            println!("{}", endpoint);
            eprintln!("attach with: {}", endpoint.jdb_command());
            Ok(())
        }
        Err(err) => {
            eprintln!("hint: {}", err.hint());
            if let Some(batch_id) = controller.batch_id().await {
                print_log_tail(&livy, batch_id).await;
            }
            Err(err.into())
        }
    }
}

/// The error a run interrupted by ctrl-c exits with, naming the sessions
/// whose batch could not be killed.
fn interrupted(kills: &[(Uuid, Result<(), DebugError>)]) -> anyhow::Error {
    let failed: Vec<String> = kills
        .iter()
        .filter_map(|(id, result)| result.as_ref().err().map(|err| format!("[{}] {}", id, err)))
        .collect();
    if failed.is_empty() {
        anyhow!("interrupted, {} debug session(s) killed", kills.len())
    } else {
        anyhow!(
            "interrupted, {} of {} debug session(s) may still be running: {}",
            failed.len(),
            kills.len(),
            failed.join("; ")
        )
    }
}

async fn print_log_tail(livy: &LivyClient, batch_id: BatchId) {
    let total = match livy.get_log(batch_id, 0, 0).await {
        Ok(log) => log.total,
        Err(err) => {
            tracing::warn!("could not read the log of batch {}: {}", batch_id, err);
            return;
        }
    };
    let from = total.saturating_sub(FAILURE_LOG_LINES);
    match livy.get_log(batch_id, from, FAILURE_LOG_LINES).await {
        Ok(log) => {
            eprintln!("--- last livy log lines of batch {} ---", batch_id);
            for line in log.log {
                eprintln!("{}", line);
            }
        }
        Err(err) => tracing::warn!("could not read the log of batch {}: {}", batch_id, err),
    }
}
