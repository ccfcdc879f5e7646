use std::io::IsTerminal;
use std::str::FromStr;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use kubernetes::{Api, ApiResource, Client, Informer, MAX_WATCH_TIMEOUT};
use kwatch::app::{GRACE_PERIOD, Stopped};
use kwatch::handler::LogHandler;
use kwatch::{signal, trace};
use tracing::{error, info, warn};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|err| format!("invalid duration {value:?}, {err}"))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("unknown log format {s:?}, expect \"text\" or \"json\"")),
        }
    }
}

#[derive(FromArgs)]
#[argh(
    description = "Watch a Kubernetes resource type and log every change of it",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'r',
        default = "\"deployments.v1.apps\".to_string()",
        description = "resource to watch, in the form resource.version.group, e.g. pods.v1."
    )]
    resource: String,

    #[argh(
        option,
        short = 'n',
        description = "only watch this namespace, all namespaces if not set"
    )]
    namespace: Option<String>,

    #[argh(option, description = "only watch objects matching this label selector")]
    label_selector: Option<String>,

    #[argh(option, description = "only watch objects matching this field selector")]
    field_selector: Option<String>,

    #[argh(
        option,
        default = "Duration::ZERO",
        from_str_fn(parse_duration),
        description = "deliver every cached object again as an update this often, e.g. 10m, 0s disables it"
    )]
    resync_period: Duration,

    #[argh(
        option,
        default = "290",
        description = "server side timeout of a single watch request, in seconds"
    )]
    watch_timeout: u32,

    #[argh(
        option,
        default = "500",
        description = "objects per list request, 0 disables pagination"
    )]
    page_size: u32,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level"
    )]
    log_level: String,

    #[argh(
        option,
        default = "LogFormat::Text",
        description = "log format, text or json"
    )]
    log_format: LogFormat,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,
}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("kwatch {}", env!("CARGO_PKG_VERSION"));
    }

    fn api(&self, client: Client) -> kwatch::Result<Api> {
        let resource = self.resource.parse::<ApiResource>()?;
        if self.watch_timeout == 0 || self.watch_timeout >= MAX_WATCH_TIMEOUT {
            return Err(format!(
                "watch timeout must be between 1 and {}, got {}",
                MAX_WATCH_TIMEOUT - 1,
                self.watch_timeout
            )
            .into());
        }

        let mut api = match &self.namespace {
            Some(namespace) => Api::namespaced(client, resource, namespace),
            None => Api::all(client, resource),
        }
        .page_size(self.page_size)
        .timeout(self.watch_timeout);

        if let Some(selector) = &self.label_selector {
            api = api.label_selector(selector);
        }
        if let Some(selector) = &self.field_selector {
            api = api.field_selector(selector);
        }

        Ok(api)
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let levels =
            std::env::var(trace::LOG_ENV).unwrap_or_else(|_| trace::directives(&self.log_level));
        let color = std::io::stderr().is_terminal();
        trace::init(color, self.log_format == LogFormat::Json, &levels);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("kwatch-worker")
            .worker_threads(self.threads.max(1))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "build tokio runtime failed", %err);
                exitcode::OSERR
            })?;

        runtime.block_on(async move {
            let client = Client::infer().map_err(|err| {
                error!(message = "load kubernetes credentials failed", %err);
                exitcode::CONFIG
            })?;

            let api = self.api(client.clone()).map_err(|err| {
                error!(message = "invalid arguments", %err);
                exitcode::CONFIG
            })?;

            match client.version().await {
                Ok(version) => info!(
                    message = "connected to api server",
                    version = %version.git_version,
                    major = %version.major,
                    minor = %version.minor,
                ),
                Err(err) => warn!(message = "get api server version failed", %err),
            }

            info!(
                message = "start kwatch",
                resource = %api.resource(),
                namespace = self.namespace.as_deref().unwrap_or("all"),
                threads = self.threads,
                resync_period = ?self.resync_period,
            );

            let signals = signal::os_signals().map_err(|err| {
                error!(message = "register signal handlers failed", %err);
                exitcode::OSERR
            })?;

            let mut informer = Informer::new(api).resync_period(self.resync_period);
            informer.add_handler(LogHandler);

            match kwatch::app::serve(informer, signals, GRACE_PERIOD).await {
                Stopped::Graceful | Stopped::Finished => info!(message = "kwatch stopped"),
                stopped => warn!(message = "kwatch stopped before in-flight work finished", ?stopped),
            }

            Ok::<(), ExitCode>(())
        })?;

        runtime.shutdown_timeout(Duration::from_secs(5));

        Ok(())
    }
}
