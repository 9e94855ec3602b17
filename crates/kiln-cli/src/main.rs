use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Context;

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "Kiln — build and run containerized components",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Config file (default: ./kiln.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// State directory (overrides [state].dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Container engine client (overrides [runtime].docker_bin)
    #[arg(long, global = true)]
    docker_bin: Option<String>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state directory and its store
    Init,
    /// Register and inspect components
    Component {
        #[command(subcommand)]
        action: ComponentAction,
    },
    /// Build component images and inspect builds
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
    /// Start a container from a build.
    ///
    /// Returns once the container is started unless --wait is given.
    Run {
        /// Build ID (image tag), e.g. kiln/etl:3
        #[arg(required_unless_present = "component", conflicts_with = "component")]
        build: Option<String>,
        /// Run the latest build of this component instead
        #[arg(short, long)]
        component: Option<String>,
        /// Bind mount, HOST:CONTAINER (repeatable)
        #[arg(short, long = "mount", value_name = "HOST:CONTAINER")]
        mounts: Vec<String>,
        /// Wait for the container to exit and report its exit code
        #[arg(long)]
        wait: bool,
        /// Remove the container after it exits (implies --wait)
        #[arg(long)]
        rm: bool,
        /// Command override; the image's own command runs when empty
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Inspect executions
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
}

#[derive(Subcommand)]
enum ComponentAction {
    /// Register a component
    Add {
        #[arg(long)]
        id: String,
        /// Component type: task or service
        #[arg(long = "type")]
        kind: String,
        /// Build context directory
        #[arg(long)]
        path: PathBuf,
        /// Specification document
        #[arg(long)]
        spec: PathBuf,
    },
    /// Show one component
    Show { id: String },
    /// List components
    List,
    /// Print a component's parsed specification
    Spec { id: String },
}

#[derive(Subcommand)]
enum BuildAction {
    /// Build a component's image; build output goes to stdout
    Create { component: String },
    /// List builds
    List {
        #[arg(short, long)]
        component: Option<String>,
    },
    /// Show one build
    Show { id: String },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List executions
    List {
        #[arg(short, long)]
        build: Option<String>,
    },
    /// Show one execution and its container's current status
    Show { id: String },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kiln=info"));
    // Logs go to stderr; stdout carries command output and build logs.
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let ctx = Context::load(cli.config.as_deref(), cli.state_dir, cli.docker_bin)?;

    match cli.command {
        Commands::Init => commands::init::init(&ctx),
        Commands::Component { action } => match action {
            ComponentAction::Add {
                id,
                kind,
                path,
                spec,
            } => commands::component::add(&ctx, &id, &kind, &path, &spec),
            ComponentAction::Show { id } => commands::component::show(&ctx, &id),
            ComponentAction::List => commands::component::list(&ctx),
            ComponentAction::Spec { id } => commands::component::spec(&ctx, &id),
        },
        Commands::Build { action } => match action {
            BuildAction::Create { component } => commands::build::create(&ctx, &component).await,
            BuildAction::List { component } => commands::build::list(&ctx, component.as_deref()),
            BuildAction::Show { id } => commands::build::show(&ctx, &id),
        },
        Commands::Run {
            build,
            component,
            mounts,
            wait,
            rm,
            command,
        } => {
            let target = match (build, component) {
                (Some(build), _) => commands::run::Target::Build(build),
                (None, Some(component)) => commands::run::Target::LatestOf(component),
                (None, None) => anyhow::bail!("either a build ID or --component is required"),
            };
            let options = commands::run::RunOptions {
                mounts,
                wait: wait || rm,
                rm,
                command,
            };
            commands::run::run(&ctx, target, options).await
        }
        Commands::Execution { action } => match action {
            ExecutionAction::List { build } => commands::execution::list(&ctx, build.as_deref()),
            ExecutionAction::Show { id } => commands::execution::show(&ctx, &id).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_mounts_and_trailing_command() {
        let cli = Cli::parse_from([
            "kiln",
            "run",
            "kiln/etl:3",
            "--mount",
            "/tmp/out.txt:/simplex/outputs/outputs.txt",
            "--rm",
            "--",
            "sh",
            "-c",
            "echo hi",
        ]);
        let Commands::Run {
            build,
            mounts,
            rm,
            command,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(build.as_deref(), Some("kiln/etl:3"));
        assert_eq!(mounts, ["/tmp/out.txt:/simplex/outputs/outputs.txt"]);
        assert!(rm);
        assert_eq!(command, ["sh", "-c", "echo hi"]);
    }

    #[test]
    fn run_requires_build_or_component() {
        assert!(Cli::try_parse_from(["kiln", "run"]).is_err());
        assert!(Cli::try_parse_from(["kiln", "run", "--component", "etl"]).is_ok());
        assert!(Cli::try_parse_from(["kiln", "run", "kiln/etl:1", "--component", "etl"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["kiln", "build", "list", "--state-dir", "/tmp/s"]);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/s")));
    }
}
