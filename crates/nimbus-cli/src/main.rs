use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use nimbus_cli::api::{ApiClient, Term, VisibilityRange};
use nimbus_cli::checkpoint::CheckpointStore;
use nimbus_cli::oss::{Bucket, ResumableUpload, TransferConfig};
use nimbus_cli::upload::{self, Session, UploadOptions};
use nimbus_cli::{Error, Result, config};

#[derive(Debug, Parser)]
#[command(name = "nimbus", author, version, about = "Command-line client for the Nimbus workspace platform")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload and download datasets
    #[command(subcommand)]
    Dataset(DatasetCommand),
    /// Expose local ports on the workspace domain
    #[command(subcommand)]
    Port(PortCommand),
    /// Manage compute instances
    #[command(subcommand)]
    Instance(InstanceCommand),
}

#[derive(Debug, Subcommand)]
enum DatasetCommand {
    /// Upload a .zip or .tar.gz archive as a dataset (resumable)
    Upload {
        file: PathBuf,
        /// Dataset name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
        /// Visibility of the new dataset
        #[arg(short, long, value_enum, default_value_t = VisibilityRange::Personal)]
        range: VisibilityRange,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Route API and storage traffic through the system proxy
        #[arg(long)]
        proxy: bool,
    },
    /// Download a dataset into the current directory
    Download {
        /// Dataset id (UUID)
        id: String,
    },
}

#[derive(Debug, Subcommand)]
enum PortCommand {
    /// List exported ports
    List {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Export a local port
    Export {
        local_port: u16,
        /// Print only the assigned remote port
        #[arg(short = 'r', long)]
        raw: bool,
    },
    /// Remove a port mapping
    Unexport { local_port: u16 },
}

#[derive(Debug, Subcommand)]
enum InstanceCommand {
    /// List instances
    Ls {
        /// Only show instances that are currently available
        #[arg(short, long)]
        available: bool,
    },
    /// Request an instance for a rental term
    Request {
        instance_id: String,
        #[arg(short, long, value_enum)]
        term: Term,
    },
    /// Release a held instance
    Release { instance_id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn main() {
    init_tracing();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Dataset(cmd) => match cmd {
            DatasetCommand::Upload {
                file,
                name,
                range,
                description,
                proxy,
            } => cmd_upload(&file, name, range, description, proxy),
            DatasetCommand::Download { id } => cmd_download(&id),
        },
        Command::Port(cmd) => match cmd {
            PortCommand::List { format } => cmd_port_list(format),
            PortCommand::Export { local_port, raw } => cmd_port_export(local_port, raw),
            PortCommand::Unexport { local_port } => cmd_port_unexport(local_port),
        },
        Command::Instance(cmd) => match cmd {
            InstanceCommand::Ls { available } => cmd_instance_ls(available),
            InstanceCommand::Request { instance_id, term } => cmd_instance_request(&instance_id, term),
            InstanceCommand::Release { instance_id } => cmd_instance_release(&instance_id),
        },
    }
}

fn byte_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn cmd_upload(
    file: &Path,
    name: Option<String>,
    range: VisibilityRange,
    description: String,
    proxy: bool,
) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, proxy)?;
    let store = CheckpointStore::open_default()?;
    let opts = UploadOptions {
        name,
        range,
        description,
    };

    let storage_endpoint = cfg.storage_endpoint.clone();
    let make_backend = move |session: &Session| -> Result<Box<dyn ResumableUpload>> {
        let endpoint = session
            .checkpoint
            .dataset_center
            .endpoint
            .clone()
            .unwrap_or_else(|| storage_endpoint.clone());
        Ok(Box::new(Bucket::new(
            &session.checkpoint.dataset_center.bucket,
            &endpoint,
            session.credentials.clone(),
            proxy,
        )?))
    };

    let pb = byte_progress_bar();
    upload::run(
        &api,
        &store,
        &make_backend,
        file,
        &opts,
        &TransferConfig::default(),
        &cfg.storage_endpoint,
        &mut |consumed, total| {
            if pb.length() != Some(total) {
                pb.set_length(total);
            }
            pb.set_position(consumed);
        },
    )?;
    pb.finish_and_clear();
    println!("Dataset uploaded");
    Ok(())
}

fn cmd_download(id: &str) -> Result<()> {
    let id = Uuid::parse_str(id).map_err(|_| Error::validation("id is not valid"))?;
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;

    let pb = byte_progress_bar();
    let dest = api.download_dataset(&id.to_string(), Path::new("."), &mut |done, total| {
        if total > 0 && pb.length() != Some(total) {
            pb.set_length(total);
        }
        pb.set_position(done);
    })?;
    pb.finish_and_clear();
    println!("Saved to {}", dest.display());
    Ok(())
}

fn cmd_port_list(format: OutputFormat) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;
    let ports = api.list_ports()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&ports)?),
        OutputFormat::Table => {
            println!("{:<12} {:<12}", "LOCAL", "REMOTE");
            for p in &ports {
                println!("{:<12} {:<12}", p.local_port, p.remote_port);
            }
        }
    }
    Ok(())
}

fn cmd_port_export(local_port: u16, raw: bool) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;
    let mapping = api.export_port(local_port)?;
    if raw {
        print!("{}", mapping.remote_port);
    } else {
        println!(
            "Local port {local_port} has been exported to {}",
            mapping.remote_port
        );
        println!(
            "You can visit http://{}:{} if it's a http server",
            cfg.workspace_domain, mapping.remote_port
        );
    }
    Ok(())
}

fn cmd_port_unexport(local_port: u16) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;
    api.unexport_port(local_port)?;
    println!("done");
    Ok(())
}

fn cmd_instance_ls(available: bool) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;
    let instances = api.list_instances(available)?;
    println!("{:<38} {:<20} {:<12} {:<10}", "ID", "NAME", "STATUS", "AVAILABLE");
    for i in &instances {
        println!(
            "{:<38} {:<20} {:<12} {:<10}",
            i.id, i.name, i.status, i.available
        );
    }
    Ok(())
}

fn cmd_instance_request(instance_id: &str, term: Term) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;
    api.request_instance(instance_id, term)?;
    println!("Instance {instance_id} requested");
    Ok(())
}

fn cmd_instance_release(instance_id: &str) -> Result<()> {
    let cfg = config::load()?;
    let api = ApiClient::new(&cfg, true)?;
    api.release_instance(instance_id)?;
    println!("Instance {instance_id} released");
    Ok(())
}
