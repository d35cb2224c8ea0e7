//! ebsvol: list EBS volumes and converge them towards a catalog.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tabled::{Table, Tabled};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ebsvol::ec2::{Ec2ClientFactory, MemoryEc2Factory};
use ebsvol::fetch::instances;
use ebsvol::{Applier, ApplyReport, Catalog, ProviderConfig, VolumeDescriptor};

/// EBS volume reconciler
#[derive(Parser, Debug)]
#[command(name = "ebsvol", version, about)]
struct Args {
    /// EC2 backend to talk to
    #[arg(long, value_enum, default_value_t = Backend::Memory, global = true)]
    backend: Backend,

    /// State file for the memory backend (created on first apply)
    #[arg(long, default_value = "ebsvol-state.json", global = true)]
    state: PathBuf,

    /// Attempts per EC2 operation
    #[arg(long, default_value = "10", global = true)]
    max_tries: u32,

    /// Base retry delay in seconds
    #[arg(long, default_value = "30", global = true)]
    base_delay_secs: u64,

    /// Maximum retry delay in seconds
    #[arg(long, default_value = "60", global = true)]
    max_delay_secs: u64,

    /// Seconds to wait for a volume to become available (aws backend)
    #[arg(long, default_value = "300", global = true)]
    wait_timeout_secs: u64,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Aws,
    Memory,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List named volumes across regions
    List {
        /// Region to list (repeatable)
        #[arg(long = "region", required = true)]
        regions: Vec<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Converge volumes towards a catalog
    Apply {
        /// Catalog file (JSON)
        #[arg(long)]
        catalog: PathBuf,

        /// Extra region to inventory besides the catalog's (repeatable)
        #[arg(long = "region")]
        regions: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "VOLUME ID")]
    volume_id: String,
    #[tabled(rename = "REGION")]
    region: String,
    #[tabled(rename = "ZONE")]
    zone: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "TYPE")]
    volume_type: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "ATTACHED TO")]
    attached_to: String,
}

impl From<VolumeDescriptor> for VolumeRow {
    fn from(v: VolumeDescriptor) -> Self {
        let attached_to = if v.attach.is_empty() {
            "-".to_string()
        } else {
            v.attach
                .iter()
                .map(|a| format!("{} ({})", a.instance_id, a.device))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Self {
            name: v.name,
            volume_id: v.volume_id.unwrap_or_else(|| "-".to_string()),
            region: v.region,
            zone: v.availability_zone.unwrap_or_else(|| "-".to_string()),
            size: v
                .size
                .map(|s| format!("{}GiB", s))
                .unwrap_or_else(|| "-".to_string()),
            volume_type: v.volume_type.unwrap_or_else(|| "-".to_string()),
            state: v.state.unwrap_or_else(|| "-".to_string()),
            attached_to,
        }
    }
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "REGION")]
    region: String,
    #[tabled(rename = "RESULT")]
    result: String,
    #[tabled(rename = "VOLUME ID")]
    volume_id: String,
}

fn report_rows(report: &ApplyReport) -> Vec<OutcomeRow> {
    let outcomes = report.outcomes.iter().map(|o| OutcomeRow {
        name: o.name.clone(),
        region: o.region.clone(),
        result: o.change.to_string(),
        volume_id: o.volume_id.clone().unwrap_or_else(|| "-".to_string()),
    });
    let failures = report.failures.iter().map(|f| OutcomeRow {
        name: f.name.clone(),
        region: f.region.clone(),
        result: format!("failed: {}", f.error),
        volume_id: "-".to_string(),
    });
    outcomes.chain(failures).collect()
}

enum Backends {
    Memory(Arc<MemoryEc2Factory>),
    #[cfg(feature = "aws")]
    Aws(Arc<ebsvol::ec2::AwsEc2Factory>),
}

impl Backends {
    async fn open(args: &Args) -> Result<Self> {
        match args.backend {
            Backend::Memory => {
                let factory = MemoryEc2Factory::load(&args.state)
                    .await
                    .with_context(|| format!("loading state from {}", args.state.display()))?;
                Ok(Backends::Memory(Arc::new(factory)))
            }
            #[cfg(feature = "aws")]
            Backend::Aws => Ok(Backends::Aws(Arc::new(ebsvol::ec2::AwsEc2Factory::new(
                Duration::from_secs(args.wait_timeout_secs),
            )))),
            #[cfg(not(feature = "aws"))]
            Backend::Aws => bail!("ebsvol was built without the `aws` feature"),
        }
    }

    fn factory(&self) -> Arc<dyn Ec2ClientFactory> {
        match self {
            Backends::Memory(f) => f.clone(),
            #[cfg(feature = "aws")]
            Backends::Aws(f) => f.clone(),
        }
    }

    async fn persist(&self, args: &Args) -> Result<()> {
        if let Backends::Memory(f) = self {
            f.save(&args.state)
                .await
                .with_context(|| format!("saving state to {}", args.state.display()))?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "ebsvol=info",
        1 => "ebsvol=debug",
        _ => "ebsvol=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ProviderConfig::default()
        .with_retry(
            args.max_tries,
            Duration::from_secs(args.base_delay_secs),
            Duration::from_secs(args.max_delay_secs),
        )
        .context("invalid retry settings")?;

    let backends = Backends::open(&args).await?;
    let factory = backends.factory();

    match &args.command {
        Commands::List { regions, json } => {
            let regions = config.regions_with(regions);
            let (source, regions) = (factory.as_ref(), regions.as_slice());
            let volumes = config
                .retry
                .run("list ebs volumes", move |_| instances(source, regions))
                .await
                .context("listing volumes")?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&volumes)?);
            } else if volumes.is_empty() {
                println!("No volumes found");
            } else {
                let rows: Vec<VolumeRow> = volumes.into_iter().map(VolumeRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Apply {
            catalog,
            regions,
            json,
        } => {
            let catalog = Catalog::load(catalog)
                .await
                .with_context(|| format!("loading catalog {}", catalog.display()))?;
            let config = ProviderConfig {
                regions: regions.clone(),
                ..config
            };

            info!(backend = ?args.backend, "Starting apply");
            let report = Applier::new(factory, config).apply(&catalog).await?;
            backends.persist(&args).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if !report.outcomes.is_empty() || !report.failures.is_empty() {
                println!("{}", Table::new(report_rows(&report)));
            }

            if !report.is_success() {
                bail!("{} volume(s) failed to converge", report.failures.len());
            }
        }
    }

    Ok(())
}
