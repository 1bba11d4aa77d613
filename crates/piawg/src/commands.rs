//! Subcommand handlers

use anyhow::{Context, Result};
use clap::Args;
use piawg_network::{HttpClient, load_ca_bundle};
use piawg_vpn::{
    Credentials, LatencyProber, Negotiator, ProbeRunner, Region, Settings, SortKey, SortOrder,
    SystemPinger, fetch_directory, filter_regions, sort_regions,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct ShowRegionsArgs {
    /// Ping each region and sort results by ping time
    #[arg(long)]
    pub ping: bool,

    /// Sort results by the given field
    #[arg(long, default_value = "name", value_parser = ["id", "name"])]
    pub sort_by: String,

    /// Sort results in ascending or descending order
    #[arg(long, default_value = "asc", value_parser = ["asc", "desc"])]
    pub sort_order: String,

    /// Only show regions whose name or id contains this term
    #[arg(long)]
    pub search: Option<String>,

    /// Max number of concurrent pings
    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    /// Number of samples to take when pinging a region
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..))]
    pub samples: u8,
}

impl ShowRegionsArgs {
    fn sort_key(&self) -> Result<SortKey> {
        if self.ping {
            return Ok(SortKey::Ping);
        }
        Ok(self.sort_by.parse()?)
    }
}

#[derive(Args, Debug)]
pub struct CreateConfigArgs {
    /// PIA account username
    #[arg(long)]
    pub pia_id: String,

    /// PIA account password
    #[arg(long, env = "PIA_PASSWORD", hide_env_values = true)]
    pub pia_password: String,

    /// Region to connect to (see show-regions)
    #[arg(long)]
    pub pia_region_id: String,

    /// Write the profile to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Leave the DNS line out of the profile
    #[arg(long)]
    pub no_dns: bool,
}

pub async fn show_regions(settings: &Settings, args: &ShowRegionsArgs) -> Result<()> {
    let client = HttpClient::with_defaults();
    let directory = fetch_directory(&client, &settings.server_list_url)
        .await
        .context("Failed to load region list")?;

    let mut regions = match args.search.as_deref() {
        Some(term) if !term.is_empty() => {
            info!("Applying region filter: {}", term);
            filter_regions(directory.regions(), term, settings.case_sensitive)
        }
        _ => directory.into_regions(),
    };

    if args.ping {
        let prober = LatencyProber::new(SystemPinger::detect());
        ProbeRunner::new(prober, args.threads, args.samples)
            .run_all(&mut regions)
            .await;
    }

    let order: SortOrder = args.sort_order.parse()?;
    sort_regions(&mut regions, args.sort_key()?, order);

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(render_table(&regions).as_bytes())
        .context("Failed to write region table")?;
    Ok(())
}

pub async fn create_config(settings: &Settings, args: &CreateConfigArgs) -> Result<()> {
    let roots = load_ca_bundle(&settings.ca_cert_path).with_context(|| {
        format!(
            "Failed to load PIA root CA from {}",
            settings.ca_cert_path.display()
        )
    })?;
    let client = HttpClient::with_defaults().with_pinned_roots(roots);

    let directory = fetch_directory(&client, &settings.server_list_url)
        .await
        .context("Failed to load region list")?;

    let credentials = Credentials::new(&args.pia_id, &args.pia_password);
    let negotiator = Negotiator::new(client, directory);

    let mut iface = negotiator
        .negotiate(&credentials, &args.pia_region_id)
        .await?;
    if args.no_dns {
        iface = iface.without_dns();
    }

    match &args.output {
        Some(path) => iface.save_profile(path)?,
        None => iface.write_profile(&mut std::io::stdout().lock())?,
    }
    Ok(())
}

/// Region listing as printed by show-regions
pub fn render_table(regions: &[Region]) -> String {
    let mut out = format!("{:<24} {:<18} {:<9}\n", "NAME", "ID", "PING (ms)");
    out.push_str(&"=".repeat(53));
    out.push('\n');
    for region in regions {
        out.push_str(&format!(
            "{:<24} {:<18} {:>9}\n",
            region.name,
            region.id,
            region.latency_label()
        ));
    }
    out
}
