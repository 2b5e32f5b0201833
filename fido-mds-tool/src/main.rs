// #![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

use clap::Parser;
use clap::{Args, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use fido_mds3::{ClientConfigBuilder, MdsError, MetadataEntry, RefreshOption};

#[derive(Debug, Args)]
pub struct CommonOpt {
    #[arg(short, long)]
    pub debug: bool,
    /// Url to download the metadata blob from
    #[arg(long, conflicts_with_all = ["mds_file", "mds_jwt"])]
    pub mds_url: Option<Url>,
    /// Path to a downloaded metadata blob
    #[arg(long, conflicts_with_all = ["mds_url", "mds_jwt"])]
    pub mds_file: Option<PathBuf>,
    /// The metadata blob itself
    #[arg(long, conflicts_with_all = ["mds_url", "mds_file"])]
    pub mds_jwt: Option<String>,
    /// Url to download the root certificate from
    #[arg(long, conflicts_with_all = ["root_file", "root_pem"])]
    pub root_url: Option<Url>,
    /// Path to the root certificate, DER or PEM
    #[arg(long, conflicts_with_all = ["root_url", "root_pem"])]
    pub root_file: Option<PathBuf>,
    /// The root certificate as PEM text
    #[arg(long, conflicts_with_all = ["root_url", "root_file"])]
    pub root_pem: Option<String>,
}

impl CommonOpt {
    fn builder(&self) -> Result<ClientConfigBuilder, MdsError> {
        let mut builder = ClientConfigBuilder::new()?;
        if let Some(url) = &self.mds_url {
            builder = builder.mds_url(url.as_str())?;
        }
        if let Some(path) = &self.mds_file {
            builder = builder.mds_file(path)?;
        }
        if let Some(jwt) = &self.mds_jwt {
            builder = builder.mds_jwt(jwt)?;
        }
        if let Some(url) = &self.root_url {
            builder = builder.root_url(url.as_str())?;
        }
        if let Some(path) = &self.root_file {
            builder = builder.root_file(path)?;
        }
        if let Some(pem) = &self.root_pem {
            builder = builder.root_pem(pem)?;
        }
        Ok(builder)
    }
}

#[derive(Debug, Subcommand)]
#[command(about = "Fido Metadata Service (MDS3) verification and query tool")]
pub enum Opt {
    /// Download and verify the metadata blob, then summarise it
    Verify(CommonOpt),
    /// Find an authenticator by aaguid, aaid or attestation certificate key identifier
    Find {
        #[command(flatten)]
        common: CommonOpt,
        identifier: String,
    },
    /// List the authenticators matching a query, such as `status eq l1 and not (status eq revoked)`
    Query {
        #[command(flatten)]
        common: CommonOpt,
        query: String,
    },
    /// Verify the metadata blob and save its payload as json
    Save {
        #[command(flatten)]
        common: CommonOpt,
        payload_file: PathBuf,
    },
}

impl Opt {
    fn common(&self) -> &CommonOpt {
        match self {
            Opt::Verify(common)
            | Opt::Find { common, .. }
            | Opt::Query { common, .. }
            | Opt::Save { common, .. } => common,
        }
    }
}

#[derive(Debug, clap::Parser)]
#[command(about = "Fido Metadata Service (MDS3) verification and query tool")]
pub struct CliParser {
    #[command(subcommand)]
    pub commands: Opt,
}

fn summary(entry: &MetadataEntry) -> String {
    format!(
        "{} | {} | {}",
        entry.identity(),
        entry.description().unwrap_or("-"),
        entry
            .latest_status()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    )
}

fn run(opt: &Opt) -> Result<(), MdsError> {
    let builder = opt.common().builder()?;
    match opt {
        Opt::Verify(_) => {
            let client = builder.build_loaded()?;
            if let Some(snapshot) = client.snapshot() {
                println!("serial number: {}", snapshot.serial_number());
                println!("next update:   {}", snapshot.next_update());
                println!("entries:       {}", snapshot.entries().len());
                println!("quarantined:   {}", snapshot.payload().quarantined());
            }
        }
        Opt::Find { identifier, .. } => {
            let client = builder.build()?;
            match client.find_metadata(identifier, RefreshOption::Needed)? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => {
                    tracing::warn!(%identifier, "no matching authenticator");
                }
            }
        }
        Opt::Query { query, .. } => {
            let client = builder.build()?;
            let entries = client.query(query, RefreshOption::Needed)?;
            for entry in entries.iter() {
                println!("{}", summary(entry));
            }
            tracing::info!(matched = entries.len());
        }
        Opt::Save { payload_file, .. } => {
            let client = builder.build_loaded()?;
            if let Some(snapshot) = client.snapshot() {
                fs::write(payload_file, snapshot.payload_text())?;
                tracing::info!(?payload_file, no = snapshot.serial_number(), "payload saved");
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let opt = CliParser::parse();

    let fmt_layer = fmt::layer().with_writer(std::io::stderr);

    let filter_layer = if opt.commands.common().debug {
        match EnvFilter::try_new("fido_mds3=debug,fido_mds3_tool=debug") {
            Ok(f) => f,
            Err(e) => {
                eprintln!("ERROR! Unable to start tracing {:?}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(f) => f,
            Err(_) => EnvFilter::new("fido_mds3=warn,fido_mds3_tool=info"),
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match run(&opt.commands) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), "{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        CliParser::command().debug_assert();
    }

    #[test]
    fn sources_are_exclusive() {
        assert!(CliParser::try_parse_from([
            "fido-mds3-tool",
            "verify",
            "--mds-file",
            "blob.jwt",
            "--mds-jwt",
            "a.b.c",
        ])
        .is_err());

        let opt = CliParser::try_parse_from([
            "fido-mds3-tool",
            "find",
            "--root-file",
            "root.crt",
            "4e4e#4005",
        ])
        .map(|p| p.commands);
        assert!(matches!(
            opt,
            Ok(Opt::Find { ref identifier, .. }) if identifier == "4e4e#4005"
        ));
    }
}
