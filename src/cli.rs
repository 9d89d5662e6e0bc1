//! Command-line interface

use crate::client::Client;
use crate::config::Config;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shm_compute_core::{Response, Status};
use std::path::PathBuf;

/// Shared-memory compute server and client
#[derive(Parser, Debug, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// Config file path
    #[clap(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the server until interrupted
    Serve,

    /// Connect, send one request, print the response and unregister
    Call {
        /// Name to register under
        #[clap(short, long)]
        name: Option<String>,

        #[clap(subcommand)]
        operation: Operation,
    },

    /// Write a config file with default settings
    Init {
        #[clap(default_value = "shm-compute.toml")]
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Operation {
    /// Apply + - * / to two integers
    #[clap(allow_negative_numbers = true)]
    Arith { operator: char, n1: i64, n2: i64 },

    /// 1 if odd, 0 if even
    #[clap(allow_negative_numbers = true)]
    EvenOdd { n: i64 },

    /// 1 if prime, 0 otherwise
    #[clap(allow_negative_numbers = true)]
    Prime { n: i64 },

    /// 1 if negative, 0 otherwise
    #[clap(allow_negative_numbers = true)]
    Negative { n: i64 },
}

impl Cli {
    /// Config from `--config` or discovery, with `--log-level` applied
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

/// Run one operation over a fresh connection. Blocks the calling thread.
pub fn call(config: &Config, name: Option<&str>, operation: &Operation) -> Result<Response> {
    let client = Client::connect(config, name).context("Cannot connect to server")?;

    let response = match *operation {
        Operation::Arith { operator, n1, n2 } => {
            let operator = u8::try_from(operator).context("Operator must be a single ASCII character")?;
            client.arithmetic(operator, n1, n2)
        }
        Operation::EvenOdd { n } => client.even_or_odd(n),
        Operation::Prime { n } => client.is_prime(n),
        Operation::Negative { n } => client.is_negative(n),
    }
    .context("Request failed")?;

    client.unregister().context("Cannot unregister")?;
    Ok(response)
}

/// Human-readable rendering of a response
pub fn describe(response: &Response) -> String {
    match response.status {
        Status::Success => response.result.to_string(),
        Status::Unsupported => "unsupported".to_string(),
        Status::UnknownFailure => "failure".to_string(),
    }
}
