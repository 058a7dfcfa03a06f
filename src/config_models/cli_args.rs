use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use super::ps_config::ConsistencyModel;
use super::ps_config::PsConfig;
use crate::errors::PsResult;

/// The `ssp-ps` program runs a single-process parameter-server cluster and
/// drives it with a synthetic increment workload.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// JSON file with a full `PsConfig`. Flags below override its values.
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of application threads issuing increments
    #[clap(long, default_value = "2")]
    pub num_app_threads: i32,

    /// Number of clock ticks each application thread performs
    #[clap(long, default_value = "10")]
    pub num_iterations: i32,

    /// Consistency model, `ssp`, `ssp-push` or `ssp-aggr`
    #[clap(long, default_value = "ssp")]
    pub consistency_model: ConsistencyModel,

    /// Staleness bound of the demo table
    #[clap(long, default_value = "0")]
    pub staleness: i32,

    /// Number of rows each thread increments per iteration
    #[clap(long, default_value = "10")]
    pub num_rows: i32,

    /// Columns per row
    #[clap(long, default_value = "16")]
    pub row_capacity: usize,

    /// Communication channels (bg worker / server thread pairs) per client
    #[clap(long, default_value = "2")]
    pub num_comm_channels: i32,

    /// Idle poll interval of the background threads, e.g. `2ms`
    #[clap(long, default_value = "2ms", value_parser = humantime::parse_duration)]
    pub bg_idle: Duration,
}

impl Args {
    /// Build the process config: file first, then command-line overrides.
    pub fn ps_config(&self) -> PsResult<PsConfig> {
        let mut config = match &self.config {
            Some(path) => PsConfig::load(path)?,
            None => PsConfig::default(),
        };
        config.num_app_threads = self.num_app_threads;
        config.consistency_model = self.consistency_model;
        config.num_comm_channels_per_client = self.num_comm_channels;
        config.bg_idle_milli = u64::try_from(self.bg_idle.as_millis()).unwrap_or(u64::MAX);
        config.server_idle_milli = config.bg_idle_milli;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_yield_valid_config() {
        let args = Args::parse_from(["ssp-ps"]);
        let config = args.ps_config().unwrap();
        assert_eq!(2, config.num_app_threads);
        assert_eq!(2, config.bg_idle_milli);
    }

    #[test]
    fn overrides_apply() {
        let args = Args::parse_from([
            "ssp-ps",
            "--consistency-model",
            "ssp-push",
            "--bg-idle",
            "15ms",
            "--num-comm-channels",
            "4",
        ]);
        let config = args.ps_config().unwrap();
        assert_eq!(ConsistencyModel::SspPush, config.consistency_model);
        assert_eq!(15, config.bg_idle_milli);
        assert_eq!(4, config.num_comm_channels_per_client);
    }
}
