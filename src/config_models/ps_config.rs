use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use super::entity_id::MAX_COMM_CHANNELS_PER_CLIENT;
use crate::errors::PsError;
use crate::errors::PsResult;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConsistencyModel {
    /// Rows are pulled on demand when the cached copy is too stale.
    #[default]
    Ssp,

    /// Servers push rows to subscribed clients at every clock boundary.
    SspPush,

    /// Push, plus bandwidth-paced early sending of prioritised row oplogs.
    SspAggr,
}

impl FromStr for ConsistencyModel {
    type Err = String;
    fn from_str(input: &str) -> Result<ConsistencyModel, Self::Err> {
        match input {
            "ssp" => Ok(ConsistencyModel::Ssp),
            "ssp-push" => Ok(ConsistencyModel::SspPush),
            "ssp-aggr" => Ok(ConsistencyModel::SspAggr),
            _ => Err(format!("Failed to parse {} as consistency model", input)),
        }
    }
}

impl Display for ConsistencyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = match self {
            ConsistencyModel::Ssp => "ssp",
            ConsistencyModel::SspPush => "ssp-push",
            ConsistencyModel::SspAggr => "ssp-aggr",
        };
        write!(f, "{}", string)
    }
}

impl ConsistencyModel {
    pub fn pushes_rows(&self) -> bool {
        !matches!(self, ConsistencyModel::Ssp)
    }
}

/// Order in which the aggregating bg worker picks row oplogs to send.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default, strum::Display,
)]
pub enum UpdateSortPolicy {
    #[default]
    FixedOrder,
    Random,
    RandomDense,
    RelativeMagnitude,
    RelativeMagnitudeApprox,
}

impl UpdateSortPolicy {
    /// Policies that rank rows by accumulated importance.
    pub fn is_value_based(&self) -> bool {
        matches!(
            self,
            UpdateSortPolicy::RelativeMagnitude | UpdateSortPolicy::RelativeMagnitudeApprox
        )
    }
}

/// Process-wide configuration. Built once at startup and shared behind an
/// `Arc`; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsConfig {
    pub client_id: i32,
    pub num_clients: i32,
    pub num_comm_channels_per_client: i32,
    pub num_app_threads: i32,
    pub num_tables: i32,
    pub consistency_model: ConsistencyModel,
    pub update_sort_policy: UpdateSortPolicy,

    /// Idle poll interval of the bg workers, in milliseconds.
    pub bg_idle_milli: u64,

    /// Idle poll interval of the server threads, in milliseconds.
    pub server_idle_milli: u64,

    /// Estimated link bandwidth used to pace aggregated sends.
    pub bandwidth_mbps: f64,
    pub row_candidate_factor: usize,

    /// Unacknowledged push messages allowed per peer.
    pub max_pending_msgs: u64,

    /// Received messages a peer may be behind on acks before one is sent.
    pub max_pending_acks: u64,
    pub max_pending_async_get_cnt: usize,
    pub oplog_push_upper_bound_kb: usize,
    pub oplog_push_staleness_tolerance: i32,
    pub server_push_row_upper_bound: usize,

    /// Server tables are snapshotted when the server clock is a multiple of
    /// this value; 0 disables.
    pub snapshot_clock: i32,
    pub snapshot_dir: PathBuf,

    /// Clock whose snapshot is loaded at table creation; 0 disables.
    pub resume_clock: i32,
    pub resume_dir: PathBuf,

    /// Number of lock stripes in row-id keyed maps.
    pub lock_pool_size: usize,
}

impl Default for PsConfig {
    fn default() -> Self {
        Self {
            client_id: 0,
            num_clients: 1,
            num_comm_channels_per_client: 1,
            num_app_threads: 1,
            num_tables: 1,
            consistency_model: ConsistencyModel::Ssp,
            update_sort_policy: UpdateSortPolicy::FixedOrder,
            bg_idle_milli: 2,
            server_idle_milli: 2,
            bandwidth_mbps: 4000.0,
            row_candidate_factor: 5,
            max_pending_msgs: 8,
            max_pending_acks: 4,
            max_pending_async_get_cnt: 16,
            oplog_push_upper_bound_kb: 100,
            oplog_push_staleness_tolerance: 2,
            server_push_row_upper_bound: 500,
            snapshot_clock: 0,
            snapshot_dir: PathBuf::from("snapshots"),
            resume_clock: 0,
            resume_dir: PathBuf::from("snapshots"),
            lock_pool_size: 64,
        }
    }
}

impl PsConfig {
    /// Read a config file in JSON. Missing fields take their defaults.
    pub fn load(path: &Path) -> PsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            PsError::InvalidConfig(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config: PsConfig = serde_json::from_str(&text).map_err(|err| {
            PsError::InvalidConfig(format!("cannot parse {}: {}", path.display(), err))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PsResult<()> {
        let invalid = |msg: String| Err(PsError::InvalidConfig(msg));
        if self.num_clients <= 0 {
            return invalid(format!("num_clients must be positive, got {}", self.num_clients));
        }
        if !(0..self.num_clients).contains(&self.client_id) {
            return invalid(format!(
                "client_id {} outside 0..{}",
                self.client_id, self.num_clients
            ));
        }
        if !(1..=MAX_COMM_CHANNELS_PER_CLIENT).contains(&self.num_comm_channels_per_client) {
            return invalid(format!(
                "num_comm_channels_per_client must be in 1..={}, got {}",
                MAX_COMM_CHANNELS_PER_CLIENT, self.num_comm_channels_per_client
            ));
        }
        if self.num_app_threads <= 0 {
            return invalid("num_app_threads must be positive".to_string());
        }
        if self.num_tables <= 0 {
            return invalid("num_tables must be positive".to_string());
        }
        if self.max_pending_msgs == 0 {
            return invalid("max_pending_msgs must be positive".to_string());
        }
        if self.max_pending_async_get_cnt == 0 {
            return invalid("max_pending_async_get_cnt must be positive".to_string());
        }
        if self.lock_pool_size == 0 {
            return invalid("lock_pool_size must be positive".to_string());
        }
        if self.consistency_model == ConsistencyModel::SspAggr {
            if !(self.bandwidth_mbps.is_finite() && self.bandwidth_mbps > 0.0) {
                return invalid(format!(
                    "bandwidth_mbps must be positive and finite, got {}",
                    self.bandwidth_mbps
                ));
            }
            if self.oplog_push_staleness_tolerance < 0 {
                return invalid("oplog_push_staleness_tolerance must be non-negative".to_string());
            }
            if self.row_candidate_factor == 0 {
                return invalid("row_candidate_factor must be positive".to_string());
            }
        }
        if self.snapshot_clock < 0 || self.resume_clock < 0 {
            return invalid("snapshot and resume clocks must be non-negative".to_string());
        }
        Ok(())
    }

    pub fn num_total_bg_threads(&self) -> i32 {
        self.num_clients * self.num_comm_channels_per_client
    }

    pub fn num_total_server_threads(&self) -> i32 {
        self.num_clients * self.num_comm_channels_per_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PsConfig::default().validate().unwrap();
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ps.json");
        std::fs::write(
            &path,
            r#"{ "num_comm_channels_per_client": 3, "consistency_model": "SspPush" }"#,
        )
        .unwrap();

        let config = PsConfig::load(&path).unwrap();
        assert_eq!(3, config.num_comm_channels_per_client);
        assert_eq!(ConsistencyModel::SspPush, config.consistency_model);
        assert_eq!(PsConfig::default().max_pending_msgs, config.max_pending_msgs);
    }

    #[test]
    fn client_id_must_be_in_range() {
        let config = PsConfig {
            client_id: 2,
            num_clients: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PsError::InvalidConfig(_))));
    }

    #[test]
    fn aggr_bandwidth_must_be_a_positive_number() {
        for bandwidth_mbps in [f64::NAN, f64::INFINITY, 0.0, -5.0] {
            let config = PsConfig {
                consistency_model: ConsistencyModel::SspAggr,
                bandwidth_mbps,
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(PsError::InvalidConfig(_))),
                "bandwidth {} accepted",
                bandwidth_mbps
            );
        }
    }

    #[test]
    fn consistency_model_parses_its_display_form() {
        for model in [
            ConsistencyModel::Ssp,
            ConsistencyModel::SspPush,
            ConsistencyModel::SspAggr,
        ] {
            assert_eq!(Ok(model), model.to_string().parse());
        }
        assert!("eventual".parse::<ConsistencyModel>().is_err());
    }
}
