//! Cluster settings and zone configuration over SQL

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, SimpleQueryMessage};
use tracing::debug;

pub const SNAPSHOT_REBALANCE_RATE: &str = "kv.snapshot_rebalance.max_rate";
pub const SNAPSHOT_RECOVERY_RATE: &str = "kv.snapshot_recovery.max_rate";
pub const PRESERVE_DOWNGRADE_OPTION: &str = "cluster.preserve_downgrade_option";

static SETTING_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z_.\d]+$").expect("valid setting name regex")
});

#[derive(Error, Debug)]
pub enum ClusterSqlError {
    #[error("{0} not a valid cluster setting, only letters, underscores, and periods allowed")]
    InvalidSettingName(String),

    #[error("failed to query {what}: {source}")]
    Query {
        what: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("setting {setting} returned no value")]
    MissingValue { setting: String },

    #[error("failed to parse {setting} value {value:?} as a byte size")]
    InvalidByteSize { setting: String, value: String },

    #[error("failed to parse zone config for {target}: {source}")]
    ZoneConfig {
        target: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no maximum range size found")]
    NoRangeMaxBytes,

    #[error("snapshot rate is zero")]
    ZeroRate,
}

pub type ClusterSqlResult<T> = Result<T, ClusterSqlError>;

pub fn validate_setting_name(name: &str) -> ClusterSqlResult<()> {
    if SETTING_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ClusterSqlError::InvalidSettingName(name.to_string()))
    }
}

/// `SHOW CLUSTER SETTING <name>` as text
pub async fn get_setting(client: &Client, name: &str) -> ClusterSqlResult<String> {
    validate_setting_name(name)?;
    let messages = client
        .simple_query(&format!("SHOW CLUSTER SETTING {name}"))
        .await
        .map_err(|source| ClusterSqlError::Query {
            what: name.to_string(),
            source,
        })?;
    messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .ok_or_else(|| ClusterSqlError::MissingValue {
            setting: name.to_string(),
        })
}

/// Like [`get_setting`], `None` when the server does not know the setting
pub async fn get_setting_opt(client: &Client, name: &str) -> ClusterSqlResult<Option<String>> {
    match get_setting(client, name).await {
        Ok(value) => Ok(Some(value)),
        Err(ClusterSqlError::Query { source, .. }) if is_unknown_setting(&source) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_unknown_setting(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNDEFINED_OBJECT)
        || err
            .as_db_error()
            .is_some_and(|db| db.message().contains("unknown cluster setting"))
}

pub async fn set_setting(client: &Client, name: &str, value: &str) -> ClusterSqlResult<()> {
    validate_setting_name(name)?;
    client
        .execute(&format!("SET CLUSTER SETTING {name} = $1"), &[&value])
        .await
        .map_err(|source| ClusterSqlError::Query {
            what: format!("{name} = {value}"),
            source,
        })?;
    Ok(())
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct GcConfig {
    #[serde(default)]
    pub ttlseconds: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ZoneConfig {
    #[serde(default)]
    pub range_min_bytes: u64,
    #[serde(default)]
    pub range_max_bytes: u64,
    #[serde(default)]
    pub num_replicas: u32,
    #[serde(default)]
    pub gc: GcConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zone {
    pub target: String,
    pub config: ZoneConfig,
}

pub fn parse_zone_config(target: &str, yaml: &str) -> ClusterSqlResult<ZoneConfig> {
    serde_yaml::from_str(yaml).map_err(|source| ClusterSqlError::ZoneConfig {
        target: target.to_string(),
        source,
    })
}

pub async fn zone_configs(client: &Client) -> ClusterSqlResult<Vec<Zone>> {
    let query_error = |source| ClusterSqlError::Query {
        what: "crdb_internal.zones".to_string(),
        source,
    };
    let rows = client
        .query("SELECT target, full_config_yaml FROM crdb_internal.zones", &[])
        .await
        .map_err(query_error)?;

    rows.iter()
        .map(|row| {
            let target: Option<String> = row.try_get(0).map_err(query_error)?;
            let yaml: String = row.try_get(1).map_err(query_error)?;
            let target = target.unwrap_or_default();
            let config = parse_zone_config(&target, &yaml)?;
            Ok(Zone { target, config })
        })
        .collect()
}

/// Parse a human readable byte size such as `32 MiB`, `10MB` or `8.0 MiB`
///
/// SI suffixes are powers of 1000, IEC suffixes powers of 1024.
pub fn parse_byte_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "ki" | "kib" => 1024.0,
        "m" | "mb" => 1e6,
        "mi" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" => 1e9,
        "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" => 1e12,
        "ti" | "tib" => 1024.0_f64.powi(4),
        _ => return None,
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((number * multiplier) as u64)
}

/// Shortest range move reported, so a stall timeout never collapses to zero
pub const MIN_RANGE_MOVE_DURATION: Duration = Duration::from_secs(1);

/// Seconds one range of `max_range_bytes` takes to move at `rate` bytes/s,
/// rounded up and at least [`MIN_RANGE_MOVE_DURATION`]
pub fn range_move_duration_for(
    rebalance_rate: u64,
    recovery_rate: Option<u64>,
    zones: &[Zone],
) -> ClusterSqlResult<Duration> {
    // A server without a recovery rate setting is unlimited on that path
    let rate = rebalance_rate.min(recovery_rate.unwrap_or(u64::MAX));
    if rate == 0 {
        return Err(ClusterSqlError::ZeroRate);
    }
    let max_range_bytes = zones
        .iter()
        .map(|z| z.config.range_max_bytes)
        .max()
        .filter(|b| *b > 0)
        .ok_or(ClusterSqlError::NoRangeMaxBytes)?;
    Ok(Duration::from_secs(max_range_bytes.div_ceil(rate)).max(MIN_RANGE_MOVE_DURATION))
}

/// Best-case time for a single range to move between two nodes
pub async fn range_move_duration(client: &Client) -> ClusterSqlResult<Duration> {
    let parse = |setting: &str, value: String| {
        parse_byte_size(&value).ok_or(ClusterSqlError::InvalidByteSize {
            setting: setting.to_string(),
            value,
        })
    };

    let rebalance = parse(
        SNAPSHOT_REBALANCE_RATE,
        get_setting(client, SNAPSHOT_REBALANCE_RATE).await?,
    )?;
    let recovery = match get_setting_opt(client, SNAPSHOT_RECOVERY_RATE).await? {
        Some(value) => Some(parse(SNAPSHOT_RECOVERY_RATE, value)?),
        None => None,
    };
    let zones = zone_configs(client).await?;
    let duration = range_move_duration_for(rebalance, recovery, &zones)?;
    debug!(
        rebalance_rate = rebalance,
        recovery_rate = ?recovery,
        duration_secs = duration.as_secs(),
        "computed range move duration"
    );
    Ok(duration)
}
