//! Node decommissioning ahead of a scale down
//!
//! The drainer talks to the database through the `cockroach` CLI inside the
//! first pod. It looks up the node id of the pod being removed, starts an
//! asynchronous decommission and then polls the node status until every
//! replica has left the node. A node whose replica count stops changing for
//! longer than the range relocation timeout is reported as stalled, which
//! usually means the remaining nodes lack disk space or cannot satisfy a zone
//! constraint.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::controller::error::BackoffConfig;
use crate::resources::exec::exec_in_pod;
use crate::resources::statefulset::DB_CONTAINER_NAME;
use crate::scale::{Drainer, ScaleError, ScaleResult};

/// Multiple of the single range move time allowed between replica changes
pub const RANGE_RELOCATION_FACTOR: u32 = 3;

const COCKROACH_BINARY: &str = "./cockroach";

const STATUS_IS_LIVE: usize = 8;
const STATUS_REPLICAS: usize = 9;
const STATUS_IS_DECOMMISSIONING: usize = 10;

/// Split CSV output of `cockroach node status` into records
///
/// Handles quoted fields with embedded commas and doubled quotes, which is
/// all the CLI ever emits.
pub fn parse_csv(input: &str) -> Vec<Vec<String>> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_csv_line)
        .collect()
}

fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut field)),
            (c, _) => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Address the database advertises for a pod of the stateful set
pub fn node_host(statefulset: &str, namespace: &str, ordinal: i32) -> String {
    format!("{statefulset}-{ordinal}.{statefulset}.{namespace}")
}

/// Node id whose address column mentions `host`
pub fn find_node_id(records: &[Vec<String>], host: &str) -> ScaleResult<u64> {
    let record = records
        .iter()
        .find(|r| r.get(1).is_some_and(|address| address.contains(host)))
        .ok_or_else(|| ScaleError::NodeNotFound {
            host: host.to_string(),
        })?;
    let id = record.first().map(String::as_str).unwrap_or_default();
    id.parse().map_err(|_| ScaleError::MalformedOutput(format!("node id {id:?}")))
}

/// One row of `cockroach node status <id> --decommission`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainStatus {
    pub is_live: bool,
    pub replicas: u64,
    pub is_decommissioning: bool,
}

/// Parse the decommission status output, skipping the header row
pub fn parse_drain_status(output: &str) -> ScaleResult<DrainStatus> {
    let records = parse_csv(output);
    let record = records
        .get(1)
        .ok_or_else(|| ScaleError::MalformedOutput("node status has no data row".to_string()))?;
    let column = |i: usize| {
        record.get(i).map(String::as_str).ok_or_else(|| {
            ScaleError::MalformedOutput(format!("node status row has no column {i}"))
        })
    };
    let replicas = column(STATUS_REPLICAS)?;
    Ok(DrainStatus {
        is_live: column(STATUS_IS_LIVE)? == "true",
        replicas: replicas
            .parse()
            .map_err(|_| ScaleError::MalformedOutput(format!("replica count {replicas:?}")))?,
        is_decommissioning: column(STATUS_IS_DECOMMISSIONING)? == "true",
    })
}

/// Outcome of one drain status observation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainProgress {
    Drained,
    Moving,
    Stalled,
}

/// Tracks when the replica count on a draining node last changed
#[derive(Clone, Debug)]
pub struct StallDetector {
    timeout: Duration,
    last_replicas: u64,
    last_change: Instant,
}

impl StallDetector {
    pub fn new(replicas: u64, now: Instant, timeout: Duration) -> Self {
        Self {
            timeout,
            last_replicas: replicas,
            last_change: now,
        }
    }

    /// Any change in the count resets the timer, however slow the movement
    pub fn observe(&mut self, replicas: u64, now: Instant) -> DrainProgress {
        if replicas == 0 {
            return DrainProgress::Drained;
        }
        if replicas != self.last_replicas {
            self.last_replicas = replicas;
            self.last_change = now;
            return DrainProgress::Moving;
        }
        if now.duration_since(self.last_change) > self.timeout {
            DrainProgress::Stalled
        } else {
            DrainProgress::Moving
        }
    }
}

/// Observe through a shared detector. A poisoned lock keeps its last state,
/// so the stall window is not lost to a panicked poll.
pub fn observe_drain(detector: &Mutex<StallDetector>, replicas: u64, now: Instant) -> DrainProgress {
    let mut guard = detector.lock().unwrap_or_else(|poisoned| {
        warn!(replicas, "stall detector lock poisoned, keeping its last state");
        PoisonError::into_inner(poisoned)
    });
    guard.observe(replicas, now)
}

/// Decommissions nodes through the CLI in the first pod
pub struct CockroachNodeDrainer {
    client: Client,
    namespace: String,
    statefulset: String,
    secure_mode: String,
    range_relocation_timeout: Duration,
}

impl CockroachNodeDrainer {
    pub fn new(client: Client, cluster: &Cluster, range_relocation_timeout: Duration) -> Self {
        Self {
            client,
            namespace: cluster.namespace(),
            statefulset: cluster.statefulset_name(),
            secure_mode: cluster.secure_mode(),
            range_relocation_timeout,
        }
    }

    async fn cockroach(&self, args: &[String]) -> ScaleResult<String> {
        let mut command = vec![COCKROACH_BINARY.to_string()];
        command.extend_from_slice(args);
        command.push(self.secure_mode.clone());

        let pod = format!("{}-0", self.statefulset);
        let output =
            exec_in_pod(&self.client, &self.namespace, &pod, DB_CONTAINER_NAME, command).await?;
        Ok(output.stdout)
    }

    async fn node_id(&self, ordinal: i32) -> ScaleResult<u64> {
        let stdout = self
            .cockroach(&["node".into(), "status".into(), "--format=csv".into()])
            .await?;
        let host = node_host(&self.statefulset, &self.namespace, ordinal);
        find_node_id(&parse_csv(&stdout), &host)
    }

    async fn drain_status(&self, id: u64) -> ScaleResult<u64> {
        let stdout = self
            .cockroach(&[
                "node".into(),
                "status".into(),
                id.to_string(),
                "--decommission".into(),
                "--format=csv".into(),
            ])
            .await?;
        let status = parse_drain_status(&stdout)?;
        info!(
            node_id = id,
            is_live = status.is_live,
            replicas = status.replicas,
            is_decommissioning = status.is_decommissioning,
            "node status"
        );
        if !status.is_live || !status.is_decommissioning {
            return Err(ScaleError::UnexpectedNodeStatus { node_id: id });
        }
        Ok(status.replicas)
    }
}

#[async_trait]
impl Drainer for CockroachNodeDrainer {
    async fn decommission(&self, ordinal: i32) -> ScaleResult<()> {
        let id = self.node_id(ordinal).await?;
        info!(node_id = id, ordinal, "draining node");

        self.cockroach(&[
            "node".into(),
            "decommission".into(),
            id.to_string(),
            "--wait=none".into(),
        ])
        .await?;

        let initial = self.drain_status(id).await?;
        let detector = Mutex::new(StallDetector::new(
            initial,
            Instant::now(),
            self.range_relocation_timeout,
        ));
        let detector = &detector;

        // Draining a large node can take days; only a stall ends the loop
        let backoff = BackoffConfig::polling(Duration::from_secs(1), self.range_relocation_timeout);
        let timeout = self.range_relocation_timeout;
        backoff
            .retry(
                Duration::MAX,
                || async move {
                    let replicas = self.drain_status(id).await?;
                    let progress = observe_drain(detector, replicas, Instant::now());
                    match progress {
                        DrainProgress::Drained => Ok(()),
                        DrainProgress::Stalled => Err(ScaleError::DecommissionStalled {
                            node_id: id,
                            replicas,
                            timeout,
                        }),
                        DrainProgress::Moving => {
                            debug!(node_id = id, replicas, "node has not finished draining");
                            Err(ScaleError::NotReady(format!(
                                "node {id} still holds {replicas} replicas"
                            )))
                        }
                    }
                },
                ScaleError::is_retryable,
            )
            .await?;

        info!(node_id = id, ordinal, "node drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_STATUS: &str = "id,address,sql_address,build,started_at,updated_at,locality,is_available,is_live
1,crdb-0.crdb.db:26258,crdb-0.crdb.db:26257,v24.1.0,2024-01-01 00:00:00,2024-01-01 00:01:00,,true,true
2,crdb-1.crdb.db:26258,crdb-1.crdb.db:26257,v24.1.0,2024-01-01 00:00:00,2024-01-01 00:01:00,,true,true
4,crdb-3.crdb.db:26258,crdb-3.crdb.db:26257,v24.1.0,2024-01-01 00:00:00,2024-01-01 00:01:00,\"region=us,zone=a\",true,true
";

    const DRAIN_STATUS: &str = "id,address,sql_address,build,started_at,updated_at,locality,is_available,is_live,replicas,is_decommissioning,membership,is_draining
4,crdb-3.crdb.db:26258,crdb-3.crdb.db:26257,v24.1.0,2024-01-01 00:00:00,2024-01-01 00:01:00,,true,true,42,true,decommissioning,false
";

    #[test]
    fn test_parse_csv_quotes() {
        let records = parse_csv("a,\"b,c\",\"say \"\"hi\"\"\"\n\nx,,y\r\n");
        assert_eq!(records, vec![
            vec!["a".to_string(), "b,c".to_string(), "say \"hi\"".to_string()],
            vec!["x".to_string(), String::new(), "y".to_string()],
        ]);
    }

    #[test]
    fn test_find_node_id_by_host() {
        let records = parse_csv(NODE_STATUS);
        let host = node_host("crdb", "db", 3);
        assert_eq!(host, "crdb-3.crdb.db");
        assert_eq!(find_node_id(&records, &host).unwrap(), 4);
        assert!(matches!(
            find_node_id(&records, &node_host("crdb", "db", 7)),
            Err(ScaleError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn test_parse_drain_status() {
        let status = parse_drain_status(DRAIN_STATUS).unwrap();
        assert_eq!(status, DrainStatus {
            is_live: true,
            replicas: 42,
            is_decommissioning: true,
        });
        assert!(parse_drain_status("id,address\n").is_err());
        assert!(parse_drain_status("h\n1,2,3\n").is_err());
    }

    #[test]
    fn test_stall_detector_resets_on_any_movement() {
        let start = Instant::now();
        let timeout = Duration::from_secs(60);
        let mut detector = StallDetector::new(42, start, timeout);

        assert_eq!(detector.observe(42, start + Duration::from_secs(30)), DrainProgress::Moving);
        // Slow movement at 59s restarts the window
        assert_eq!(detector.observe(41, start + Duration::from_secs(59)), DrainProgress::Moving);
        assert_eq!(detector.observe(41, start + Duration::from_secs(100)), DrainProgress::Moving);
        assert_eq!(detector.observe(41, start + Duration::from_secs(120)), DrainProgress::Stalled);
        assert_eq!(detector.observe(0, start + Duration::from_secs(121)), DrainProgress::Drained);
    }

    #[test]
    fn test_stall_after_unchanged_window() {
        let start = Instant::now();
        let mut detector = StallDetector::new(42, start, Duration::from_secs(180));
        assert_eq!(detector.observe(42, start + Duration::from_secs(180)), DrainProgress::Moving);
        assert_eq!(detector.observe(42, start + Duration::from_secs(181)), DrainProgress::Stalled);
    }

    #[test]
    fn test_poisoned_detector_keeps_stall_window() {
        let start = Instant::now();
        let detector = Mutex::new(StallDetector::new(42, start, Duration::from_secs(60)));

        let poisoned = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = detector.lock().unwrap();
                    panic!("poll panicked while holding the detector");
                })
                .join()
        });
        assert!(poisoned.is_err());
        assert!(detector.is_poisoned());

        assert_eq!(
            observe_drain(&detector, 42, start + Duration::from_secs(30)),
            DrainProgress::Moving
        );
        assert_eq!(
            observe_drain(&detector, 42, start + Duration::from_secs(61)),
            DrainProgress::Stalled
        );
    }
}
