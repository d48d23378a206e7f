//! Per-node work item carried through the pipeline

use crate::check::client::{ClientHandle, NodeClient};
use crate::check::platform::{CfTrace, MediaReport};
use crate::check::state::{RunState, Stage};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome for one node that made it through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Dispatch position, used to keep the final list in dispatch order
    pub index: usize,
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kbps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code_tag: Option<String>,
    #[serde(flatten)]
    pub media: MediaReport,
}

impl CheckResult {
    pub fn new(index: usize, node: Node) -> Self {
        Self {
            index,
            node,
            speed_kbps: None,
            ip: None,
            country: None,
            country_code_tag: None,
            media: MediaReport::default(),
        }
    }
}

/// Exclusive ownership of a node's client
///
/// Closing adds the client's traffic to the run total and runs the release
/// callback. It happens once, on the first of `close` or drop.
#[derive(Debug)]
pub struct ClientLease {
    handle: Option<ClientHandle>,
    state: Arc<RunState>,
}

impl ClientLease {
    pub fn new(handle: ClientHandle, state: Arc<RunState>) -> Self {
        Self {
            handle: Some(handle),
            state,
        }
    }

    pub fn client(&self) -> Option<&Arc<dyn NodeClient>> {
        self.handle.as_ref().map(ClientHandle::client)
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.state.add_bytes(handle.bytes_read());
            handle.release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct Job {
    pub index: usize,
    pub result: CheckResult,
    /// Whether the relay trace has to be taken at connectivity
    pub need_cf: bool,
    pub cf: Option<CfTrace>,
    lease: ClientLease,
    counted: [bool; 3],
}

impl Job {
    pub fn new(index: usize, node: Node, lease: ClientLease, need_cf: bool) -> Self {
        Self {
            index,
            result: CheckResult::new(index, node),
            need_cf,
            cf: None,
            lease,
            counted: [false; 3],
        }
    }

    pub fn node(&self) -> &Node {
        &self.result.node
    }

    /// Client of the node, `None` once released
    pub fn client(&self) -> Option<Arc<dyn NodeClient>> {
        self.lease.client().cloned()
    }

    /// Mark the job as counted by `stage`; true only the first time
    pub fn mark(&mut self, stage: Stage) -> bool {
        let slot = match stage {
            Stage::Alive => 0,
            Stage::Speed => 1,
            Stage::Media => 2,
            Stage::Idle | Stage::Done => return false,
        };
        !std::mem::replace(&mut self.counted[slot], true)
    }

    pub fn close(&mut self) {
        self.lease.close();
    }

    /// Release the client and hand back the result
    pub fn into_result(mut self) -> CheckResult {
        self.lease.close();
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::client::{ProbeError, ProbeRequest, ProbeResponse};
    use crate::node::Protocol;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(u64);

    #[async_trait]
    impl NodeClient for Counted {
        async fn get(&self, _request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
            Err(ProbeError::Cancelled)
        }

        fn bytes_read(&self) -> u64 {
            self.0
        }
    }

    fn job(releases: &Arc<AtomicUsize>, state: &Arc<RunState>) -> Job {
        let r = releases.clone();
        let handle = ClientHandle::new(Arc::new(Counted(1500)), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let node = Node::new("n", Protocol::Trojan, "1.2.3.4", 443);
        Job::new(7, node, ClientLease::new(handle, state.clone()), false)
    }

    #[test]
    fn test_close_is_idempotent_and_accounts_traffic() {
        let releases = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(RunState::new());
        let mut job = job(&releases, &state);
        assert!(job.client().is_some());
        job.close();
        job.close();
        assert!(job.client().is_none());
        drop(job);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(state.total_bytes(), 1500);
    }

    #[test]
    fn test_drop_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(RunState::new());
        drop(job(&releases, &state));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_result_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(RunState::new());
        let result = job(&releases, &state).into_result();
        assert_eq!(result.index, 7);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_counts_once_per_stage() {
        let releases = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(RunState::new());
        let mut job = job(&releases, &state);
        assert!(job.mark(Stage::Alive));
        assert!(!job.mark(Stage::Alive));
        assert!(job.mark(Stage::Speed));
        assert!(job.mark(Stage::Media));
        assert!(!job.mark(Stage::Done));
    }

    #[test]
    fn test_result_serializes_flat() {
        let mut result = CheckResult::new(0, Node::new("a", Protocol::Vless, "example.com", 443));
        result.media.netflix = true;
        result.speed_kbps = Some(2048);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["netflix"], true);
        assert_eq!(value["speed_kbps"], 2048);
        assert_eq!(value["node"]["type"], "vless");
    }
}
