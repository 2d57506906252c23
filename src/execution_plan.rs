use crate::graph::Graph;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Scheduling parameters attached to a compiled segment, stored on the
/// wire as `model_config = [global, this, duplicates, timeout]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub global_cores: i64,
    pub segment_cores: i64,
    pub max_duplicates: i64,
    pub timeout_secs: i64,
}

impl ExecutionPlan {
    pub const UNCONFIGURED: i64 = -1;

    pub fn to_model_config(&self) -> Vec<i64> {
        vec![self.global_cores, self.segment_cores, self.max_duplicates, self.timeout_secs]
    }

    pub fn from_model_config(values: &[i64]) -> Option<Self> {
        match values {
            [global_cores, segment_cores, max_duplicates, timeout_secs] => Some(Self {
                global_cores: *global_cores,
                segment_cores: *segment_cores,
                max_duplicates: *max_duplicates,
                timeout_secs: *timeout_secs,
            }),
            _ => None,
        }
    }
}

/// Device-specific constants of the plan computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanPolicy {
    pub max_duplicates: usize,
    /// More segments than this disable duplication entirely.
    pub many_segments_threshold: usize,
    pub device_memory_bytes: f64,
    pub memory_channels: usize,
    pub compile_bytes_per_second: f64,
    pub min_timeout_secs: u64,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            max_duplicates: 4,
            many_segments_threshold: 2,
            device_memory_bytes: 4e9,
            memory_channels: 2,
            compile_bytes_per_second: 1e8,
            min_timeout_secs: 10,
        }
    }
}

/// Core requirements read from the fixed-size artifact header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub optimal_cores: u32,
    pub min_cores: u32,
}

impl ArtifactHeader {
    pub const LEN: usize = 544;
    const OPTIMAL_CORES_AT: usize = 168;
    const PER_CORE_AT: usize = 480;
    const MAX_CORES: u32 = 64;

    pub fn parse(artifact: &[u8]) -> Option<Self> {
        let header = artifact.get(..Self::LEN)?;
        let raw: [u8; 4] = header[Self::OPTIMAL_CORES_AT..Self::OPTIMAL_CORES_AT + 4].try_into().ok()?;
        let optimal_cores = u32::from_le_bytes(raw);
        let min_cores = header[Self::PER_CORE_AT..Self::LEN].iter().copied().max().unwrap_or(0) as u32;
        let valid = |n: u32| (1..=Self::MAX_CORES).contains(&n);
        if !valid(optimal_cores) || !valid(min_cores) {
            return None;
        }
        Some(Self { optimal_cores, min_cores })
    }

    /// Builds a header-only artifact; used by tests and stub compilers.
    pub fn encode(optimal_cores: u32, min_cores: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::LEN];
        bytes[Self::OPTIMAL_CORES_AT..Self::OPTIMAL_CORES_AT + 4].copy_from_slice(&optimal_cores.to_le_bytes());
        bytes[Self::PER_CORE_AT] = min_cores;
        bytes
    }
}

/// How many artifact+input copies fit in device memory, scaled by the
/// number of memory channels.
pub fn memory_bound_duplicates(graph: &Graph, policy: &PlanPolicy) -> usize {
    let total: usize = graph
        .nodes()
        .iter()
        .filter_map(|n| n.segment.as_deref())
        .map(|s| s.executable.as_ref().map_or(0, Vec::len) + s.input_bytes())
        .sum();
    if total == 0 {
        return policy.max_duplicates;
    }
    (policy.device_memory_bytes / total as f64).floor() as usize * policy.memory_channels
}

/// Annotates every compiled segment with its execution plan.
pub fn set_execution_plan(graph: &mut Graph, policy: &PlanPolicy) {
    let segments: Vec<String> = graph
        .nodes()
        .iter()
        .filter(|n| n.segment.as_deref().is_some_and(|s| s.is_compiled()))
        .map(|n| n.name.clone())
        .collect();
    if segments.is_empty() {
        return;
    }

    let headers: Vec<Option<ArtifactHeader>> = segments
        .iter()
        .map(|name| {
            let header = graph
                .node(name)
                .and_then(|n| n.segment.as_deref())
                .and_then(|s| s.executable.as_deref())
                .and_then(ArtifactHeader::parse);
            if header.is_none() {
                warn!(segment = %name, "artifact metadata is unreadable");
            }
            header
        })
        .collect();

    let unconfigured = headers.iter().any(Option::is_none);
    let global_cores = if unconfigured {
        ExecutionPlan::UNCONFIGURED
    } else {
        headers.iter().flatten().map(|h| h.optimal_cores as i64).max().unwrap_or(ExecutionPlan::UNCONFIGURED)
    };

    let mut duplicates = memory_bound_duplicates(graph, policy).clamp(1, policy.max_duplicates.max(1));
    if unconfigured || segments.len() > policy.many_segments_threshold {
        duplicates = 1;
    } else if segments.len() == policy.many_segments_threshold {
        duplicates = duplicates.min(2);
    }

    for (name, header) in segments.iter().zip(&headers) {
        let Some(segment) = graph.node_mut(name).and_then(|n| n.segment.as_deref_mut()) else {
            continue;
        };
        let size = segment.executable.as_ref().map_or(0, Vec::len) as f64;
        let timeout = (size / policy.compile_bytes_per_second).max(policy.min_timeout_secs as f64);
        let plan = ExecutionPlan {
            global_cores,
            segment_cores: header.map_or(ExecutionPlan::UNCONFIGURED, |h| h.optimal_cores as i64),
            max_duplicates: duplicates as i64,
            timeout_secs: timeout as i64,
        };
        info!(segment = %name, ?plan, "execution plan");
        segment.plan = Some(plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::OpKind;
    use crate::graph::Node;
    use crate::segment::FusedSegment;

    fn compiled(name: &str, artifact: Vec<u8>) -> Node {
        let mut node = Node::new(name, OpKind::FusedSegment);
        node.segment = Some(Box::new(FusedSegment { executable: Some(artifact), ..Default::default() }));
        node
    }

    fn plan_of(graph: &Graph, name: &str) -> ExecutionPlan {
        graph.node(name).unwrap().segment.as_ref().unwrap().plan.unwrap()
    }

    #[test]
    fn header_fields_are_range_checked() {
        assert_eq!(
            ArtifactHeader::parse(&ArtifactHeader::encode(4, 1)),
            Some(ArtifactHeader { optimal_cores: 4, min_cores: 1 })
        );
        assert_eq!(ArtifactHeader::parse(&ArtifactHeader::encode(0, 1)), None);
        assert_eq!(ArtifactHeader::parse(&ArtifactHeader::encode(65, 1)), None);
        assert_eq!(ArtifactHeader::parse(&ArtifactHeader::encode(4, 0)), None);
        assert_eq!(ArtifactHeader::parse(&[1, 2, 3]), None);
    }

    #[test]
    fn many_segments_disable_duplication() {
        let mut graph = Graph::from_nodes(
            (0..3).map(|i| compiled(&format!("s{i}"), ArtifactHeader::encode(2, 1))).collect(),
        )
        .unwrap();
        set_execution_plan(&mut graph, &PlanPolicy::default());
        for i in 0..3 {
            let plan = plan_of(&graph, &format!("s{i}"));
            assert_eq!(plan.global_cores, 2);
            assert_eq!(plan.segment_cores, 2);
            assert_eq!(plan.max_duplicates, 1);
            assert_eq!(plan.timeout_secs, 10);
        }
    }

    #[test]
    fn duplication_stays_within_bounds() {
        let policy = PlanPolicy::default();
        let mut single = Graph::from_nodes(vec![compiled("s", ArtifactHeader::encode(1, 1))]).unwrap();
        set_execution_plan(&mut single, &policy);
        assert_eq!(plan_of(&single, "s").max_duplicates, 4);

        let mut pair = Graph::from_nodes(vec![
            compiled("a", ArtifactHeader::encode(1, 1)),
            compiled("b", ArtifactHeader::encode(4, 1)),
        ])
        .unwrap();
        set_execution_plan(&mut pair, &policy);
        assert_eq!(plan_of(&pair, "a").max_duplicates, 2);
        assert_eq!(plan_of(&pair, "a").global_cores, 4);

        let tight = PlanPolicy { device_memory_bytes: 100.0, ..PlanPolicy::default() };
        let mut big = Graph::from_nodes(vec![compiled("s", ArtifactHeader::encode(1, 1))]).unwrap();
        set_execution_plan(&mut big, &tight);
        assert_eq!(plan_of(&big, "s").max_duplicates, 1);
    }

    #[test]
    fn unreadable_metadata_marks_plan_unconfigured() {
        let mut graph = Graph::from_nodes(vec![
            compiled("good", ArtifactHeader::encode(2, 1)),
            compiled("bad", vec![7; 16]),
        ])
        .unwrap();
        set_execution_plan(&mut graph, &PlanPolicy::default());
        let bad = plan_of(&graph, "bad");
        assert_eq!(bad.global_cores, ExecutionPlan::UNCONFIGURED);
        assert_eq!(bad.segment_cores, ExecutionPlan::UNCONFIGURED);
        assert_eq!(plan_of(&graph, "good").segment_cores, 2);
        assert_eq!(bad.max_duplicates, 1);
    }

    #[test]
    fn timeout_scales_with_artifact_size() {
        let mut artifact = ArtifactHeader::encode(1, 1);
        artifact.resize(2_500_000_000 / 1000, 0);
        let policy = PlanPolicy { compile_bytes_per_second: 1e5, ..PlanPolicy::default() };
        let mut graph = Graph::from_nodes(vec![compiled("s", artifact)]).unwrap();
        set_execution_plan(&mut graph, &policy);
        assert_eq!(plan_of(&graph, "s").timeout_secs, 25);
    }
}
