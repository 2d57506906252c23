use crate::constants::ConstantStore;
use crate::core::types::{Input, Shape, TensorRef};
use crate::graph::{AttrValue, Graph};
use crate::segment::FusedSegment;
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const GRAPH_FILE: &str = "graph_def.pb";
pub const ARTIFACT_FILE: &str = "artifact.bin";
pub const LOG_FILE: &str = "compiler.log";
pub const IO_CONFIG_FILE: &str = "io-config.json";
pub const ERROR_FILE: &str = "compiler-error.txt";
pub const IO_REPORT_FILE: &str = "io-report.json";

/// Line that opens the interesting part of a failed compiler log.
pub const FAILURE_MARKER: &str = "***************";
const LOG_HEAD_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub program: PathBuf,
    /// Arguments placed before the `compile` subcommand.
    pub program_args: Vec<String>,
    /// Arguments appended after the generated ones.
    pub extra_args: Vec<String>,
    /// Root of the per-segment working directories. A temporary directory
    /// is used when unset.
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
    pub max_workers: Option<usize>,
    pub memory_per_worker: u64,
    pub grace_period: Duration,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("neuron-cc"),
            program_args: Vec::new(),
            extra_args: Vec::new(),
            workdir: None,
            timeout: Duration::from_secs(18000),
            max_workers: None,
            memory_per_worker: 4_000_000_000,
            grace_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled,
    Skipped { reason: String },
    Failed { reason: String, log_excerpt: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub workers: usize,
    pub outcomes: BTreeMap<String, CompileOutcome>,
}

impl CompileReport {
    fn with_outcome(&self, pred: impl Fn(&CompileOutcome) -> bool) -> Vec<String> {
        self.outcomes.iter().filter(|(_, o)| pred(o)).map(|(n, _)| n.clone()).collect()
    }

    pub fn compiled(&self) -> Vec<String> {
        self.with_outcome(|o| matches!(o, CompileOutcome::Compiled))
    }

    pub fn skipped(&self) -> Vec<String> {
        self.with_outcome(|o| matches!(o, CompileOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> Vec<String> {
        self.with_outcome(|o| matches!(o, CompileOutcome::Failed { .. }))
    }
}

/// `name -> [dims, dtype]` for inputs plus the output list, passed to the
/// compiler on its command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoConfig {
    pub inputs: BTreeMap<String, (Vec<i64>, String)>,
    pub outputs: Vec<String>,
}

impl IoConfig {
    pub fn for_segment(segment: &FusedSegment) -> Self {
        let dims = |s: &Shape| s.dims.as_ref().map_or_else(Vec::new, |d| d.iter().map(|x| x.to_i64()).collect());
        let inputs = segment
            .input_names
            .iter()
            .zip(&segment.input_shapes)
            .zip(&segment.input_dtypes)
            .map(|((name, shape), dtype)| (name.full_name(), (dims(shape), dtype.name().to_string())))
            .collect();
        Self { inputs, outputs: segment.output_names.iter().map(TensorRef::full_name).collect() }
    }
}

/// What the compiler actually kept, if it chose to report it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IoReport {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub input_shapes: HashMap<String, Vec<i64>>,
    pub output_shapes: HashMap<String, Vec<i64>>,
}

struct CompileJob {
    segment: String,
    dir: PathBuf,
    graph_def: Vec<u8>,
    io_config: IoConfig,
}

#[derive(Debug)]
enum JobResult {
    Compiled { artifact: Vec<u8>, io_report: Option<IoReport> },
    Failed { reason: String, log_excerpt: Option<String> },
}

fn mem_available_bytes() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Worker count bounded by CPUs and by how many compilers fit in memory.
pub fn default_worker_count(memory_per_worker: u64) -> usize {
    let cpus = num_cpus::get();
    match mem_available_bytes() {
        Some(avail) if memory_per_worker > 0 => cpus.min((avail / memory_per_worker) as usize).max(1),
        _ => cpus.max(1),
    }
}

/// Condenses a failed compiler log. Short logs are kept whole; long ones
/// are cut to what follows the failure marker, or to their head when no
/// marker is present.
pub fn extract_failure(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    if lines.len() < LOG_HEAD_LINES {
        return log.trim_end().to_string();
    }
    let marked: Vec<&str> = lines
        .iter()
        .skip_while(|l| !l.contains(FAILURE_MARKER))
        .filter(|l| !l.contains("Artifacts stored"))
        .copied()
        .collect();
    if marked.is_empty() {
        lines[..LOG_HEAD_LINES].join("\n")
    } else {
        marked.join("\n")
    }
}

/// Working directory of `segment` under `root`. `%`, `/` and a leading `.`
/// are percent-escaped, so distinct segment names get distinct directories.
pub fn segment_dir(root: &Path, segment: &str) -> PathBuf {
    let mut escaped = String::with_capacity(segment.len());
    for (i, c) in segment.chars().enumerate() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '.' if i == 0 => escaped.push_str("%2E"),
            _ => escaped.push(c),
        }
    }
    root.join(escaped)
}

fn prepare_job(root: &Path, name: &str, segment: &FusedSegment, constants: &ConstantStore) -> CompileJob {
    let mut sub = segment.graph.clone();
    constants.restore(&mut sub);
    for (input, shape) in segment.input_names.iter().zip(&segment.input_shapes) {
        if let Some(node) = sub.node_mut(&input.node) {
            node.attrs.insert("shape".to_string(), AttrValue::Shape(shape.clone()));
        }
    }
    CompileJob {
        segment: name.to_string(),
        dir: segment_dir(root, name),
        graph_def: sub.encode(),
        io_config: IoConfig::for_segment(segment),
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT) {
        debug!(pid = child.id(), error = %err, "could not interrupt compiler");
    }
}

#[cfg(not(unix))]
fn interrupt(_: &Child) {}

fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Waits for `child` up to `timeout`; then interrupts it and, after the
/// grace period, kills it. `None` means the process timed out.
fn wait_compiler(child: &mut Child, timeout: Duration, grace: Duration) -> std::io::Result<Option<ExitStatus>> {
    if let Some(status) = wait_until(child, Instant::now() + timeout)? {
        return Ok(Some(status));
    }
    interrupt(child);
    if wait_until(child, Instant::now() + grace)?.is_none() {
        child.kill()?;
        child.wait()?;
    }
    Ok(None)
}

fn remove_stale(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn run_job(job: &CompileJob, options: &CompilerOptions) -> anyhow::Result<JobResult> {
    fs::create_dir_all(&job.dir).with_context(|| format!("creating {}", job.dir.display()))?;
    let graph_path = job.dir.join(GRAPH_FILE);
    let artifact_path = job.dir.join(ARTIFACT_FILE);
    let log_path = job.dir.join(LOG_FILE);
    // A reused workdir must not hand a previous run's outputs to this one.
    for stale in [ARTIFACT_FILE, IO_REPORT_FILE, ERROR_FILE, IO_CONFIG_FILE] {
        remove_stale(&job.dir.join(stale)).with_context(|| format!("clearing {stale} in {}", job.dir.display()))?;
    }
    fs::write(&graph_path, &job.graph_def)?;
    let io_config = serde_json::to_string(&job.io_config)?;

    let log = File::create(&log_path)?;
    let mut child = Command::new(&options.program)
        .args(&options.program_args)
        .arg("compile")
        .arg(&graph_path)
        .arg("--io-config")
        .arg(&io_config)
        .arg("--output")
        .arg(&artifact_path)
        .args(&options.extra_args)
        .current_dir(&job.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .spawn()
        .with_context(|| format!("failed to launch compiler {}", options.program.display()))?;
    debug!(segment = %job.segment, pid = child.id(), "compiler started");

    let status = wait_compiler(&mut child, options.timeout, options.grace_period)?;
    let failure = match status {
        None => Some(format!("compiler timed out after {}s", options.timeout.as_secs_f64())),
        Some(s) if !s.success() => Some(format!("compiler exited with {s}")),
        Some(_) if !artifact_path.is_file() => Some("compiler produced no artifact".to_string()),
        Some(_) => None,
    };

    if let Some(reason) = failure {
        let log_text = fs::read(&log_path).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
        let excerpt = extract_failure(&log_text);
        fs::write(job.dir.join(IO_CONFIG_FILE), &io_config)?;
        if !excerpt.is_empty() {
            fs::write(job.dir.join(ERROR_FILE), &excerpt)?;
        }
        return Ok(JobResult::Failed { reason, log_excerpt: (!excerpt.is_empty()).then_some(excerpt) });
    }

    let artifact = fs::read(&artifact_path)?;
    if artifact.is_empty() {
        return Ok(JobResult::Failed { reason: "compiler produced an empty artifact".to_string(), log_excerpt: None });
    }
    let report_path = job.dir.join(IO_REPORT_FILE);
    let io_report = if report_path.is_file() {
        Some(serde_json::from_str(&fs::read_to_string(&report_path)?).context("malformed io report")?)
    } else {
        None
    };
    Ok(JobResult::Compiled { artifact, io_report })
}

/// Re-derives the boundary of segment `name` from what the compiler kept.
/// Inputs may be dropped or reordered; outputs may only be reordered, or
/// dropped when nothing in the parent graph reads them.
pub fn apply_io_report(graph: &mut Graph, name: &str, report: &IoReport) -> Result<(), String> {
    let node = graph.node(name).ok_or_else(|| format!("segment {name} vanished"))?;
    let segment = node.segment.as_deref().ok_or_else(|| format!("{name} is not a segment"))?;
    let externals: Vec<TensorRef> = node.data_inputs().cloned().collect();

    let lookup = |names: &[TensorRef], wanted: &str| -> Result<usize, String> {
        let t = TensorRef::parse(wanted).map_err(|e| e.to_string())?;
        names.iter().position(|n| *n == t).ok_or_else(|| format!("compiler reported unknown tensor {wanted}"))
    };
    let input_order = report.inputs.iter().map(|n| lookup(&segment.input_names, n)).collect::<Result<Vec<_>, _>>()?;
    let output_order =
        report.outputs.iter().map(|n| lookup(&segment.output_names, n)).collect::<Result<Vec<_>, _>>()?;

    let new_port: HashMap<usize, usize> = output_order.iter().enumerate().map(|(k, &j)| (j, k)).collect();
    let read_ports: Vec<usize> = graph
        .nodes()
        .iter()
        .flat_map(|n| n.data_inputs())
        .filter(|t| t.node == name)
        .map(|t| t.port)
        .collect();
    if let Some(lost) = read_ports.iter().find(|p| !new_port.contains_key(p)) {
        return Err(format!("compiler dropped output {lost}, which is still consumed"));
    }

    let pick = |order: &[usize], shapes: &[Shape], reported: &HashMap<String, Vec<i64>>, names: &[TensorRef]| {
        order
            .iter()
            .map(|&i| {
                let known = shapes.get(i).cloned().unwrap_or_default();
                match reported.get(&names[i].full_name()) {
                    Some(dims) => known.merge(&Shape::from_i64s(dims)).map_err(|e| e.to_string()),
                    None => Ok(known),
                }
            })
            .collect::<Result<Vec<_>, String>>()
    };
    let updated = FusedSegment {
        graph: segment.graph.clone(),
        input_names: input_order.iter().map(|&i| segment.input_names[i].clone()).collect(),
        input_dtypes: input_order.iter().map(|&i| segment.input_dtypes[i]).collect(),
        input_shapes: pick(&input_order, &segment.input_shapes, &report.input_shapes, &segment.input_names)?,
        output_names: output_order.iter().map(|&j| segment.output_names[j].clone()).collect(),
        output_dtypes: output_order.iter().map(|&j| segment.output_dtypes[j]).collect(),
        output_shapes: pick(&output_order, &segment.output_shapes, &report.output_shapes, &segment.output_names)?,
        executable: segment.executable.clone(),
        plan: segment.plan,
        input_batch_axis: input_order.iter().filter_map(|&i| segment.input_batch_axis.get(i).copied()).collect(),
        output_batch_axis: output_order.iter().filter_map(|&j| segment.output_batch_axis.get(j).copied()).collect(),
    };
    let controls: Vec<Input> = node.inputs.iter().filter(|i| i.is_control()).cloned().collect();
    let mut inputs: Vec<Input> = input_order.iter().map(|&i| Input::Data(externals[i].clone())).collect();
    inputs.extend(controls);

    if let Some(node) = graph.node_mut(name) {
        node.inputs = inputs;
        node.segment = Some(Box::new(updated));
    }
    for n in graph.nodes_mut() {
        for input in &mut n.inputs {
            if let Input::Data(t) = input {
                if t.node == name {
                    if let Some(&p) = new_port.get(&t.port) {
                        t.port = p;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Compiles every eligible segment of `graph` in parallel and attaches the
/// artifacts. Payloads held in `constants` are put back into each sub-graph
/// before it is written out. Skips and failures are reported, never raised.
pub fn compile_segments(
    graph: &mut Graph,
    options: &CompilerOptions,
    constants: &ConstantStore,
) -> anyhow::Result<CompileReport> {
    let scratch;
    let root = match &options.workdir {
        Some(dir) => dir.clone(),
        None => {
            scratch = tempfile::Builder::new().prefix("segflow-").tempdir()?;
            scratch.path().to_path_buf()
        }
    };

    let mut report = CompileReport::default();
    let mut jobs = Vec::new();
    for node in graph.nodes() {
        let Some(segment) = node.segment.as_deref() else { continue };
        if segment.is_compiled() {
            continue;
        }
        if let Some(reason) = segment.skip_reason() {
            warn!(segment = %node.name, "not fusing subgraph because {reason}");
            report.outcomes.insert(node.name.clone(), CompileOutcome::Skipped { reason });
            continue;
        }
        jobs.push(prepare_job(&root, &node.name, segment, constants));
    }
    if jobs.is_empty() {
        return Ok(report);
    }

    let workers = options.max_workers.unwrap_or_else(|| default_worker_count(options.memory_per_worker)).max(1);
    report.workers = workers;
    info!(segments = jobs.len(), workers, "compiling segments");
    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
    let results: Vec<(String, JobResult)> = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let result = run_job(job, options).unwrap_or_else(|err| JobResult::Failed {
                    reason: format!("{err:#}"),
                    log_excerpt: None,
                });
                (job.segment.clone(), result)
            })
            .collect()
    });

    for (name, result) in results {
        let outcome = match result {
            JobResult::Compiled { artifact, io_report } => {
                let applied = match &io_report {
                    Some(r) => apply_io_report(graph, &name, r),
                    None => Ok(()),
                };
                match applied {
                    Ok(()) => {
                        if let Some(segment) = graph.node_mut(&name).and_then(|n| n.segment.as_deref_mut()) {
                            info!(segment = %name, bytes = artifact.len(), "compiled segment");
                            segment.executable = Some(artifact);
                        }
                        CompileOutcome::Compiled
                    }
                    Err(reason) => CompileOutcome::Failed { reason, log_excerpt: None },
                }
            }
            JobResult::Failed { reason, log_excerpt } => CompileOutcome::Failed { reason, log_excerpt },
        };
        if let CompileOutcome::Failed { reason, log_excerpt } = &outcome {
            warn!(
                segment = %name,
                log = log_excerpt.as_deref().unwrap_or(""),
                "failed to compile subgraph: {reason}"
            );
        }
        report.outcomes.insert(name, outcome);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::OpKind;
    use crate::core::types::DataType;
    use crate::graph::Node;

    fn fused_graph(input_shape: &[usize]) -> Graph {
        let sub = Graph::from_nodes(vec![
            Node::new("seg/placeholder_0", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            Node::new("r", OpKind::Relu).with_inputs(&["seg/placeholder_0"]).unwrap(),
        ])
        .unwrap();
        let mut fused = Node::new("seg", OpKind::FusedSegment).with_inputs(&["x"]).unwrap();
        fused.segment = Some(Box::new(FusedSegment {
            graph: sub,
            input_names: vec![TensorRef::new("seg/placeholder_0", 0)],
            input_dtypes: vec![DataType::F32],
            input_shapes: vec![Shape::from_dims(input_shape)],
            output_names: vec![TensorRef::new("r", 0)],
            output_dtypes: vec![DataType::F32],
            output_shapes: vec![Shape::from_dims(&[2, 3])],
            ..Default::default()
        }));
        Graph::from_nodes(vec![
            Node::new("x", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            fused,
            Node::new("y", OpKind::Identity).with_inputs(&["seg"]).unwrap(),
        ])
        .unwrap()
    }

    fn stub(dir: &Path, body: &str) -> CompilerOptions {
        let script = dir.join("stub-compiler.sh");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        CompilerOptions {
            program: PathBuf::from("/bin/sh"),
            program_args: vec![script.to_string_lossy().into_owned()],
            workdir: Some(dir.join("work")),
            timeout: Duration::from_secs(30),
            max_workers: Some(2),
            grace_period: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn short_logs_are_surfaced_whole() {
        assert_eq!(extract_failure("boom\nbad op\n"), "boom\nbad op");
    }

    #[test]
    fn long_logs_are_cut_at_the_marker() {
        let mut log: Vec<String> = (0..30).map(|i| format!("progress {i}")).collect();
        log.push(format!("{FAILURE_MARKER}****"));
        log.push("ERROR: unsupported op Erf".into());
        log.push("Artifacts stored in /tmp/x".into());
        let text = extract_failure(&log.join("\n"));
        assert!(text.starts_with(FAILURE_MARKER));
        assert!(text.contains("unsupported op Erf"));
        assert!(!text.contains("Artifacts stored"));
        assert!(!text.contains("progress 3"));

        let unmarked: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
        assert_eq!(extract_failure(&unmarked.join("\n")).lines().count(), LOG_HEAD_LINES);
    }

    #[test]
    fn segments_without_full_shapes_are_skipped() {
        let mut g = fused_graph(&[2, 3]);
        if let Some(seg) = g.node_mut("seg").and_then(|n| n.segment.as_deref_mut()) {
            seg.input_shapes = vec![Shape::from_i64s(&[-1, 3])];
        }
        let report = compile_segments(&mut g, &CompilerOptions::default(), &ConstantStore::default()).unwrap();
        assert_eq!(
            report.outcomes.get("seg"),
            Some(&CompileOutcome::Skipped { reason: "input shapes are not fully defined".into() })
        );
    }

    #[test]
    fn io_config_lists_dims_and_dtype() {
        let g = fused_graph(&[2, 3]);
        let cfg = IoConfig::for_segment(g.node("seg").unwrap().segment.as_ref().unwrap());
        assert_eq!(cfg.inputs.get("seg/placeholder_0:0"), Some(&(vec![2, 3], "float32".to_string())));
        assert_eq!(cfg.outputs, vec!["r:0".to_string()]);
    }

    #[test]
    fn io_report_reorders_inputs_and_rewires_consumers() {
        let sub = Graph::from_nodes(vec![
            Node::new("s/placeholder_0", OpKind::Placeholder),
            Node::new("s/placeholder_1", OpKind::Placeholder),
            Node::new("m", OpKind::Mul).with_inputs(&["s/placeholder_0", "s/placeholder_1"]).unwrap(),
            Node::new("n", OpKind::Neg).with_inputs(&["m"]).unwrap(),
        ])
        .unwrap();
        let mut fused = Node::new("s", OpKind::FusedSegment).with_inputs(&["a", "b", "^c"]).unwrap();
        fused.segment = Some(Box::new(FusedSegment {
            graph: sub,
            input_names: vec![TensorRef::new("s/placeholder_0", 0), TensorRef::new("s/placeholder_1", 0)],
            input_dtypes: vec![DataType::F32, DataType::I32],
            input_shapes: vec![Shape::from_dims(&[1]), Shape::from_dims(&[2])],
            output_names: vec![TensorRef::new("m", 0), TensorRef::new("n", 0)],
            output_dtypes: vec![DataType::F32, DataType::F32],
            output_shapes: vec![Shape::from_dims(&[4]), Shape::from_dims(&[4])],
            ..Default::default()
        }));
        let mut g = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder),
            Node::new("b", OpKind::Placeholder),
            Node::new("c", OpKind::Other("NoOp".into())),
            fused,
            Node::new("out", OpKind::Identity).with_inputs(&["s:1"]).unwrap(),
        ])
        .unwrap();

        let report = IoReport {
            inputs: vec!["s/placeholder_1:0".into(), "s/placeholder_0:0".into()],
            outputs: vec!["n:0".into()],
            ..Default::default()
        };
        apply_io_report(&mut g, "s", &report).unwrap();
        let s = g.node("s").unwrap();
        assert_eq!(s.inputs.iter().map(|i| i.to_string()).collect::<Vec<_>>(), vec!["b", "a", "^c"]);
        let seg = s.segment.as_ref().unwrap();
        assert_eq!(seg.input_dtypes, vec![DataType::I32, DataType::F32]);
        assert_eq!(seg.output_names, vec![TensorRef::new("n", 0)]);
        assert_eq!(g.node("out").unwrap().data_inputs().next(), Some(&TensorRef::new("s", 0)));

        let dropped = IoReport { inputs: vec!["s/placeholder_1:0".into()], outputs: vec![], ..Default::default() };
        assert!(apply_io_report(&mut g, "s", &dropped).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn successful_compile_attaches_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let options = stub(dir.path(), r#"[ "$1" = compile ] || exit 2
[ -f "$2" ] || exit 3
printf 'artifact' > "$6""#);
        let mut g = fused_graph(&[2, 3]);
        let report = compile_segments(&mut g, &options, &ConstantStore::default()).unwrap();
        assert_eq!(report.compiled(), vec!["seg".to_string()]);
        let seg = g.node("seg").unwrap().segment.as_ref().unwrap();
        assert_eq!(seg.executable.as_deref(), Some(&b"artifact"[..]));
        assert!(dir.path().join("work/seg").join(GRAPH_FILE).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn failed_compile_persists_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let options = stub(dir.path(), "echo 'ERROR: unsupported op'\nexit 1");
        let mut g = fused_graph(&[2, 3]);
        let report = compile_segments(&mut g, &options, &ConstantStore::default()).unwrap();
        match report.outcomes.get("seg") {
            Some(CompileOutcome::Failed { log_excerpt, .. }) => {
                assert_eq!(log_excerpt.as_deref(), Some("ERROR: unsupported op"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let work = dir.path().join("work/seg");
        assert!(work.join(IO_CONFIG_FILE).is_file());
        assert!(work.join(ERROR_FILE).is_file());
        assert!(!g.node("seg").unwrap().segment.as_ref().unwrap().is_compiled());
    }

    #[cfg(unix)]
    #[test]
    fn hung_compiler_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = stub(dir.path(), "exec sleep 30");
        options.timeout = Duration::from_millis(200);
        let mut g = fused_graph(&[2, 3]);
        let started = Instant::now();
        let report = compile_segments(&mut g, &options, &ConstantStore::default()).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        match report.outcomes.get("seg") {
            Some(CompileOutcome::Failed { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn reused_workdir_does_not_leak_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let first = stub(dir.path(), r#"head -c 544 /dev/zero > "$6"
printf '{"inputs":["seg/placeholder_0:0"],"outputs":["r:0"]}' > io-report.json"#);
        let mut g = fused_graph(&[2, 3]);
        let report = compile_segments(&mut g, &first, &ConstantStore::default()).unwrap();
        assert_eq!(report.compiled(), vec!["seg".to_string()]);
        let work = dir.path().join("work/seg");
        assert!(work.join(ARTIFACT_FILE).is_file());

        let second = stub(dir.path(), "exit 0");
        let mut g = fused_graph(&[2, 3]);
        let report = compile_segments(&mut g, &second, &ConstantStore::default()).unwrap();
        assert_eq!(
            report.outcomes.get("seg"),
            Some(&CompileOutcome::Failed { reason: "compiler produced no artifact".into(), log_excerpt: None })
        );
        assert!(!work.join(ARTIFACT_FILE).exists());
        assert!(!work.join(IO_REPORT_FILE).exists());
        assert!(!g.node("seg").unwrap().segment.as_ref().unwrap().is_compiled());
    }

    #[test]
    fn segment_dirs_never_collide() {
        let root = Path::new("/work");
        let names = ["a/b", "a_b", "a%2Fb", "segment_0", "..", ".hidden"];
        let dirs: Vec<PathBuf> = names.iter().map(|n| segment_dir(root, n)).collect();
        for (i, d) in dirs.iter().enumerate() {
            assert_eq!(d.parent(), Some(root), "{} escapes the root", names[i]);
            assert!(dirs[i + 1..].iter().all(|other| other != d), "{} collides", names[i]);
        }
        assert_eq!(segment_dir(root, "segment_0"), root.join("segment_0"));
    }

    #[cfg(unix)]
    #[test]
    fn similarly_named_segments_keep_their_own_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let options = stub(dir.path(), r#"printf '%s' "$4" > "$6""#);
        let segment = |name: &str, out: &str| {
            let ph = format!("{name}/placeholder_0");
            let sub = Graph::from_nodes(vec![
                Node::new(ph.as_str(), OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
                Node::new(out, OpKind::Relu).with_inputs(&[ph.as_str()]).unwrap(),
            ])
            .unwrap();
            let mut fused = Node::new(name, OpKind::FusedSegment).with_inputs(&["x"]).unwrap();
            fused.segment = Some(Box::new(FusedSegment {
                graph: sub,
                input_names: vec![TensorRef::new(ph, 0)],
                input_dtypes: vec![DataType::F32],
                input_shapes: vec![Shape::from_dims(&[2])],
                output_names: vec![TensorRef::new(out, 0)],
                output_dtypes: vec![DataType::F32],
                output_shapes: vec![Shape::from_dims(&[2])],
                ..Default::default()
            }));
            fused
        };
        let mut g = Graph::from_nodes(vec![
            Node::new("x", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            segment("a/b", "first"),
            segment("a_b", "second"),
        ])
        .unwrap();
        let report = compile_segments(&mut g, &options, &ConstantStore::default()).unwrap();
        assert_eq!(report.compiled().len(), 2);
        let artifact = |name: &str| {
            let seg = g.node(name).unwrap().segment.as_ref().unwrap();
            String::from_utf8(seg.executable.clone().unwrap()).unwrap()
        };
        assert!(artifact("a/b").contains("first:0"));
        assert!(artifact("a_b").contains("second:0"));
    }

    #[cfg(unix)]
    #[test]
    fn erased_constants_reach_the_compiler() {
        let weights = crate::wire::TensorProto {
            dtype: DataType::F32.to_enum(),
            tensor_shape: Some(crate::tensor_util::shape_to_proto(&Shape::from_dims(&[2, 512]))),
            tensor_content: vec![1u8; 4096],
            ..Default::default()
        };
        let mut g = fused_graph(&[2, 3]);
        if let Some(seg) = g.node_mut("seg").and_then(|n| n.segment.as_deref_mut()) {
            let w = Node::new("w", OpKind::Const)
                .with_attr("dtype", AttrValue::Type(DataType::F32))
                .with_attr("value", AttrValue::Tensor(weights));
            seg.graph.add_node(w).unwrap();
        }
        let mut store = ConstantStore::default();
        if let Some(seg) = g.node_mut("seg").and_then(|n| n.segment.as_deref_mut()) {
            store = crate::constants::run_erase_large_constants(&mut seg.graph);
        }
        assert_eq!(store.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let options = stub(dir.path(), r#"[ $(wc -c < "$2") -gt 4096 ] || exit 4
printf 'artifact' > "$6""#);
        let report = compile_segments(&mut g, &options, &store).unwrap();
        assert_eq!(report.compiled(), vec!["seg".to_string()]);
        let seg = g.node("seg").unwrap().segment.as_ref().unwrap();
        let kept = seg.graph.node("w").unwrap().attr("value").and_then(AttrValue::as_tensor).unwrap();
        assert!(kept.tensor_content.is_empty());
    }
}
