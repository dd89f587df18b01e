use crate::{
    collector::Instance,
    config::{RunConfiguration, SolverEngine},
    ingest::{parse_solver_output, IngestError},
    results::ResultRecord,
    sync::{CancelToken, ChildRegistry},
};
use std::{
    collections::HashSet,
    fs,
    io::Read,
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, trace};
use wait_timeout::ChildExt;

/// wake interval of the supervision loop, every wake takes one memory
/// sample of the solver process tree
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn solver for {instance}: {source}")]
    Spawn {
        instance: String,
        source: std::io::Error,
    },
    #[error("solver for {instance} failed with {status}: {stderr}")]
    SolverFailed {
        instance: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("solver output for {instance} violates the output protocol: {source}")]
    Protocol {
        instance: String,
        source: IngestError,
    },
    #[error("failed to wait on solver for {instance}: {source}")]
    Wait {
        instance: String,
        source: std::io::Error,
    },
    #[error("run for {instance} was cancelled")]
    Cancelled { instance: String },
}

/// deterministic argument list for one instance, options that are off or
/// unset are omitted entirely so the command line is reproducible from the
/// configuration alone
pub fn command_args(run: &RunConfiguration, instance: &Instance) -> Vec<String> {
    let mut args = vec![
        instance.path.to_string_lossy().to_string(),
        run.method.as_arg().to_string(),
    ];

    if let Some(bound) = instance.upper_bound {
        args.push("-ub".to_string());
        args.push(bound.to_string());
    }

    if let Some(limit) = run.time_limit {
        args.push("-t".to_string());
        args.push(limit.to_string());
    }

    if run.incremental {
        args.push("-i".to_string());

        if let Some(ref var) = run.incremental_var {
            args.push("-v".to_string());
            args.push(var.clone());
        }
    }

    if run.symmetry_breaking {
        args.push("--use-symmetry-breaking".to_string());
    }

    if run.heuristics {
        args.push("--use-heuristics".to_string());
    }

    if run.engine != SolverEngine::default() {
        args.push("--solver".to_string());
        args.push(run.engine.as_arg().to_string());
    }

    args
}

/// Source of memory information for a process and its descendants.
/// Production reads procfs, tests substitute a fake.
pub trait ProcessMemory {
    /// resident set size in bytes, `None` once the process is gone
    fn rss_bytes(&self, pid: u32) -> Option<u64>;
    /// pids of the direct children currently alive
    fn children(&self, pid: u32) -> Vec<u32>;
}

pub struct ProcfsMemory {
    page_size: u64,
}

impl ProcfsMemory {
    pub fn new() -> Self {
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|size| size as u64)
            .unwrap_or(4096);

        Self { page_size }
    }
}

impl Default for ProcfsMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemory for ProcfsMemory {
    fn rss_bytes(&self, pid: u32) -> Option<u64> {
        let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let rss_pages = statm.split_whitespace().nth(1)?.parse::<u64>().ok()?;

        Some(rss_pages * self.page_size)
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let mut children = Vec::new();

        // every thread of the process may have forked on its own
        let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
            return children;
        };
        for task in tasks.filter_map(Result::ok) {
            let path = task.path().join("children");
            if let Ok(list) = fs::read_to_string(path) {
                children
                    .extend(list.split_whitespace().filter_map(|pid| pid.parse::<u32>().ok()));
            }
        }

        children
    }
}

/// one instantaneous sample: resident memory of the process plus all live
/// descendants, transitively
///
/// A descendant that exits between enumeration and sampling is simply
/// excluded from the sample.
pub fn process_tree_rss(memory: &impl ProcessMemory, root: u32) -> u64 {
    let mut total = 0;
    let mut visited = HashSet::new();
    let mut pending = vec![root];

    while let Some(pid) = pending.pop() {
        if !visited.insert(pid) {
            continue;
        }

        if let Some(rss) = memory.rss_bytes(pid) {
            total += rss;
        }
        pending.extend(memory.children(pid));
    }

    total
}

/// Run one instance under supervision: spawn the solver, sample the peak
/// memory of its process tree while it lives and classify the exit.
///
/// Any non-success exit is fatal for the whole batch, a crashed solver or a
/// malformed command line is a configuration bug and not transient noise.
pub fn supervise(
    instance: &Instance,
    run: &RunConfiguration,
    cancel: &CancelToken,
    registry: &ChildRegistry,
    memory: &impl ProcessMemory,
) -> Result<ResultRecord, RunError> {
    info!("Solving {}", instance.path.to_string_lossy());

    let mut child = Command::new(&run.solver_exec)
        .args(command_args(run, instance))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RunError::Spawn {
            instance: instance.name.clone(),
            source,
        })?;
    let pid = child.id();
    registry.register(&instance.name, pid);

    // drain both pipes while the solver runs, a solver chatty enough to
    // fill a pipe buffer would otherwise block mid-write and never exit
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let mut peak_rss = 0;
    let status = loop {
        match child.wait_timeout(SAMPLE_INTERVAL) {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if cancel.is_cancelled() {
                    debug!("Cancelling in-flight solver for {}", instance.name);
                    let _ = child.kill();
                    let _ = child.wait();
                    registry.deregister(&instance.name);

                    return Err(RunError::Cancelled {
                        instance: instance.name.clone(),
                    });
                }

                // the sample lands only while the child is alive, peaks
                // between the last sample and exit are missed by design
                peak_rss = peak_rss.max(process_tree_rss(memory, pid));
            }
            Err(source) => {
                registry.deregister(&instance.name);

                return Err(RunError::Wait {
                    instance: instance.name.clone(),
                    source,
                });
            }
        }
    };
    registry.deregister(&instance.name);

    // the child exited, both pipes are at EOF and the readers are done
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    trace!("Output: {stdout}");

    if !status.success() {
        return Err(RunError::SolverFailed {
            instance: instance.name.clone(),
            status,
            stderr,
        });
    }

    let stats = parse_solver_output(&stdout).map_err(|source| RunError::Protocol {
        instance: instance.name.clone(),
        source,
    })?;

    Ok(ResultRecord::from_run(instance, stats, peak_rss))
}

fn spawn_pipe_reader(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();

        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer);
        }

        buffer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolvingMethod;
    use std::{collections::HashMap, path::PathBuf};

    struct FakeMemory {
        rss: HashMap<u32, u64>,
        children: HashMap<u32, Vec<u32>>,
    }

    impl ProcessMemory for FakeMemory {
        fn rss_bytes(&self, pid: u32) -> Option<u64> {
            self.rss.get(&pid).copied()
        }

        fn children(&self, pid: u32) -> Vec<u32> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }
    }

    fn instance(path: &str) -> Instance {
        Instance {
            name: PathBuf::from(path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string(),
            path: PathBuf::from(path),
            upper_bound: None,
        }
    }

    fn run_configuration(solver_exec: PathBuf) -> RunConfiguration {
        RunConfiguration {
            solver_exec,
            method: SolvingMethod::OneVarLess,
            time_limit: None,
            incremental: false,
            incremental_var: None,
            symmetry_breaking: false,
            heuristics: false,
            engine: SolverEngine::Cadical,
        }
    }

    /// write an executable stub standing in for the solver binary
    fn stub_solver(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("bcp");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    #[test]
    fn tree_sample_sums_live_descendants() {
        let memory = FakeMemory {
            rss: HashMap::from([(1, 100), (2, 10), (4, 1)]),
            children: HashMap::from([(1, vec![2, 3]), (2, vec![4])]),
        };

        // pid 3 exited between enumeration and sampling and is skipped
        assert_eq!(process_tree_rss(&memory, 1), 111);
    }

    #[test]
    fn tree_sample_of_a_dead_root_is_zero() {
        let memory = FakeMemory {
            rss: HashMap::new(),
            children: HashMap::new(),
        };

        assert_eq!(process_tree_rss(&memory, 42), 0);
    }

    #[test]
    fn tree_sample_tolerates_pid_cycles() {
        // pid reuse can make the parent relation momentarily cyclic
        let memory = FakeMemory {
            rss: HashMap::from([(1, 5), (2, 7)]),
            children: HashMap::from([(1, vec![2]), (2, vec![1])]),
        };

        assert_eq!(process_tree_rss(&memory, 1), 12);
    }

    #[test]
    fn minimal_configuration_builds_a_minimal_command_line() {
        let run = run_configuration(PathBuf::from("./bcp"));
        let args = command_args(&run, &instance("./dataset/a.cnf"));

        assert_eq!(args, vec!["./dataset/a.cnf", "one-var-less"]);
    }

    #[test]
    fn every_enabled_option_appears_in_order() {
        let mut run = run_configuration(PathBuf::from("./bcp"));
        run.time_limit = Some(60);
        run.incremental = true;
        run.incremental_var = Some("x1".to_string());
        run.symmetry_breaking = true;
        run.heuristics = true;
        run.engine = SolverEngine::Kissat;

        let mut with_bound = instance("./dataset/a.cnf");
        with_bound.upper_bound = Some(12);

        assert_eq!(
            command_args(&run, &with_bound),
            vec![
                "./dataset/a.cnf",
                "one-var-less",
                "-ub",
                "12",
                "-t",
                "60",
                "-i",
                "-v",
                "x1",
                "--use-symmetry-breaking",
                "--use-heuristics",
                "--solver",
                "kissat",
            ]
        );
    }

    #[test]
    fn successful_run_yields_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let solver = stub_solver(
            dir.path(),
            "printf 'status: 2\\nencoding_time: 1.5\\nclauses: 10\\n'",
        );

        let run = run_configuration(solver);
        let registry = ChildRegistry::default();
        let record = supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &CancelToken::default(),
            &registry,
            &ProcfsMemory::new(),
        )
        .unwrap();

        assert_eq!(record.name(), "a.cnf");
        assert_eq!(record.status_label(), Some("OPTIMAL"));
        assert!(record.numeric("memory_usage").is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn procfs_lists_spawned_children_by_pid() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();

        let children = ProcfsMemory::new().children(std::process::id());
        assert!(children.contains(&child.id()));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn chatty_solver_output_is_drained_while_it_runs() {
        let dir = tempfile::tempdir().unwrap();
        // 2MB of ignorable banner lines, far beyond any pipe buffer
        let solver = stub_solver(
            dir.path(),
            "yes 'c banner line' | head -c 2097152\necho\nprintf 'status: 1\\ntime_used: 4\\n'",
        );

        let run = run_configuration(solver);
        let record = supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &CancelToken::default(),
            &ChildRegistry::default(),
            &ProcfsMemory::new(),
        )
        .unwrap();

        assert_eq!(record.status_label(), Some("SATISFIABLE"));
        assert_eq!(record.numeric("time_used"), Some(4.0));
    }

    #[test]
    fn peak_memory_is_sampled_while_the_solver_lives() {
        let dir = tempfile::tempdir().unwrap();
        let solver = stub_solver(dir.path(), "sleep 0.5\nprintf 'status: 1\\n'");

        let run = run_configuration(solver);
        let record = supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &CancelToken::default(),
            &ChildRegistry::default(),
            &ProcfsMemory::new(),
        )
        .unwrap();

        // several samples landed, the shell alone has a nonzero rss
        assert!(record.numeric("memory_usage").unwrap() > 0.0);
    }

    #[test]
    fn nonzero_exit_is_fatal_and_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let solver = stub_solver(dir.path(), "echo 'broken flags' >&2\nexit 3");

        let run = run_configuration(solver);
        match supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &CancelToken::default(),
            &ChildRegistry::default(),
            &ProcfsMemory::new(),
        ) {
            Err(RunError::SolverFailed {
                instance, stderr, ..
            }) => {
                assert_eq!(instance, "a.cnf");
                assert!(stderr.contains("broken flags"));
            }
            other => panic!("expected a fatal solver failure, got {other:?}"),
        }
    }

    #[test]
    fn protocol_violations_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let solver = stub_solver(dir.path(), "printf 'status: 7\\n'");

        let run = run_configuration(solver);
        match supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &CancelToken::default(),
            &ChildRegistry::default(),
            &ProcfsMemory::new(),
        ) {
            Err(RunError::Protocol { source, .. }) => {
                assert!(matches!(source, IngestError::UnknownStatusCode(7)));
            }
            other => panic!("expected a protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_kills_the_child_at_the_next_wake() {
        let dir = tempfile::tempdir().unwrap();
        let solver = stub_solver(dir.path(), "sleep 30\nprintf 'status: 1\\n'");

        let run = run_configuration(solver);
        let cancel = CancelToken::default();
        cancel.cancel();

        let start = std::time::Instant::now();
        let registry = ChildRegistry::default();
        let result = supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &cancel,
            &registry,
            &ProcfsMemory::new(),
        );

        assert!(matches!(result, Err(RunError::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn spawn_failures_name_the_instance() {
        let run = run_configuration(PathBuf::from("/nonexistent/bcp"));
        let result = supervise(
            &instance("./dataset/a.cnf"),
            &run,
            &CancelToken::default(),
            &ChildRegistry::default(),
            &ProcfsMemory::new(),
        );

        match result {
            Err(RunError::Spawn { instance, .. }) => assert_eq!(instance, "a.cnf"),
            other => panic!("expected a spawn failure, got {other:?}"),
        }
    }
}
