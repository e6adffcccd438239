// crates/piperuntime/tests/job_test.rs

mod common;

use common::{diamond, graph};
use pipecore::{qualified_var, Pipeline, PipelineError, Tool, ToolId, Value};
use piperuntime::{Job, KernelId, Next, TaskId, TaskState, Workspace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

fn compile(pipeline: &Pipeline, start: ToolId) -> Job {
    Job::compile(pipeline, start, &BTreeMap::new()).unwrap()
}

fn task_of(job: &Job, tool: ToolId) -> TaskId {
    job.tasks()
        .iter()
        .find(|t| t.tools.contains(&tool))
        .map(|t| t.id)
        .unwrap()
}

/// Every task is in exactly one of the four lists.
fn assert_partitioned(job: &Job) {
    let mut seen = HashSet::new();
    for list in [
        job.tasks_queued(),
        job.tasks_running(),
        job.tasks_complete(),
        job.tasks_errored(),
    ] {
        for task in list {
            assert!(seen.insert(*task), "task {} appears twice", task);
        }
    }
    assert_eq!(seen.len(), job.tasks().len());
}

#[test]
fn test_linear_chain_is_one_task() {
    let (pipeline, ids) = graph(&["A", "B", "C"], &[("A", "B"), ("B", "C")]);
    let job = compile(&pipeline, ids["A"]);

    assert_eq!(job.tasks().len(), 1);
    assert_eq!(job.tasks()[0].tools, vec![ids["A"], ids["B"], ids["C"]]);
    assert_eq!(job.executes().len(), 3);
    assert!(job.tasks()[0].dependencies.is_empty());
}

#[test]
fn test_diamond_splits_at_fork_and_join() {
    let (pipeline, ids) = diamond();
    let job = compile(&pipeline, ids["A"]);

    assert!(job.tasks().len() >= 3);
    let a = task_of(&job, ids["A"]);
    let b = task_of(&job, ids["B"]);
    let c = task_of(&job, ids["C"]);
    let d = task_of(&job, ids["D"]);

    assert_eq!(job.tasks()[a].tools, vec![ids["A"]]);
    assert_ne!(b, c);
    assert_eq!(job.tasks()[d].tools, vec![ids["D"]]);
    assert_eq!(job.tasks()[d].dependencies, BTreeSet::from([b, c]));
    assert_eq!(job.tasks()[b].dependencies, BTreeSet::from([a]));
    assert_eq!(job.tasks()[c].dependencies, BTreeSet::from([a]));

    let identity: BTreeSet<ToolId> = ["A", "B", "C", "D"].iter().map(|n| ids[*n]).collect();
    assert_eq!(job.identity(), &identity);
}

#[test]
fn test_join_with_outside_parent_starts_new_task() {
    let (pipeline, ids) = graph(&["A", "B", "C", "D"], &[("A", "B"), ("B", "D"), ("C", "D")]);
    let job = compile(&pipeline, ids["A"]);

    assert_eq!(job.tasks().len(), 2);
    assert_eq!(job.tasks()[0].tools, vec![ids["A"], ids["B"]]);
    assert_eq!(job.tasks()[1].tools, vec![ids["D"]]);
    assert_eq!(job.tasks()[1].dependencies, BTreeSet::from([0]));
    assert!(!job.identity().contains(&ids["C"]));
}

#[test]
fn test_unequal_paths_wait_for_every_parent() {
    let (pipeline, ids) = graph(
        &["A", "B", "C", "E", "D"],
        &[("A", "B"), ("A", "C"), ("C", "E"), ("E", "D"), ("B", "D")],
    );
    let job = compile(&pipeline, ids["A"]);

    let d = task_of(&job, ids["D"]);
    let e = task_of(&job, ids["E"]);
    let b = task_of(&job, ids["B"]);
    assert_eq!(task_of(&job, ids["C"]), e, "C and E form a chain");
    assert_eq!(job.tasks()[d].dependencies, BTreeSet::from([b, e]));
}

#[test]
fn test_paused_tool_stops_propagation() {
    let mut pipeline = Pipeline::new("paused");
    let a = pipeline.add_tool(Tool::new("A").with_output("out"));
    let b = pipeline.add_tool(Tool::new("B").with_input("in").with_output("out").paused());
    let c = pipeline.add_tool(Tool::new("C").with_input("in"));
    pipeline.connect(a, "out", b, "in").unwrap();
    pipeline.connect(b, "out", c, "in").unwrap();

    let job = compile(&pipeline, a);
    assert_eq!(job.identity(), &BTreeSet::from([a, b]));
    assert_eq!(job.tasks().len(), 1);
}

#[test]
fn test_zero_watcher_tool_is_single_task() {
    let (pipeline, ids) = graph(&["A"], &[]);
    let job = compile(&pipeline, ids["A"]);
    assert_eq!(job.tasks().len(), 1);
    assert_eq!(job.identity().len(), 1);
}

#[test]
fn test_unknown_start_is_rejected() {
    let (pipeline, _) = diamond();
    let missing = uuid::Uuid::new_v4();
    let err = Job::compile(&pipeline, missing, &BTreeMap::new()).unwrap_err();
    assert_eq!(err, PipelineError::ToolNotFound(missing));
}

#[test]
fn test_execute_snapshots_config_globals_and_ports() {
    let (mut pipeline, ids) = graph(&["A", "B"], &[("A", "B")]);
    pipeline
        .tool_mut(ids["B"])
        .unwrap()
        .config
        .insert("scale".to_string(), Value::Number(2.0));

    let mut globals = BTreeMap::new();
    globals.insert("run".to_string(), Value::from("nightly"));
    let job = Job::compile(&pipeline, ids["A"], &globals).unwrap();

    let exec = job.executes().iter().find(|e| e.tool == ids["B"]).unwrap();
    assert_eq!(exec.input_vars.get("run"), Some(&Value::from("nightly")));
    assert_eq!(
        exec.input_vars.get("config").and_then(|c| c.field("scale")),
        Some(Value::Number(2.0))
    );
    assert_eq!(exec.bindings.get("in0"), Some(&qualified_var(ids["A"], "out")));
    assert_eq!(exec.output_var_names, vec!["out".to_string()]);
    assert_eq!(
        exec.exports.get(&qualified_var(ids["B"], "out")),
        Some(&"out".to_string())
    );
    assert_eq!(exec.code, vec!["B".to_string()]);
}

#[test]
fn test_next_respects_dependencies_and_drains() {
    let (pipeline, ids) = diamond();
    let workspace = Workspace::new(pipeline.clone());
    let mut job = compile(&pipeline, ids["A"]);
    let total = job.tasks().len();

    let mut dispatched = Vec::new();
    loop {
        assert_partitioned(&job);
        match job.next(KernelId(0), &workspace) {
            Next::Dispatch(run) => {
                let deps = &job.tasks()[run.task].dependencies;
                for dep in deps {
                    assert_eq!(job.state_of(*dep), Some(TaskState::Complete));
                }
                assert_eq!(job.state_of(run.task), Some(TaskState::Running));
                dispatched.push(run.task);
                assert!(job.task_completed(run.task));
            }
            Next::Waiting => panic!("nothing is running, so nothing should wait"),
            Next::Drained => break,
        }
    }

    assert_eq!(dispatched.len(), total);
    assert_eq!(job.tasks_complete().len(), total);
    assert!(job.is_finished());
}

#[test]
fn test_next_waits_while_dependencies_run() {
    let (pipeline, ids) = diamond();
    let workspace = Workspace::new(pipeline.clone());
    let mut job = compile(&pipeline, ids["A"]);

    let first = match job.next(KernelId(0), &workspace) {
        Next::Dispatch(run) => run,
        other => panic!("expected dispatch, got {:?}", other),
    };
    assert_eq!(first.task, task_of(&job, ids["A"]));
    assert!(matches!(job.next(KernelId(0), &workspace), Next::Waiting));
    assert!(job.task_completed(first.task));
    assert!(matches!(job.next(KernelId(0), &workspace), Next::Dispatch(_)));
}

#[test]
fn test_failed_dependency_cascades_without_dispatch() {
    let (pipeline, ids) = graph(
        &["A", "B", "C", "D", "X"],
        &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
    );
    let workspace = Workspace::new(pipeline.clone());
    let mut job = compile(&pipeline, ids["A"]);

    let first = match job.next(KernelId(0), &workspace) {
        Next::Dispatch(run) => run,
        other => panic!("expected dispatch, got {:?}", other),
    };
    assert!(job.task_failed(first.task));

    assert!(matches!(job.next(KernelId(0), &workspace), Next::Drained));
    let skipped = job.take_skipped();
    assert_eq!(skipped.len(), job.tasks().len() - 1);
    assert_eq!(job.tasks_errored().len(), job.tasks().len());
    assert!(job.take_skipped().is_empty());
    assert_partitioned(&job);
}

#[test]
fn test_state_moves_only_forward() {
    let (pipeline, ids) = graph(&["A"], &[]);
    let workspace = Workspace::new(pipeline.clone());
    let mut job = compile(&pipeline, ids["A"]);

    assert!(!job.task_completed(0), "queued task cannot complete");
    let Next::Dispatch(run) = job.next(KernelId(0), &workspace) else {
        panic!("expected dispatch");
    };
    assert!(job.task_completed(run.task));
    assert!(!job.task_failed(run.task), "complete task cannot fail");
    assert_eq!(job.state_of(run.task), Some(TaskState::Complete));
}

#[test]
fn test_transfer_prepended_for_non_resident_parent() {
    let (pipeline, ids) = graph(&["A", "B", "C"], &[("A", "B"), ("A", "C")]);
    let mut workspace = Workspace::new(pipeline.clone());
    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), Value::Number(4.0));
    workspace.store_outputs(ids["A"], KernelId(0), outputs);

    let mut job = compile(&pipeline, ids["A"]);
    let Next::Dispatch(first) = job.next(KernelId(0), &workspace) else {
        panic!("expected dispatch");
    };
    job.task_completed(first.task);

    let Next::Dispatch(local) = job.next(KernelId(0), &workspace) else {
        panic!("expected dispatch");
    };
    assert!(local.transferred().is_empty());

    let Next::Dispatch(remote) = job.next(KernelId(1), &workspace) else {
        panic!("expected dispatch");
    };
    assert_eq!(remote.transferred(), vec![ids["A"]]);
    let transfer = &remote.executes[0];
    assert!(transfer.is_transfer());
    assert_eq!(
        transfer.input_vars.get(&qualified_var(ids["A"], "out")),
        Some(&Value::Number(4.0))
    );
    assert_eq!(remote.tools().len(), 1);
}

#[test]
fn test_compile_is_deterministic() {
    let (pipeline, ids) = diamond();
    let first = compile(&pipeline, ids["A"]);
    let second = compile(&pipeline, ids["A"]);

    assert_ne!(first.id(), second.id());
    assert_eq!(first.identity(), second.identity());
    assert_eq!(first.tasks(), second.tasks());
}

fn random_dag(rng: &mut StdRng, size: usize) -> (Pipeline, Vec<ToolId>) {
    let names: Vec<String> = (0..size).map(|i| format!("t{}", i)).collect();
    let mut edges = Vec::new();
    for j in 1..size {
        for i in 0..j {
            if rng.gen_bool(0.25) {
                edges.push((names[i].clone(), names[j].clone()));
            }
        }
    }
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let edge_refs: Vec<(&str, &str)> = edges
        .iter()
        .map(|(a, b)| (a.as_str(), b.as_str()))
        .collect();
    let (pipeline, ids) = graph(&name_refs, &edge_refs);
    let order = names.iter().map(|n| ids[n]).collect();
    (pipeline, order)
}

fn reachable(pipeline: &Pipeline, start: ToolId) -> BTreeSet<ToolId> {
    let mut seen = BTreeSet::from([start]);
    let mut stack = vec![start];
    while let Some(t) = stack.pop() {
        for w in pipeline.watchers(t) {
            if seen.insert(w) {
                stack.push(w);
            }
        }
    }
    seen
}

#[test]
fn test_random_dags_compile_consistently() {
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);

    for round in 0..200 {
        let size = rng.gen_range(2..12);
        let (pipeline, order) = random_dag(&mut rng, size);
        let start = order[rng.gen_range(0..size)];
        let job = compile(&pipeline, start);

        assert_eq!(job.identity(), &reachable(&pipeline, start), "round {}", round);

        let mut owner: HashMap<ToolId, TaskId> = HashMap::new();
        for task in job.tasks() {
            assert!(!task.tools.is_empty());
            for tool in &task.tools {
                assert!(owner.insert(*tool, task.id).is_none(), "tool compiled twice");
            }
        }

        for task in job.tasks() {
            for tool in &task.tools {
                for parent in pipeline.parents(*tool) {
                    let Some(&other) = owner.get(&parent) else {
                        continue;
                    };
                    assert!(other <= task.id, "parent compiled after child");
                    if other != task.id {
                        assert!(task.dependencies.contains(&other), "round {}", round);
                    }
                }
            }
            for dep in &task.dependencies {
                assert!(*dep < task.id);
            }
        }

        let again = compile(&pipeline, start);
        assert_eq!(job.tasks(), again.tasks());

        let workspace = Workspace::new(pipeline.clone());
        let mut job = job;
        let mut count = 0;
        while let Next::Dispatch(run) = job.next(KernelId(0), &workspace) {
            for dep in &job.tasks()[run.task].dependencies {
                assert_eq!(job.state_of(*dep), Some(TaskState::Complete));
            }
            job.task_completed(run.task);
            count += 1;
        }
        assert_eq!(count, job.tasks().len());
    }
}
