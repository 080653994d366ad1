//! Benchmark lifecycle against a real local child and a simulated cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corral_bench::{BenchmarkRunner, RunnerOptions};
use corral_common::{BenchmarkConfig, BenchmarkReport, ClusterTopology, LaunchMode, NodeSpec, TopologyInput};
use corral_exec::{DispatchOptions, Dispatcher, MemoryCluster};

fn topology() -> ClusterTopology {
    let spec = |ip: &str, name: &str| NodeSpec {
        ip: ip.parse().unwrap(),
        name: name.into(),
        os_hint: Some("ubuntu".into()),
        cpus: Some(2),
        extra_addresses: vec![],
    };
    TopologyInput {
        master: spec("10.0.0.1", "A"),
        workers: vec![spec("10.0.0.2", "B"), spec("10.0.0.3", "C")],
        username: "hpc".into(),
    }
    .build(&HashMap::new())
    .unwrap()
}

fn direct(name: &str, binary: &str, args: &[&str], timeout_sec: u64) -> BenchmarkConfig {
    BenchmarkConfig {
        name: name.into(),
        binary_path: binary.into(),
        launch_mode: LaunchMode::Direct,
        process_count: 0,
        args: args.iter().map(|a| a.to_string()).collect(),
        timeout_sec,
        description: None,
    }
}

async fn runner(cluster: &MemoryCluster, topo: &ClusterTopology) -> BenchmarkRunner {
    let dispatcher = Dispatcher::per_node(Arc::new(cluster.clone()), DispatchOptions::default());
    BenchmarkRunner::new(
        Arc::new(topo.clone()),
        Arc::new(dispatcher),
        RunnerOptions {
            grace: Duration::from_secs(1),
            ..RunnerOptions::default()
        },
    )
}

#[tokio::test]
async fn test_sleeping_binary_hits_deadline_and_is_swept() {
    let topo = topology();
    let cluster = MemoryCluster::from_topology(&topo);
    // what a hung distributed run leaves on each node
    for n in topo.nodes() {
        cluster
            .update(n.ip, |s| {
                s.processes = vec!["/bin/sleep 30".into(), "/usr/bin/prted --daemon".into()];
            })
            .await;
    }
    let mut runner = runner(&cluster, &topo).await;

    let start = Instant::now();
    let result = runner.run(&direct("sleepy", "/bin/sleep", &["30"], 1)).await;
    let elapsed = start.elapsed();

    assert!(!result.success);
    assert!(result.timed_out);
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(result.stderr.contains("exceeded its 1s deadline"));

    let sweep = runner.last_cleanup().unwrap();
    assert!(sweep.clean(), "{:?}", sweep);
    assert_eq!(sweep.remaining_total(), 0);
    assert!(sweep.patterns.iter().any(|p| p == "/bin/sleep"));
    for n in topo.nodes() {
        assert!(cluster.snapshot(n.ip).await.unwrap().processes.is_empty());
    }
}

#[tokio::test]
async fn test_run_all_keeps_order_and_exports() {
    let topo = topology();
    let cluster = MemoryCluster::from_topology(&topo);
    let mut runner = runner(&cluster, &topo).await;

    let configs = vec![
        direct("hello", "/bin/sh", &["-c", "echo hello"], 10),
        direct("broken", "/bin/sh", &["-c", "exit 7"], 10),
        direct("missing", "/nonexistent/bench", &[], 10),
    ];
    let results = runner.run_all(&configs).await;

    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["hello", "broken", "missing"]);
    assert!(results[0].success);
    assert_eq!(results[0].stdout, "hello\n");
    assert_eq!(results[1].exit_code, Some(7));
    assert!(!results[1].success);
    assert!(!results[2].success);
    assert_eq!(results[2].exit_code, None);
    assert_eq!(runner.results().len(), 3);

    let path = std::env::temp_dir()
        .join(format!("corral-export-{}", std::process::id()))
        .join("bench.json");
    runner.export(&path).await.unwrap();
    let report: BenchmarkReport = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(report.master, "A");
    assert_eq!(report.nodes.len(), 3);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.run_id, runner.run_id().to_string());
    assert!(!report.all_succeeded());
}
