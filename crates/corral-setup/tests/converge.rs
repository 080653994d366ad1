//! End-to-end setup against a simulated three-node cluster.

use std::collections::HashMap;
use std::sync::Arc;

use corral_common::{ClusterError, ClusterTopology, NodeSpec, OsFamily, TopologyInput};
use corral_exec::{
    Credentials, DispatchOptions, DispatchStrategy, Dispatcher, ExecOutput, FanOut, MemoryCluster, Session,
    SimNode, Transport,
};
use corral_setup::{Deployer, StepContext, StepOutcome, StepRunner};

const POLICY: &str = "/etc/sudoers.d/corral-hpc";

fn topology() -> ClusterTopology {
    let spec = |ip: &str, name: &str, os: &str| NodeSpec {
        ip: ip.parse().unwrap(),
        name: name.into(),
        os_hint: Some(os.into()),
        cpus: Some(4),
        extra_addresses: vec![],
    };
    TopologyInput {
        master: spec("10.0.0.1", "A", "ubuntu"),
        workers: vec![spec("10.0.0.2", "B", "debian"), spec("10.0.0.3", "C", "rocky")],
        username: "hpc".into(),
    }
    .build(&HashMap::new())
    .unwrap()
}

fn packages_in(command: &str, verb: &str) -> Vec<String> {
    command
        .split(verb)
        .nth(1)
        .unwrap_or_default()
        .split_whitespace()
        .filter(|t| !t.starts_with('-'))
        .take_while(|t| !t.contains('>'))
        .map(|t| t.to_string())
        .collect()
}

fn path_after<'a>(command: &'a str, verb: &str) -> &'a str {
    command.split(verb).nth(1).unwrap_or_default().trim()
}

fn installed(sim: &SimNode, pkgs: &[String]) -> ExecOutput {
    if pkgs.iter().all(|p| sim.files.contains_key(&format!("pkg:{p}"))) {
        ExecOutput::ok("")
    } else {
        ExecOutput::failed(1, "not installed")
    }
}

/// A tiny fake shell: sudo, packages and directories backed by the file map.
async fn fake_cluster(topo: &ClusterTopology) -> MemoryCluster {
    let c = MemoryCluster::from_topology(topo);
    c.on_command("sudo -n true", |_, sim| {
        if sim.files.contains_key(POLICY) {
            ExecOutput::ok("")
        } else {
            ExecOutput::failed(1, "sudo: a password is required")
        }
    })
    .await;
    c.on_command("dpkg -s", |cmd, sim| installed(sim, &packages_in(cmd, "dpkg -s")))
        .await;
    c.on_command("rpm -q", |cmd, sim| installed(sim, &packages_in(cmd, "rpm -q")))
        .await;
    for verb in ["apt-get install", "dnf install"] {
        c.on_command(verb, move |cmd, sim| {
            for p in packages_in(cmd, verb) {
                sim.files.insert(format!("pkg:{p}"), Vec::new());
            }
            ExecOutput::ok("")
        })
        .await;
    }
    c.on_command("test -d", |cmd, sim| {
        if sim.files.contains_key(&format!("dir:{}", path_after(cmd, "test -d"))) {
            ExecOutput::ok("")
        } else {
            ExecOutput::failed(1, "")
        }
    })
    .await;
    c.on_command("mkdir -p", |cmd, sim| {
        sim.files.insert(format!("dir:{}", path_after(cmd, "mkdir -p")), Vec::new());
        ExecOutput::ok("")
    })
    .await;
    c
}

async fn context(topo: &ClusterTopology, cluster: &MemoryCluster, tag: &str) -> StepContext {
    let transport: Arc<dyn Transport> = Arc::new(cluster.clone());
    let fan_out: Arc<dyn FanOut> = Arc::new(cluster.clone());
    let dispatcher = Arc::new(
        Dispatcher::detect(transport, Some(fan_out), &topo.all_nodes(), DispatchOptions::default()).await,
    );
    let staging = std::env::temp_dir().join(format!("corral-e2e-{tag}-{}", std::process::id()));
    let deployer = Arc::new(Deployer::new(dispatcher.clone(), staging));
    let session = Arc::new(Session::new(Credentials::new("hpc", "secret"), dispatcher.clone()));
    StepContext::new(Arc::new(topo.clone()), dispatcher, deployer).with_session(session)
}

#[tokio::test]
async fn test_first_run_verifies_second_run_is_noop() {
    let topo = topology();
    assert_eq!(topo.workers[1].os_family, OsFamily::RhelLike);
    let cluster = fake_cluster(&topo).await;
    let ctx = context(&topo, &cluster, "noop").await;
    let runner = StepRunner::builtin();

    let first = runner.run_all(&ctx).await;
    assert!(first.all_ok(), "{:#?}", first.failures());
    assert_eq!(first.steps.len(), 9);
    for step in &first.steps {
        assert_eq!(step.count(StepOutcome::Verified), 3, "step {}", step.name);
    }

    let writes_after_first: Vec<u32> = {
        let mut w = Vec::new();
        for n in topo.nodes() {
            w.push(cluster.snapshot(n.ip).await.unwrap().writes);
        }
        w
    };

    let second = runner.run_all(&ctx).await;
    assert!(second.all_already_satisfied(), "{:#?}", second.steps);
    for step in &second.steps {
        assert_eq!(step.count(StepOutcome::AlreadySatisfied), 3, "step {}", step.name);
    }
    for (n, before) in topo.nodes().zip(writes_after_first) {
        assert_eq!(cluster.snapshot(n.ip).await.unwrap().writes, before);
    }

    let c = cluster.snapshot(topo.workers[1].ip).await.unwrap();
    assert!(c.files.contains_key("pkg:openmpi-devel"));
    assert!(c.commands.iter().any(|cmd| cmd.contains("dnf install")));
    let mca = c.file_string("~/.openmpi/mca-params.conf").unwrap();
    assert!(mca.contains("btl_tcp_if_include = 10.0.0.0/30"));
}

#[tokio::test]
async fn test_per_node_path_converges_identically() {
    let topo = topology();
    let parallel = fake_cluster(&topo).await;
    parallel.set_fan_out(true).await;
    let sequential = fake_cluster(&topo).await;

    let ctx_parallel = context(&topo, &parallel, "parallel").await;
    let ctx_sequential = context(&topo, &sequential, "sequential").await;
    assert_eq!(ctx_parallel.dispatcher.strategy(), DispatchStrategy::ParallelTool);
    assert_eq!(ctx_sequential.dispatcher.strategy(), DispatchStrategy::PerNode);

    let a = StepRunner::builtin().run_all(&ctx_parallel).await;
    let b = StepRunner::builtin().run_all(&ctx_sequential).await;
    assert!(a.all_ok() && b.all_ok());
    assert!(parallel.fan_out_calls().await > 0);

    for n in topo.nodes() {
        let pa = parallel.snapshot(n.ip).await.unwrap();
        let pb = sequential.snapshot(n.ip).await.unwrap();
        assert_eq!(pa.files, pb.files);
    }
}

#[tokio::test]
async fn test_conflicting_runtime_blocks_node() {
    let topo = topology();
    let cluster = fake_cluster(&topo).await;
    let c_ip = topo.workers[1].ip;
    cluster
        .update(c_ip, |s| {
            s.files.insert("pkg:mpich".into(), Vec::new());
        })
        .await;
    let ctx = context(&topo, &cluster, "conflict").await;
    let report = StepRunner::builtin().run_all(&ctx).await;

    assert!(!report.aborted());
    assert!(report.blocked.contains_key(&c_ip));
    let mpi = report.steps.iter().find(|s| s.name == "mpi-runtime").unwrap();
    assert!(matches!(
        mpi.nodes[2].error,
        Some(ClusterError::PackageManagerMismatch { .. })
    ));
    assert_eq!(mpi.count(StepOutcome::Verified), 2);
    for later in &report.steps[4..] {
        assert_eq!(later.nodes[2].outcome, StepOutcome::Blocked);
        assert_eq!(later.count(StepOutcome::Verified), 2);
    }

    let c = cluster.snapshot(c_ip).await.unwrap();
    assert!(c.files.contains_key("pkg:mpich"));
    assert!(!c.files.contains_key("pkg:openmpi"));
}

#[tokio::test]
async fn test_missing_privilege_aborts_before_mutation() {
    let topo = topology();
    let cluster = fake_cluster(&topo).await;
    let transport: Arc<dyn Transport> = Arc::new(cluster.clone());
    let dispatcher = Arc::new(Dispatcher::per_node(transport, DispatchOptions::default()));
    let deployer = Arc::new(Deployer::new(dispatcher.clone(), std::env::temp_dir().join("corral-e2e-nopriv")));
    let ctx = StepContext::new(Arc::new(topo.clone()), dispatcher, deployer);

    let report = StepRunner::builtin().run_all(&ctx).await;
    assert_eq!(report.aborted_at.as_deref(), Some("privilege-escalation"));
    assert_eq!(report.steps.len(), 1);
    assert!(matches!(
        report.steps[0].nodes[0].error,
        Some(ClusterError::PrivilegeDenied { .. })
    ));
    for n in topo.nodes() {
        assert_eq!(cluster.snapshot(n.ip).await.unwrap().writes, 0);
    }
}

#[tokio::test]
async fn test_unreachable_worker_is_isolated() {
    let topo = topology();
    let cluster = fake_cluster(&topo).await;
    let b_ip = topo.workers[0].ip;
    let ctx = context(&topo, &cluster, "unreachable").await;
    // sudo is already in place on B, so the fatal step passes there before it drops off
    cluster
        .update(b_ip, |s| {
            s.files.insert(POLICY.into(), Vec::new());
        })
        .await;

    let report = StepRunner::builtin().run_all(&ctx).await;
    assert!(report.all_ok());

    cluster.update(b_ip, |s| s.reachable = false).await;
    let report = StepRunner::builtin().run_all(&ctx).await;
    // the fatal step cannot reach B, so the run stops there
    assert_eq!(report.aborted_at.as_deref(), Some("privilege-escalation"));
    assert!(matches!(
        report.steps[0].nodes[1].error,
        Some(ClusterError::ConnectionFailed { .. })
    ));
}
