use corral_bench::{Catalog, CleanupReport, SyncOutcome, SyncReport};
use corral_common::{BenchmarkResult, CommandStatus, Node, RemoteCommandResult};
use corral_exec::MeshReport;
use corral_setup::{DeployOutcome, DeployReport, StepOutcome, StepReport};

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

fn first_line(s: &str) -> &str {
    s.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

pub fn print_role(node: &Node) {
    println!("\n=== Corral Role ===");
    println!("  {:<12} {}", "Role", node.role);
    println!("  {:<12} {}", "Hostname", node.hostname);
    println!("  {:<12} {}", "Address", node.ip);
    println!("  {:<12} {:?}", "OS family", node.os_family);
    println!("  {:<12} {}", "CPUs", node.cpu_count);
    println!();
}

pub fn print_mesh(report: &MeshReport) {
    println!("\n=== Corral Mesh ===\n");
    println!(
        "  {:<3} {:<20} {:<16} {:<8} {:<10} {:<12} {:<6}",
        "", "Node", "Address", "Key", "Authorized", "Known hosts", "Sudo"
    );
    println!("  {:-<80}", "");
    for n in &report.nodes {
        println!(
            "  {:<3} {:<20} {:<16} {:<8} {:<10} {:<12} {:<6}",
            mark(n.complete()),
            n.node,
            n.ip,
            mark(n.public_key),
            mark(n.authorized_keys),
            mark(n.known_hosts),
            mark(n.sudo_policy)
        );
        for e in &n.errors {
            println!("        {}", e);
        }
    }
    println!();
}

pub fn print_step_report(report: &StepReport) {
    println!("\n=== Corral Setup ===\n");
    println!(
        "  {:<4} {:<28} {:>9} {:>9} {:>7} {:>8}",
        "ID", "Step", "Satisfied", "Verified", "Failed", "Blocked"
    );
    println!("  {:-<70}", "");
    for step in &report.steps {
        let failed = step.nodes.len()
            - step.count(StepOutcome::AlreadySatisfied)
            - step.count(StepOutcome::Verified)
            - step.count(StepOutcome::Blocked);
        println!(
            "  {:<4} {:<28} {:>9} {:>9} {:>7} {:>8}",
            step.id,
            step.name,
            step.count(StepOutcome::AlreadySatisfied),
            step.count(StepOutcome::Verified),
            failed,
            step.count(StepOutcome::Blocked)
        );
    }

    let failures = report.failures();
    let failures: Vec<_> = failures
        .into_iter()
        .filter(|(_, n)| n.outcome != StepOutcome::Blocked)
        .collect();
    if !failures.is_empty() {
        println!("\n[Failures]");
        for (step, n) in failures {
            let reason = n
                .error
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| n.detail.clone())
                .unwrap_or_default();
            println!("  ✗ {:<24} {:<20} {:<14} {}", step.name, n.node, n.outcome.as_str(), reason);
        }
    }

    if !report.blocked.is_empty() {
        println!("\n[Blocked nodes]");
        for (ip, reason) in &report.blocked {
            println!("  {:<16} {}", ip, reason);
        }
    }

    match &report.aborted_at {
        Some(step) => println!("\nAborted at step: {}", step),
        None if report.all_already_satisfied() => println!("\nCluster already converged."),
        None if report.all_ok() => println!("\nAll steps verified."),
        None => println!("\nCompleted with failures."),
    }
    println!();
}

pub fn print_deploy(reports: &[DeployReport]) {
    println!("\n=== Corral Deploy ===\n");
    println!("  {:<3} {:<24} {:<20} {:<16} {:<12}", "", "Template", "Node", "Address", "Outcome");
    println!("  {:-<80}", "");
    for report in reports {
        for n in &report.nodes {
            let outcome = match &n.outcome {
                DeployOutcome::Verified => "verified".to_string(),
                DeployOutcome::Repaired => "repaired".to_string(),
                DeployOutcome::Degraded { error } => format!("degraded: {}", error),
                DeployOutcome::Failed { reason } => format!("failed: {}", first_line(reason)),
            };
            println!(
                "  {:<3} {:<24} {:<20} {:<16} {}",
                mark(n.outcome.ok()),
                report.template.as_str(),
                n.node,
                n.ip,
                outcome
            );
        }
    }
    println!();
}

pub fn print_exec(results: &[RemoteCommandResult]) {
    for r in results {
        let status = match r.status {
            CommandStatus::Completed => format!("exit {}", r.exit_code),
            CommandStatus::ConnectionFailed => "connection failed".to_string(),
            CommandStatus::TimedOut => "timed out".to_string(),
        };
        println!("\n=== {} ({}) [{}, {}ms] ===", r.node, r.ip, status, r.duration_ms);
        if !r.stdout.is_empty() {
            print!("{}", r.stdout);
            if !r.stdout.ends_with('\n') {
                println!();
            }
        }
        if !r.stderr.is_empty() {
            eprint!("{}", r.stderr);
            if !r.stderr.ends_with('\n') {
                eprintln!();
            }
        }
    }
    let ok = results.iter().filter(|r| r.success()).count();
    println!("\n{}/{} nodes succeeded", ok, results.len());
}

pub fn print_benchmarks(catalog: &Catalog) {
    println!("\n=== Corral Benchmarks ===\n");
    if catalog.is_empty() {
        println!("No benchmarks configured.");
        return;
    }
    println!(
        "{:<20} {:<15} {:>9} {:>9}  {:<40}",
        "Name", "Launch", "Processes", "Timeout", "Binary"
    );
    println!("{:-<100}", "");
    for b in catalog.iter() {
        let procs = if b.process_count == 0 {
            "all".to_string()
        } else {
            b.process_count.to_string()
        };
        println!(
            "{:<20} {:<15} {:>9} {:>8}s  {:<40}",
            b.name,
            format!("{:?}", b.launch_mode),
            procs,
            b.timeout_sec,
            b.binary_path
        );
        if let Some(desc) = &b.description {
            println!("  {}", desc);
        }
    }
    println!();
}

pub fn print_sync(report: &SyncReport) {
    println!("\n=== Corral Sync ===\n");
    println!("  {:<3} {:<20} {:<16} {:<40} {:<12}", "", "Node", "Address", "Binary", "Outcome");
    println!("  {:-<100}", "");
    for e in &report.entries {
        let (ok, outcome) = match &e.outcome {
            SyncOutcome::Unchanged => (true, "unchanged".to_string()),
            SyncOutcome::Transferred => (true, "transferred".to_string()),
            SyncOutcome::Failed { reason } => (false, format!("failed: {}", first_line(reason))),
        };
        println!("  {:<3} {:<20} {:<16} {:<40} {}", mark(ok), e.node, e.ip, e.binary, outcome);
    }
    println!("\n{} transferred, {} failed", report.transferred(), report.failed().len());
    println!();
}

pub fn print_results(results: &[BenchmarkResult]) {
    println!("\n=== Corral Results ===\n");
    println!(
        "  {:<3} {:<20} {:>6} {:>10} {:>9}  {:<10}",
        "", "Benchmark", "Exit", "Duration", "Processes", "Note"
    );
    println!("  {:-<70}", "");
    for r in results {
        let exit = r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        let note = if r.timed_out { "timed out" } else { "" };
        println!(
            "  {:<3} {:<20} {:>6} {:>9.1}s {:>9}  {:<10}",
            mark(r.success),
            r.name,
            exit,
            r.duration_ms as f64 / 1000.0,
            r.processes,
            note
        );
        if !r.success {
            let line = first_line(&r.stderr);
            if !line.is_empty() {
                println!("        {}", line);
            }
        }
    }
    println!();
}

pub fn print_cleanup(report: &CleanupReport) {
    println!("\n=== Corral Cleanup ===\n");
    println!("  Patterns: {}", report.patterns.join(", "));
    println!("  {:<3} {:<20} {:<16} {:>9}", "", "Node", "Address", "Remaining");
    println!("  {:-<60}", "");
    for n in &report.nodes {
        let remaining = n.remaining.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string());
        println!(
            "  {:<3} {:<20} {:<16} {:>9}",
            mark(n.remaining == Some(0)),
            n.node,
            n.ip,
            remaining
        );
        if let Some(e) = &n.error {
            println!("        {}", first_line(e));
        }
    }
    println!();
}
