//! Process registry tests: per-thread kills, global kills, shutdown.

#![cfg(unix)]

use std::time::{Duration, Instant};

use rankpipe_kernel::{
    Command, Error, ExitStatus, LaunchRequest, ManageConfig, OwnerHandle, Pipeline,
    PipelineOptions, ProcessRegistry, Signal, WorkList, kill_for_thread, launch, manage,
};

fn sleepers(registry: &ProcessRegistry, n: usize) -> Vec<rankpipe_kernel::Pid> {
    (0..n)
        .map(|_| {
            let launched = launch(LaunchRequest::new(["sleep", "30"])).expect("launch sleep");
            registry.register(launched.pid).expect("register");
            launched.pid
        })
        .collect()
}

#[test]
fn kill_for_thread_terminates_all_children() {
    let global = ProcessRegistry::global();
    let owner = OwnerHandle::current();
    let pids = sleepers(global, 4);
    assert_eq!(global.live_for(owner), {
        let mut sorted = pids.clone();
        sorted.sort();
        sorted
    });

    assert_eq!(kill_for_thread(owner), 4);

    let mut work = WorkList::new();
    for pid in &pids {
        work.wait(*pid);
    }
    let managed = manage(work, &ManageConfig::default(), global).unwrap();
    for pid in &pids {
        assert_eq!(managed.statuses[pid], ExitStatus::Signaled(15));
    }
    assert!(global.live_for(owner).is_empty(), "reaped children must be forgotten");
}

#[test]
fn kill_all_reaches_every_thread() {
    let registry = ProcessRegistry::new();
    let mine = sleepers(&registry, 2);
    let theirs = {
        let registry = registry.clone();
        std::thread::spawn(move || sleepers(&registry, 2)).join().unwrap()
    };
    assert_eq!(registry.live_count(), 4);

    assert_eq!(registry.kill_all(Signal::SIGKILL), 4);

    let mut work = WorkList::new();
    for pid in mine.iter().chain(&theirs) {
        work.wait(*pid);
    }
    let managed = manage(work, &ManageConfig::default(), &registry).unwrap();
    assert!(managed.statuses.values().all(|s| s.code() == -9));
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn kill_from_another_thread_during_communicate() {
    let registry = ProcessRegistry::new();
    let owner = OwnerHandle::current();
    let options = PipelineOptions::new().registry(registry.clone());
    let mut p = Pipeline::with_options(&Command::new("sleep").arg("30"), options).unwrap();

    let killer = {
        let registry = registry.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            registry.kill_for_thread(owner, Signal::SIGTERM)
        })
    };
    p.communicate().unwrap();
    assert_eq!(killer.join().unwrap(), 1);
    assert_eq!(p.poll(), Some(-15));
}

#[test]
fn shutdown_kills_and_refuses_launches() {
    let registry = ProcessRegistry::new();
    let options = PipelineOptions::new().registry(registry.clone());
    let mut running = Pipeline::with_options(&Command::new("sleep").arg("30"), options.clone()).unwrap();

    assert_eq!(registry.shutdown(), 1);
    assert!(matches!(running.communicate(), Err(Error::NoMoreProcesses)));
    assert_eq!(running.poll(), Some(-15));
    assert_eq!(registry.live_count(), 0);

    let refused = Pipeline::with_options(&Command::new("true"), options);
    assert!(matches!(refused, Err(Error::NoMoreProcesses)));
}

#[test]
fn shutdown_during_communicate_escalates_to_sigkill() {
    let registry = ProcessRegistry::new();
    let config = ManageConfig::default().with_kill_after(Duration::from_millis(300));
    let options = PipelineOptions::new().registry(registry.clone()).config(config);
    let stubborn = Command::new("sh").args(["-c", "trap '' TERM; sleep 3; echo finished"]);
    let mut p = Pipeline::with_options(&stubborn, options).unwrap();

    let interrupter = {
        let registry = registry.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            registry.shutdown()
        })
    };
    let started = Instant::now();
    let result = p.communicate().map(|captured| captured.clone());
    let elapsed = started.elapsed();

    assert_eq!(interrupter.join().unwrap(), 1);
    assert!(matches!(result, Err(Error::NoMoreProcesses)), "got {result:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(p.status(), Some(ExitStatus::Signaled(Signal::SIGKILL as i32)));
    assert_eq!(registry.live_count(), 0);
    assert!(!p.is_done());
}

#[test]
fn signalling_reaped_children_is_harmless() {
    let registry = ProcessRegistry::new();
    let options = PipelineOptions::new().registry(registry.clone());
    let mut p = Pipeline::with_options(&Command::new("true"), options).unwrap();
    p.communicate().unwrap();
    assert_eq!(registry.kill_all(Signal::SIGTERM), 0);
    p.terminate().unwrap();
    assert_eq!(p.poll(), Some(0));
}
