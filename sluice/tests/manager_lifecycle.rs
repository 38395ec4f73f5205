//! Manager-level lifecycle tests: add/reserve/complete, dependencies,
//! retries, behaviours, persistence failure and the scheduler bridge.

use std::sync::Arc;
use std::time::Duration;

use sluice::{
    Accounting, Action, Behaviour, Behaviours, Dependency, Error, JobSpec, JobState, Manager,
    ManagerConfig, Trigger, CMDS_QUEUE,
};
use sluice_testkit::{MemoryStore, MockScheduler, RecordingRunner, RunnerCall};

fn test_config() -> ManagerConfig {
    ManagerConfig::default().with_release_backoff(Duration::ZERO)
}

struct Harness {
    manager: Arc<Manager>,
    store: MemoryStore,
    scheduler: MockScheduler,
    runner: RecordingRunner,
}

fn harness_with(cfg: ManagerConfig) -> Harness {
    let store = MemoryStore::new();
    let scheduler = MockScheduler::new();
    let runner = RecordingRunner::new();
    let manager = Manager::with_action_runner(
        cfg,
        Arc::new(store.clone()),
        Arc::new(scheduler.clone()),
        Arc::new(runner.clone()),
    );
    Harness {
        manager,
        store,
        scheduler,
        runner,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn success() -> Accounting {
    Accounting {
        exit_code: 0,
        peak_ram_mb: 100,
        cpu_time: Duration::from_secs(1),
        walltime: Duration::from_secs(2),
        host: "node1".to_string(),
        pid: 1234,
    }
}

fn failure(exit_code: i32) -> Accounting {
    Accounting {
        exit_code,
        ..success()
    }
}

#[tokio::test]
async fn add_reserve_complete_round_trip() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let spec = JobSpec::new("echo hi", "/tmp").with_retries(3);
    let added = h
        .manager
        .add_jobs(&handle, vec![spec], false)
        .await
        .unwrap();
    assert_eq!(added.len(), 1);
    assert!(!added[0].already_existed);
    let key = added[0].key.clone();

    let job = h
        .manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    assert_eq!(job.key, key);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.state, JobState::Reserved);
    // a throwaway working directory is assigned on first reservation
    let actual_cwd = job.actual_cwd.clone().unwrap();
    assert!(actual_cwd.starts_with("/tmp/"));
    assert!(actual_cwd.ends_with("/cwd"));

    h.manager
        .complete_job(&handle, &key, success(), "hi\n", "")
        .await
        .unwrap();

    let jobs = h.manager.get_by_keys(&handle, &[key.clone()]);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Complete);
    assert_eq!(jobs[0].exit_code, 0);
    assert_eq!(jobs[0].host, "node1");
    assert_eq!(h.store.complete_count(), 1);
    assert_eq!(h.store.live_count(), 0);
}

#[tokio::test]
async fn duplicate_add_only_updates_rep_group() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let first = JobSpec::new("echo hi", "/tmp").with_rep_group("first");
    let added = h
        .manager
        .add_jobs(&handle, vec![first], false)
        .await
        .unwrap();
    let key = added[0].key.clone();

    let again = JobSpec::new("echo hi", "/tmp")
        .with_rep_group("second")
        .with_priority(250);
    let added = h
        .manager
        .add_jobs(&handle, vec![again], false)
        .await
        .unwrap();
    assert!(added[0].already_existed);
    assert_eq!(added[0].key, key);

    let jobs = h.manager.get_by_keys(&handle, &[key]);
    assert_eq!(jobs[0].rep_group, "second");
    // the original submission's ordering is untouched
    assert_eq!(jobs[0].priority, 0);
    assert!(h
        .manager
        .get_by_rep_group(&handle, "first", 0, None)
        .is_empty());
}

#[tokio::test]
async fn dependency_chain_runs_in_order() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let spec_a = JobSpec::new("echo a", "/tmp");
    let key_a = spec_a.key();
    let spec_b = JobSpec::new("echo b", "/tmp")
        .with_dependencies(vec![Dependency::Key(key_a.clone())]);

    h.manager
        .add_jobs(&handle, vec![spec_a, spec_b], false)
        .await
        .unwrap();

    let job = h
        .manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    assert_eq!(job.key, key_a);

    // b stays blocked while a runs
    assert!(h
        .manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .is_none());

    h.manager
        .complete_job(&handle, &key_a, success(), "", "")
        .await
        .unwrap();

    let job = h
        .manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    assert_eq!(job.cmd, "echo b");
}

#[tokio::test]
async fn retry_exhaustion_buries_then_kick_restores() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let spec = JobSpec::new("false", "/tmp").with_retries(1);
    let added = h
        .manager
        .add_jobs(&handle, vec![spec], false)
        .await
        .unwrap();
    let key = added[0].key.clone();

    // first failure: released back to ready with one attempt left
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    h.manager
        .release(&handle, &key, "exited 1", Some(failure(1)))
        .unwrap();
    let job = &h.manager.get_by_keys(&handle, &[key.clone()])[0];
    assert_eq!(job.state, JobState::Ready);
    assert_eq!(job.until_buried, 1);

    // second failure: buried, attempts within the retry cap
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    h.manager
        .release(&handle, &key, "exited 1", Some(failure(1)))
        .unwrap();
    let job = &h.manager.get_by_keys(&handle, &[key.clone()])[0];
    assert_eq!(job.state, JobState::Buried);
    assert!(job.attempts <= job.retries + 1);

    // kick restores a full budget
    h.manager.kick(&handle, &key).unwrap();
    let job = &h.manager.get_by_keys(&handle, &[key.clone()])[0];
    assert_eq!(job.state, JobState::Ready);
    assert_eq!(job.until_buried, 2);
}

#[tokio::test]
async fn behaviours_fire_in_outcome_then_exit_order() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let behaviours = Behaviours::new(vec![
        Behaviour::new(Trigger::ON_SUCCESS, Action::Run("echo A".to_string())),
        Behaviour::new(Trigger::ON_FAILURE, Action::Run("echo B".to_string())),
        Behaviour::new(Trigger::ON_EXIT, Action::Run("echo C".to_string())),
    ]);

    // success: A then C
    let spec = JobSpec::new("true", "/tmp").with_behaviours(behaviours.clone());
    let added = h
        .manager
        .add_jobs(&handle, vec![spec], false)
        .await
        .unwrap();
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    h.manager
        .complete_job(&handle, &added[0].key, success(), "", "")
        .await
        .unwrap();
    let commands: Vec<String> = h
        .runner
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RunnerCall::Shell { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(commands, ["echo A", "echo C"]);

    // failure: B then C
    h.runner.clear();
    let spec = JobSpec::new("false", "/tmp").with_behaviours(behaviours);
    let added = h
        .manager
        .add_jobs(&handle, vec![spec], false)
        .await
        .unwrap();
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    h.manager
        .complete_job(&handle, &added[0].key, failure(2), "", "")
        .await
        .unwrap();
    let commands: Vec<String> = h
        .runner
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RunnerCall::Shell { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(commands, ["echo B", "echo C"]);
}

#[tokio::test]
async fn cleanup_never_touches_a_cwd_that_matters() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let behaviours = Behaviours::new(vec![Behaviour::new(Trigger::ON_EXIT, Action::CleanupAll)]);
    let spec = JobSpec::new("true", "/data/project")
        .with_cwd_matters(true)
        .with_behaviours(behaviours.clone());
    let added = h
        .manager
        .add_jobs(&handle, vec![spec], false)
        .await
        .unwrap();
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    h.manager
        .complete_job(&handle, &added[0].key, success(), "", "")
        .await
        .unwrap();
    assert!(h.runner.calls().is_empty());

    // without cwd_matters the per-attempt tree is deleted
    let spec = JobSpec::new("true", "/data/scratch").with_behaviours(behaviours);
    let added = h
        .manager
        .add_jobs(&handle, vec![spec], false)
        .await
        .unwrap();
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    h.manager
        .complete_job(&handle, &added[0].key, success(), "", "")
        .await
        .unwrap();
    let removed_tree = h
        .runner
        .calls()
        .iter()
        .any(|call| matches!(call, RunnerCall::RemoveTree(path) if path.starts_with("/data/scratch/")));
    assert!(removed_tree);
}

#[tokio::test]
async fn persistence_failure_aborts_the_completion() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let added = h
        .manager
        .add_jobs(&handle, vec![JobSpec::new("true", "/tmp")], false)
        .await
        .unwrap();
    let key = added[0].key.clone();
    h.manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();

    h.store.fail_writes(true);
    let err = h
        .manager
        .complete_job(&handle, &key, success(), "", "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PersistenceFailed { .. }));

    // the job is still reserved, exactly as before the attempt
    let job = &h.manager.get_by_keys(&handle, &[key.clone()])[0];
    assert_eq!(job.state, JobState::Reserved);

    h.store.fail_writes(false);
    h.manager
        .complete_job(&handle, &key, success(), "", "")
        .await
        .unwrap();
    assert_eq!(h.store.complete_count(), 1);
}

#[tokio::test]
async fn persistence_failure_rolls_back_an_add() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    h.store.fail_writes(true);
    let err = h
        .manager
        .add_jobs(&handle, vec![JobSpec::new("true", "/tmp")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PersistenceFailed { .. }));
    assert!(h
        .manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .is_none());

    // the key is free again, not poisoned by a terminal record
    h.store.fail_writes(false);
    let added = h
        .manager
        .add_jobs(&handle, vec![JobSpec::new("true", "/tmp")], false)
        .await
        .unwrap();
    assert!(!added[0].already_existed);
}

#[tokio::test]
async fn bulk_retry_matches_selectors() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let mut keys = Vec::new();
    for n in 0..3 {
        let spec = JobSpec::new(format!("job {n}"), "/tmp")
            .with_rep_group("r1")
            .with_retries(0);
        let added = h
            .manager
            .add_jobs(&handle, vec![spec], false)
            .await
            .unwrap();
        keys.push(added[0].key.clone());
    }
    for key in &keys {
        h.manager
            .reserve(&handle, "", Duration::from_secs(60))
            .unwrap()
            .unwrap();
        h.manager
            .bury(&handle, key, "oom", Some(failure(2)))
            .unwrap();
    }
    assert_eq!(
        h.manager
            .get_by_rep_group(&handle, "r1", 0, Some(JobState::Buried))
            .len(),
        3
    );

    // without All only one is kicked
    assert_eq!(h.manager.retry_matching(&handle, "r1", 2, "oom", false), 1);
    // with All the rest follow
    assert_eq!(h.manager.retry_matching(&handle, "r1", 2, "oom", true), 2);
    assert!(h
        .manager
        .get_by_rep_group(&handle, "r1", 0, Some(JobState::Buried))
        .is_empty());

    // selectors that match nothing kick nothing
    assert_eq!(h.manager.retry_matching(&handle, "r1", 9, "oom", true), 0);
}

#[tokio::test]
async fn remove_refuses_jobs_with_dependents() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let spec_a = JobSpec::new("echo a", "/tmp");
    let key_a = spec_a.key();
    let spec_b =
        JobSpec::new("echo b", "/tmp").with_dependencies(vec![Dependency::Key(key_a.clone())]);
    h.manager
        .add_jobs(&handle, vec![spec_a, spec_b], false)
        .await
        .unwrap();

    let err = h.manager.remove_job(&handle, &key_a).await.unwrap_err();
    assert!(matches!(err, Error::HasDependents(_)));
}

#[tokio::test]
async fn removing_a_delayed_job_hints_the_scheduler() {
    let h = harness_with(test_config().with_release_backoff(Duration::from_secs(60)));
    let handle = h.manager.handle(CMDS_QUEUE);

    let specs = vec![
        JobSpec::new("echo one", "/tmp").with_retries(3),
        JobSpec::new("echo two", "/tmp").with_retries(3),
    ];
    let group = sluice::Requirements::default().scheduler_group();
    h.manager.add_jobs(&handle, specs, false).await.unwrap();

    {
        let scheduler = h.scheduler.clone();
        let group = group.clone();
        eventually("both jobs reported schedulable", move || {
            scheduler.last_count_for(&group) == Some(2)
        })
        .await;
    }

    let job = h
        .manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    // wait for the bridge to observe the reservation before releasing, so
    // the decrement below starts from a settled count
    {
        let scheduler = h.scheduler.clone();
        let group = group.clone();
        eventually("reservation reported", move || {
            scheduler.last_count_for(&group) == Some(1)
        })
        .await;
    }
    h.manager.release(&handle, &job.key, "hiccup", None).unwrap();
    let jobs = h.manager.get_by_keys(&handle, &[job.key.clone()]);
    assert_eq!(jobs[0].state, JobState::Delayed);

    h.manager.remove_job(&handle, &job.key).await.unwrap();
    // the prompt hint asked for fewer runners
    assert!(h
        .scheduler
        .calls()
        .iter()
        .any(|call| call.group == group && call.count == 0));
    assert!(h.manager.get_by_keys(&handle, &[job.key]).is_empty());
}

#[tokio::test]
async fn bridge_reports_requirements_for_the_group() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);

    let mut reqs = sluice::Requirements::default();
    reqs.ram_mb = 2048;
    reqs.cores = 4;
    let group = reqs.scheduler_group();
    let spec = JobSpec::new("big job", "/tmp").with_requirements(reqs);
    h.manager.add_jobs(&handle, vec![spec], false).await.unwrap();

    let scheduler = h.scheduler.clone();
    let group_clone = group.clone();
    eventually("scheduler asked for a runner", move || {
        scheduler.last_count_for(&group_clone) == Some(1)
    })
    .await;

    let call = h
        .scheduler
        .calls()
        .into_iter()
        .find(|call| call.group == group)
        .unwrap();
    assert_eq!(call.requirements.ram_mb, 2048);
    assert_eq!(call.requirements.cores, 4);
}

#[tokio::test]
async fn recovery_restores_live_jobs_with_dependencies() {
    let store = MemoryStore::new();
    {
        let manager = Manager::new(
            test_config(),
            Arc::new(store.clone()),
            Arc::new(MockScheduler::new()),
        );
        let handle = manager.handle(CMDS_QUEUE);
        let spec_a = JobSpec::new("echo a", "/tmp");
        let key_a = spec_a.key();
        let spec_b =
            JobSpec::new("echo b", "/tmp").with_dependencies(vec![Dependency::Key(key_a)]);
        manager
            .add_jobs(&handle, vec![spec_a, spec_b], false)
            .await
            .unwrap();
        assert_eq!(store.live_count(), 2);
    }

    // a fresh manager over the same store resumes the same queue
    let manager = Manager::new(
        test_config(),
        Arc::new(store.clone()),
        Arc::new(MockScheduler::new()),
    );
    manager.start().await.unwrap();
    let handle = manager.handle(CMDS_QUEUE);

    let mut jobs = manager.get_incomplete(&handle);
    jobs.sort_by(|a, b| a.cmd.cmp(&b.cmd));
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].state, JobState::Ready);
    assert_eq!(jobs[1].state, JobState::Dependent);

    // and the chain still resolves in order
    let job = manager
        .reserve(&handle, "", Duration::from_secs(60))
        .unwrap()
        .unwrap();
    assert_eq!(job.cmd, "echo a");
}

#[tokio::test]
async fn zero_ttl_reservations_are_refused() {
    let h = harness();
    let handle = h.manager.handle(CMDS_QUEUE);
    let err = h.manager.reserve(&handle, "", Duration::ZERO).unwrap_err();
    assert_eq!(err, Error::TtlRefused);
}
