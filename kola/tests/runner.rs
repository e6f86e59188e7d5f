//! Runner behaviour against an in-memory cluster backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use kola::{ClusterFactory, KolaError, Registry, RunOutcome, Runner, Test};
use kola_platform::{Cluster, Machine, PlatformError, SshSession, TestCluster};

/// Shared record of everything the fake backend was asked to do.
#[derive(Debug, Default)]
struct FakeState {
    created: Vec<String>,
    destroyed: usize,
    configs: Vec<String>,
    commands: Vec<(String, String, Option<Vec<u8>>)>,
    fail_next_create: Option<String>,
    fail_machine_at: Option<usize>,
}

/// Cluster factory whose clusters live in memory.
#[derive(Clone, Default)]
struct FakeFactory {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeFactory {
    fn state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.inner.lock().unwrap())
    }
}

#[async_trait]
impl ClusterFactory for FakeFactory {
    async fn create(&self, platform: &str) -> kola::Result<Arc<dyn Cluster>> {
        let mut state = self.inner.lock().unwrap();
        if let Some(msg) = state.fail_next_create.take() {
            return Err(KolaError::Cluster(PlatformError::Qemu(msg)));
        }
        state.created.push(platform.to_string());
        Ok(Arc::new(FakeCluster {
            platform: platform.to_string(),
            inner: self.inner.clone(),
            machines: Mutex::new(Vec::new()),
        }))
    }
}

struct FakeCluster {
    platform: String,
    inner: Arc<Mutex<FakeState>>,
    machines: Mutex<Vec<Arc<dyn Machine>>>,
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn new_machine(&self, config: &str) -> kola_platform::Result<Arc<dyn Machine>> {
        let mut machines = self.machines.lock().unwrap();
        let ordinal = machines.len();
        let mut state = self.inner.lock().unwrap();
        if state.fail_machine_at == Some(ordinal) {
            return Err(PlatformError::Qemu("no capacity".into()));
        }
        state.configs.push(config.to_string());

        let machine: Arc<dyn Machine> = Arc::new(FakeMachine {
            id: format!("{}-{}", self.platform, ordinal),
            inner: self.inner.clone(),
        });
        machines.push(Arc::clone(&machine));
        Ok(machine)
    }

    async fn get_discovery_url(&self, size: usize) -> kola_platform::Result<String> {
        Ok(format!("fake://discovery/{}", size))
    }

    async fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.machines.lock().unwrap().clone()
    }

    async fn destroy(&self) -> kola_platform::Result<()> {
        self.machines.lock().unwrap().clear();
        self.inner.lock().unwrap().destroyed += 1;
        Ok(())
    }
}

struct FakeMachine {
    id: String,
    inner: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Machine for FakeMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        "10.0.0.2"
    }

    async fn ssh_session(&self) -> kola_platform::Result<Box<dyn SshSession>> {
        Ok(Box::new(FakeSession {
            machine: self.id.clone(),
            inner: self.inner.clone(),
            stdin: None,
        }))
    }

    async fn destroy(&self) -> kola_platform::Result<()> {
        Ok(())
    }
}

struct FakeSession {
    machine: String,
    inner: Arc<Mutex<FakeState>>,
    stdin: Option<Vec<u8>>,
}

#[async_trait]
impl SshSession for FakeSession {
    fn set_stdin(&mut self, input: Vec<u8>) {
        self.stdin = Some(input);
    }

    async fn combined_output(self: Box<Self>, cmd: &str) -> kola_platform::Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .push((self.machine, cmd.to_string(), self.stdin));
        Ok(b"ok\n".to_vec())
    }
}

fn runner(registry: Registry, factory: &FakeFactory) -> Runner {
    Runner::new(registry, Arc::new(factory.clone())).default_platforms(vec!["fake".into()])
}

fn registry(tests: Vec<Test>) -> Registry {
    let mut registry = Registry::new();
    for test in tests {
        registry.register(test).unwrap();
    }
    registry
}

fn three_machines(cluster: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        let machines = cluster.machines().await;
        anyhow::ensure!(machines.len() == 3, "got {} machines", machines.len());
        for machine in machines {
            machine.ssh("true").await?;
        }
        Ok(())
    }
    .boxed()
}

fn always_fails(_: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    async { anyhow::bail!("etcd never converged") }.boxed()
}

fn panics(_: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    async { panic!("assertion in test body") }.boxed()
}

fn passes(_: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    async { Ok(()) }.boxed()
}

fn native_noop() -> anyhow::Result<()> {
    Ok(())
}

static NAMED_RUNS: AtomicUsize = AtomicUsize::new(0);

fn checks_name(cluster: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        anyhow::ensure!(cluster.name == "e2e.Named", "got name {}", cluster.name);
        NAMED_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    .boxed()
}

#[tokio::test]
async fn three_machine_success_exits_zero() {
    let factory = FakeFactory::default();
    let runner = runner(
        registry(vec![Test::new("e2e.Pass", three_machines)
            .cluster_size(3)
            .cloud_config("discovery=$discovery name=$name")]),
        &factory,
    );

    let outcome = runner.run_tests(None).await;

    assert!(matches!(outcome, RunOutcome::Passed { ran: 1 }));
    assert_eq!(outcome.exit_code(), 0);
    factory.state(|s| {
        assert_eq!(s.created, vec!["fake"]);
        assert_eq!(s.destroyed, 1);
        assert_eq!(
            s.configs,
            vec![
                "discovery=fake://discovery/3 name=instance0",
                "discovery=fake://discovery/3 name=instance1",
                "discovery=fake://discovery/3 name=instance2",
            ]
        );
        // No native functions, so nothing but the test's own commands.
        assert_eq!(s.commands.len(), 3);
        assert!(s.commands.iter().all(|(_, cmd, _)| cmd == "true"));
    });
}

#[tokio::test]
async fn failing_test_still_destroys_cluster_and_exits_one() {
    let factory = FakeFactory::default();
    let runner = runner(
        registry(vec![Test::new("e2e.Fail", always_fails).cluster_size(3)]),
        &factory,
    );

    let outcome = runner.run_tests(Some("e2e.*")).await;

    assert_eq!(outcome.exit_code(), 1);
    match outcome {
        RunOutcome::Failed {
            test,
            platform,
            error,
        } => {
            assert_eq!(test, "e2e.Fail");
            assert_eq!(platform, "fake");
            assert_eq!(error.to_string(), "etcd never converged");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    factory.state(|s| assert_eq!(s.destroyed, 1));
}

#[tokio::test]
async fn first_failure_stops_the_run() {
    let factory = FakeFactory::default();
    let runner = runner(
        registry(vec![
            Test::new("a.Fail", always_fails),
            Test::new("b.Pass", passes),
        ]),
        &factory,
    );

    let outcome = runner.run_tests(None).await;

    assert_eq!(outcome.exit_code(), 1);
    factory.state(|s| {
        assert_eq!(s.created.len(), 1);
        assert_eq!(s.destroyed, 1);
    });
}

#[tokio::test]
async fn machine_failure_is_staged_and_cluster_destroyed() {
    let factory = FakeFactory::default();
    factory.state(|s| s.fail_machine_at = Some(1));
    let runner = runner(
        registry(vec![Test::new("e2e.Pass", three_machines).cluster_size(3)]),
        &factory,
    );

    let outcome = runner.run_tests(None).await;

    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, KolaError::StartMachine(_)));
            assert!(error
                .to_string()
                .starts_with("cluster failed starting machine: "));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    factory.state(|s| {
        assert_eq!(s.configs.len(), 1);
        assert_eq!(s.destroyed, 1);
    });
}

#[tokio::test]
async fn cluster_construction_failure_is_reported() {
    let factory = FakeFactory::default();
    factory.state(|s| s.fail_next_create = Some("kvm unavailable".into()));
    let runner = runner(registry(vec![Test::new("e2e.Pass", passes)]), &factory);

    let outcome = runner.run_tests(None).await;

    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error.to_string(), "cluster failed: qemu failed: kvm unavailable")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    // Nothing was built, so nothing is torn down.
    factory.state(|s| assert_eq!(s.destroyed, 0));
}

#[tokio::test]
async fn kolet_is_installed_on_every_machine_for_native_tests() {
    let dir = tempfile::tempdir().unwrap();
    let kolet = dir.path().join("kolet");
    std::fs::write(&kolet, b"KOLET").unwrap();

    let factory = FakeFactory::default();
    let runner = runner(
        registry(vec![Test::new("e2e.Native", passes)
            .cluster_size(2)
            .native_func("Noop", native_noop)]),
        &factory,
    )
    .kolet_path(&kolet);

    let outcome = runner.run_tests(None).await;

    assert_eq!(outcome.exit_code(), 0);
    factory.state(|s| {
        assert_eq!(s.commands.len(), 2);
        for (i, (machine, cmd, stdin)) in s.commands.iter().enumerate() {
            assert_eq!(machine, &format!("fake-{}", i));
            assert_eq!(cmd, "install -m 0755 /dev/stdin ./kolet");
            assert_eq!(stdin.as_deref(), Some(&b"KOLET"[..]));
        }
    });
}

#[tokio::test]
async fn missing_kolet_fails_deploy_stage() {
    let factory = FakeFactory::default();
    let runner = runner(
        registry(vec![Test::new("e2e.Native", passes).native_func("Noop", native_noop)]),
        &factory,
    )
    .kolet_path("/nonexistent/kolet");

    let outcome = runner.run_tests(None).await;

    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, KolaError::DeployKolet(_)));
            assert!(error.to_string().starts_with("dropping kolet binary: "));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    factory.state(|s| assert_eq!(s.destroyed, 1));
}

#[tokio::test]
async fn tests_without_platforms_use_defaults() {
    let factory = FakeFactory::default();
    let runner = Runner::new(
        registry(vec![
            Test::new("e2e.Default", passes),
            Test::new("e2e.Pinned", passes).platforms(["three"]),
        ]),
        Arc::new(factory.clone()),
    )
    .default_platforms(vec!["one".into(), "two".into()]);

    let outcome = runner.run_tests(None).await;

    assert!(matches!(outcome, RunOutcome::Passed { ran: 3 }));
    factory.state(|s| {
        assert_eq!(s.created, vec!["one", "two", "three"]);
        assert_eq!(s.destroyed, 3);
    });
}

#[tokio::test]
async fn panicking_test_is_contained() {
    let factory = FakeFactory::default();
    let runner = runner(registry(vec![Test::new("e2e.Panic", panics)]), &factory);

    let outcome = runner.run_tests(None).await;

    match outcome {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, KolaError::TestPanicked(ref m) if m == "assertion in test body"))
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    factory.state(|s| assert_eq!(s.destroyed, 1));
}

#[tokio::test]
async fn malformed_pattern_runs_nothing() {
    let factory = FakeFactory::default();
    let runner = runner(registry(vec![Test::new("e2e.Pass", passes)]), &factory);

    let outcome = runner.run_tests(Some("e2e.[")).await;

    assert!(matches!(outcome, RunOutcome::Passed { ran: 0 }));
    factory.state(|s| assert!(s.created.is_empty()));
}

#[tokio::test]
async fn test_receives_its_own_name() {
    let factory = FakeFactory::default();
    let runner = runner(registry(vec![Test::new("e2e.Named", checks_name)]), &factory);

    let outcome = runner.run_tests(Some("e2e.Named")).await;

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(NAMED_RUNS.load(Ordering::SeqCst), 1);
}

#[test]
fn builtin_suite_is_selectable() {
    let registry = kola::suite::registry().unwrap();
    let names: Vec<_> = registry
        .select("etcd.*")
        .unwrap()
        .into_iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["etcd.Discovery"]);

    let native: BTreeMap<_, _> = registry
        .iter()
        .map(|t| (t.name.as_str(), t.has_native_funcs()))
        .collect();
    assert!(native["coretest.NativeHello"]);
    assert!(!native["etcd.Discovery"]);
}
