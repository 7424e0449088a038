use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use plugctl_core::{
    locate, ExecuteOptions, HookContext, HookKind, HookOutput, HookRunner, Orchestrator,
    PlugError, PluginFetcher, PluginRegistry, RegistryEntry, ResolutionKind, Resolver, Result,
    RetryPolicy, StepOutcome, Version, VersionStore, REGISTRY_FILE,
};
use tempfile::TempDir;

/// Records hook invocations; every hook succeeds with empty output
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl HookRunner for RecordingRunner {
    fn run(&self, ctx: &HookContext, hook: HookKind, _argv: &[String]) -> Result<HookOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}@{}:{}", ctx.plugin, ctx.version, hook));
        Ok(HookOutput {
            success: true,
            ..HookOutput::default()
        })
    }
}

struct Env {
    temp: TempDir,
    store: VersionStore,
    fetcher: PluginFetcher,
    registry: PluginRegistry,
}

impl Env {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        Self {
            store: VersionStore::open(&temp.path().join("plugins")).unwrap(),
            fetcher: PluginFetcher::new(Duration::from_secs(5)).unwrap(),
            registry: PluginRegistry::load(&temp.path().join(REGISTRY_FILE)).unwrap(),
            temp,
        }
    }

    fn sources(&self) -> PathBuf {
        self.temp.path().join("sources")
    }

    /// Write a plugin source directory and return its path
    fn plugin_dir(&self, dir_name: &str, manifest: serde_json::Value) -> PathBuf {
        let dir = self.sources().join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
        fs::write(dir.join("install.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        dir
    }

    fn register(&mut self, name: &str, path: &Path) {
        self.registry
            .add(
                name,
                RegistryEntry {
                    url: path.display().to_string(),
                    version: None,
                    description: None,
                },
            )
            .unwrap();
    }

    fn install(&self, runner: &dyn HookRunner, reference: &str, force: bool) -> Result<Vec<(String, Version, StepOutcome)>> {
        let resolver = Resolver::new(&self.fetcher, &self.registry)
            .with_retry(RetryPolicy::none())
            .with_cwd(self.sources());
        let orchestrator =
            Orchestrator::new(&self.store, &self.fetcher, runner).with_retry(RetryPolicy::none());
        let report =
            orchestrator.install(&resolver, &locate(reference)?, ExecuteOptions { force })?;
        Ok(report
            .steps
            .into_iter()
            .map(|s| (s.name, s.version, s.outcome))
            .collect())
    }
}

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

fn manifest(name: &str, version: &str, deps: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "version": version,
        "type": "library",
        "depends_on": deps,
        "hooks": { "install": ["sh", "install.sh"] }
    })
}

#[test]
fn installs_satisfying_dependency_over_stale_stored_version() {
    let mut env = Env::new();
    let runner = RecordingRunner::default();

    let q_old = env.plugin_dir("q-0.9.0", manifest("q", "0.9.0", &[]));
    env.register("q", &q_old);
    env.install(&runner, "q", false).unwrap();
    assert_eq!(env.store.active_version("q").unwrap(), Some(v("0.9.0")));

    // The registry now serves a newer q
    env.registry.remove("q").unwrap();
    let q_new = env.plugin_dir("q-1.1.0", manifest("q", "1.1.0", &[]));
    env.register("q", &q_new);
    let p = env.plugin_dir("p", manifest("p", "1.0.0", &["q>=1.0.0"]));
    env.register("p", &p);

    let steps = env.install(&runner, "p", false).unwrap();
    let names: Vec<&str> = steps.iter().map(|(name, _, _)| name.as_str()).collect();
    assert_eq!(names, ["q", "p"]);

    assert_eq!(env.store.active_version("q").unwrap(), Some(v("1.1.0")));
    assert_eq!(env.store.list_versions("q").unwrap(), vec![v("0.9.0"), v("1.1.0")]);
    assert_eq!(env.store.active_version("p").unwrap(), Some(v("1.0.0")));
}

#[test]
fn cycle_installs_nothing() {
    let mut env = Env::new();
    let runner = RecordingRunner::default();
    let a = env.plugin_dir("a", manifest("a", "1.0.0", &["b"]));
    let b = env.plugin_dir("b", manifest("b", "1.0.0", &["a"]));
    env.register("a", &a);
    env.register("b", &b);

    let err = env.install(&runner, "a", false).unwrap_err();
    assert!(matches!(
        err,
        PlugError::Resolution {
            kind: ResolutionKind::CyclicDependency,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 4);
    assert!(env.store.list_plugins().unwrap().is_empty());
    assert!(runner.calls().is_empty());
}

#[test]
fn reinstall_is_idempotent() {
    let mut env = Env::new();
    let runner = RecordingRunner::default();
    let x = env.plugin_dir("x", manifest("x", "1.0.0", &[]));
    env.register("x", &x);

    env.install(&runner, "x", false).unwrap();
    let steps = env.install(&runner, "x", false).unwrap();

    assert_eq!(steps, vec![("x".to_string(), v("1.0.0"), StepOutcome::Activated)]);
    assert_eq!(runner.calls(), ["x@1.0.0:install"]);

    let forced = env.install(&runner, "x", true).unwrap();
    assert_eq!(forced[0].2, StepOutcome::Reinstalled);
    assert_eq!(runner.calls().len(), 2);
}

#[test]
fn explicit_relative_origin_bypasses_registry() {
    let env = Env::new();
    let runner = RecordingRunner::default();
    env.plugin_dir("helper", manifest("helper", "0.3.0", &[]));
    env.plugin_dir("tool", manifest("tool", "2.0.0", &["helper@../helper"]));

    let steps = env.install(&runner, "tool@./tool", false).unwrap();
    let names: Vec<&str> = steps.iter().map(|(name, _, _)| name.as_str()).collect();
    assert_eq!(names, ["helper", "tool"]);

    let helper = env.store.get("helper", &v("0.3.0")).unwrap();
    assert!(helper.origin.ends_with("helper"));
}

#[test]
fn installs_from_tarball_with_top_level_directory() {
    let env = Env::new();
    let runner = RecordingRunner::default();

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in [
        ("reporter-1.4.0/plugin.json", manifest("reporter", "1.4.0", &[]).to_string()),
        ("reporter-1.4.0/lib/report.py", "print('report')\n".to_string()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
    }
    let bytes = builder.into_inner().unwrap().finish().unwrap();

    fs::create_dir_all(env.sources()).unwrap();
    let archive = env.sources().join("reporter.tar.gz");
    fs::write(&archive, bytes).unwrap();

    env.install(&runner, "reporter@./reporter.tar.gz", false).unwrap();

    let stored = env.store.get_active("reporter").unwrap();
    assert_eq!(stored.version, v("1.4.0"));
    assert!(stored.storage_path.join("plugin.json").is_file());
    assert!(stored.storage_path.join("lib/report.py").is_file());
    assert!(stored.checksum.starts_with("sha256:"));
}

#[test]
fn switch_then_list_and_uninstall() {
    let mut env = Env::new();
    let runner = RecordingRunner::default();

    let x1 = env.plugin_dir("x-1", manifest("x", "1.0.0", &[]));
    env.register("x", &x1);
    env.install(&runner, "x", false).unwrap();

    env.registry.remove("x").unwrap();
    let x2 = env.plugin_dir("x-2", manifest("x", "2.0.0", &[]));
    env.register("x", &x2);
    env.install(&runner, "x", false).unwrap();

    let orchestrator = Orchestrator::new(&env.store, &env.fetcher, &runner);
    orchestrator.switch("x", &v("1.0.0")).unwrap();

    let listed = orchestrator.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].versions, vec![v("1.0.0"), v("2.0.0")]);
    assert_eq!(listed[0].active, Some(v("1.0.0")));

    orchestrator.uninstall("x", &v("1.0.0")).unwrap();
    assert_eq!(env.store.active_version("x").unwrap(), Some(v("2.0.0")));

    orchestrator.uninstall("x", &v("2.0.0")).unwrap();
    assert!(orchestrator.list().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn failing_install_script_rolls_back() {
    use plugctl_core::ProcessHookRunner;

    let mut env = Env::new();
    let dir = env.plugin_dir("broken", manifest("broken", "1.0.0", &[]));
    fs::write(dir.join("install.sh"), "#!/bin/sh\necho \"missing $PLUGCTL_PLUGIN deps\" >&2\nexit 1\n").unwrap();
    env.register("broken", &dir);

    let runner = ProcessHookRunner::new(Duration::from_secs(10));
    let err = env.install(&runner, "broken", false).unwrap_err();

    match &err {
        PlugError::HookFailure { plugin, hook, message, .. } => {
            assert_eq!(plugin, "broken");
            assert_eq!(hook, "install");
            assert_eq!(message, "missing broken deps");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.exit_code(), 5);
    assert!(env.store.list_plugins().unwrap().is_empty());
}
