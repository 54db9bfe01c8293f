use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use super::*;
use crate::manifest::{ProcessRegistry, TransformRegistry};
use crate::tracker::FileHashCache;

fn registries(processes_json: &str, transforms_json: &str) -> (ProcessRegistry, TransformRegistry) {
    (serde_json::from_str(processes_json).unwrap(), serde_json::from_str(transforms_json).unwrap())
}

fn paths_scope(dir: &TempDir) -> VarScope {
    let mut vars = VarScope::new();
    for (key, sub) in
        [("input.path", "in"), ("output.path", "out"), ("cache.path", "cache"), ("tools.path", "tools")]
    {
        vars.add(key, &dir.path().join(sub).display().to_string(), false);
    }
    vars
}

const TWO_STAGE_PROCESSES: &str = r#"{ "processes": [
    { "name": "esrgan", "executable": "tool.sh" },
    { "name": "convert", "executable": "tool.sh" }
] }"#;

const TWO_STAGE_TRANSFORMS: &str = r#"{ "transforms": [
    { "name": "default", "stages": [
        { "name": "uprez", "processes": [
            { "name": "esr", "process": "esrgan",
              "vars": { "x.input": "{transform.input}",
                        "x.output": "{cache.path}/{transform.input.filename}.up.png" },
              "cmdline": "{x.input} 0" }
        ] },
        { "name": "finish", "processes": [
            { "name": "conv", "process": "convert",
              "vars": { "y.input": "{x.output}",
                        "y.output": "{transform.output}" },
              "cmdline": "{y.input} 0" }
        ] }
    ] }
] }"#;

#[test]
fn test_seed_bindings() {
    let bindings = seed_bindings("sub/dir/rock.png");
    let get = |key: &str| {
        bindings.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()).unwrap_or_default()
    };
    assert_eq!(get("transform.input"), "{input.path}/sub/dir/rock.png");
    assert_eq!(get("transform.output"), "{output.path}/sub/dir/rock.png");
    assert_eq!(get("transform.input.filename"), "rock.png");
    assert_eq!(get("transform.input.filename.ext"), ".png");
    assert_eq!(get("transform.input.subpath"), "sub/dir");
    assert_eq!(get("transform.output.subpath"), "sub/dir");
}

#[test]
fn test_seed_bindings_flat_artifact() {
    let bindings = seed_bindings("rock.png");
    let get = |key: &str| {
        bindings.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()).unwrap_or_default()
    };
    assert_eq!(get("transform.input.filename"), "rock.png");
    assert_eq!(get("transform.input.subpath"), "");
}

#[test]
fn test_expansion_threads_scopes_across_stages() {
    let dir = TempDir::new().unwrap();
    let (processes, transforms) = registries(TWO_STAGE_PROCESSES, TWO_STAGE_TRANSFORMS);
    let transform = transforms.get("default").unwrap();

    let cache = Arc::new(FileHashCache::new());
    let pipeline = Pipeline::new(&processes, transform, paths_scope(&dir), cache, false, true);

    let mut root = paths_scope(&dir);
    for (key, value) in seed_bindings("rock.png") {
        root.add(&key, &value, false);
    }
    let stages = pipeline.expand(&root).unwrap();
    assert_eq!(stages.len(), 2);

    // Stage B's process scope sees stage A's x.output, and its declared
    // y.input resolves through it to the concrete cached file.
    let conv = &stages[1].processes[0];
    assert!(conv.vars.contains_key("x.output"));
    let resolved = conv.vars.resolve_path(conv.vars.get("y.input").unwrap()).unwrap();
    assert_eq!(resolved, dir.path().join("cache").join("rock.png.up.png").display().to_string());

    // ...and the tracked-file derivation picks that file up via the
    // .input/.output convention.
    let (files, outputs) = tracked_files(conv).unwrap();
    assert!(files.contains(&resolved));
    assert!(files.iter().any(|f| f.ends_with("process.convert.node.json")));

    // y.output is the only declared output of the delivery process.
    let expected_output = conv.vars.resolve_path("{transform.output}").unwrap();
    assert_eq!(outputs, vec![expected_output]);
}

#[test]
fn test_expansion_sibling_isolation_within_stage() {
    let dir = TempDir::new().unwrap();
    let (processes, transforms) = registries(
        TWO_STAGE_PROCESSES,
        r#"{ "transforms": [
            { "name": "default", "stages": [
                { "name": "only", "processes": [
                    { "name": "first", "process": "esrgan",
                      "vars": { "a.out": "A" }, "cmdline": "" },
                    { "name": "second", "process": "convert",
                      "vars": { "b.out": "B" }, "cmdline": "" }
                ] }
            ] }
        ] }"#,
    );
    let transform = transforms.get("default").unwrap();
    let pipeline = Pipeline::new(
        &processes,
        transform,
        paths_scope(&dir),
        Arc::new(FileHashCache::new()),
        false,
        true,
    );

    let stages = pipeline.expand(&paths_scope(&dir)).unwrap();
    let stage = &stages[0];

    // Later siblings do not see earlier siblings' vars within the stage...
    assert!(!stage.processes[1].vars.contains_key("a.out"));
    // ...but the stage output scope carries the union forward.
    assert!(stage.output_vars.contains_key("a.out"));
    assert!(stage.output_vars.contains_key("b.out"));
}

#[test]
fn test_expansion_rejects_unknown_process() {
    let dir = TempDir::new().unwrap();
    let (processes, transforms) = registries(
        TWO_STAGE_PROCESSES,
        r#"{ "transforms": [
            { "name": "default", "stages": [
                { "name": "uprez", "processes": [
                    { "name": "esr", "process": "missing-tool", "cmdline": "" }
                ] }
            ] }
        ] }"#,
    );
    let transform = transforms.get("default").unwrap();
    let pipeline = Pipeline::new(
        &processes,
        transform,
        paths_scope(&dir),
        Arc::new(FileHashCache::new()),
        false,
        true,
    );

    let err = pipeline.expand(&paths_scope(&dir)).unwrap_err();
    assert!(matches!(err, UprezError::UnknownProcess { ref process, .. } if process == "missing-tool"));
}

#[test]
fn test_group_by_thread_preserves_order() {
    let specs: Vec<InvocationSpec> = serde_json::from_str(
        r#"[
            { "name": "a", "process": "p", "thread": "main", "cmdline": "" },
            { "name": "b", "process": "p", "thread": "gpu", "cmdline": "" },
            { "name": "c", "process": "p", "thread": "main", "cmdline": "" }
        ]"#,
    )
    .unwrap();
    let registry: ProcessRegistry =
        serde_json::from_str(r#"{ "processes": [ { "name": "p", "executable": "x" } ] }"#).unwrap();
    let spec = registry.get("p").unwrap();

    let processes: Vec<ProcessInvocation<'_>> = specs
        .iter()
        .map(|s| ProcessInvocation { spec: s, registry: spec, vars: VarScope::new() })
        .collect();

    let groups = group_by_thread(&processes);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].0, "main");
    assert_eq!(groups[0].1.iter().map(|p| p.spec.name.as_str()).collect::<Vec<_>>(), ["a", "c"]);
    assert_eq!(groups[1].0, "gpu");
    assert_eq!(groups[1].1.iter().map(|p| p.spec.name.as_str()).collect::<Vec<_>>(), ["b"]);
}

#[cfg(unix)]
mod execution {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Lays out tools/, in/, cache/ and a counting fake tool; returns the
    /// scope pointing at them. The tool appends one line to this fixture's
    /// log per run and exits with its second argument.
    fn fixture(dir: &TempDir) -> VarScope {
        for sub in ["in", "out", "cache", "tools"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let log = dir.path().join("cache").join("tool.log");
        let tool = dir.path().join("tools").join("tool.sh");
        fs::write(
            &tool,
            format!("#!/bin/sh\necho ran >> \"{}\"\nexit ${{2:-0}}\n", log.display()),
        )
        .unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("in").join("rock.png"), "pixels").unwrap();
        paths_scope(dir)
    }

    fn executions(dir: &TempDir) -> usize {
        fs::read_to_string(dir.path().join("cache").join("tool.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let dir = TempDir::new().unwrap();
        let vars = fixture(&dir);
        let (processes, transforms) = registries(TWO_STAGE_PROCESSES, TWO_STAGE_TRANSFORMS);
        let transform = transforms.get("default").unwrap();

        let cache = Arc::new(FileHashCache::new());
        let pipeline =
            Pipeline::new(&processes, transform, vars.clone(), cache, false, false);
        let report = pipeline.run("rock.png").await.unwrap();
        assert_eq!(report, PipelineReport { executed: 2, skipped: 0 });
        assert_eq!(executions(&dir), 2);

        // Fresh cache, as a new run would have.
        let cache = Arc::new(FileHashCache::new());
        let pipeline = Pipeline::new(&processes, transform, vars, cache, false, false);
        let report = pipeline.run("rock.png").await.unwrap();
        assert_eq!(report, PipelineReport { executed: 0, skipped: 2 });
        assert_eq!(executions(&dir), 2);
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing_and_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let vars = fixture(&dir);
        let (processes, transforms) = registries(TWO_STAGE_PROCESSES, TWO_STAGE_TRANSFORMS);
        let transform = transforms.get("default").unwrap();

        let pipeline = Pipeline::new(
            &processes,
            transform,
            vars,
            Arc::new(FileHashCache::new()),
            false,
            true,
        );
        let report = pipeline.run("rock.png").await.unwrap();
        assert_eq!(report.executed, 2);
        assert_eq!(executions(&dir), 0);
        assert!(!dir.path().join("cache").join("rock.png.dep.json").exists());
    }

    #[tokio::test]
    async fn test_failure_aborts_and_keeps_completed_prefix() {
        let dir = TempDir::new().unwrap();
        let vars = fixture(&dir);
        let (processes, transforms) = registries(
            TWO_STAGE_PROCESSES,
            // Second stage exits 5.
            &TWO_STAGE_TRANSFORMS.replace("{y.input} 0", "{y.input} 5"),
        );
        let transform = transforms.get("default").unwrap();

        let pipeline = Pipeline::new(
            &processes,
            transform,
            vars,
            Arc::new(FileHashCache::new()),
            false,
            false,
        );
        let err = pipeline.run("rock.png").await.unwrap_err();
        let failure = err.downcast_ref::<UprezError>().unwrap();
        assert!(matches!(failure, UprezError::ProcessFailed { code: 5, .. }));

        // Both tools ran; the snapshot was still persisted with the
        // completed node but without the failed one.
        assert_eq!(executions(&dir), 2);
        let snapshot = Snapshot::load(&dir.path().join("cache").join("rock.png.dep.json"));
        assert!(snapshot.group("default.uprez.esr").is_some());
        assert!(snapshot.group("default.finish.conv").is_none());
    }

    #[tokio::test]
    async fn test_cmdline_change_forces_reexecution() {
        let dir = TempDir::new().unwrap();
        let vars = fixture(&dir);
        let (processes, transforms) = registries(TWO_STAGE_PROCESSES, TWO_STAGE_TRANSFORMS);
        let transform = transforms.get("default").unwrap();

        let pipeline = Pipeline::new(
            &processes,
            transform,
            vars.clone(),
            Arc::new(FileHashCache::new()),
            false,
            false,
        );
        pipeline.run("rock.png").await.unwrap();

        // Same files, different command line for stage A.
        let (_, transforms) = registries(
            TWO_STAGE_PROCESSES,
            &TWO_STAGE_TRANSFORMS.replace("{x.input} 0", "{x.input} 0 --fast"),
        );
        let transform = transforms.get("default").unwrap();
        let pipeline = Pipeline::new(
            &processes,
            transform,
            vars,
            Arc::new(FileHashCache::new()),
            false,
            false,
        );
        let report = pipeline.run("rock.png").await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.skipped, 1);
    }
}
