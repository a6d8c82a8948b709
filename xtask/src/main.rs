use std::{
    env,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const PACKAGE: &str = "vkmembench";

// ----------------------------------------------------------------
// Entry point
// ----------------------------------------------------------------

fn main() {
    if let Err(e) = try_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(task) = args.next() else {
        eprintln!("Usage: cargo xtask <task> [--release]\n");
        eprintln!("Tasks:");
        for task in &all_tasks() {
            eprintln!("  {}", task.name);
        }
        std::process::exit(1);
    };

    let mut profile = Profile::Debug;
    for arg in args {
        match arg.as_str() {
            "--release" => profile = Profile::Release,
            other => return Err(format!("unknown argument: `{other}`").into()),
        }
    }

    let ctx = TaskContext {
        root: workspace_root()?,
        profile,
    };
    execute_graph(&all_tasks(), &task, &ctx)
}

// ----------------------------------------------------------------
// Task graph
// ----------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Profile {
    Debug,
    Release,
}

impl Profile {
    fn dir_name(self) -> &'static str {
        match self {
            Profile::Debug => "debug",
            Profile::Release => "release",
        }
    }
}

struct TaskContext {
    root: PathBuf,
    profile: Profile,
}

impl TaskContext {
    /// `out/vkmembench/<profile>`: the runnable layout, exe with its
    /// `shaders/` directory beside it.
    fn out_dir(&self) -> PathBuf {
        self.root
            .join("out")
            .join(PACKAGE)
            .join(self.profile.dir_name())
    }
}

struct Task {
    name: &'static str,
    deps: &'static [&'static str],
    run: fn(&TaskContext) -> Result<()>,
}

fn noop(_: &TaskContext) -> Result<()> {
    Ok(())
}

fn all_tasks() -> Vec<Task> {
    vec![
        Task {
            name: "cargo-build",
            deps: &[],
            run: cargo_build,
        },
        Task {
            name: "compile-shaders",
            deps: &[],
            run: compile_shaders,
        },
        Task {
            name: "copy-exe",
            deps: &["cargo-build"],
            run: copy_exe,
        },
        Task {
            name: "build",
            deps: &["cargo-build", "compile-shaders", "copy-exe"],
            run: noop,
        },
    ]
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Status {
    Succeeded,
    Failed,
    Skipped,
}

fn task_index(tasks: &[Task], name: &str) -> Result<usize> {
    tasks
        .iter()
        .position(|t| t.name == name)
        .ok_or_else(|| format!("unknown task: `{name}`").into())
}

/// Dependency-first order of the tasks reachable from `name`.
fn topo_order(tasks: &[Task], name: &str) -> Result<Vec<usize>> {
    fn visit(
        tasks: &[Task],
        name: &str,
        visited: &mut [bool],
        order: &mut Vec<usize>,
    ) -> Result<()> {
        let idx = task_index(tasks, name)?;
        if visited[idx] {
            return Ok(());
        }
        visited[idx] = true;
        for &dep in tasks[idx].deps {
            visit(tasks, dep, visited, order)?;
        }
        order.push(idx);
        Ok(())
    }

    let mut visited = vec![false; tasks.len()];
    let mut order = Vec::new();
    visit(tasks, name, &mut visited, &mut order)?;
    Ok(order)
}

fn execute_graph(tasks: &[Task], target: &str, ctx: &TaskContext) -> Result<()> {
    let order = topo_order(tasks, target)?;
    let mut statuses: Vec<Option<Status>> = vec![None; tasks.len()];

    for &idx in &order {
        let task = &tasks[idx];
        let mut blocked = false;
        for &dep in task.deps {
            let dep_idx = task_index(tasks, dep)?;
            if matches!(statuses[dep_idx], Some(Status::Failed | Status::Skipped))
            {
                blocked = true;
            }
        }

        if blocked {
            eprintln!("skip: {}", task.name);
            statuses[idx] = Some(Status::Skipped);
            continue;
        }

        match (task.run)(ctx) {
            Ok(()) => statuses[idx] = Some(Status::Succeeded),
            Err(e) => {
                eprintln!("failed: {}: {e}", task.name);
                statuses[idx] = Some(Status::Failed);
            }
        }
    }

    let failed: Vec<&str> = order
        .iter()
        .filter(|&&i| statuses[i] == Some(Status::Failed))
        .map(|&i| tasks[i].name)
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(
            format!("{} task(s) failed: {}", failed.len(), failed.join(", "))
                .into(),
        )
    }
}

// ----------------------------------------------------------------
// Task implementations
// ----------------------------------------------------------------

fn workspace_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| "xtask has no parent directory".into())
}

fn is_up_to_date(src: &Path, dst: &Path) -> bool {
    let modified = |p: &Path| p.metadata().and_then(|m| m.modified()).ok();
    match (modified(src), modified(dst)) {
        (Some(src_mtime), Some(dst_mtime)) => src_mtime <= dst_mtime,
        _ => false,
    }
}

fn run(cmd: &mut Command) -> Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(format!(
            "command {:?} failed with {}",
            cmd.get_program(),
            status
        )
        .into());
    }
    Ok(())
}

fn cargo_build(ctx: &TaskContext) -> Result<()> {
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut cmd = Command::new(cargo);
    cmd.args(["build", "-p", PACKAGE]).current_dir(&ctx.root);
    if ctx.profile == Profile::Release {
        cmd.arg("--release");
    }
    run(&mut cmd)
}

/// Output file names for one shader source: the plain module and, in
/// debug builds, a `.debug` variant with debug info.
fn shader_outputs(stem: &str, profile: Profile) -> Vec<(String, &'static [&'static str])> {
    let mut outputs: Vec<(String, &'static [&'static str])> =
        vec![(format!("{stem}.spv"), &[])];
    if profile == Profile::Debug {
        outputs.push((format!("{stem}.debug.spv"), &["-g"]));
    }
    outputs
}

fn compile_shaders(ctx: &TaskContext) -> Result<()> {
    let src_dir = ctx.root.join(PACKAGE).join("shaders");
    let out_dir = ctx.out_dir().join("shaders");
    fs::create_dir_all(&out_dir)?;

    let mut compiled = 0u32;
    let mut skipped = 0u32;

    for entry in fs::read_dir(&src_dir)? {
        let src = entry?.path();
        if src.extension() != Some(OsStr::new("slang")) {
            continue;
        }
        let Some(stem) = src.file_stem().map(|s| s.to_string_lossy()) else {
            continue;
        };

        for (file_name, extra_args) in shader_outputs(&stem, ctx.profile) {
            let dst = out_dir.join(&file_name);

            if is_up_to_date(&src, &dst) {
                skipped += 1;
                continue;
            }

            println!("Compiling {} -> {file_name}", src.display());

            run(Command::new("slangc")
                .arg(&src)
                .args(["-target", "spirv", "-profile", "spirv_1_5"])
                .args(["-entry", "main", "-stage", "compute", "-o"])
                .arg(&dst)
                .args(extra_args))?;

            compiled += 1;
        }
    }

    println!("Shaders: {compiled} compiled, {skipped} up-to-date");
    Ok(())
}

fn copy_if_changed(src: &Path, dst: &Path) -> Result<bool> {
    if is_up_to_date(src, dst) {
        return Ok(false);
    }
    fs::copy(src, dst)?;
    Ok(true)
}

fn copy_exe(ctx: &TaskContext) -> Result<()> {
    let out_dir = ctx.out_dir();
    fs::create_dir_all(&out_dir)?;

    let exe_name = format!("{PACKAGE}{}", env::consts::EXE_SUFFIX);
    let target_dir = ctx.root.join("target").join(ctx.profile.dir_name());
    let src_exe = target_dir.join(&exe_name);
    let dst_exe = out_dir.join(&exe_name);

    if copy_if_changed(&src_exe, &dst_exe)? {
        println!("Copied {exe_name}");
    } else {
        println!("Up-to-date: {exe_name}");
    }

    #[cfg(windows)]
    {
        let pdb_name = format!("{}.pdb", PACKAGE.replace('-', "_"));
        copy_if_changed(&target_dir.join(&pdb_name), &out_dir.join(&pdb_name))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tasks: &[Task], order: &[usize]) -> Vec<&'static str> {
        order.iter().map(|&i| tasks[i].name).collect()
    }

    #[test]
    fn build_runs_dependencies_first() {
        let tasks = all_tasks();
        let order = topo_order(&tasks, "build").unwrap();
        assert_eq!(
            names(&tasks, &order),
            ["cargo-build", "compile-shaders", "copy-exe", "build"]
        );
    }

    #[test]
    fn copy_exe_pulls_in_cargo_build() {
        let tasks = all_tasks();
        let order = topo_order(&tasks, "copy-exe").unwrap();
        assert_eq!(names(&tasks, &order), ["cargo-build", "copy-exe"]);
    }

    #[test]
    fn unknown_task_is_an_error() {
        let tasks = all_tasks();
        let err = topo_order(&tasks, "deploy").unwrap_err();
        assert_eq!(err.to_string(), "unknown task: `deploy`");
    }

    #[test]
    fn debug_shaders_get_a_debug_variant() {
        let outputs = shader_outputs("copy_words", Profile::Debug);
        let files: Vec<&str> = outputs.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(files, ["copy_words.spv", "copy_words.debug.spv"]);
        assert_eq!(outputs[1].1, &["-g"]);
    }

    #[test]
    fn release_shaders_have_no_debug_variant() {
        let outputs = shader_outputs("copy_words", Profile::Release);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0, "copy_words.spv");
    }

    #[test]
    fn failed_dependency_skips_dependents() {
        fn fail(_: &TaskContext) -> Result<()> {
            Err("boom".into())
        }
        fn must_not_run(_: &TaskContext) -> Result<()> {
            panic!("dependent task ran after its dependency failed");
        }
        let tasks = vec![
            Task {
                name: "a",
                deps: &[],
                run: fail,
            },
            Task {
                name: "b",
                deps: &["a"],
                run: must_not_run,
            },
        ];
        let ctx = TaskContext {
            root: PathBuf::from("."),
            profile: Profile::Debug,
        };
        let err = execute_graph(&tasks, "b", &ctx).unwrap_err();
        assert_eq!(err.to_string(), "1 task(s) failed: a");
    }
}
