use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

const FUZZ_TARGETS: &[&str] = &["envelope_decode", "chunk_transfer"];

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        print_help();
        return ExitCode::SUCCESS;
    }

    match args[0].as_str() {
        "test" => test(&args[1..]),
        "loom" => loom(&args[1..]),
        "fuzz" => fuzz(&args[1..]),
        "clean-shm" => clean_shm(&args[1..]),
        "help" | "--help" | "-h" => {
            print_help();
            ExitCode::SUCCESS
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            eprintln!();
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    eprintln!(
        r#"shmchannel xtask

USAGE:
    cargo xtask <COMMAND> [OPTIONS]

COMMANDS:
    test [ARGS]                Run all workspace tests
                               ARGS are passed to cargo test

    loom [ARGS]                Model-check the shared-memory primitives with loom

    fuzz [TARGET]              Run bolero fuzz targets
                               TARGET: envelope_decode, chunk_transfer
                               Without TARGET, runs all targets sequentially

    clean-shm [NAMESPACE]      Remove leftover shared-memory objects
                               NAMESPACE defaults to "shmchannel"

    help                       Print this help message

EXAMPLES:
    cargo xtask test -p shmchannel
    cargo xtask loom
    cargo xtask fuzz chunk_transfer
    cargo xtask clean-shm rt
"#
    );
}

fn project_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(PathBuf::from)
        .unwrap_or(manifest_dir)
}

fn run(cmd: &mut Command, what: &str) -> bool {
    match cmd.status() {
        Ok(s) if s.success() => true,
        Ok(s) => {
            eprintln!("{what} exited with: {s}");
            false
        }
        Err(e) => {
            eprintln!("Failed to run {what}: {e}");
            false
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn test(args: &[String]) -> ExitCode {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(project_root()).arg("test").args(args);
    exit_code(run(&mut cmd, "tests"))
}

fn loom(args: &[String]) -> ExitCode {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(project_root())
        .args(["test", "-p", "shm-primitives", "--features", "loom", "--release"])
        .args(args);
    exit_code(run(&mut cmd, "loom tests"))
}

fn fuzz(args: &[String]) -> ExitCode {
    let fuzz_dir = project_root().join("fuzz");

    let targets: Vec<&str> = match args.first() {
        Some(t) if FUZZ_TARGETS.contains(&t.as_str()) => vec![t.as_str()],
        Some(t) => {
            eprintln!("Unknown fuzz target: {t}");
            eprintln!("Available: {}", FUZZ_TARGETS.join(", "));
            return ExitCode::FAILURE;
        }
        None => FUZZ_TARGETS.to_vec(),
    };

    for target in targets {
        eprintln!("==> Fuzzing target: {target}");
        let mut cmd = Command::new("cargo");
        cmd.current_dir(&fuzz_dir).args(["test", "--test", target]);
        if !run(&mut cmd, target) {
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

/// Unlink `/dev/shm` entries left behind by crashed processes.
fn clean_shm(args: &[String]) -> ExitCode {
    let namespace = args.first().map(String::as_str).unwrap_or("shmchannel");
    let prefix = format!("{namespace}_");

    let entries = match fs::read_dir("/dev/shm") {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Cannot read /dev/shm: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to remove {name}: {e}"),
        }
    }

    eprintln!("Removed {removed} object(s) with prefix {prefix}");
    ExitCode::SUCCESS
}
