use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use panedir::config::Settings;
use panedir::logging::init_logging;
use panedir::{
    DeleteOutcome, EngineError, FileOperationType, NewTransfer, Result, TaskRecord, TransferEngine,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TRANSFER_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

fn print_help() {
    println!("panedir {} - Background copy/move engine for a dual-pane file manager", VERSION);
    println!();
    println!("USAGE:");
    println!("    panedir [--root DIR] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    copy <source> <target> <name>... [--overwrite <name>]...");
    println!("                            Copy entries and wait for the task to finish");
    println!("    move <source> <target> <name>... [--overwrite <name>]...");
    println!("                            Move entries and wait for the task to finish");
    println!("    conflicts <target> <name>...");
    println!("                            List names that already exist in <target>");
    println!("    delete <dir> <name>     Move an entry to the trash (purge inside the trash)");
    println!("    restore <trash-path>    Put a trashed entry back where it came from");
    println!("    trash                   List trashed entries");
    println!("    empty-trash             Permanently delete everything in the trash");
    println!("    tasks [limit]           List recent tasks, newest first");
    println!("    task <id>               Show one task");
    println!("    clear-completed         Forget completed tasks");
    println!();
    println!("OPTIONS:");
    println!("    --root <DIR>            Browse root (overrides settings.json)");
    println!("    -h, --help              Print help information");
    println!("    -v, --version           Print version information");
    println!();
    println!("Paths are relative to the root, e.g. /Documents or Documents.");
}

fn print_version() {
    println!("panedir {}", VERSION);
}

fn usage_error(message: &str) -> EngineError {
    EngineError::Config(format!("{} (use --help for usage information)", message))
}

fn print_task(task: &TaskRecord) {
    println!(
        "{}  {:<11} {:<4} {} -> {}  {}/{} ({}%)",
        task.id,
        task.status.as_str(),
        task.operation.as_str(),
        task.source_path,
        task.target_path,
        task.processed_units,
        task.total_units,
        task.percent()
    );
    println!("    entries: {}", task.names.join(", "));
    if !task.overwrite_names.is_empty() {
        println!("    overwrite: {}", task.overwrite_names.join(", "));
    }
    if let Some(item) = &task.current_item {
        println!("    current: {}", item);
    }
    if let Some(error) = &task.error {
        println!("    error: {}", error);
    }
    println!("    created: {}", task.created_at.to_rfc3339());
    if let Some(finished) = task.finished_at {
        println!("    finished: {}", finished.to_rfc3339());
    }
}

fn parse_transfer(operation: FileOperationType, args: &[String]) -> Result<NewTransfer> {
    let mut positional = Vec::new();
    let mut overwrite = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--overwrite" {
            let name = iter
                .next()
                .ok_or_else(|| usage_error("--overwrite requires a name"))?;
            overwrite.push(name.clone());
        } else {
            positional.push(arg.clone());
        }
    }

    if positional.len() < 3 {
        return Err(usage_error(&format!(
            "{} requires <source> <target> <name>...",
            operation.as_str()
        )));
    }
    let names = positional.split_off(2);
    let target = positional.pop().unwrap_or_default();
    let source = positional.pop().unwrap_or_default();
    Ok(NewTransfer::new(operation, source, target, names).with_overwrite(overwrite))
}

fn run(settings: &Settings, command: &str, args: &[String]) -> Result<bool> {
    let mut engine = TransferEngine::open(&settings.engine_config()?)?;

    let succeeded = match command {
        "copy" | "move" => {
            let operation = FileOperationType::parse(command)
                .ok_or_else(|| usage_error(&format!("Unknown command: {}", command)))?;
            let request = parse_transfer(operation, args)?;
            let id = engine.create_transfer_task(request)?;
            println!("Queued task {}", id);
            let task = engine.wait_for_task(&id, TRANSFER_WAIT)?;
            print_task(&task);
            task.error.is_none()
        }
        "conflicts" => {
            let (target, names) = args
                .split_first()
                .filter(|(_, names)| !names.is_empty())
                .ok_or_else(|| usage_error("conflicts requires <target> <name>..."))?;
            for name in engine.find_conflicts(target, names)? {
                println!("{}", name);
            }
            true
        }
        "delete" => {
            let [dir, name] = args else {
                return Err(usage_error("delete requires <dir> <name>"));
            };
            match engine.delete_entry(dir, name)? {
                DeleteOutcome::Trashed { trash_path } => println!("Moved to trash: {}", trash_path),
                DeleteOutcome::Purged => println!("Permanently deleted"),
            }
            true
        }
        "restore" => {
            let [trash_path] = args else {
                return Err(usage_error("restore requires <trash-path>"));
            };
            let restored = engine.restore_trash_entry(trash_path)?;
            println!("Restored to {}", restored);
            true
        }
        "trash" => {
            for entry in engine.list_trash()? {
                println!(
                    "{}  {}  (from {})",
                    entry.deleted_at.to_rfc3339(),
                    entry.trash_path,
                    entry.original_path
                );
            }
            true
        }
        "empty-trash" => {
            let purged = engine.empty_trash()?;
            println!("Purged {} entr{}", purged, if purged == 1 { "y" } else { "ies" });
            true
        }
        "tasks" => {
            let limit = match args.first() {
                Some(value) => value
                    .parse()
                    .map_err(|_| usage_error(&format!("Invalid limit: {}", value)))?,
                None => settings.task_list_limit,
            };
            for task in engine.list_tasks(limit) {
                print_task(&task);
            }
            true
        }
        "task" => {
            let [id] = args else {
                return Err(usage_error("task requires <id>"));
            };
            let task = engine
                .get_task(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
            print_task(&task);
            true
        }
        "clear-completed" => {
            let removed = engine.clear_completed_tasks()?;
            println!("Removed {} completed task{}", removed, if removed == 1 { "" } else { "s" });
            true
        }
        other => return Err(usage_error(&format!("Unknown command: {}", other))),
    };

    engine.shutdown();
    Ok(succeeded)
}

fn main() -> ExitCode {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let mut root_override: Option<PathBuf> = None;

    if args.first().map(String::as_str) == Some("--root") {
        if args.len() < 2 {
            eprintln!("Error: --root requires a directory argument");
            return ExitCode::FAILURE;
        }
        root_override = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }

    let Some(command) = args.first().cloned() else {
        print_help();
        return ExitCode::SUCCESS;
    };
    match command.as_str() {
        "-h" | "--help" => {
            print_help();
            return ExitCode::SUCCESS;
        }
        "-v" | "--version" => {
            print_version();
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let mut settings = match Settings::load_with_error() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Warning: {}; using defaults", e);
            Settings::default()
        }
    };
    if let Some(root) = root_override {
        let root = if root.is_absolute() {
            root
        } else {
            env::current_dir().map(|cwd| cwd.join(&root)).unwrap_or(root)
        };
        settings.root = Some(root.display().to_string());
    }

    if let Err(e) = init_logging(&settings.logging) {
        eprintln!("Warning: {}", e);
    }

    match run(&settings, &command, &args[1..]) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
