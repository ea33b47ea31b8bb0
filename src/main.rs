// src/main.rs

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use winecharm::archive::{self, CreateOptions, Flavor};
use winecharm::catalog::{Catalog, SortField};
use winecharm::cli::{Cli, Commands, RunnerCommands};
use winecharm::control::{self, Message, Rendezvous};
use winecharm::launch;
use winecharm::notify::{LogNotifier, Notifier};
use winecharm::paths::DataRoot;
use winecharm::pe;
use winecharm::prefix::{self, PrefixBuilder};
use winecharm::runner::RunnerRegistry;
use winecharm::settings::{Arch, Settings};
use winecharm::task::{EventQueue, TaskControl};
use winecharm::template::TemplateEngine;
use winecharm::Supervisor;

/// Set by the SIGINT handler so the serve loop can unwind cleanly
/// (unlinking the rendezvous socket on the way out)
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let root = DataRoot::resolve().context("cannot prepare the data root")?;
    let settings = Settings::load(&root).context("cannot load settings")?;

    match (cli.command, cli.file) {
        (Some(command), _) => run_command(command, &root, settings),
        (None, Some(file)) => open_file(&file, &root, settings),
        (None, None) => run_list(&root, "name", false),
    }
}

fn run_command(command: Commands, root: &DataRoot, mut settings: Settings) -> Result<()> {
    let notifier = LogNotifier;
    match command {
        Commands::List { sort, desc } => run_list(root, &sort, desc),

        Commands::InitTemplate { arch } => {
            let arch = Arch::parse(&arch).ok_or_else(|| anyhow!("unknown arch: {arch}"))?;
            let engine = TemplateEngine::new(settings.runner_path());
            engine.initialize(
                &root.template_dir(arch.as_str()),
                arch,
                &TaskControl::new(),
                &notifier,
            )?;
            settings.arch = arch;
            settings.template = root
                .template_dir(arch.as_str())
                .to_string_lossy()
                .into_owned();
            settings.save(root)?;
            Ok(())
        }

        Commands::InstallComponents { verbs } => {
            let engine = TemplateEngine::new(settings.runner_path());
            engine.install_components(
                &settings.template_path(),
                &verbs,
                &TaskControl::new(),
                &notifier,
            )?;
            Ok(())
        }

        Commands::Backup { prefix, output } => {
            let flavor = Flavor::from_path(&output)
                .filter(|f| *f != Flavor::Legacy)
                .ok_or_else(|| anyhow!("output must end in .prefix or .bottle"))?;
            archive::create_archive(
                &prefix,
                &output,
                &CreateOptions {
                    flavor,
                    runners_root: &root.runners_dir(),
                },
                &TaskControl::new(),
                &notifier,
            )?;
            Ok(())
        }

        Commands::Restore { archive: file } => {
            let mut catalog = Catalog::load(&root.prefixes_dir())?;
            let restored = archive::restore_archive(
                &file,
                root,
                &settings,
                &mut catalog,
                &TaskControl::new(),
                &notifier,
            )?;
            info!("restored to {}", restored.display());
            Ok(())
        }

        Commands::Import { directory } => {
            let mut catalog = Catalog::load(&root.prefixes_dir())?;
            let imported = archive::import_wine_directory(
                &directory,
                root,
                &settings,
                &mut catalog,
                &TaskControl::new(),
                &notifier,
            )?;
            info!("imported to {}", imported.display());
            Ok(())
        }

        Commands::Rename {
            key,
            name,
            prefix: whole,
        } => {
            let mut catalog = Catalog::load(&root.prefixes_dir())?;
            let key = resolve_key(&catalog, &key)?;
            if whole {
                let dir = catalog
                    .get(&key)
                    .map(|d| d.wineprefix.clone())
                    .ok_or_else(|| anyhow!("no entry for {key}"))?;
                let moved = prefix::rename_prefix(&dir, &name, &mut catalog)?;
                info!("prefix moved to {}", moved.display());
            } else {
                catalog.rename(&key, &name)?;
            }
            Ok(())
        }

        Commands::Delete { key, prefix: whole } => {
            let mut catalog = Catalog::load(&root.prefixes_dir())?;
            let key = resolve_key(&catalog, &key)?;
            if whole {
                let dir = catalog
                    .get(&key)
                    .map(|d| d.wineprefix.clone())
                    .ok_or_else(|| anyhow!("no entry for {key}"))?;
                prefix::delete_prefix(&dir, &mut catalog)?;
            } else {
                catalog.delete(&key)?;
            }
            Ok(())
        }

        Commands::Runner { command } => run_runner_command(command, root),
    }
}

fn run_runner_command(command: RunnerCommands, root: &DataRoot) -> Result<()> {
    let registry = RunnerRegistry::new(root);
    match command {
        RunnerCommands::List => {
            for runner in registry.list_local()? {
                let state = if RunnerRegistry::validate(&runner.wine) {
                    "ok"
                } else {
                    "broken"
                };
                println!("{:<30} {}  [{}]", runner.name, runner.wine.display(), state);
            }
            Ok(())
        }
        RunnerCommands::Available => {
            for remote in registry.remote_runners()? {
                println!("{}", remote.name);
            }
            Ok(())
        }
        RunnerCommands::Download { name } => {
            let remote = registry
                .remote_runners()?
                .into_iter()
                .find(|r| r.name == name)
                .ok_or_else(|| anyhow!("no downloadable runner named {name}"))?;
            let dir = registry.download(&remote, &TaskControl::new(), &LogNotifier)?;
            info!("runner installed at {}", dir.display());
            Ok(())
        }
        RunnerCommands::Backup { name, output } => {
            registry.backup(&name, &output, &TaskControl::new())?;
            Ok(())
        }
        RunnerCommands::Restore { archive } => {
            let dir = registry.restore_backup(&archive, &TaskControl::new())?;
            info!("runner restored at {}", dir.display());
            Ok(())
        }
    }
}

fn run_list(root: &DataRoot, sort: &str, desc: bool) -> Result<()> {
    let field = match sort {
        "name" => SortField::Progname,
        "prefix" => SortField::Wineprefix,
        "time" => SortField::Mtime,
        other => bail!("unknown sort field: {other}"),
    };
    let catalog = Catalog::load(&root.prefixes_dir())?;
    for descriptor in catalog.sorted(field, desc) {
        println!(
            "{}  {:<30} {}",
            pe::short_hash(&descriptor.sha256sum),
            descriptor.progname,
            descriptor.wineprefix.display(),
        );
    }
    Ok(())
}

/// Accept a full key or an unambiguous key prefix
fn resolve_key(catalog: &Catalog, given: &str) -> Result<String> {
    if catalog.contains(given) {
        return Ok(given.to_string());
    }
    let matches: Vec<&str> = catalog.keys().filter(|k| k.starts_with(given)).collect();
    match matches.as_slice() {
        [one] => Ok((*one).to_string()),
        [] => bail!("no shortcut matches {given}"),
        _ => bail!("{given} is ambiguous ({} matches)", matches.len()),
    }
}

/// Dispatch on the positional file argument's extension
fn open_file(file: &Path, root: &DataRoot, settings: Settings) -> Result<()> {
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "charm" => run_headless(file),
        "exe" | "msi" => match control::rendezvous(&root.socket_file())? {
            Rendezvous::Peer(mut client) => {
                let resolved = file
                    .canonicalize()
                    .with_context(|| format!("cannot resolve {}", file.display()))?;
                client.send(&Message::ProcessFile(resolved))?;
                info!("handed {} to the running instance", file.display());
                Ok(())
            }
            Rendezvous::Owner(server) => serve(file, server, root, settings),
        },
        _ => {
            let body = format!("{} is not a .exe, .msi or .charm file", file.display());
            if let Ok(Rendezvous::Peer(mut client)) = control::rendezvous(&root.socket_file()) {
                client.send(&Message::ShowDialog {
                    title: "Invalid file type".into(),
                    body,
                })?;
                Ok(())
            } else {
                bail!(body);
            }
        }
    }
}

/// Run a `.charm` shortcut headless: same command the supervisor would
/// spawn, inherited stdio, exit with the child's code.
fn run_headless(charm: &Path) -> Result<()> {
    let descriptor = winecharm::descriptor::Descriptor::load(charm)?;
    let runner = launch::resolve_runner(&descriptor)?;
    if !descriptor.exe_file.is_file() {
        bail!("executable not found: {}", descriptor.exe_file.display());
    }
    let mut cmd = launch::build_command(&descriptor, &runner, &launch::new_unique_id())?;
    let status = cmd
        .status()
        .with_context(|| format!("cannot run {}", descriptor.progname))?;
    std::process::exit(status.code().unwrap_or(1));
}

/// Owning-instance loop: bind the executable, supervise it, and keep
/// serving rendezvous hand-offs until everything has exited.
fn serve(
    file: &Path,
    server: winecharm::control::ControlServer,
    root: &DataRoot,
    settings: Settings,
) -> Result<()> {
    // SAFETY: the handler only stores into an atomic
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let supervisor = Supervisor::new(notifier.clone());
    let catalog = Arc::new(Mutex::new(Catalog::load(&root.prefixes_dir())?));

    {
        let mut catalog = catalog.lock().map_err(|_| anyhow!("catalog poisoned"))?;
        let adopted = supervisor.reconcile(&catalog);
        if !adopted.is_empty() {
            info!("adopted {} already-running shortcut(s)", adopted.len());
        }
        process_file(file, root, &settings, &mut catalog, &supervisor, &*notifier)?;
    }

    // Hand-offs from later invocations arrive on the accept thread and
    // are posted here; the loop below is the single place catalog
    // mutation happens.
    let queue = EventQueue::new();
    {
        let poster = queue.poster();
        let root = root.clone();
        let catalog = catalog.clone();
        let supervisor = supervisor.clone();
        let notifier = notifier.clone();
        let settings = settings.clone();
        server.spawn(move |message| {
            let root = root.clone();
            let catalog = catalog.clone();
            let supervisor = supervisor.clone();
            let notifier = notifier.clone();
            let settings = settings.clone();
            poster.post(move || match message {
                Message::ProcessFile(path) => {
                    let Ok(mut catalog) = catalog.lock() else { return };
                    if let Err(e) = process_file(
                        &path,
                        &root,
                        &settings,
                        &mut catalog,
                        &supervisor,
                        &*notifier,
                    ) {
                        notifier.error_dialog("Cannot open file", &e.to_string(), None);
                    }
                }
                Message::ShowDialog { title, body } => {
                    notifier.error_dialog(&title, &body, None);
                }
            });
        })?;
    }

    loop {
        queue.drain();
        if SHUTDOWN.load(Ordering::SeqCst) {
            warn!("interrupted, shutting down");
            break;
        }
        if supervisor.running_keys().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    // `server` dropped here unlinks the rendezvous socket
    Ok(())
}

/// Bind an executable to a prefix (creating it from the template when
/// needed) and start supervising it.
fn process_file(
    file: &Path,
    root: &DataRoot,
    settings: &Settings,
    catalog: &mut Catalog,
    supervisor: &Supervisor,
    notifier: &dyn Notifier,
) -> Result<()> {
    let builder = PrefixBuilder::new(root, settings);
    let key = builder.create(file, catalog, &TaskControl::new(), notifier)?;
    let charm = catalog
        .get(&key)
        .map(|d| d.script_path.clone())
        .ok_or_else(|| anyhow!("descriptor vanished for {key}"))?;
    supervisor.start(&charm)?;
    Ok(())
}
