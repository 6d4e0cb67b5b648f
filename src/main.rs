mod delivery;
mod features;
mod i18n;
mod platform;

use clap::{Arg, ArgAction, ArgMatches, Command};
use delivery::backend::InstallBackend;
use delivery::config::{DeliveryConfig, DeliveryMode};
use delivery::engine::InstallEngine;
use delivery::model::DownloadState;
use delivery::registry::ModuleRegistry;
use delivery::resolver::{open_feature, EntryPointResolver, FeatureView};
use delivery::simulated::SimulatedBackend;
use delivery::unpack::ResourceUnpacker;
use i18n::{get_messages, render_state, Locale, Messages};
use indicatif::{ProgressBar, ProgressStyle};
use platform::fetch::{FetchContext, ModuleSource};
use platform::service::RepositoryInstallService;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn build_cli() -> Command {
    let module_arg = || {
        Arg::new("module")
            .help("Module id, e.g. featurepremium")
            .required(true)
            .num_args(1)
    };

    Command::new("greenshop-features")
        .about("Install and open optional GreenShop feature modules on demand")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("mode")
                .long("mode")
                .help("Delivery mode: simulated or platform (defaults by build profile)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("repo")
                .long("repo")
                .help("Module repository: http(s) URL, file:// URL or directory")
                .default_value("./splits")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("data_dir")
                .long("data-dir")
                .help("Where installed modules and their records live")
                .default_value("./greenshop-data")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("assets_dir")
                .long("assets-dir")
                .help("Directory holding <module>_resources.zip archives")
                .default_value("./assets")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("locale")
                .long("locale")
                .help("Message language: en or vi")
                .default_value("en")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("user_agent")
                .long("user-agent")
                .help("User-Agent for repository requests")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("timeout_secs")
                .long("timeout-secs")
                .help("Request timeout in seconds")
                .default_value("60")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .help("Retries for transient repository errors")
                .default_value("2")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("retry_backoff_ms")
                .long("retry-backoff-ms")
                .help("Base backoff between retries in milliseconds")
                .default_value("400")
                .global(true)
                .num_args(1),
        )
        .subcommand(Command::new("list").about("List optional modules and whether they are installed"))
        .subcommand(
            Command::new("install")
                .about("Download and install a module (Ctrl-C cancels)")
                .arg(module_arg())
                .arg(
                    Arg::new("open")
                        .long("open")
                        .help("Open the module once it is installed")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Remove a module (platform removal happens on next start)")
                .arg(module_arg()),
        )
        .subcommand(Command::new("open").about("Open an installed module").arg(module_arg()))
}

fn arg<'a>(m: &'a ArgMatches, name: &str) -> anyhow::Result<&'a String> {
    m.get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("missing argument: {}", name))
}

fn fetch_context(m: &ArgMatches) -> anyhow::Result<FetchContext> {
    let mut ctx = FetchContext::default();
    if let Some(ua) = m.get_one::<String>("user_agent") {
        ctx.user_agent = ua.clone();
    }
    ctx.timeout_secs = arg(m, "timeout_secs")?.parse()?;
    ctx.retries = arg(m, "retries")?.parse()?;
    ctx.retry_backoff_ms = arg(m, "retry_backoff_ms")?.parse()?;
    Ok(ctx)
}

struct App {
    service: Arc<RepositoryInstallService>,
    engine: InstallEngine,
    registry: Arc<ModuleRegistry>,
    resolver: EntryPointResolver,
    msgs: &'static Messages,
}

impl App {
    async fn build(m: &ArgMatches) -> anyhow::Result<Self> {
        let config = match m.get_one::<String>("mode") {
            Some(raw) => DeliveryConfig::new(raw.parse::<DeliveryMode>()?),
            None => DeliveryConfig::default(),
        };
        let mode = config.mode;
        let data_dir: PathBuf = arg(m, "data_dir")?.into();
        let assets_dir: PathBuf = arg(m, "assets_dir")?.into();
        let source = ModuleSource::parse(arg(m, "repo")?)?;
        let msgs = get_messages(Locale::from_str(arg(m, "locale")?));

        let service = Arc::new(RepositoryInstallService::open(source, &data_dir, fetch_context(m)?).await?);
        let backend: Arc<dyn InstallBackend> = if mode.is_simulated() {
            Arc::new(SimulatedBackend::new(service.clone(), config.simulation.clone()))
        } else {
            service.clone()
        };

        let registry = Arc::new(ModuleRegistry::with_defaults());
        let unpacker = Arc::new(ResourceUnpacker::new(assets_dir, data_dir.join("files")));
        let engine = InstallEngine::new(backend, registry.clone(), config, Some(unpacker));

        Ok(Self {
            service,
            engine,
            registry,
            resolver: EntryPointResolver::new(features::loader()),
            msgs,
        })
    }

    fn list(&self) {
        for d in self.engine.available_modules() {
            let status = if d.installed {
                self.msgs.status_installed
            } else {
                self.msgs.status_not_installed
            };
            println!("{:<24} {:<20} {:>8}  [{}]", d.id, d.display_name, d.size_label, status);
            println!("{:<24} {}", "", d.description);
        }
    }

    /// Returns true when the module ended up installed.
    async fn install(&self, module: &str) -> anyhow::Result<bool> {
        let pb = ProgressBar::new(100);
        pb.set_style(ProgressStyle::with_template("{prefix} {bar:40.green/white} {pos:>3}% {wide_msg}")?);
        pb.set_prefix(format!("[{}]", self.registry.display_name(module)));

        let mut sub = self.engine.subscribe();
        self.engine.request(module);

        let mut outcome: Option<DownloadState> = None;
        let mut cancel_sent = false;
        loop {
            tokio::select! {
                state = sub.next() => {
                    let state = match state {
                        Some(s) => s,
                        None => break,
                    };
                    pb.set_message(render_state(&state, self.msgs));
                    match &state {
                        DownloadState::Downloading(pct) => pb.set_position(u64::from(*pct)),
                        DownloadState::Installing => pb.set_position(100),
                        DownloadState::AlreadyInstalled => {
                            outcome = Some(state.clone());
                            break;
                        }
                        s if s.is_terminal() => outcome = Some(s.clone()),
                        // terminal states linger, then the engine resets to idle
                        DownloadState::Idle if outcome.is_some() => break,
                        _ => {}
                    }
                }
                _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                    cancel_sent = true;
                    pb.set_message(self.msgs.cancelling);
                    if let Err(e) = self.service.cancel_module(module).await {
                        tracing::warn!("[CLI] cannot cancel {}: {}", module, e);
                        break;
                    }
                }
            }
        }

        let installed = matches!(
            outcome,
            Some(DownloadState::Installed(_)) | Some(DownloadState::AlreadyInstalled)
        );
        let last = outcome.unwrap_or(DownloadState::Cancelled);
        if installed {
            pb.finish_with_message(render_state(&last, self.msgs));
        } else {
            pb.abandon_with_message(render_state(&last, self.msgs));
        }
        Ok(installed)
    }

    fn open(&self, module: &str) {
        let view = open_feature(
            self.engine.oracle(),
            &self.resolver,
            &self.registry,
            module,
            Box::new(|| tracing::debug!("[CLI] navigated back")),
        );
        match view {
            FeatureView::Loaded(mut screen) | FeatureView::Fallback(mut screen) => {
                print!("{}", screen.render());
                screen.navigate_back();
            }
            FeatureView::NotInstalled => {
                println!("{} {}", self.registry.display_name(module), self.msgs.not_installed_hint);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();
    let app = App::build(&matches).await?;

    let result = match matches.subcommand() {
        Some(("list", _)) => {
            app.list();
            Ok(())
        }
        Some(("install", m)) => {
            let module = arg(m, "module")?;
            match app.install(module).await {
                Ok(true) if m.get_flag("open") => {
                    app.open(module);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Some(("uninstall", m)) => {
            let module = arg(m, "module")?;
            app.engine.uninstall(module);
            println!("{}: {}", app.msgs.uninstalled, app.registry.display_name(module));
            Ok(())
        }
        Some(("open", m)) => {
            app.open(arg(m, "module")?);
            Ok(())
        }
        _ => Ok(()),
    };

    app.engine.shutdown().await;
    result
}
