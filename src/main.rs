// src/main.rs

use anyhow::{Context, Result};
use appcatalog::db::models::{InstalledSnapshot, Repository};
use appcatalog::query::{self, CatalogApp};
use appcatalog::repository::{self, RepoIndex};
use appcatalog::{Catalog, Config};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "appcatalog")]
#[command(author, version, about = "Multi-repository application catalog", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides the configuration file)
    #[arg(short, long, global = true)]
    db_path: Option<String>,

    /// Log filter, e.g. "debug" (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog database
    Init,
    /// Add a new repository
    RepoAdd {
        /// Repository name
        name: String,
        /// Repository address
        address: String,
        /// Hex-encoded signing certificate
        #[arg(long)]
        certificate: Option<String>,
        /// Priority (higher = preferred)
        #[arg(short, long, default_value = "0")]
        priority: i32,
        /// Disable repository after adding
        #[arg(long)]
        disabled: bool,
    },
    /// List repositories
    RepoList {
        /// Show all repositories (including disabled)
        #[arg(short, long)]
        all: bool,
    },
    /// Remove a repository and everything it published
    RepoRemove {
        /// Repository name
        name: String,
    },
    /// Enable a repository
    RepoEnable {
        /// Repository name
        name: String,
    },
    /// Disable a repository
    RepoDisable {
        /// Repository name
        name: String,
    },
    /// Change a repository's priority
    RepoPriority {
        /// Repository name
        name: String,
        /// New priority (higher = preferred)
        priority: i32,
    },
    /// Apply a verified index (JSON) to a repository
    Sync {
        /// Repository name
        name: String,
        /// Index file
        index: PathBuf,
        /// Apply even if the index token matches the last sync
        #[arg(short, long)]
        force: bool,
    },
    /// Show a package
    Show {
        /// Package name
        package: String,
    },
    /// Search packages by name, summary or description
    Search {
        /// Search term
        term: String,
    },
    /// List packages
    List {
        /// Only packages in this category
        #[arg(long)]
        category: Option<String>,
    },
    /// List installed packages with pending updates
    Updates,
    /// List installed packages
    Installed,
    /// List installed packages with known vulnerabilities
    Vulnerable,
    /// Show or change a package's update preferences
    Prefs {
        /// Package name
        package: String,
        /// Ignore every update
        #[arg(long)]
        ignore_all_updates: Option<bool>,
        /// Ignore updates up to and including this version code
        #[arg(long)]
        ignore_up_to: Option<i64>,
        /// Hide known-vulnerability warnings
        #[arg(long)]
        ignore_vulnerabilities: Option<bool>,
        /// Release channel for this package ("" resets to the default)
        #[arg(long)]
        channel: Option<String>,
    },
    /// Record a package as installed (or uninstalled)
    MarkInstalled {
        /// Package name
        package: String,
        /// Installed version code
        #[arg(required_unless_present = "uninstalled")]
        version_code: Option<i64>,
        /// Installed version name
        #[arg(long)]
        version_name: Option<String>,
        /// Signer of the installed copy
        #[arg(long)]
        signer: Option<String>,
        /// The package was uninstalled
        #[arg(long)]
        uninstalled: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn print_apps(apps: &[CatalogApp]) {
    if apps.is_empty() {
        println!("No packages found.");
        return;
    }
    for app in apps {
        print!("{} ({})", app.metadata.name, app.package_name);
        if let Some(summary) = &app.metadata.summary {
            print!(" - {}", summary);
        }
        println!();
    }
    println!("\nTotal: {} package(s)", apps.len());
}

fn print_repository(repo: &Repository) {
    let state = if !repo.enabled {
        "disabled"
    } else if repository::needs_sync(repo) {
        "stale"
    } else {
        "current"
    };
    println!(
        "  {} (priority {}) [{}] {}",
        repo.name, repo.priority, state, repo.address
    );
    if let Some(fingerprint) = &repo.fingerprint {
        println!("    fingerprint: {}", fingerprint);
    }
    if let Some(last_sync) = &repo.last_sync {
        println!("    last sync: {}", last_sync);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    let log_level = cli.log_level.unwrap_or_else(|| config.log_level.clone());

    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    let Some(command) = cli.command else {
        println!("Appcatalog v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'appcatalog --help' for usage information");
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        clap_complete::generate(shell, &mut Cli::command(), "appcatalog", &mut std::io::stdout());
        return Ok(());
    }

    let default_channel = config.sync.default_release_channel.clone();
    let catalog = Catalog::open(config)?;

    match command {
        Commands::Init => {
            info!("Initialized catalog at: {}", catalog.config().db_path);
            println!(
                "Database initialized successfully at: {}",
                catalog.config().db_path
            );
        }
        Commands::RepoAdd {
            name,
            address,
            certificate,
            priority,
            disabled,
        } => {
            let repo = catalog.add_repository(&name, &address, certificate.as_deref(), priority)?;
            if disabled {
                catalog.set_repository_enabled(&name, false)?;
            }
            println!("Added repository: {} ({})", repo.name, repo.address);
        }
        Commands::RepoList { all } => {
            let repos: Vec<Repository> = catalog
                .repositories()?
                .into_iter()
                .filter(|r| all || r.enabled)
                .collect();
            if repos.is_empty() {
                println!("No repositories configured.");
            } else {
                println!("Repositories:");
                for repo in &repos {
                    print_repository(repo);
                }
            }
        }
        Commands::RepoRemove { name } => {
            catalog.remove_repository(&name)?;
            println!("Removed repository: {}", name);
        }
        Commands::RepoEnable { name } => {
            catalog.set_repository_enabled(&name, true)?;
            println!("Enabled repository: {}", name);
        }
        Commands::RepoDisable { name } => {
            catalog.set_repository_enabled(&name, false)?;
            println!("Disabled repository: {}", name);
        }
        Commands::RepoPriority { name, priority } => {
            catalog.set_repository_priority(&name, priority)?;
            println!("Repository {} priority set to {}", name, priority);
        }
        Commands::Sync { name, index, force } => {
            let conn = catalog.connection()?;
            let repo = repository::find_repository(&conn, &name)?;
            let repo_id = repo.id.context("repository has no id")?;
            drop(conn);

            let index = RepoIndex::from_file(&index)
                .with_context(|| format!("failed to read index {}", index.display()))?;
            let report = catalog.sync(
                repo_id,
                index.token.as_deref(),
                force,
                index.entries.iter().cloned().map(Ok),
            )?;
            if report.unchanged {
                println!("Repository {} is up to date", name);
            } else {
                println!(
                    "Synchronized {}: {} packages, {} versions \
                     ({} skipped, {} packages and {} versions removed)",
                    name,
                    report.packages,
                    report.versions,
                    report.skipped,
                    report.removed_packages,
                    report.removed_versions
                );
            }
        }
        Commands::Show { package } => {
            let conn = catalog.connection()?;
            let Some(details) = query::get_by_package(&conn, &package, &default_channel)? else {
                println!("Package '{}' not found.", package);
                return Ok(());
            };

            let metadata = &details.app.metadata;
            println!("{} ({})", metadata.name, details.app.package_name);
            if let Some(summary) = &metadata.summary {
                println!("  {}", summary);
            }
            if let Some(license) = &metadata.license {
                println!("  License: {}", license);
            }
            if !details.categories.is_empty() {
                println!("  Categories: {}", details.categories.join(", "));
            }
            if let Some(apk) = &details.suggested_apk {
                println!(
                    "  Suggested: {} ({})",
                    apk.version_name.as_deref().unwrap_or("?"),
                    apk.version_code
                );
            }
            if let Some(installed) = &details.installed {
                println!(
                    "  Installed: {}{}",
                    installed.version_code,
                    if details.status.can_and_want_to_update {
                        " (update available)"
                    } else {
                        ""
                    }
                );
            }
            println!("  Versions:");
            for version in &details.versions {
                let mut flags = Vec::new();
                if !version.compatible {
                    flags.push(format!(
                        "incompatible: {}",
                        version.incompatible_reasons.join("; ")
                    ));
                }
                if version.has_known_vulnerability() {
                    flags.push("known vulnerability".to_string());
                }
                if !version.release_channels.is_empty() {
                    flags.push(version.release_channels.join(","));
                }
                println!(
                    "    {} ({}){}",
                    version.version_name.as_deref().unwrap_or("?"),
                    version.version_code,
                    if flags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", flags.join(", "))
                    }
                );
            }
        }
        Commands::Search { term } => {
            let conn = catalog.connection()?;
            print_apps(&query::search(&conn, &term)?);
        }
        Commands::List { category } => {
            let conn = catalog.connection()?;
            let apps = match category {
                Some(category) => query::by_category(&conn, &category)?,
                None => query::list(&conn)?,
            };
            print_apps(&apps);
        }
        Commands::Updates => {
            let conn = catalog.connection()?;
            let pending = query::updates(&conn)?;
            if pending.is_empty() {
                println!("All packages are up to date.");
            }
            for (app, status) in &pending {
                println!(
                    "{} ({}): {} -> {}",
                    app.metadata.name,
                    app.package_name,
                    status.installed_version_code,
                    status.suggested_version_code
                );
            }
        }
        Commands::Installed => {
            let conn = catalog.connection()?;
            print_apps(&query::installed(&conn)?);
        }
        Commands::Vulnerable => {
            let conn = catalog.connection()?;
            print_apps(&query::installed_with_known_vulnerability(&conn)?);
        }
        Commands::Prefs {
            package,
            ignore_all_updates,
            ignore_up_to,
            ignore_vulnerabilities,
            channel,
        } => {
            let mut prefs = catalog.prefs(&package)?;
            let changed = ignore_all_updates.is_some()
                || ignore_up_to.is_some()
                || ignore_vulnerabilities.is_some()
                || channel.is_some();

            if let Some(value) = ignore_all_updates {
                prefs.ignore_all_updates = value;
            }
            if let Some(value) = ignore_up_to {
                prefs.ignore_version_code_up_to = value;
            }
            if let Some(value) = ignore_vulnerabilities {
                prefs.ignore_vulnerabilities = value;
            }
            if let Some(value) = channel {
                prefs.release_channel = (!value.is_empty()).then_some(value);
            }
            if changed {
                catalog.set_prefs(&prefs)?;
            }

            println!("Preferences for {}:", package);
            println!("  ignore all updates: {}", prefs.ignore_all_updates);
            println!("  ignore updates up to: {}", prefs.ignore_version_code_up_to);
            println!("  ignore vulnerabilities: {}", prefs.ignore_vulnerabilities);
            println!(
                "  release channel: {}",
                prefs.release_channel.as_deref().unwrap_or(&default_channel)
            );
        }
        Commands::MarkInstalled {
            package,
            version_code,
            version_name,
            signer,
            uninstalled,
        } => {
            if uninstalled {
                catalog.forget_installed(&package)?;
                println!("Marked {} as uninstalled", package);
            } else {
                let version_code = version_code.context("version code is required")?;
                let mut snapshot = InstalledSnapshot::new(package.clone(), version_code);
                snapshot.version_name = version_name;
                snapshot.signer = signer;
                snapshot.last_update_time = Some(chrono::Utc::now().to_rfc3339());
                catalog.record_installed(&snapshot)?;
                println!("Marked {} as installed at version {}", package, version_code);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
