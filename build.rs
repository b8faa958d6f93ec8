// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn name_arg() -> Arg {
    Arg::new("name").required(true).help("Repository name")
}

fn package_arg() -> Arg {
    Arg::new("package").required(true).help("Package name")
}

fn build_cli() -> Command {
    Command::new("appcatalog")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Appcatalog Contributors")
        .about("Multi-repository application catalog")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("db_path")
                .short('d')
                .long("db-path")
                .value_name("PATH")
                .global(true)
                .help("Database path (overrides the configuration file)"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .value_name("FILTER")
                .global(true)
                .help("Log filter, e.g. \"debug\" (RUST_LOG takes precedence)"),
        )
        .subcommand(Command::new("init").about("Initialize the catalog database"))
        .subcommand(
            Command::new("repo-add")
                .about("Add a new repository")
                .arg(name_arg())
                .arg(Arg::new("address").required(true).help("Repository address"))
                .arg(
                    Arg::new("certificate")
                        .long("certificate")
                        .help("Hex-encoded signing certificate"),
                )
                .arg(
                    Arg::new("priority")
                        .short('p')
                        .long("priority")
                        .default_value("0")
                        .help("Priority (higher = preferred)"),
                )
                .arg(
                    Arg::new("disabled")
                        .long("disabled")
                        .action(ArgAction::SetTrue)
                        .help("Disable repository after adding"),
                ),
        )
        .subcommand(
            Command::new("repo-list").about("List repositories").arg(
                Arg::new("all")
                    .short('a')
                    .long("all")
                    .action(ArgAction::SetTrue)
                    .help("Show all repositories (including disabled)"),
            ),
        )
        .subcommand(
            Command::new("repo-remove")
                .about("Remove a repository and everything it published")
                .arg(name_arg()),
        )
        .subcommand(
            Command::new("repo-enable")
                .about("Enable a repository")
                .arg(name_arg()),
        )
        .subcommand(
            Command::new("repo-disable")
                .about("Disable a repository")
                .arg(name_arg()),
        )
        .subcommand(
            Command::new("repo-priority")
                .about("Change a repository's priority")
                .arg(name_arg())
                .arg(Arg::new("priority").required(true).help("New priority")),
        )
        .subcommand(
            Command::new("sync")
                .about("Apply a verified index (JSON) to a repository")
                .arg(name_arg())
                .arg(Arg::new("index").required(true).help("Index file"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Apply even if the index token matches the last sync"),
                ),
        )
        .subcommand(Command::new("show").about("Show a package").arg(package_arg()))
        .subcommand(
            Command::new("search")
                .about("Search packages by name, summary or description")
                .arg(Arg::new("term").required(true).help("Search term")),
        )
        .subcommand(
            Command::new("list").about("List packages").arg(
                Arg::new("category")
                    .long("category")
                    .help("Only packages in this category"),
            ),
        )
        .subcommand(Command::new("updates").about("List installed packages with pending updates"))
        .subcommand(Command::new("installed").about("List installed packages"))
        .subcommand(
            Command::new("vulnerable").about("List installed packages with known vulnerabilities"),
        )
        .subcommand(
            Command::new("prefs")
                .about("Show or change a package's update preferences")
                .arg(package_arg())
                .arg(Arg::new("ignore_all_updates").long("ignore-all-updates"))
                .arg(Arg::new("ignore_up_to").long("ignore-up-to"))
                .arg(Arg::new("ignore_vulnerabilities").long("ignore-vulnerabilities"))
                .arg(Arg::new("channel").long("channel")),
        )
        .subcommand(
            Command::new("mark-installed")
                .about("Record a package as installed (or uninstalled)")
                .arg(package_arg())
                .arg(Arg::new("version_code").help("Installed version code"))
                .arg(Arg::new("version_name").long("version-name"))
                .arg(Arg::new("signer").long("signer"))
                .arg(
                    Arg::new("uninstalled")
                        .long("uninstalled")
                        .action(ArgAction::SetTrue)
                        .help("The package was uninstalled"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell", "elvish"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("appcatalog.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
