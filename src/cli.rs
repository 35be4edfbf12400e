use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

pub struct CliOptions {
    pub endpoint: Option<String>,
    pub all_pages: bool,
    pub max_concurrent_pages: Option<usize>,
    pub max_pages: Option<u32>,
    pub log_level: Option<String>,
    pub version: bool,
}

impl CliOptions {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            endpoint: matches.get_one::<String>("endpoint").cloned(),
            all_pages: matches.get_flag("all-pages"),
            max_concurrent_pages: matches.get_one::<usize>("max-concurrent-pages").copied(),
            max_pages: matches.get_one::<u32>("max-pages").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            version: matches.get_flag("version"),
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("esi-pager")
        .about("Fetch ESI endpoints with budget tracking and page reassembly")
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .num_args(1)
                .help("Endpoint path relative to ESI_BASE_URL, e.g. /markets/10000002/orders/"),
        )
        .arg(
            Arg::new("all-pages")
                .long("all-pages")
                .help("Follow X-Pages and merge every page into one array")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("max-concurrent-pages")
                .long("max-concurrent-pages")
                .num_args(1)
                .value_parser(value_parser!(usize))
                .help("Override ESI_MAX_CONCURRENT_PAGES"),
        )
        .arg(
            Arg::new("max-pages")
                .long("max-pages")
                .num_args(1)
                .value_parser(value_parser!(u32))
                .help("Override ESI_MAX_PAGES (highest page requested)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
}

pub fn init_logging(level: Option<&str>) {
    // Explicit level wins, then RUST_LOG, then info. Logs go to stderr so stdout stays JSON.
    if let Some(lvl) = level {
        std::env::set_var("RUST_LOG", lvl);
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
