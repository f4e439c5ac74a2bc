use kestrel_clusters::cli::CliOverrides;
use kestrel_clusters::run;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli_overrides = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed.into_config_overrides(),
        Err(err) => {
            log::error!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(cli_overrides) {
        log::error!("Application error: {err:?}");
        std::process::exit(1);
    }
}
