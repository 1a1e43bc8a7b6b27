use std::process::exit;

use tracing::{error, info_span};

use riverpool::{init_runtime, init_settings, init_tracing, run_servers};


fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("{}", e);
        exit(1);
    }

    let span = info_span!("startup");
    let _enter = span.enter();

    let config = match init_settings() {
        Ok(config) => config,
        Err(e) => {
            error!(%e, "could not load config");
            exit(1);
        }
    };
    let runtime = match init_runtime(&config.get()) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(%e, "could not start the tokio runtime");
            exit(1);
        }
    };
    drop(_enter);

    if let Err(e) = run_servers(config, &runtime) {
        error!(%e, "server failed");
        exit(1);
    }
}
