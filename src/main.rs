//! Binary entry point: builds a [`exaproxy::config::Config`], brings up the
//! supervisor, and runs it to completion on a single-threaded runtime.
//!
//! Parsing a configuration file or command line into a `Config` is out of
//! scope for this crate; `main` below builds one directly from its
//! `Default` plus the bind addresses every deployment needs, the same way
//! `hyper`'s own single-threaded example wires a `Builder::new_current_thread`
//! runtime together with a `LocalSet` so `!Send` state (the `Rc<RefCell<_>>`
//! classifier and resolver handles) can be spawned as local tasks.

use std::net::SocketAddr;

use exaproxy::config::Config;
use exaproxy::supervisor::Supervisor;

fn main() {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    config.listen = vec!["0.0.0.0:3128".parse::<SocketAddr>().expect("valid default listen address")];

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(config));
}

async fn run(config: Config) {
    let supervisor = match Supervisor::new(&config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "failed to start proxy");
            std::process::exit(1);
        }
    };
    supervisor.run().await;
}
